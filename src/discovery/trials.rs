//! Per-hypothesis trial logs
//!
//! Trials complete out of order from many tasks, so every log lives behind
//! one mutex. Logs leave the `Pending` state exactly once; a settled
//! hypothesis keeps only its id and verdict.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::types::{Candidate, HypothesisId, TrialOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStatus {
    Pending,
    Promoted,
    /// Failed the win-rate bar; outcomes dropped, never retried
    Retired,
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialStatus::Pending => write!(f, "PENDING"),
            TrialStatus::Promoted => write!(f, "PROMOTED"),
            TrialStatus::Retired => write!(f, "RETIRED"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct TrialLog {
    pub(crate) candidate: Candidate,
    pub(crate) outcomes: Vec<TrialOutcome>,
    /// Trials handed out but not yet recorded
    pub(crate) in_flight: usize,
}

impl TrialLog {
    pub(crate) fn wins(&self) -> usize {
        self.outcomes.iter().filter(|o| o.profitable).count()
    }
}

#[derive(Debug, Default)]
pub(crate) struct TrialBook {
    pub(crate) pending: HashMap<HypothesisId, TrialLog>,
    pub(crate) settled: HashMap<HypothesisId, TrialStatus>,
}

impl TrialBook {
    fn status(&self, hypothesis_id: &HypothesisId) -> Option<TrialStatus> {
        if self.pending.contains_key(hypothesis_id) {
            return Some(TrialStatus::Pending);
        }
        self.settled.get(hypothesis_id).copied()
    }

    /// Drop the log and remember only the verdict
    pub(crate) fn settle(
        &mut self,
        hypothesis_id: &HypothesisId,
        status: TrialStatus,
    ) -> Option<TrialLog> {
        let log = self.pending.remove(hypothesis_id)?;
        self.settled.insert(hypothesis_id.clone(), status);
        Some(log)
    }
}

/// Accumulates trial outcomes for every registered hypothesis
pub struct TrialRecorder {
    target_trials: usize,
    book: Mutex<TrialBook>,
}

impl TrialRecorder {
    /// `target_trials` is how many outcomes a hypothesis needs before a verdict
    pub fn new(target_trials: usize) -> Self {
        Self {
            target_trials: target_trials.max(1),
            book: Mutex::new(TrialBook::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TrialBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a candidate. Returns false if it is already known,
    /// including one that was already promoted or retired.
    pub fn register(&self, candidate: Candidate) -> bool {
        let mut book = self.lock();
        if book.status(candidate.id()).is_some() {
            return false;
        }
        book.pending.insert(
            candidate.id().clone(),
            TrialLog {
                candidate,
                outcomes: Vec::new(),
                in_flight: 0,
            },
        );
        true
    }

    /// Append an outcome. Outcomes for settled hypotheses are dropped.
    pub fn record_trial(
        &self,
        hypothesis_id: &HypothesisId,
        outcome: TrialOutcome,
    ) -> Result<TrialStatus> {
        let mut book = self.lock();
        if let Some(log) = book.pending.get_mut(hypothesis_id) {
            log.in_flight = log.in_flight.saturating_sub(1);
            log.outcomes.push(outcome);
            return Ok(TrialStatus::Pending);
        }
        book.settled
            .get(hypothesis_id)
            .copied()
            .ok_or_else(|| Error::UnknownHypothesis(hypothesis_id.clone()))
    }

    /// Hand out up to `limit` trial slots across pending hypotheses that still
    /// need outcomes, oldest first.
    pub fn claim_trials(&self, limit: usize) -> Vec<Candidate> {
        let mut book = self.lock();
        let mut open: Vec<&mut TrialLog> = book
            .pending
            .values_mut()
            .filter(|l| l.outcomes.len() + l.in_flight < self.target_trials)
            .collect();
        open.sort_by(|a, b| {
            a.candidate
                .hypothesis
                .created_at
                .cmp(&b.candidate.hypothesis.created_at)
                .then_with(|| a.candidate.id().cmp(b.candidate.id()))
        });

        let mut claimed = Vec::new();
        'outer: for log in open {
            while log.outcomes.len() + log.in_flight < self.target_trials {
                if claimed.len() >= limit {
                    break 'outer;
                }
                log.in_flight += 1;
                claimed.push(log.candidate.clone());
            }
        }
        claimed
    }

    /// Give back a claimed slot whose trial never produced an outcome
    pub fn abandon_trial(&self, hypothesis_id: &HypothesisId) {
        if let Some(log) = self.lock().pending.get_mut(hypothesis_id) {
            log.in_flight = log.in_flight.saturating_sub(1);
        }
    }

    /// Hypotheses with enough outcomes for a verdict that are still pending
    pub fn ready_for_verdict(&self) -> Vec<HypothesisId> {
        self.lock()
            .pending
            .iter()
            .filter(|(_, l)| l.outcomes.len() >= self.target_trials)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn status(&self, hypothesis_id: &HypothesisId) -> Option<TrialStatus> {
        self.lock().status(hypothesis_id)
    }

    pub fn outcome_count(&self, hypothesis_id: &HypothesisId) -> usize {
        self.lock()
            .pending
            .get(hypothesis_id)
            .map(|l| l.outcomes.len())
            .unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn target_trials(&self) -> usize {
        self.target_trials
    }
}
