//! Promotion gate: turns a well-tested hypothesis into an active pattern

use tracing::{debug, info};

use super::trials::{TrialRecorder, TrialStatus};
use crate::error::{Error, Result};
use crate::types::{decimal_to_f64, HypothesisId, Pattern, PatternStats, TrialOutcome};

#[derive(Debug, Clone)]
pub struct PromotionConfig {
    pub min_tests: usize,
    pub min_win_rate: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            min_tests: 100,
            min_win_rate: 0.55,
        }
    }
}

/// Verdict of one promotion attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Promoted(Pattern),
    /// Not enough outcomes yet
    Undecided { outcomes: usize },
    Retired { win_rate: f64 },
    /// Already promoted or retired earlier
    Settled(TrialStatus),
}

pub struct PromotionGate {
    config: PromotionConfig,
}

impl PromotionGate {
    pub fn new(config: PromotionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    /// Promote `hypothesis_id` if it has earned it. Idempotent: a settled
    /// hypothesis never yields a second pattern.
    pub fn try_promote(
        &self,
        recorder: &TrialRecorder,
        hypothesis_id: &HypothesisId,
    ) -> Result<Option<Pattern>> {
        match self.evaluate(recorder, hypothesis_id)? {
            Verdict::Promoted(pattern) => Ok(Some(pattern)),
            _ => Ok(None),
        }
    }

    pub fn evaluate(
        &self,
        recorder: &TrialRecorder,
        hypothesis_id: &HypothesisId,
    ) -> Result<Verdict> {
        let mut book = recorder.lock();
        if let Some(status) = book.settled.get(hypothesis_id) {
            return Ok(Verdict::Settled(*status));
        }
        let log = book
            .pending
            .get(hypothesis_id)
            .ok_or_else(|| Error::UnknownHypothesis(hypothesis_id.clone()))?;

        let outcomes = log.outcomes.len();
        if outcomes < self.config.min_tests {
            return Ok(Verdict::Undecided { outcomes });
        }

        let win_rate = log.wins() as f64 / outcomes as f64;
        if win_rate < self.config.min_win_rate {
            book.settle(hypothesis_id, TrialStatus::Retired);
            debug!(
                hypothesis_id = %hypothesis_id,
                win_rate,
                outcomes,
                "Hypothesis retired"
            );
            return Ok(Verdict::Retired { win_rate });
        }

        let mut stats = PatternStats::default();
        for outcome in &log.outcomes {
            stats.record_trade(outcome.profitable, outcome.profit, trial_return(outcome));
        }
        let pattern = Pattern::from_stats(&log.candidate, &stats, true);
        book.settle(hypothesis_id, TrialStatus::Promoted);

        info!(
            pattern_id = %pattern.id,
            generation = pattern.generation,
            win_rate = %format!("{:.3}", pattern.win_rate),
            sharpe = %format!("{:.2}", pattern.sharpe_ratio),
            tests = pattern.test_count(),
            "✅ Pattern promoted"
        );
        Ok(Verdict::Promoted(pattern))
    }
}

/// Per-trial return on the traded price
fn trial_return(outcome: &TrialOutcome) -> f64 {
    let entry = decimal_to_f64(outcome.entry_price);
    if entry <= 0.0 {
        return 0.0;
    }
    (decimal_to_f64(outcome.exit_price) - entry) / entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candidate, Condition, Hypothesis, Operator};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn setup() -> (TrialRecorder, PromotionGate, HypothesisId) {
        let recorder = TrialRecorder::new(100);
        let candidate = Candidate::fresh(Hypothesis::new(
            vec![Condition::new("order_book_imbalance", Operator::Gt, 0.3, 0.9)],
            vec![Condition::new("price_delta_5m", Operator::Lt, -0.5, 1.0)],
            30,
            Utc::now(),
            9,
        ));
        let id = candidate.id().clone();
        recorder.register(candidate);
        (recorder, PromotionGate::new(PromotionConfig::default()), id)
    }

    fn feed(recorder: &TrialRecorder, id: &HypothesisId, wins: usize, total: usize) {
        for i in 0..total {
            let win = i < wins;
            recorder
                .record_trial(
                    id,
                    TrialOutcome {
                        hypothesis_id: id.clone(),
                        profitable: win,
                        profit: if win { dec!(1) } else { dec!(-0.5) },
                        entry_price: dec!(100),
                        exit_price: if win { dec!(120) } else { dec!(90) },
                        duration_secs: 60,
                    },
                )
                .unwrap();
        }
    }

    #[test]
    fn undecided_below_min_tests() {
        let (recorder, gate, id) = setup();
        feed(&recorder, &id, 99, 99);
        assert_eq!(
            gate.evaluate(&recorder, &id).unwrap(),
            Verdict::Undecided { outcomes: 99 }
        );
        assert_eq!(recorder.status(&id), Some(TrialStatus::Pending));
    }

    #[test]
    fn fifty_four_percent_does_not_promote() {
        let (recorder, gate, id) = setup();
        feed(&recorder, &id, 54, 100);
        assert!(gate.try_promote(&recorder, &id).unwrap().is_none());
        assert_eq!(recorder.status(&id), Some(TrialStatus::Retired));
        assert_eq!(recorder.outcome_count(&id), 0);

        // Retired hypotheses are never retried
        feed(&recorder, &id, 100, 100);
        assert_eq!(recorder.outcome_count(&id), 0);
        assert!(gate.try_promote(&recorder, &id).unwrap().is_none());
    }

    #[test]
    fn fifty_six_percent_promotes_once() {
        let (recorder, gate, id) = setup();
        feed(&recorder, &id, 56, 100);

        let pattern = gate.try_promote(&recorder, &id).unwrap().unwrap();
        assert_eq!(pattern.id, id);
        assert_eq!(pattern.generation, 0);
        assert!(pattern.is_active);
        assert_eq!(pattern.test_count(), 100);
        assert_eq!(pattern.win_count(), 56);
        assert!((pattern.win_rate - 0.56).abs() < 1e-12);
        assert_eq!(pattern.total_profit(), dec!(34));
        assert!(pattern.sharpe_ratio > 0.0);

        assert!(gate.try_promote(&recorder, &id).unwrap().is_none());
        assert_eq!(
            gate.evaluate(&recorder, &id).unwrap(),
            Verdict::Settled(TrialStatus::Promoted)
        );
    }
}
