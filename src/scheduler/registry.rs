//! Pattern registry
//!
//! Every pattern ever promoted lives in an id-keyed arena. The active subset
//! is an immutable [`ActiveSet`] swapped atomically, so a tick always
//! evaluates one consistent generation while promotions and evolution write a
//! new set beside it.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::types::{Candidate, Pattern, PatternId, PatternStats};

/// Live state of one pattern: immutable lineage, statistics behind their own
/// lock, lifecycle flag as an atomic.
#[derive(Debug)]
pub struct PatternEntry {
    candidate: Candidate,
    stats: RwLock<PatternStats>,
    active: AtomicBool,
}

impl PatternEntry {
    fn new(pattern: &Pattern) -> Self {
        Self {
            candidate: pattern.candidate(),
            stats: RwLock::new(pattern.stats.clone()),
            active: AtomicBool::new(pattern.is_active),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PatternStats> {
        self.stats.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PatternStats> {
        self.stats.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &PatternId {
        self.candidate.id()
    }

    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PatternStats {
        self.read().clone()
    }

    /// Consistent point-in-time copy
    pub fn snapshot(&self) -> Pattern {
        let stats = self.read();
        Pattern::from_stats(&self.candidate, &stats, self.is_active())
    }

    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.read().last_triggered {
            Some(last) => now - last >= self.candidate.hypothesis.cooldown(),
            None => true,
        }
    }

    /// Atomically check the cooldown and stamp `last_triggered = now`.
    /// Returns the previous stamp on success so a skipped attempt can undo it.
    pub fn try_claim_trigger(&self, now: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
        let mut stats = self.write();
        let previous = stats.last_triggered;
        if let Some(last) = previous {
            if now - last < self.candidate.hypothesis.cooldown() {
                return None;
            }
        }
        stats.last_triggered = Some(now);
        Some(previous)
    }

    /// Undo a claim made at `claimed_at`, unless something newer replaced it
    pub fn release_trigger(&self, claimed_at: DateTime<Utc>, previous: Option<DateTime<Utc>>) {
        let mut stats = self.write();
        if stats.last_triggered == Some(claimed_at) {
            stats.last_triggered = previous;
        }
    }

    pub fn mark_triggered(&self, at: DateTime<Utc>) {
        let mut stats = self.write();
        if stats.last_triggered.map(|t| at > t).unwrap_or(true) {
            stats.last_triggered = Some(at);
        }
    }

    /// Fold a completed trade; returns the updated snapshot
    pub fn record_trade(&self, won: bool, profit: Decimal, trade_return: f64) -> Pattern {
        let mut stats = self.write();
        stats.record_trade(won, profit, trade_return);
        Pattern::from_stats(&self.candidate, &stats, self.is_active())
    }

    /// An execution that never resolved counts as a loss
    pub fn record_unresolved(&self) -> Pattern {
        let mut stats = self.write();
        stats.record_unresolved();
        Pattern::from_stats(&self.candidate, &stats, self.is_active())
    }
}

/// One immutable generation of schedulable patterns
#[derive(Debug, Default)]
pub struct ActiveSet {
    pub version: u64,
    pub patterns: Vec<Arc<PatternEntry>>,
}

impl ActiveSet {
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Arena of all patterns plus the copy-on-write active set
pub struct PatternRegistry {
    entries: RwLock<HashMap<PatternId, Arc<PatternEntry>>>,
    active: ArcSwap<ActiveSet>,
    /// Serialises writers of the active set; readers never take it
    writer: Mutex<()>,
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            active: ArcSwap::from_pointee(ActiveSet::default()),
            writer: Mutex::new(()),
        }
    }

    /// Current active generation; cheap, never blocks writers
    pub fn snapshot_active(&self) -> Arc<ActiveSet> {
        self.active.load_full()
    }

    pub fn get(&self, id: &PatternId) -> Option<Arc<PatternEntry>> {
        self.entries.read().ok()?.get(id).cloned()
    }

    /// Register a promoted pattern and append it to the active set.
    /// Returns `None` if the id is already registered.
    pub fn insert_active(&self, pattern: &Pattern) -> Option<Arc<PatternEntry>> {
        debug_assert!(pattern.win_count() <= pattern.test_count());
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let entry = Arc::new(PatternEntry::new(pattern));
        entry.active.store(true, Ordering::Release);
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if entries.contains_key(&pattern.id) {
                return None;
            }
            entries.insert(pattern.id.clone(), entry.clone());
        }

        let current = self.active.load();
        let mut patterns = current.patterns.clone();
        patterns.push(entry.clone());
        self.active.store(Arc::new(ActiveSet {
            version: current.version + 1,
            patterns,
        }));
        debug!(pattern_id = %pattern.id, active = current.len() + 1, "Pattern activated");
        Some(entry)
    }

    /// Swap in the next generation: every id in `retire` is deactivated
    /// (kept for audit) and dropped from the active set in one store.
    pub fn apply_generation(&self, retire: &[PatternId]) -> u64 {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.active.load_full();
        let patterns: Vec<Arc<PatternEntry>> = current
            .patterns
            .iter()
            .filter(|e| !retire.contains(e.id()))
            .cloned()
            .collect();
        for entry in current.patterns.iter().filter(|e| retire.contains(e.id())) {
            entry.active.store(false, Ordering::Release);
        }

        let version = current.version + 1;
        info!(
            version,
            retired = current.len() - patterns.len(),
            active = patterns.len(),
            "Active set swapped"
        );
        self.active.store(Arc::new(ActiveSet { version, patterns }));
        version
    }

    /// Deactivate a single pattern. Returns false if it was not active.
    pub fn deactivate(&self, id: &PatternId) -> bool {
        let active = self.snapshot_active();
        if !active.patterns.iter().any(|e| e.id() == id) {
            return false;
        }
        self.apply_generation(std::slice::from_ref(id));
        true
    }

    pub fn active_patterns(&self) -> Vec<Pattern> {
        self.snapshot_active()
            .patterns
            .iter()
            .map(|e| e.snapshot())
            .collect()
    }

    pub fn all_patterns(&self) -> Vec<Pattern> {
        match self.entries.read() {
            Ok(entries) => entries.values().map(|e| e.snapshot()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.active.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Condition, Hypothesis, Operator};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    pub(crate) fn promoted(timeframe: u32, salt: u64) -> Pattern {
        let hypothesis = Hypothesis::new(
            vec![Condition::new("volume_spike", Operator::Gt, 2.0, 1.0)],
            vec![Condition::new("price_delta_1m", Operator::Lt, -1.0, 1.0)],
            timeframe,
            Utc::now(),
            salt,
        );
        let mut stats = PatternStats::default();
        for i in 0..100 {
            if i < 60 {
                stats.record(dec!(2), 0.02);
            } else {
                stats.record(dec!(-1), -0.01);
            }
        }
        Pattern::from_stats(&Candidate::fresh(hypothesis), &stats, true)
    }

    #[test]
    fn insert_and_swap_generations() {
        let registry = PatternRegistry::new();
        let a = promoted(5, 1);
        let b = promoted(5, 2);
        let c = promoted(5, 3);
        for p in [&a, &b, &c] {
            assert!(registry.insert_active(p).is_some());
        }
        assert!(registry.insert_active(&a).is_none());

        let before = registry.snapshot_active();
        assert_eq!(before.len(), 3);

        let version = registry.apply_generation(&[b.id.clone()]);
        assert_eq!(version, before.version + 1);

        // The old snapshot is untouched; the new one excludes the retiree
        assert_eq!(before.len(), 3);
        assert_eq!(registry.active_len(), 2);
        assert_eq!(registry.len(), 3);
        assert!(!registry.get(&b.id).unwrap().is_active());
        assert!(registry.get(&a.id).unwrap().is_active());

        // Retirees stay on record for audit
        let all = registry.all_patterns();
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().filter(|p| !p.is_active).count(), 1);
    }

    #[test]
    fn entry_snapshot_matches_pattern() {
        let registry = PatternRegistry::new();
        let p = promoted(15, 4);
        let entry = registry.insert_active(&p).unwrap();
        let snap = entry.snapshot();
        assert_eq!(snap.test_count(), 100);
        assert_eq!(snap.win_count(), 60);
        assert_eq!(snap.avg_win, p.avg_win);
        assert_eq!(snap.avg_loss, p.avg_loss);
        assert_eq!(snap.sharpe_ratio, p.sharpe_ratio);
        assert!(snap.sharpe_ratio > 0.0);
        assert!(snap.is_active);
    }

    #[test]
    fn trigger_claim_respects_cooldown() {
        let entry = PatternEntry::new(&promoted(5, 5));
        let t0 = Utc::now();

        assert_eq!(entry.try_claim_trigger(t0), Some(None));
        assert_eq!(entry.try_claim_trigger(t0 + Duration::milliseconds(100)), None);
        assert_eq!(entry.try_claim_trigger(t0 + Duration::seconds(299)), None);
        assert_eq!(
            entry.try_claim_trigger(t0 + Duration::minutes(5)),
            Some(Some(t0))
        );

        // Undo restores the earlier stamp
        entry.release_trigger(t0 + Duration::minutes(5), Some(t0));
        assert!(entry.cooldown_elapsed(t0 + Duration::minutes(5)));
        assert!(!entry.cooldown_elapsed(t0 + Duration::minutes(4)));
    }

    #[test]
    fn trade_recording_keeps_invariant() {
        let entry = PatternEntry::new(&promoted(5, 6));
        let p = entry.record_trade(true, dec!(3), 0.03);
        assert_eq!(p.test_count(), 101);
        assert_eq!(p.win_count(), 61);
        let p = entry.record_unresolved();
        assert_eq!(p.test_count(), 102);
        assert_eq!(p.win_count(), 61);
        assert!(p.win_count() <= p.test_count());
    }
}
