//! Discovery pipeline
//!
//! Generator → Trial Recorder → Promotion Gate → active set.
//!
//! Hypotheses are generated at a fixed hourly rate. Trial rounds hand out
//! slots to pending hypotheses (fresh or requalifying offspring), run them
//! through the [`TrialRunner`] and try promotion once a hypothesis has
//! enough outcomes. While trading is halted the loop keeps generating but
//! runs no trials.

mod generator;
mod promotion;
mod trials;

pub use generator::{GeneratorConfig, HypothesisGenerator};
pub use promotion::{PromotionConfig, PromotionGate, Verdict};
pub use trials::{TrialRecorder, TrialStatus};

use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::ExecutionError;
use crate::execution::TrialRunner;
use crate::persistence::{
    HypothesisRecord, LifecycleStore, PatternEvent, PatternRecord, TrialRecord,
};
use crate::risk::RiskManager;
use crate::scheduler::PatternRegistry;
use crate::types::{Candidate, HypothesisId, Pattern, TrialOutcome};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub hypotheses_per_hour: u32,
    /// Fixed stake of every trial
    pub trial_stake: Decimal,
    /// Trials run concurrently per round
    pub trial_concurrency: usize,
    pub round_interval: Duration,
    /// A trial still running after this long is abandoned and re-queued
    pub trial_timeout: Duration,
    pub promotion: PromotionConfig,
    pub generator: GeneratorConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hypotheses_per_hour: 50,
            trial_stake: Decimal::from(5),
            trial_concurrency: 32,
            round_interval: Duration::from_secs(1),
            trial_timeout: Duration::from_secs(30),
            promotion: PromotionConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Spacing between two generated hypotheses
    pub fn generation_interval(&self) -> Duration {
        Duration::from_secs_f64(3600.0 / self.hypotheses_per_hour.max(1) as f64)
    }
}

#[derive(Debug, Default)]
struct DiscoveryCounters {
    generated: AtomicU64,
    trials: AtomicU64,
    abandoned: AtomicU64,
    promoted: AtomicU64,
    retired: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    pub generated: u64,
    pub trials: u64,
    pub abandoned: u64,
    pub promoted: u64,
    pub retired: u64,
    pub pending: usize,
}

/// What one trial round did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundReport {
    pub skipped: bool,
    pub trials_run: usize,
    pub trials_abandoned: usize,
    pub promoted: Vec<Pattern>,
    pub retired: usize,
}

pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    generator: HypothesisGenerator,
    recorder: Arc<TrialRecorder>,
    gate: PromotionGate,
    runner: Arc<dyn TrialRunner>,
    registry: Arc<PatternRegistry>,
    risk: Arc<RiskManager>,
    store: Arc<dyn LifecycleStore>,
    clock: SharedClock,
    counters: DiscoveryCounters,
}

impl DiscoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DiscoveryConfig,
        recorder: Arc<TrialRecorder>,
        runner: Arc<dyn TrialRunner>,
        registry: Arc<PatternRegistry>,
        risk: Arc<RiskManager>,
        store: Arc<dyn LifecycleStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            generator: HypothesisGenerator::new(config.generator.clone(), clock.clone()),
            gate: PromotionGate::new(config.promotion.clone()),
            config,
            recorder,
            runner,
            registry,
            risk,
            store,
            clock,
            counters: DiscoveryCounters::default(),
        }
    }

    pub fn recorder(&self) -> &Arc<TrialRecorder> {
        &self.recorder
    }

    pub fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            generated: self.counters.generated.load(Ordering::Relaxed),
            trials: self.counters.trials.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            promoted: self.counters.promoted.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            pending: self.recorder.pending_count(),
        }
    }

    /// Generate and register `count` fresh hypotheses
    pub async fn generate(&self, count: usize) -> usize {
        let mut registered = 0;
        for _ in 0..count {
            let candidate = Candidate::fresh(self.generator.generate());
            if self.submit_candidate(candidate).await {
                registered += 1;
            }
        }
        self.counters
            .generated
            .fetch_add(registered as u64, Ordering::Relaxed);
        registered
    }

    /// Queue a hypothesis for trials. Returns false if it is already known.
    pub async fn submit_candidate(&self, candidate: Candidate) -> bool {
        let record = HypothesisRecord::new(&candidate, self.clock.now());
        let id = candidate.id().clone();
        if !self.recorder.register(candidate) {
            debug!(hypothesis_id = %id, "Duplicate hypothesis ignored");
            return false;
        }
        if let Err(e) = self.store.save_hypothesis(record).await {
            warn!(error = %e, "Failed to persist hypothesis");
        }
        true
    }

    /// Run one batch of trials and settle every hypothesis that has enough
    /// outcomes.
    pub async fn run_trial_round(&self) -> RoundReport {
        let mut report = RoundReport::default();
        if self.risk.is_trading_halted() {
            report.skipped = true;
            return report;
        }

        let claimed = self.recorder.claim_trials(self.config.trial_concurrency);
        let stake = self.config.trial_stake;
        let timeout = self.config.trial_timeout;
        let runner = &self.runner;

        let results: Vec<(HypothesisId, Result<TrialOutcome, ExecutionError>)> =
            stream::iter(claimed)
                .map(|candidate| async move {
                    let hypothesis = &candidate.hypothesis;
                    let result = match time::timeout(timeout, runner.run_trial(hypothesis, stake)).await {
                        Ok(result) => result,
                        Err(_) => Err(ExecutionError::Timeout(timeout.as_millis() as u64)),
                    };
                    (hypothesis.id.clone(), result)
                })
                .buffer_unordered(self.config.trial_concurrency.max(1))
                .collect()
                .await;

        for (id, result) in results {
            match result {
                Ok(outcome) => {
                    let record = TrialRecord::new(&outcome, self.clock.now());
                    if let Err(e) = self.recorder.record_trial(&id, outcome) {
                        warn!(hypothesis_id = %id, error = %e, "Outcome for unknown hypothesis");
                        continue;
                    }
                    report.trials_run += 1;
                    if let Err(e) = self.store.save_trial(record).await {
                        warn!(error = %e, "Failed to persist trial");
                    }
                }
                Err(e) => {
                    // No outcome: the slot goes back to the pool
                    self.recorder.abandon_trial(&id);
                    report.trials_abandoned += 1;
                    debug!(hypothesis_id = %id, error = %e, "Trial abandoned");
                }
            }
        }
        self.counters
            .trials
            .fetch_add(report.trials_run as u64, Ordering::Relaxed);
        self.counters
            .abandoned
            .fetch_add(report.trials_abandoned as u64, Ordering::Relaxed);

        for id in self.recorder.ready_for_verdict() {
            match self.gate.evaluate(&self.recorder, &id) {
                Ok(Verdict::Promoted(pattern)) => {
                    self.activate(&pattern).await;
                    report.promoted.push(pattern);
                }
                Ok(Verdict::Retired { .. }) => report.retired += 1,
                Ok(_) => {}
                Err(e) => warn!(hypothesis_id = %id, error = %e, "Promotion check failed"),
            }
        }
        self.counters
            .promoted
            .fetch_add(report.promoted.len() as u64, Ordering::Relaxed);
        self.counters
            .retired
            .fetch_add(report.retired as u64, Ordering::Relaxed);
        report
    }

    async fn activate(&self, pattern: &Pattern) {
        if self.registry.insert_active(pattern).is_none() {
            warn!(pattern_id = %pattern.id, "Pattern already registered");
            return;
        }
        let record = PatternRecord::new(PatternEvent::Promoted, pattern, self.clock.now());
        if let Err(e) = self.store.save_pattern(record).await {
            warn!(error = %e, "Failed to persist promotion");
        }
    }

    /// Generate at the configured hourly rate and run trial rounds until
    /// `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut generate = time::interval(self.config.generation_interval());
        generate.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rounds = time::interval(self.config.round_interval);
        rounds.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            hypotheses_per_hour = self.config.hypotheses_per_hour,
            trial_stake = %self.config.trial_stake,
            min_tests = self.config.promotion.min_tests,
            "🔬 Discovery loop started"
        );

        let mut halted = false;
        loop {
            tokio::select! {
                _ = generate.tick() => {
                    self.generate(1).await;
                }
                _ = rounds.tick() => {
                    let report = self.run_trial_round().await;
                    if report.skipped != halted {
                        halted = report.skipped;
                        if halted {
                            warn!("Trading halted, discovery continues without trials");
                        } else {
                            info!("Trading resumed, trials re-enabled");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Discovery loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryStore;
    use crate::risk::RiskConfig;
    use crate::types::{Condition, Hypothesis, Operator};
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    /// Wins the first `wins` trials of every hypothesis, loses the rest
    struct ScriptedRunner {
        wins: usize,
        calls: std::sync::Mutex<std::collections::HashMap<HypothesisId, usize>>,
        failures: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(wins: usize) -> Self {
            Self {
                wins,
                calls: Default::default(),
                failures: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TrialRunner for ScriptedRunner {
        async fn run_trial(
            &self,
            hypothesis: &Hypothesis,
            stake: Decimal,
        ) -> Result<TrialOutcome, ExecutionError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecutionError::Unavailable("flaky".to_string()));
            }
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(hypothesis.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let profitable = n <= self.wins;
            let (profit, exit) = if profitable {
                (stake * dec!(0.2), dec!(102))
            } else {
                (-stake * dec!(0.1), dec!(99))
            };
            Ok(TrialOutcome {
                hypothesis_id: hypothesis.id.clone(),
                profitable,
                profit,
                entry_price: dec!(100),
                exit_price: exit,
                duration_secs: 60,
            })
        }
    }

    struct Harness {
        engine: DiscoveryEngine,
        registry: Arc<PatternRegistry>,
        risk: Arc<RiskManager>,
        store: Arc<MemoryStore>,
    }

    fn harness(runner: Arc<dyn TrialRunner>) -> Harness {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(PatternRegistry::new());
        let risk = Arc::new(RiskManager::new(
            RiskConfig::default(),
            dec!(1000),
            clock.clone(),
        ));
        let store = Arc::new(MemoryStore::new());
        let config = DiscoveryConfig {
            trial_concurrency: 50,
            ..Default::default()
        };
        let engine = DiscoveryEngine::new(
            config,
            Arc::new(TrialRecorder::new(100)),
            runner,
            registry.clone(),
            risk.clone(),
            store.clone(),
            clock,
        );
        Harness {
            engine,
            registry,
            risk,
            store,
        }
    }

    fn candidate(salt: u64) -> Candidate {
        Candidate::fresh(Hypothesis::new(
            vec![Condition::new("volume_spike", Operator::Gt, 2.0, 1.0)],
            vec![Condition::new("price_delta_1m", Operator::Lt, -1.0, 1.0)],
            15,
            Utc::now(),
            salt,
        ))
    }

    #[test]
    fn generation_interval_from_hourly_rate() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.generation_interval(), Duration::from_secs(72));
    }

    #[tokio::test]
    async fn test_generate_registers_and_persists() {
        let h = harness(Arc::new(ScriptedRunner::new(0)));
        assert_eq!(h.engine.generate(5).await, 5);
        assert_eq!(h.engine.stats().pending, 5);
        assert_eq!(h.store.hypotheses().len(), 5);

        let dup = candidate(1);
        assert!(h.engine.submit_candidate(dup.clone()).await);
        assert!(!h.engine.submit_candidate(dup).await);
        assert_eq!(h.store.hypotheses().len(), 6);
    }

    #[tokio::test]
    async fn test_promotes_after_enough_trials() {
        let h = harness(Arc::new(ScriptedRunner::new(60)));
        let c = candidate(1);
        h.engine.submit_candidate(c.clone()).await;

        let first = h.engine.run_trial_round().await;
        assert_eq!(first.trials_run, 50);
        assert!(first.promoted.is_empty());
        assert_eq!(h.registry.active_len(), 0);

        let second = h.engine.run_trial_round().await;
        assert_eq!(second.trials_run, 50);
        assert_eq!(second.promoted.len(), 1);

        let pattern = &second.promoted[0];
        assert_eq!(pattern.id, *c.id());
        assert_eq!(pattern.test_count(), 100);
        assert_eq!(pattern.win_count(), 60);
        assert!(pattern.is_active);
        assert_eq!(h.registry.active_len(), 1);
        assert_eq!(h.engine.recorder().status(c.id()), Some(TrialStatus::Promoted));

        // Settled: no further slots, no second promotion
        let third = h.engine.run_trial_round().await;
        assert_eq!(third.trials_run, 0);
        assert!(third.promoted.is_empty());

        assert_eq!(h.store.trials().len(), 100);
        let promoted: Vec<_> = h
            .store
            .patterns()
            .into_iter()
            .filter(|r| r.event == "PROMOTED")
            .collect();
        assert_eq!(promoted.len(), 1);
    }

    #[tokio::test]
    async fn test_retires_losers() {
        let h = harness(Arc::new(ScriptedRunner::new(54)));
        let c = candidate(2);
        h.engine.submit_candidate(c.clone()).await;
        h.engine.run_trial_round().await;
        let report = h.engine.run_trial_round().await;

        assert_eq!(report.retired, 1);
        assert!(report.promoted.is_empty());
        assert_eq!(h.registry.active_len(), 0);
        assert_eq!(h.engine.recorder().status(c.id()), Some(TrialStatus::Retired));
        assert_eq!(h.engine.stats().retired, 1);
    }

    #[tokio::test]
    async fn test_failed_trials_return_their_slots() {
        let runner = Arc::new(ScriptedRunner::new(100));
        runner.failures.store(10, Ordering::SeqCst);
        let h = harness(runner);
        let c = candidate(3);
        h.engine.submit_candidate(c.clone()).await;

        let report = h.engine.run_trial_round().await;
        assert_eq!(report.trials_run + report.trials_abandoned, 50);
        assert_eq!(report.trials_abandoned, 10);
        assert_eq!(h.engine.recorder().outcome_count(c.id()), 40);

        h.engine.run_trial_round().await;
        h.engine.run_trial_round().await;
        assert_eq!(h.engine.recorder().status(c.id()), Some(TrialStatus::Promoted));
    }

    #[tokio::test]
    async fn test_halted_trading_skips_trials_but_keeps_generating() {
        let h = harness(Arc::new(ScriptedRunner::new(100)));
        h.risk.record_capital_change(dec!(-400));
        assert!(h.risk.is_emergency_stopped());

        assert_eq!(h.engine.generate(3).await, 3);
        let report = h.engine.run_trial_round().await;
        assert!(report.skipped);
        assert_eq!(report.trials_run, 0);
        assert_eq!(h.engine.stats().pending, 3);
    }
}
