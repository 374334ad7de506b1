//! End-to-end lifecycle: discovery -> promotion -> scheduling -> evolution

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use patternbot::clock::{ManualClock, SharedClock};
    use patternbot::discovery::{DiscoveryConfig, DiscoveryEngine, TrialRecorder, TrialStatus};
    use patternbot::evolution::{EvolutionConfig, EvolutionEngine};
    use patternbot::execution::{Fill, Order, OrderExecutor, TrialRunner};
    use patternbot::feed::{MetricFeed, StaticMetricFeed, PRICE_METRIC};
    use patternbot::persistence::MemoryStore;
    use patternbot::risk::{RiskConfig, RiskManager};
    use patternbot::scheduler::{PatternRegistry, PatternScheduler, SchedulerConfig};
    use patternbot::types::{
        f64_to_decimal, Candidate, Condition, Hypothesis, HypothesisId, Operator, TrialOutcome,
    };
    use patternbot::ExecutionError;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::task::JoinSet;

    /// Wins the first `wins` trials of each hypothesis
    struct ScriptedRunner {
        wins: usize,
        calls: Mutex<HashMap<HypothesisId, usize>>,
    }

    #[async_trait]
    impl TrialRunner for ScriptedRunner {
        async fn run_trial(
            &self,
            hypothesis: &Hypothesis,
            stake: Decimal,
        ) -> Result<TrialOutcome, ExecutionError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(hypothesis.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let profitable = n <= self.wins;
            Ok(TrialOutcome {
                hypothesis_id: hypothesis.id.clone(),
                profitable,
                profit: if profitable { stake * dec!(0.2) } else { -stake * dec!(0.1) },
                entry_price: dec!(100),
                exit_price: if profitable { dec!(102) } else { dec!(99) },
                duration_secs: 60,
            })
        }
    }

    /// Fills at the current feed price without fees
    struct InstantExecutor {
        feed: Arc<StaticMetricFeed>,
    }

    #[async_trait]
    impl OrderExecutor for InstantExecutor {
        async fn submit(&self, _order: Order) -> Result<Fill, ExecutionError> {
            let price = self
                .feed
                .get_metric(PRICE_METRIC, "BTC")
                .ok_or_else(|| ExecutionError::Unavailable("no price".to_string()))?;
            Ok(Fill {
                filled: true,
                fill_price: f64_to_decimal(price),
                fees: Decimal::ZERO,
                latency: Duration::from_millis(1),
            })
        }
    }

    struct World {
        discovery: DiscoveryEngine,
        scheduler: Arc<PatternScheduler>,
        evolution: EvolutionEngine,
        registry: Arc<PatternRegistry>,
        recorder: Arc<TrialRecorder>,
        risk: Arc<RiskManager>,
        feed: Arc<StaticMetricFeed>,
        store: Arc<MemoryStore>,
    }

    fn world() -> World {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let feed = Arc::new(StaticMetricFeed::new());
        feed.set("BTC", PRICE_METRIC, 100.0);
        feed.set("BTC", "volume_spike", 3.0);

        let registry = Arc::new(PatternRegistry::new());
        let recorder = Arc::new(TrialRecorder::new(100));
        let risk = Arc::new(RiskManager::new(
            RiskConfig::default(),
            dec!(10000),
            clock.clone(),
        ));
        let store = Arc::new(MemoryStore::new());

        let discovery_config = DiscoveryConfig {
            trial_concurrency: 50,
            ..Default::default()
        };
        let generator = discovery_config.generator.clone();
        let discovery = DiscoveryEngine::new(
            discovery_config,
            recorder.clone(),
            Arc::new(ScriptedRunner {
                wins: 60,
                calls: Mutex::new(HashMap::new()),
            }),
            registry.clone(),
            risk.clone(),
            store.clone(),
            clock.clone(),
        );
        let scheduler = Arc::new(PatternScheduler::new(
            SchedulerConfig::default(),
            registry.clone(),
            risk.clone(),
            Arc::new(InstantExecutor { feed: feed.clone() }),
            feed.clone(),
            store.clone(),
            clock.clone(),
        ));
        let evolution = EvolutionEngine::new(
            EvolutionConfig::default(),
            generator,
            registry.clone(),
            recorder.clone(),
            store.clone(),
            clock,
        );

        World {
            discovery,
            scheduler,
            evolution,
            registry,
            recorder,
            risk,
            feed,
            store,
        }
    }

    fn candidate() -> Candidate {
        Candidate::fresh(Hypothesis::new(
            vec![Condition::new("volume_spike", Operator::Gt, 2.0, 1.0)],
            vec![Condition::new("price_delta_1m", Operator::Lt, -1.0, 1.0)],
            60,
            Utc::now(),
            7,
        ))
    }

    async fn join_all(tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    async fn promote(w: &World, candidate: &Candidate) {
        assert!(w.discovery.submit_candidate(candidate.clone()).await);
        w.discovery.run_trial_round().await;
        let report = w.discovery.run_trial_round().await;
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(w.recorder.status(candidate.id()), Some(TrialStatus::Promoted));
    }

    // ============================================================================
    // Discovery -> scheduler
    // ============================================================================

    #[tokio::test]
    async fn test_promoted_pattern_trades_and_learns() {
        let w = world();
        let c = candidate();
        promote(&w, &c).await;
        assert_eq!(w.registry.active_len(), 1);

        let mut tasks = JoinSet::new();
        let report = w.scheduler.tick(&mut tasks);
        join_all(&mut tasks).await;
        assert_eq!(report.fired, 1);
        assert_eq!(report.dispatched, 1);

        let position = w.risk.open_positions().pop().unwrap();
        assert_eq!(position.pattern_id, *c.id());
        assert!(position.size > Decimal::ZERO);
        assert_eq!(position.take_profit, dec!(104));

        // Price runs through take-profit
        w.feed.set("BTC", PRICE_METRIC, 105.0);
        let report = w.scheduler.tick(&mut tasks);
        join_all(&mut tasks).await;
        assert_eq!(report.exits, 1);
        // Cooldown holds the re-entry back
        assert_eq!(report.dispatched, 0);

        let profit = position.size * dec!(0.05);
        assert_eq!(w.risk.current_capital(), dec!(10000) + profit);

        let pattern = w.registry.get(c.id()).unwrap().snapshot();
        assert_eq!(pattern.test_count(), 101);
        assert_eq!(pattern.win_count(), 61);
        assert!(pattern.is_active);

        let events: Vec<_> = w.store.patterns().into_iter().map(|r| r.event).collect();
        assert!(events.contains(&"PROMOTED".to_string()));
        assert!(events.contains(&"STATS_UPDATED".to_string()));
        assert_eq!(w.store.positions().len(), 2);

        let stats = w.scheduler.stats();
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.profitable, 1);
    }

    // ============================================================================
    // Scheduler -> evolution -> discovery
    // ============================================================================

    #[tokio::test]
    async fn test_evolution_feeds_offspring_back_into_trials() {
        let w = world();
        let c = candidate();
        promote(&w, &c).await;

        let outcome = w.evolution.run_cycle().await.unwrap();
        assert_eq!(outcome.record.generation_number, 1);
        assert_eq!(outcome.record.population_before, 1);
        assert_eq!(outcome.survivors, vec![c.id().clone()]);
        assert!(outcome.retired.is_empty());
        assert_eq!(outcome.mutants, 3);
        assert_eq!(outcome.crossovers, 0);
        assert_eq!(outcome.injected, 10);
        assert_eq!(outcome.record.population_after, 14);

        // Offspring start untested and must requalify
        assert_eq!(w.registry.active_len(), 1);
        for child in &outcome.offspring {
            assert_eq!(w.recorder.status(child.id()), Some(TrialStatus::Pending));
            assert_eq!(w.recorder.outcome_count(child.id()), 0);
        }
        let mutant = &outcome.offspring[0];
        assert_eq!(mutant.parent_ids, vec![c.id().clone()]);
        assert_eq!(mutant.generation, 1);

        let report = w.discovery.run_trial_round().await;
        assert_eq!(report.trials_run, 50);
        assert!(report.promoted.is_empty());

        assert_eq!(w.store.generations().len(), 1);
        assert_eq!(w.evolution.current_generation(), 1);
    }
}
