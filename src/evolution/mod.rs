//! Evolution Engine
//!
//! Once per cycle: score the active population, keep the top half, breed
//! the elites, inject fresh random hypotheses and swap the next active set in
//! with a single store. Offspring are not active; they go back through trials
//! and must requalify.
//!
//! Cycles are single-flight. Scheduler ticks keep running against the
//! previous active set until the swap.

pub mod fitness;
mod operators;

pub use fitness::{fitness, PROFIT_SCALE};
pub use operators::{crossover, mutate, MAX_CONDITIONS, MIN_CONDITIONS};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::discovery::{GeneratorConfig, HypothesisGenerator, TrialRecorder};
use crate::error::{Error, Result};
use crate::persistence::{
    GenerationRow, HypothesisRecord, LifecycleStore, PatternEvent, PatternRecord,
};
use crate::scheduler::PatternRegistry;
use crate::types::{Candidate, GenerationRecord, Hypothesis, Pattern, PatternId};

#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    pub cycle_interval: Duration,
    /// Share of the population kept each cycle
    pub survival_rate: f64,
    /// Share of the population that breeds
    pub selection_pressure: f64,
    pub mutations_per_parent: usize,
    /// Per-condition chance of a re-rolled weight during mutation
    pub mutation_rate: f64,
    /// Fresh random hypotheses added every cycle
    pub random_injection: usize,
    pub profit_scale: f64,
    /// Bar an elite must clear before the enhancer is asked for variants
    pub enhance_min_win_rate: f64,
    pub enhance_min_sharpe: f64,
    pub enhancer_timeout: Duration,
    /// Enhancer calls allowed per cycle
    pub enhancer_max_calls: usize,
    /// Variants kept per enhancer call
    pub enhancer_variants: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(24 * 3600),
            survival_rate: 0.5,
            selection_pressure: 0.2,
            mutations_per_parent: 3,
            mutation_rate: 0.1,
            random_injection: 10,
            profit_scale: PROFIT_SCALE,
            enhance_min_win_rate: 0.65,
            enhance_min_sharpe: 1.5,
            enhancer_timeout: Duration::from_secs(30),
            enhancer_max_calls: 5,
            enhancer_variants: 3,
        }
    }
}

/// Optional producer of extra variants for high performers. Failure or
/// silence never blocks a cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, pattern: &Pattern) -> anyhow::Result<Vec<Hypothesis>>;
}

/// Everything one cycle produced
#[derive(Debug, Clone)]
pub struct EvolutionOutcome {
    pub record: GenerationRecord,
    pub survivors: Vec<PatternId>,
    pub retired: Vec<PatternId>,
    /// Offspring accepted by the trial recorder, in production order
    pub offspring: Vec<Candidate>,
    pub mutants: usize,
    pub crossovers: usize,
    pub enhanced: usize,
    pub injected: usize,
}

pub struct EvolutionEngine {
    config: EvolutionConfig,
    registry: Arc<PatternRegistry>,
    recorder: Arc<TrialRecorder>,
    generator: HypothesisGenerator,
    enhancer: Option<Arc<dyn Enhancer>>,
    store: Arc<dyn LifecycleStore>,
    clock: SharedClock,
    generation: AtomicU32,
    /// Held for the whole cycle; `try_lock` makes cycles single-flight
    cycle: tokio::sync::Mutex<()>,
    history: Mutex<Vec<GenerationRecord>>,
}

impl EvolutionEngine {
    pub fn new(
        config: EvolutionConfig,
        generator: GeneratorConfig,
        registry: Arc<PatternRegistry>,
        recorder: Arc<TrialRecorder>,
        store: Arc<dyn LifecycleStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            generator: HypothesisGenerator::new(generator, clock.clone()),
            config,
            registry,
            recorder,
            enhancer: None,
            store,
            clock,
            generation: AtomicU32::new(0),
            cycle: tokio::sync::Mutex::new(()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn Enhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    /// Continue numbering after the last persisted generation
    pub async fn resume(&self) -> Result<u32> {
        let last = self.store.last_generation().await?.unwrap_or(0);
        self.generation.store(last, Ordering::SeqCst);
        if last > 0 {
            info!(generation = last, "Resuming generation numbering");
        }
        Ok(last)
    }

    pub fn current_generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<GenerationRecord> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Run one cycle. Fails with [`Error::EvolutionInProgress`] if another
    /// cycle holds the engine.
    pub async fn run_cycle(&self) -> Result<EvolutionOutcome> {
        let _cycle = self
            .cycle
            .try_lock()
            .map_err(|_| Error::EvolutionInProgress)?;

        let generation_number = self.current_generation() + 1;
        let population = self.registry.active_patterns();
        let population_before = population.len();

        let mut ranked: Vec<(f64, Pattern)> = population
            .into_iter()
            .map(|p| (fitness(&p, self.config.profit_scale), p))
            .collect();
        ranked.sort_by(|(fa, a), (fb, b)| {
            fb.partial_cmp(fa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        let avg_fitness_before = mean(ranked.iter().map(|(f, _)| *f), population_before);

        let survivor_count = share(population_before, self.config.survival_rate);
        let elite_count =
            share(population_before, self.config.selection_pressure).min(survivor_count);
        let survivors: Vec<PatternId> = ranked[..survivor_count]
            .iter()
            .map(|(_, p)| p.id.clone())
            .collect();
        let retired: Vec<Pattern> = ranked[survivor_count..]
            .iter()
            .map(|(_, p)| p.clone())
            .collect();
        let elites = &ranked[..elite_count];

        // Breeding and injection draw from a thread-local rng; no await inside
        let (mutants, crossovers, injected) = {
            let mut rng = rand::thread_rng();
            let mut mutants = Vec::new();
            for (_, parent) in elites {
                for _ in 0..self.config.mutations_per_parent {
                    mutants.push(mutate(parent, &self.generator, self.config.mutation_rate, &mut rng));
                }
            }

            let mut crossovers = Vec::new();
            if elites.len() >= 2 {
                for i in 0..elites.len() {
                    let (fa, a) = &elites[i];
                    let (fb, b) = &elites[(i + 1) % elites.len()];
                    crossovers.push(crossover((a, *fa), (b, *fb), &self.generator, &mut rng));
                }
            }

            let injected: Vec<Candidate> = (0..self.config.random_injection)
                .map(|_| Candidate {
                    hypothesis: self.generator.generate_with(&mut rng),
                    generation: generation_number,
                    parent_ids: Vec::new(),
                    ai_enhanced: false,
                })
                .collect();
            (mutants, crossovers, injected)
        };

        let enhanced = self.enhance(elites).await;

        let mut outcome = EvolutionOutcome {
            record: GenerationRecord {
                generation_number,
                timestamp: self.clock.now(),
                population_before,
                population_after: 0,
                avg_fitness_before,
                avg_fitness_after: 0.0,
                top_performer_id: ranked.first().map(|(_, p)| p.id.clone()),
            },
            survivors,
            retired: retired.iter().map(|p| p.id.clone()).collect(),
            offspring: Vec::new(),
            mutants: 0,
            crossovers: 0,
            enhanced: 0,
            injected: 0,
        };
        outcome.mutants = self.submit(mutants, &mut outcome.offspring).await;
        outcome.crossovers = self.submit(crossovers, &mut outcome.offspring).await;
        outcome.enhanced = self.submit(enhanced, &mut outcome.offspring).await;
        outcome.injected = self.submit(injected, &mut outcome.offspring).await;

        self.registry.apply_generation(&outcome.retired);
        let now = self.clock.now();
        for pattern in retired {
            let pattern = Pattern {
                is_active: false,
                ..pattern
            };
            let record = PatternRecord::new(PatternEvent::Retired, &pattern, now);
            if let Err(e) = self.store.save_pattern(record).await {
                warn!(error = %e, "Failed to persist retired pattern");
            }
        }

        // Unproven offspring score zero
        let population_after = outcome.survivors.len() + outcome.offspring.len();
        let survivor_fitness = ranked[..survivor_count].iter().map(|(f, _)| *f);
        outcome.record.population_after = population_after;
        outcome.record.avg_fitness_after = mean(survivor_fitness, population_after);

        if let Err(e) = self
            .store
            .save_generation(GenerationRow::from(&outcome.record))
            .await
        {
            warn!(error = %e, "Failed to persist generation record");
        }
        self.generation.store(generation_number, Ordering::SeqCst);
        if let Ok(mut history) = self.history.lock() {
            history.push(outcome.record.clone());
        }

        info!(
            generation = generation_number,
            before = population_before,
            after = population_after,
            survivors = outcome.survivors.len(),
            retired = outcome.retired.len(),
            mutants = outcome.mutants,
            crossovers = outcome.crossovers,
            enhanced = outcome.enhanced,
            injected = outcome.injected,
            avg_fitness_before = %format!("{:.4}", avg_fitness_before),
            avg_fitness_after = %format!("{:.4}", outcome.record.avg_fitness_after),
            "🧬 Evolution cycle complete"
        );
        Ok(outcome)
    }

    /// Ask the enhancer for variants of each qualifying elite, within budget
    async fn enhance(&self, elites: &[(f64, Pattern)]) -> Vec<Candidate> {
        let Some(enhancer) = &self.enhancer else {
            return Vec::new();
        };

        let mut variants = Vec::new();
        let qualifying = elites
            .iter()
            .map(|(_, p)| p)
            .filter(|p| {
                p.win_rate > self.config.enhance_min_win_rate
                    && p.sharpe_ratio > self.config.enhance_min_sharpe
            })
            .take(self.config.enhancer_max_calls);

        for parent in qualifying {
            match time::timeout(self.config.enhancer_timeout, enhancer.enhance(parent)).await {
                Ok(Ok(hypotheses)) => {
                    variants.extend(
                        hypotheses
                            .into_iter()
                            .take(self.config.enhancer_variants)
                            .map(|hypothesis| Candidate {
                                hypothesis,
                                generation: parent.generation + 1,
                                parent_ids: vec![parent.id.clone()],
                                ai_enhanced: true,
                            }),
                    );
                }
                Ok(Err(e)) => {
                    warn!(pattern_id = %parent.id, error = %e, "Enhancer failed, skipping");
                }
                Err(_) => {
                    warn!(
                        pattern_id = %parent.id,
                        timeout_ms = self.config.enhancer_timeout.as_millis() as u64,
                        "Enhancer timed out, skipping"
                    );
                }
            }
        }
        variants
    }

    /// Register candidates for trials; returns how many were new
    async fn submit(&self, candidates: Vec<Candidate>, accepted: &mut Vec<Candidate>) -> usize {
        let now = self.clock.now();
        let mut count = 0;
        for candidate in candidates {
            if !self.recorder.register(candidate.clone()) {
                debug!(hypothesis_id = %candidate.id(), "Offspring already known");
                continue;
            }
            let record = HypothesisRecord::new(&candidate, now);
            if let Err(e) = self.store.save_hypothesis(record).await {
                warn!(error = %e, "Failed to persist offspring");
            }
            accepted.push(candidate);
            count += 1;
        }
        count
    }

    /// Run a cycle every `cycle_interval` until `shutdown` flips. The first
    /// cycle runs one interval after start.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.cycle_interval;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            cycle_hours = period.as_secs_f64() / 3600.0,
            generation = self.current_generation(),
            "🧬 Evolution loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(_) => {}
                        Err(Error::EvolutionInProgress) => {
                            warn!("Previous evolution cycle still running, skipped");
                        }
                        Err(e) => error!(error = %e, "Evolution cycle failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Evolution loop stopped");
    }
}

/// `ceil(n * rate)`, tolerant of float noise
fn share(n: usize, rate: f64) -> usize {
    let exact = n as f64 * rate.clamp(0.0, 1.0);
    ((exact - 1e-9).ceil().max(0.0) as usize).min(n)
}

fn mean(values: impl Iterator<Item = f64>, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    values.sum::<f64>() / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::discovery::TrialStatus;
    use crate::persistence::MemoryStore;
    use crate::types::{Condition, Operator, PatternStats};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: EvolutionEngine,
        registry: Arc<PatternRegistry>,
        recorder: Arc<TrialRecorder>,
        store: Arc<MemoryStore>,
    }

    fn harness(config: EvolutionConfig) -> Harness {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(PatternRegistry::new());
        let recorder = Arc::new(TrialRecorder::new(100));
        let store = Arc::new(MemoryStore::new());
        let engine = EvolutionEngine::new(
            config,
            GeneratorConfig::default(),
            registry.clone(),
            recorder.clone(),
            store.clone(),
            clock,
        );
        Harness {
            engine,
            registry,
            recorder,
            store,
        }
    }

    /// Win rate 0.55..0.95 spread over the population
    fn pattern(i: u32) -> Pattern {
        let hypothesis = Hypothesis::new(
            vec![Condition::new("volume_spike", Operator::Gt, 2.0, 1.0)],
            vec![Condition::new("price_delta_1m", Operator::Lt, -1.0, 1.0)],
            15 + i,
            Utc::now(),
            i as u64,
        );
        let wins = 55 + (i % 40);
        let mut stats = PatternStats::default();
        for n in 0..100 {
            if n < wins {
                stats.record(dec!(2), 0.02);
            } else {
                stats.record(dec!(-1), -0.01);
            }
        }
        Pattern::from_stats(&Candidate::fresh(hypothesis), &stats, true)
    }

    fn populate(registry: &PatternRegistry, n: u32) -> Vec<Pattern> {
        (0..n)
            .map(|i| {
                let p = pattern(i);
                registry.insert_active(&p).unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn share_rounds_up() {
        assert_eq!(share(100, 0.2), 20);
        assert_eq!(share(100, 0.5), 50);
        assert_eq!(share(5, 0.5), 3);
        assert_eq!(share(1, 0.2), 1);
        assert_eq!(share(0, 0.5), 0);
    }

    #[tokio::test]
    async fn test_cycle_population_arithmetic() {
        let h = harness(EvolutionConfig::default());
        let population = populate(&h.registry, 100);

        let outcome = h.engine.run_cycle().await.unwrap();
        assert_eq!(outcome.survivors.len(), 50);
        assert_eq!(outcome.retired.len(), 50);
        assert_eq!(outcome.mutants, 60);
        assert_eq!(outcome.crossovers, 20);
        assert_eq!(outcome.enhanced, 0);
        assert_eq!(outcome.injected, 10);
        assert_eq!(outcome.record.population_before, 100);
        assert_eq!(outcome.record.population_after, 140);
        assert_eq!(outcome.record.generation_number, 1);
        assert!(outcome.record.avg_fitness_after < outcome.record.avg_fitness_before);

        // Survivors stay active, the rest are deactivated but kept
        assert_eq!(h.registry.active_len(), 50);
        assert_eq!(h.registry.len(), 100);
        for id in &outcome.retired {
            assert!(!h.registry.get(id).unwrap().is_active());
        }

        // Every survivor outranks every retiree
        let score = |id: &PatternId| {
            let p = population.iter().find(|p| &p.id == id).unwrap();
            fitness(p, PROFIT_SCALE)
        };
        let worst_survivor = outcome.survivors.iter().map(score).fold(f64::MAX, f64::min);
        let best_retired = outcome.retired.iter().map(score).fold(f64::MIN, f64::max);
        assert!(worst_survivor >= best_retired);

        assert_eq!(h.recorder.pending_count(), 90);
        assert_eq!(h.store.generations().len(), 1);
        assert_eq!(h.store.hypotheses().len(), 90);
        assert_eq!(
            h.store.patterns().iter().filter(|r| r.event == "RETIRED").count(),
            50
        );
        assert_eq!(h.engine.history().len(), 1);
    }

    #[tokio::test]
    async fn test_offspring_must_requalify() {
        let h = harness(EvolutionConfig::default());
        populate(&h.registry, 10);
        let outcome = h.engine.run_cycle().await.unwrap();

        for child in &outcome.offspring {
            assert_eq!(h.recorder.status(child.id()), Some(TrialStatus::Pending));
            assert_eq!(h.recorder.outcome_count(child.id()), 0);
            assert!(h.registry.get(child.id()).is_none());
            let unproven = Pattern::unproven(child);
            assert_eq!(unproven.test_count(), 0);
            assert!(!unproven.is_active);

            // Founders are generation 0, so every child is generation 1
            assert_eq!(child.generation, 1);
            assert!(child.parent_ids.len() <= 2);
        }
        // 10 -> 5 survivors, 2 elites: 6 mutants, 2 crossovers, 10 injected
        assert_eq!(outcome.offspring.len(), 18);
        assert_eq!(h.registry.active_len(), 5);
    }

    #[tokio::test]
    async fn test_enhancer_variants_for_high_performers() {
        let mut enhancer = MockEnhancer::new();
        enhancer.expect_enhance().times(2).returning(|parent| {
            let variant = |salt| {
                Hypothesis::new(
                    parent.hypothesis.entry_conditions.clone(),
                    vec![Condition::new("bid_ask_spread", Operator::Gt, 0.5, 1.0)],
                    parent.hypothesis.timeframe_minutes,
                    Utc::now(),
                    salt,
                )
            };
            Ok((0..5).map(variant).collect())
        });

        let config = EvolutionConfig {
            enhancer_max_calls: 2,
            ..Default::default()
        };
        let h = harness(config);
        let h = Harness {
            engine: h.engine.with_enhancer(Arc::new(enhancer)),
            ..h
        };
        populate(&h.registry, 100);

        let outcome = h.engine.run_cycle().await.unwrap();
        // Two calls, three variants kept from each
        assert_eq!(outcome.enhanced, 6);
        assert_eq!(outcome.record.population_after, 146);

        let enhanced: Vec<_> = outcome.offspring.iter().filter(|c| c.ai_enhanced).collect();
        assert_eq!(enhanced.len(), 6);
        for child in enhanced {
            assert_eq!(child.parent_ids.len(), 1);
            assert_eq!(child.generation, 1);
        }
    }

    #[tokio::test]
    async fn test_enhancer_failure_does_not_block_cycle() {
        let mut enhancer = MockEnhancer::new();
        enhancer
            .expect_enhance()
            .returning(|_| Err(anyhow::anyhow!("model unavailable")));

        let h = harness(EvolutionConfig::default());
        let h = Harness {
            engine: h.engine.with_enhancer(Arc::new(enhancer)),
            ..h
        };
        populate(&h.registry, 100);

        let outcome = h.engine.run_cycle().await.unwrap();
        assert_eq!(outcome.enhanced, 0);
        assert_eq!(outcome.record.population_after, 140);
    }

    struct SlowEnhancer;

    #[async_trait]
    impl Enhancer for SlowEnhancer {
        async fn enhance(&self, _pattern: &Pattern) -> anyhow::Result<Vec<Hypothesis>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_cycles_are_single_flight() {
        let h = harness(EvolutionConfig::default());
        populate(&h.registry, 20);
        let engine = Arc::new(h.engine.with_enhancer(Arc::new(SlowEnhancer)));

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            engine.run_cycle().await,
            Err(Error::EvolutionInProgress)
        ));
        assert!(running.await.unwrap().is_ok());
        assert_eq!(engine.current_generation(), 1);

        // Free again once the first cycle finished
        assert!(engine.run_cycle().await.is_ok());
        assert_eq!(engine.current_generation(), 2);
    }

    #[tokio::test]
    async fn test_resume_continues_numbering() {
        let h = harness(EvolutionConfig::default());
        for n in 1..=3 {
            let record = GenerationRecord {
                generation_number: n,
                timestamp: Utc::now(),
                population_before: 0,
                population_after: 10,
                avg_fitness_before: 0.0,
                avg_fitness_after: 0.0,
                top_performer_id: None,
            };
            h.store
                .save_generation(GenerationRow::from(&record))
                .await
                .unwrap();
        }

        assert_eq!(h.engine.resume().await.unwrap(), 3);
        let outcome = h.engine.run_cycle().await.unwrap();
        assert_eq!(outcome.record.generation_number, 4);
        // Empty population still gets fresh blood
        assert_eq!(outcome.injected, 10);
        assert_eq!(outcome.record.population_after, 10);
    }
}
