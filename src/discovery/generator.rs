//! Random hypothesis generation
//!
//! Draws conditions from the fixed metric vocabulary plus synthetic metric
//! names, so the search space is open-ended.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::clock::SharedClock;
use crate::feed::METRICS;
use crate::types::{Condition, Hypothesis, Operator};

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub max_entry_conditions: usize,
    pub max_exit_conditions: usize,
    pub value_range: (f64, f64),
    pub weight_range: (f64, f64),
    /// Chance that a condition uses a synthetic metric name
    pub synthetic_metric_probability: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_entry_conditions: 5,
            max_exit_conditions: 3,
            value_range: (-100.0, 100.0),
            weight_range: (0.1, 1.0),
            synthetic_metric_probability: 0.1,
        }
    }
}

pub struct HypothesisGenerator {
    config: GeneratorConfig,
    clock: SharedClock,
}

impl HypothesisGenerator {
    pub fn new(config: GeneratorConfig, clock: SharedClock) -> Self {
        Self { config, clock }
    }

    /// Produce a fresh random hypothesis. Never fails.
    pub fn generate(&self) -> Hypothesis {
        self.generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng>(&self, rng: &mut R) -> Hypothesis {
        let entry_count = rng.gen_range(1..=self.config.max_entry_conditions.max(1));
        let exit_count = rng.gen_range(1..=self.config.max_exit_conditions.max(1));

        let entry = (0..entry_count).map(|_| self.random_condition(rng)).collect();
        let exit = (0..exit_count).map(|_| self.random_condition(rng)).collect();
        let timeframe = rng.gen_range(Hypothesis::MIN_TIMEFRAME..=Hypothesis::MAX_TIMEFRAME);

        Hypothesis::new(entry, exit, timeframe, self.clock.now(), rng.gen())
    }

    pub fn random_condition<R: Rng>(&self, rng: &mut R) -> Condition {
        let metric = if rng.gen_bool(self.config.synthetic_metric_probability.clamp(0.0, 1.0)) {
            synthetic_metric(rng)
        } else {
            METRICS.choose(rng).copied().unwrap_or(METRICS[0]).to_string()
        };
        let operator = *Operator::ALL.choose(rng).unwrap_or(&Operator::Gt);
        let (lo, hi) = self.config.value_range;

        Condition::new(
            metric,
            operator,
            rng.gen_range(lo..=hi.max(lo)),
            self.random_weight(rng),
        )
    }

    pub fn random_weight<R: Rng>(&self, rng: &mut R) -> f64 {
        let (lo, hi) = self.config.weight_range;
        rng.gen_range(lo..=hi.max(lo))
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

fn synthetic_metric<R: Rng>(rng: &mut R) -> String {
    if rng.gen_bool(0.5) {
        format!("pattern_{:x}", rng.gen::<u32>())
    } else {
        format!("metric_{:x}", rng.gen::<u32>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn generated_hypotheses_respect_bounds() {
        let generator = HypothesisGenerator::new(GeneratorConfig::default(), Arc::new(SystemClock));
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..500 {
            let h = generator.generate_with(&mut rng);
            assert!((1..=5).contains(&h.entry_conditions.len()));
            assert!((1..=3).contains(&h.exit_conditions.len()));
            assert!((1..=1440).contains(&h.timeframe_minutes));
            for c in h.entry_conditions.iter().chain(h.exit_conditions.iter()) {
                assert!((-100.0..=100.0).contains(&c.value));
                assert!((0.1..=1.0).contains(&c.weight));
            }
        }
    }

    #[test]
    fn identical_structures_get_distinct_ids() {
        let generator = HypothesisGenerator::new(GeneratorConfig::default(), Arc::new(SystemClock));
        let ids: HashSet<_> = (0..1000).map(|_| generator.generate().id).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn synthetic_metrics_extend_vocabulary() {
        let config = GeneratorConfig {
            synthetic_metric_probability: 1.0,
            ..Default::default()
        };
        let generator = HypothesisGenerator::new(config, Arc::new(SystemClock));
        let mut rng = StdRng::seed_from_u64(7);
        let c = generator.random_condition(&mut rng);
        assert!(c.metric.starts_with("pattern_") || c.metric.starts_with("metric_"));
    }
}
