//! Genetic operators over hypotheses
//!
//! Offspring are always fresh candidates: new id, zero statistics, one
//! generation past their youngest parent.

use rand::Rng;

use crate::discovery::HypothesisGenerator;
use crate::types::{Candidate, Condition, Hypothesis, Pattern};

pub const MIN_CONDITIONS: usize = 1;
pub const MAX_CONDITIONS: usize = 8;

/// Timeframe perturbation (±20%)
const TIMEFRAME_JITTER: (f64, f64) = (0.8, 1.2);
/// Threshold perturbation of a modified condition (±10%)
const VALUE_JITTER: (f64, f64) = (0.9, 1.1);
/// Share of structural edits applied to entry rather than exit conditions
const ENTRY_EDIT_PROBABILITY: f64 = 2.0 / 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Add,
    Remove,
    Modify,
}

/// One mutated child of `parent`.
///
/// The timeframe is always jittered; then exactly one condition is added,
/// removed or modified; then each weight is re-rolled with probability
/// `mutation_rate`.
pub fn mutate<R: Rng>(
    parent: &Pattern,
    generator: &HypothesisGenerator,
    mutation_rate: f64,
    rng: &mut R,
) -> Candidate {
    let source = &parent.hypothesis;
    let mut entry = source.entry_conditions.clone();
    let mut exit = source.exit_conditions.clone();

    let scale = rng.gen_range(TIMEFRAME_JITTER.0..=TIMEFRAME_JITTER.1);
    let timeframe = (source.timeframe_minutes as f64 * scale).round() as u32;

    if rng.gen_bool(ENTRY_EDIT_PROBABILITY) {
        edit_conditions(&mut entry, generator, rng);
    } else {
        edit_conditions(&mut exit, generator, rng);
    }

    let rate = mutation_rate.clamp(0.0, 1.0);
    for condition in entry.iter_mut().chain(exit.iter_mut()) {
        if rng.gen_bool(rate) {
            condition.weight = generator.random_weight(rng);
        }
    }

    Candidate {
        hypothesis: Hypothesis::new(entry, exit, timeframe, generator.now(), rng.gen()),
        generation: parent.generation + 1,
        parent_ids: vec![parent.id.clone()],
        ai_enhanced: false,
    }
}

fn edit_conditions<R: Rng>(
    conditions: &mut Vec<Condition>,
    generator: &HypothesisGenerator,
    rng: &mut R,
) {
    let edit = match rng.gen_range(0..3) {
        0 => Edit::Add,
        1 => Edit::Remove,
        _ => Edit::Modify,
    };
    let edit = match edit {
        _ if conditions.is_empty() => Edit::Add,
        Edit::Add if conditions.len() >= MAX_CONDITIONS => Edit::Modify,
        Edit::Remove if conditions.len() <= MIN_CONDITIONS => Edit::Modify,
        other => other,
    };

    match edit {
        Edit::Add => conditions.push(generator.random_condition(rng)),
        Edit::Remove => {
            let index = rng.gen_range(0..conditions.len());
            conditions.remove(index);
        }
        Edit::Modify => {
            let index = rng.gen_range(0..conditions.len());
            conditions[index].value *= rng.gen_range(VALUE_JITTER.0..=VALUE_JITTER.1);
        }
    }
}

/// Entry conditions of the fitter parent, exit conditions of the other,
/// averaged timeframe.
pub fn crossover<R: Rng>(
    a: (&Pattern, f64),
    b: (&Pattern, f64),
    generator: &HypothesisGenerator,
    rng: &mut R,
) -> Candidate {
    let ((fitter, _), (other, _)) = if a.1 >= b.1 { (a, b) } else { (b, a) };
    let timeframe = ((fitter.hypothesis.timeframe_minutes + other.hypothesis.timeframe_minutes)
        as f64
        / 2.0)
        .round() as u32;

    Candidate {
        hypothesis: Hypothesis::new(
            fitter.hypothesis.entry_conditions.clone(),
            other.hypothesis.exit_conditions.clone(),
            timeframe,
            generator.now(),
            rng.gen(),
        ),
        generation: fitter.generation.max(other.generation) + 1,
        parent_ids: vec![fitter.id.clone(), other.id.clone()],
        ai_enhanced: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::discovery::GeneratorConfig;
    use crate::types::{Operator, PatternStats};
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn generator() -> HypothesisGenerator {
        HypothesisGenerator::new(GeneratorConfig::default(), Arc::new(SystemClock))
    }

    fn parent(entry: usize, exit: usize, timeframe: u32, generation: u32) -> Pattern {
        let conditions = |n: usize| {
            (0..n)
                .map(|i| Condition::new(format!("metric_{}", i), Operator::Gt, 10.0, 0.5))
                .collect::<Vec<_>>()
        };
        let hypothesis = Hypothesis::new(conditions(entry), conditions(exit), timeframe, Utc::now(), 0);
        let candidate = Candidate {
            hypothesis,
            generation,
            parent_ids: Vec::new(),
            ai_enhanced: false,
        };
        let mut stats = PatternStats::default();
        stats.record(rust_decimal::Decimal::ONE, 0.01);
        Pattern::from_stats(&candidate, &stats, true)
    }

    #[test]
    fn mutation_keeps_condition_count_bounded() {
        let generator = generator();
        let mut rng = StdRng::seed_from_u64(1);
        let full = parent(MAX_CONDITIONS, MAX_CONDITIONS, 60, 0);
        let thin = parent(MIN_CONDITIONS, MIN_CONDITIONS, 60, 0);

        for _ in 0..300 {
            let child = mutate(&full, &generator, 0.1, &mut rng);
            assert!(child.hypothesis.entry_conditions.len() <= MAX_CONDITIONS);
            assert!(child.hypothesis.exit_conditions.len() <= MAX_CONDITIONS);

            let child = mutate(&thin, &generator, 0.1, &mut rng);
            assert!(child.hypothesis.entry_conditions.len() >= MIN_CONDITIONS);
            assert!(child.hypothesis.exit_conditions.len() >= MIN_CONDITIONS);
        }
    }

    #[test]
    fn mutation_changes_exactly_one_condition_slot() {
        let generator = generator();
        let mut rng = StdRng::seed_from_u64(2);
        let p = parent(3, 3, 100, 4);

        for _ in 0..200 {
            let child = mutate(&p, &generator, 0.0, &mut rng);
            let h = &child.hypothesis;
            let delta = (h.entry_conditions.len() as i64 - 3).abs()
                + (h.exit_conditions.len() as i64 - 3).abs();
            assert!(delta <= 1);
            assert!((80..=120).contains(&h.timeframe_minutes));
            assert_eq!(child.generation, 5);
            assert_eq!(child.parent_ids, vec![p.id.clone()]);
            assert!(!child.ai_enhanced);
            assert_ne!(h.id, p.id);
        }
    }

    #[test]
    fn mutation_clamps_timeframe() {
        let generator = generator();
        let mut rng = StdRng::seed_from_u64(3);
        let long = parent(2, 2, 1440, 0);
        let short = parent(2, 2, 1, 0);
        for _ in 0..100 {
            assert!(mutate(&long, &generator, 0.1, &mut rng).hypothesis.timeframe_minutes <= 1440);
            assert!(mutate(&short, &generator, 0.1, &mut rng).hypothesis.timeframe_minutes >= 1);
        }
    }

    #[test]
    fn crossover_combines_fitter_entry_with_other_exit() {
        let generator = generator();
        let mut rng = StdRng::seed_from_u64(4);
        let a = parent(2, 1, 30, 2);
        let b = parent(4, 3, 61, 5);

        let child = crossover((&a, 0.4), (&b, 0.9), &generator, &mut rng);
        assert_eq!(child.hypothesis.entry_conditions, b.hypothesis.entry_conditions);
        assert_eq!(child.hypothesis.exit_conditions, a.hypothesis.exit_conditions);
        assert_eq!(child.hypothesis.timeframe_minutes, 46);
        assert_eq!(child.generation, 6);
        assert_eq!(child.parent_ids, vec![b.id.clone(), a.id.clone()]);
    }
}
