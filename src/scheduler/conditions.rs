//! Condition interpreter
//!
//! A [`MetricFrame`] is built once per tick. Each metric is read from the feed
//! at most once per frame, and crossing operators compare against the value
//! seen on the previous tick.

use std::collections::HashMap;

use crate::feed::{MetricFeed, PRICE_METRIC};
use crate::types::{Condition, Operator};

/// Relative tolerance for `Eq`, with an absolute floor for targets near zero
const EQ_RELATIVE_TOLERANCE: f64 = 0.01;
const EQ_ABSOLUTE_TOLERANCE: f64 = 0.01;

/// Threshold comparisons carry float noise from weight sums
const THRESHOLD_EPSILON: f64 = 1e-9;

pub struct MetricFrame<'a> {
    feed: &'a dyn MetricFeed,
    symbol: &'a str,
    current: HashMap<String, Option<f64>>,
    previous: HashMap<String, f64>,
}

impl<'a> MetricFrame<'a> {
    pub fn new(feed: &'a dyn MetricFeed, symbol: &'a str, previous: HashMap<String, f64>) -> Self {
        Self {
            feed,
            symbol,
            current: HashMap::new(),
            previous,
        }
    }

    /// Value of `name` on this tick, cached for the life of the frame
    pub fn current(&mut self, name: &str) -> Option<f64> {
        if let Some(value) = self.current.get(name) {
            return *value;
        }
        let value = self
            .feed
            .get_metric(name, self.symbol)
            .filter(|v| v.is_finite());
        self.current.insert(name.to_string(), value);
        value
    }

    pub fn previous(&self, name: &str) -> Option<f64> {
        self.previous.get(name).copied()
    }

    pub fn price(&mut self) -> Option<f64> {
        self.current(PRICE_METRIC).filter(|p| *p > 0.0)
    }

    pub fn condition_holds(&mut self, condition: &Condition) -> bool {
        let Some(value) = self.current(&condition.metric) else {
            return false;
        };
        let target = condition.value;

        match condition.operator {
            Operator::Gt => value > target,
            Operator::Lt => value < target,
            Operator::Eq => {
                let tolerance = (target.abs() * EQ_RELATIVE_TOLERANCE).max(EQ_ABSOLUTE_TOLERANCE);
                (value - target).abs() <= tolerance
            }
            Operator::CrossesAbove => self
                .previous(&condition.metric)
                .map(|prev| prev <= target && value > target)
                .unwrap_or(false),
            Operator::CrossesBelow => self
                .previous(&condition.metric)
                .map(|prev| prev >= target && value < target)
                .unwrap_or(false),
        }
    }

    /// Weighted share of satisfied conditions
    pub fn satisfied_share(&mut self, conditions: &[Condition]) -> f64 {
        if conditions.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        let mut satisfied = 0.0;
        let mut count = 0usize;
        for condition in conditions {
            total += condition.weight;
            if self.condition_holds(condition) {
                satisfied += condition.weight;
                count += 1;
            }
        }
        if total <= 0.0 {
            // All weights zero: fall back to an unweighted count
            return count as f64 / conditions.len() as f64;
        }
        satisfied / total
    }

    /// True when the weighted share reaches `threshold`. An empty rule never fires.
    pub fn rule_fires(&mut self, conditions: &[Condition], threshold: f64) -> bool {
        !conditions.is_empty()
            && self.satisfied_share(conditions) + THRESHOLD_EPSILON >= threshold
    }

    /// Merge this tick's readings into the history handed to the next frame
    pub fn into_previous(self) -> HashMap<String, f64> {
        let mut previous = self.previous;
        for (name, value) in self.current {
            if let Some(value) = value {
                previous.insert(name, value);
            }
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::StaticMetricFeed;

    fn feed(values: &[(&str, f64)]) -> StaticMetricFeed {
        let feed = StaticMetricFeed::new();
        for (name, value) in values {
            feed.set("BTC", name, *value);
        }
        feed
    }

    #[test]
    fn comparison_operators() {
        let feed = feed(&[("volume_spike", 3.0), ("bid_ask_spread", 0.05)]);
        let mut frame = MetricFrame::new(&feed, "BTC", HashMap::new());

        assert!(frame.condition_holds(&Condition::new("volume_spike", Operator::Gt, 2.0, 1.0)));
        assert!(!frame.condition_holds(&Condition::new("volume_spike", Operator::Lt, 2.0, 1.0)));
        assert!(frame.condition_holds(&Condition::new("volume_spike", Operator::Eq, 3.02, 1.0)));
        assert!(!frame.condition_holds(&Condition::new("volume_spike", Operator::Eq, 3.5, 1.0)));
        // Absolute floor near zero
        assert!(frame.condition_holds(&Condition::new("bid_ask_spread", Operator::Eq, 0.055, 1.0)));
    }

    #[test]
    fn unknown_metric_is_unsatisfied() {
        let feed = feed(&[]);
        let mut frame = MetricFrame::new(&feed, "BTC", HashMap::new());
        assert!(!frame.condition_holds(&Condition::new("metric_ff", Operator::Gt, -100.0, 1.0)));
        assert!(!frame.condition_holds(&Condition::new("metric_ff", Operator::Lt, 100.0, 1.0)));
    }

    #[test]
    fn crossings_need_previous_tick() {
        let feed = feed(&[("price_delta_1m", 0.5)]);
        let above = Condition::new("price_delta_1m", Operator::CrossesAbove, 0.0, 1.0);
        let below = Condition::new("price_delta_1m", Operator::CrossesBelow, 0.0, 1.0);

        let mut frame = MetricFrame::new(&feed, "BTC", HashMap::new());
        assert!(!frame.condition_holds(&above));
        let previous = frame.into_previous();
        assert_eq!(previous.get("price_delta_1m"), Some(&0.5));

        feed.set("BTC", "price_delta_1m", -0.5);
        let mut frame = MetricFrame::new(&feed, "BTC", previous);
        assert!(frame.condition_holds(&below));
        assert!(!frame.condition_holds(&above));

        feed.set("BTC", "price_delta_1m", 0.2);
        let mut frame = MetricFrame::new(&feed, "BTC", frame.into_previous());
        assert!(frame.condition_holds(&above));
    }

    #[test]
    fn weighted_threshold() {
        let feed = feed(&[("volume_spike", 3.0), ("order_book_imbalance", -0.4)]);
        let rule = vec![
            Condition::new("volume_spike", Operator::Gt, 2.0, 0.75),
            Condition::new("order_book_imbalance", Operator::Gt, 0.0, 0.25),
        ];
        let mut frame = MetricFrame::new(&feed, "BTC", HashMap::new());

        assert!((frame.satisfied_share(&rule) - 0.75).abs() < 1e-12);
        assert!(!frame.rule_fires(&rule, 1.0));
        assert!(frame.rule_fires(&rule, 0.7));
        assert!(!frame.rule_fires(&[], 0.0));

        let unweighted = vec![
            Condition::new("volume_spike", Operator::Gt, 2.0, 0.0),
            Condition::new("order_book_imbalance", Operator::Gt, 0.0, 0.0),
        ];
        assert!((frame.satisfied_share(&unweighted) - 0.5).abs() < 1e-12);
    }
}
