//! Paper execution
//!
//! Simulates fills against the metric feed's last price with slippage, fees
//! and latency, and simulates discovery trials with a fixed payoff profile.

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Fill, Order, OrderExecutor, TrialRunner};
use crate::error::ExecutionError;
use crate::feed::{MetricFeed, PRICE_METRIC};
use crate::types::{f64_to_decimal, Hypothesis, Side, TrialOutcome};

/// Paper trading configuration
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Simulated slippage in basis points (e.g., 5 = 0.05%)
    pub slippage_bps: f64,
    /// Simulated fee in basis points
    pub fee_bps: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Share of orders the simulated venue rejects
    pub reject_probability: f64,
    /// Win probability of a simulated trial
    pub trial_win_probability: f64,
    /// Winning trial return range, as a fraction of stake
    pub trial_win_range: (f64, f64),
    /// Losing trial loss range, as a fraction of stake
    pub trial_loss_range: (f64, f64),
    /// Price used when the feed has no price yet
    pub fallback_price: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 5.0,
            fee_bps: 10.0,
            min_latency_ms: 5,
            max_latency_ms: 40,
            reject_probability: 0.02,
            trial_win_probability: 0.45,
            trial_win_range: (0.10, 0.30),
            trial_loss_range: (0.05, 0.15),
            fallback_price: 100.0,
        }
    }
}

/// Simulated order venue
pub struct PaperExecutor {
    config: PaperConfig,
    feed: Arc<dyn MetricFeed>,
    symbol: String,
}

impl PaperExecutor {
    pub fn new(config: PaperConfig, feed: Arc<dyn MetricFeed>, symbol: impl Into<String>) -> Self {
        Self {
            config,
            feed,
            symbol: symbol.into(),
        }
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn submit(&self, order: Order) -> Result<Fill, ExecutionError> {
        let base_price = self
            .feed
            .get_metric(PRICE_METRIC, &self.symbol)
            .filter(|p| *p > 0.0)
            .ok_or_else(|| ExecutionError::Unavailable(format!("no price for {}", self.symbol)))?;

        // Draw everything up front; the rng must not live across the await.
        let (latency_ms, rejected) = {
            let mut rng = rand::thread_rng();
            let lo = self.config.min_latency_ms;
            let hi = self.config.max_latency_ms.max(lo);
            (
                rng.gen_range(lo..=hi),
                rng.gen_bool(self.config.reject_probability.clamp(0.0, 1.0)),
            )
        };
        let latency = Duration::from_millis(latency_ms);
        tokio::time::sleep(latency).await;

        if rejected {
            return Err(ExecutionError::Rejected("simulated venue rejection".to_string()));
        }

        let slippage = self.config.slippage_bps / 10_000.0;
        let fill_price = match order.side {
            Side::Buy => base_price * (1.0 + slippage),
            Side::Sell => base_price * (1.0 - slippage),
        };
        let fees = order.size * f64_to_decimal(self.config.fee_bps / 10_000.0);

        debug!(
            pattern_id = %order.pattern_id,
            side = %order.side,
            size = %order.size,
            fill_price,
            latency_ms,
            "Paper fill"
        );

        Ok(Fill {
            filled: true,
            fill_price: f64_to_decimal(fill_price).round_dp(8),
            fees: fees.round_dp(6),
            latency,
        })
    }
}

/// Simulated discovery trials
pub struct PaperTrialRunner {
    config: PaperConfig,
    feed: Option<Arc<dyn MetricFeed>>,
    symbol: String,
}

impl PaperTrialRunner {
    pub fn new(config: PaperConfig, symbol: impl Into<String>) -> Self {
        Self {
            config,
            feed: None,
            symbol: symbol.into(),
        }
    }

    pub fn with_feed(mut self, feed: Arc<dyn MetricFeed>) -> Self {
        self.feed = Some(feed);
        self
    }
}

#[async_trait]
impl TrialRunner for PaperTrialRunner {
    async fn run_trial(
        &self,
        hypothesis: &Hypothesis,
        stake: Decimal,
    ) -> Result<TrialOutcome, ExecutionError> {
        let entry = self
            .feed
            .as_ref()
            .and_then(|f| f.get_metric(PRICE_METRIC, &self.symbol))
            .filter(|p| *p > 0.0)
            .unwrap_or(self.config.fallback_price);

        let mut rng = rand::thread_rng();
        let profitable = rng.gen_bool(self.config.trial_win_probability.clamp(0.0, 1.0));
        let ret = if profitable {
            let (lo, hi) = self.config.trial_win_range;
            rng.gen_range(lo..=hi.max(lo))
        } else {
            let (lo, hi) = self.config.trial_loss_range;
            -rng.gen_range(lo..=hi.max(lo))
        };
        let max_secs = (hypothesis.timeframe_minutes as u64 * 60).max(60);
        let duration_secs = rng.gen_range(60..=max_secs.min(3600).max(60));

        Ok(TrialOutcome {
            hypothesis_id: hypothesis.id.clone(),
            profitable,
            profit: (stake * f64_to_decimal(ret)).round_dp(6),
            entry_price: f64_to_decimal(entry),
            exit_price: f64_to_decimal(entry * (1.0 + ret)),
            duration_secs,
        })
    }
}
