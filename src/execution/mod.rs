//! Execution collaborators
//!
//! Orders and discovery trials leave the engine through these traits. The
//! paper implementations simulate both against a [`MetricFeed`](crate::feed::MetricFeed).

mod paper;

pub use paper::{PaperConfig, PaperExecutor, PaperTrialRunner};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::error::ExecutionError;
use crate::types::{Hypothesis, PatternId, PositionId, Side, TrialOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub pattern_id: PatternId,
    pub position_id: PositionId,
    pub side: Side,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub filled: bool,
    pub fill_price: Decimal,
    pub fees: Decimal,
    pub latency: Duration,
}

/// Routes orders to a venue
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn submit(&self, order: Order) -> Result<Fill, ExecutionError>;
}

/// Runs one empirical test of a hypothesis with a fixed stake
#[async_trait]
pub trait TrialRunner: Send + Sync {
    async fn run_trial(
        &self,
        hypothesis: &Hypothesis,
        stake: Decimal,
    ) -> Result<TrialOutcome, ExecutionError>;
}
