//! Domain errors for the lifecycle engine

use crate::types::{HypothesisId, PositionId};
use thiserror::Error;

/// Failures reported by an order execution collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("order unresolved after {0}ms")]
    Timeout(u64),
    #[error("execution venue unavailable: {0}")]
    Unavailable(String),
}

impl ExecutionError {
    /// Unresolved executions count against pattern statistics as a losing trial
    pub fn counts_as_loss(&self) -> bool {
        matches!(self, ExecutionError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown hypothesis {0}")]
    UnknownHypothesis(HypothesisId),
    #[error("unknown position {0}")]
    UnknownPosition(PositionId),
    #[error("an evolution cycle is already running")]
    EvolutionInProgress,
    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
