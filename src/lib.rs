//! PatternBot Library
//!
//! Autonomous pattern lifecycle engine: hypothesis discovery, trial-based
//! promotion, risk-gated scheduling and periodic evolution.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod evolution;
pub mod execution;
pub mod feed;
pub mod persistence;
pub mod risk;
pub mod scheduler;
pub mod system;
pub mod types;

pub use error::{Error, ExecutionError, Result};
