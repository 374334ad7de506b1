//! Lifecycle persistence
//!
//! Every hypothesis, trial, pattern transition, position open/close,
//! generation record and risk transition is written as a flat record with
//! enough fields to rebuild the lineage afterwards.

mod csv_store;
mod memory;

pub use csv_store::CsvPersistence;
pub use memory::{MemoryStore, NoopStore};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::risk::RiskEvent;
use crate::types::{
    decimal_to_f64, Candidate, Condition, GenerationRecord, Pattern, PatternId, Position,
    TrialOutcome,
};

/// Hypothesis registration (fresh, mutated, crossed or injected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisRecord {
    pub timestamp: i64,
    pub hypothesis_id: String,
    pub generation: u32,
    pub parent_ids: String,
    pub ai_enhanced: bool,
    pub timeframe_minutes: u32,
    pub entry_conditions: String,
    pub exit_conditions: String,
    pub created_at: i64,
}

impl HypothesisRecord {
    pub fn new(candidate: &Candidate, at: DateTime<Utc>) -> Self {
        let h = &candidate.hypothesis;
        Self {
            timestamp: at.timestamp_millis(),
            hypothesis_id: h.id.to_string(),
            generation: candidate.generation,
            parent_ids: join_ids(&candidate.parent_ids),
            ai_enhanced: candidate.ai_enhanced,
            timeframe_minutes: h.timeframe_minutes,
            entry_conditions: join_conditions(&h.entry_conditions),
            exit_conditions: join_conditions(&h.exit_conditions),
            created_at: h.created_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub timestamp: i64,
    pub hypothesis_id: String,
    pub profitable: bool,
    pub profit: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub duration_secs: u64,
}

impl TrialRecord {
    pub fn new(outcome: &TrialOutcome, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.timestamp_millis(),
            hypothesis_id: outcome.hypothesis_id.to_string(),
            profitable: outcome.profitable,
            profit: decimal_to_f64(outcome.profit),
            entry_price: decimal_to_f64(outcome.entry_price),
            exit_price: decimal_to_f64(outcome.exit_price),
            duration_secs: outcome.duration_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternEvent {
    Promoted,
    StatsUpdated,
    Deactivated,
    Retired,
}

impl fmt::Display for PatternEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternEvent::Promoted => write!(f, "PROMOTED"),
            PatternEvent::StatsUpdated => write!(f, "STATS_UPDATED"),
            PatternEvent::Deactivated => write!(f, "DEACTIVATED"),
            PatternEvent::Retired => write!(f, "RETIRED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub timestamp: i64,
    pub event: String,
    pub pattern_id: String,
    pub generation: u32,
    pub parent_ids: String,
    pub ai_enhanced: bool,
    pub is_active: bool,
    pub timeframe_minutes: u32,
    pub test_count: u32,
    pub win_count: u32,
    pub win_rate: f64,
    pub sharpe_ratio: f64,
    pub total_profit: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub last_triggered: Option<i64>,
}

impl PatternRecord {
    pub fn new(event: PatternEvent, pattern: &Pattern, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.timestamp_millis(),
            event: event.to_string(),
            pattern_id: pattern.id.to_string(),
            generation: pattern.generation,
            parent_ids: join_ids(&pattern.parent_ids),
            ai_enhanced: pattern.ai_enhanced,
            is_active: pattern.is_active,
            timeframe_minutes: pattern.hypothesis.timeframe_minutes,
            test_count: pattern.test_count(),
            win_count: pattern.win_count(),
            win_rate: pattern.win_rate,
            sharpe_ratio: pattern.sharpe_ratio,
            total_profit: decimal_to_f64(pattern.total_profit()),
            avg_win: decimal_to_f64(pattern.avg_win),
            avg_loss: decimal_to_f64(pattern.avg_loss),
            last_triggered: pattern.last_triggered().map(|t| t.timestamp_millis()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionEvent {
    Opened,
    Closed,
    Liquidated,
}

impl fmt::Display for PositionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionEvent::Opened => write!(f, "OPENED"),
            PositionEvent::Closed => write!(f, "CLOSED"),
            PositionEvent::Liquidated => write!(f, "LIQUIDATED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub timestamp: i64,
    pub event: String,
    pub position_id: String,
    pub pattern_id: String,
    pub size: f64,
    pub entry_price: f64,
    pub entry_time: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub fees: f64,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub exit_reason: Option<String>,
}

impl PositionRecord {
    pub fn opened(position: &Position, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.timestamp_millis(),
            event: PositionEvent::Opened.to_string(),
            position_id: position.id.to_string(),
            pattern_id: position.pattern_id.to_string(),
            size: decimal_to_f64(position.size),
            entry_price: decimal_to_f64(position.entry_price),
            entry_time: position.entry_time.timestamp_millis(),
            stop_loss: decimal_to_f64(position.stop_loss),
            take_profit: decimal_to_f64(position.take_profit),
            fees: decimal_to_f64(position.fees),
            exit_price: None,
            pnl: None,
            exit_reason: None,
        }
    }

    pub fn closed(
        event: PositionEvent,
        position: &Position,
        exit_price: f64,
        pnl: f64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event: event.to_string(),
            exit_price: Some(exit_price),
            pnl: Some(pnl),
            exit_reason: Some(reason.to_string()),
            ..Self::opened(position, at)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRow {
    pub timestamp: i64,
    pub generation_number: u32,
    pub population_before: usize,
    pub population_after: usize,
    pub avg_fitness_before: f64,
    pub avg_fitness_after: f64,
    pub top_performer_id: Option<String>,
}

impl From<&GenerationRecord> for GenerationRow {
    fn from(r: &GenerationRecord) -> Self {
        Self {
            timestamp: r.timestamp.timestamp_millis(),
            generation_number: r.generation_number,
            population_before: r.population_before,
            population_after: r.population_after,
            avg_fitness_before: r.avg_fitness_before,
            avg_fitness_after: r.avg_fitness_after,
            top_performer_id: r.top_performer_id.as_ref().map(|id| id.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEventRecord {
    pub timestamp: i64,
    pub kind: String,
    pub severity: String,
    pub description: String,
    pub capital: f64,
    pub reserved: f64,
    pub high_watermark: f64,
    pub drawdown: f64,
    pub loss_15m: f64,
    pub loss_1h: f64,
    pub loss_24h: f64,
    pub emergency_stop: bool,
    pub breaker_15m_until: Option<i64>,
    pub breaker_1h_until: Option<i64>,
    pub open_positions: usize,
}

impl From<&RiskEvent> for RiskEventRecord {
    fn from(event: &RiskEvent) -> Self {
        let s = &event.snapshot;
        Self {
            timestamp: s.at.timestamp_millis(),
            kind: event.kind.to_string(),
            severity: event.severity().to_string(),
            description: event.description.clone(),
            capital: decimal_to_f64(s.current_capital),
            reserved: decimal_to_f64(s.reserved),
            high_watermark: decimal_to_f64(s.daily_high_watermark),
            drawdown: s.drawdown,
            loss_15m: decimal_to_f64(s.loss_15m),
            loss_1h: decimal_to_f64(s.loss_1h),
            loss_24h: decimal_to_f64(s.loss_24h),
            emergency_stop: s.emergency_stop,
            breaker_15m_until: s.breaker_15m_until.map(|t| t.timestamp_millis()),
            breaker_1h_until: s.breaker_1h_until.map(|t| t.timestamp_millis()),
            open_positions: s.open_positions,
        }
    }
}

/// Durable sink for lifecycle records
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn save_hypothesis(&self, record: HypothesisRecord) -> Result<()>;
    async fn save_trial(&self, record: TrialRecord) -> Result<()>;
    async fn save_pattern(&self, record: PatternRecord) -> Result<()>;
    async fn save_position(&self, record: PositionRecord) -> Result<()>;
    async fn save_generation(&self, record: GenerationRow) -> Result<()>;
    async fn save_risk_event(&self, record: RiskEventRecord) -> Result<()>;

    /// Highest generation number already on record, used to resume numbering
    async fn last_generation(&self) -> Result<Option<u32>> {
        Ok(None)
    }
}

fn join_ids(ids: &[PatternId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

fn join_conditions(conditions: &[Condition]) -> String {
    conditions
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" & ")
}
