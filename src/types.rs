//! Core types used throughout PatternBot
//!
//! Defines the lifecycle data model: conditions, hypotheses, trial outcomes,
//! patterns, positions and generation records.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 16;

/// Trading days used to annualise per-trade Sharpe ratios.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const MINUTES_PER_DAY: f64 = 1440.0;

/// Comparison applied by a [`Condition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Lt,
    Eq,
    CrossesAbove,
    CrossesBelow,
}

impl Operator {
    pub const ALL: [Operator; 5] = [
        Operator::Gt,
        Operator::Lt,
        Operator::Eq,
        Operator::CrossesAbove,
        Operator::CrossesBelow,
    ];
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Gt => write!(f, ">"),
            Operator::Lt => write!(f, "<"),
            Operator::Eq => write!(f, "=="),
            Operator::CrossesAbove => write!(f, "crosses_above"),
            Operator::CrossesBelow => write!(f, "crosses_below"),
        }
    }
}

/// A single rule clause: `metric <operator> value`, weighted in `[0, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub metric: String,
    pub operator: Operator,
    pub value: f64,
    pub weight: f64,
}

impl Condition {
    pub fn new(metric: impl Into<String>, operator: Operator, value: f64, weight: f64) -> Self {
        Self {
            metric: metric.into(),
            operator,
            value,
            weight: weight.clamp(0.0, 1.0),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.4} (w={:.2})",
            self.metric, self.operator, self.value, self.weight
        )
    }
}

/// Content-derived hypothesis fingerprint. Patterns keep the id of the
/// hypothesis they were promoted from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HypothesisId(pub String);

impl HypothesisId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HypothesisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HypothesisId {
    fn from(s: &str) -> Self {
        HypothesisId(s.to_string())
    }
}

/// Identity of an active (or retired) pattern
pub type PatternId = HypothesisId;

/// An untested candidate entry/exit rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: HypothesisId,
    pub entry_conditions: Vec<Condition>,
    pub exit_conditions: Vec<Condition>,
    /// Holding horizon and trigger cooldown, 1..=1440 minutes
    pub timeframe_minutes: u32,
    pub created_at: DateTime<Utc>,
}

impl Hypothesis {
    pub const MIN_TIMEFRAME: u32 = 1;
    pub const MAX_TIMEFRAME: u32 = 1440;

    /// Build a hypothesis, fingerprinting its content together with `salt`.
    pub fn new(
        entry_conditions: Vec<Condition>,
        exit_conditions: Vec<Condition>,
        timeframe_minutes: u32,
        created_at: DateTime<Utc>,
        salt: u64,
    ) -> Self {
        let timeframe_minutes = timeframe_minutes.clamp(Self::MIN_TIMEFRAME, Self::MAX_TIMEFRAME);
        let id = Self::fingerprint(
            &entry_conditions,
            &exit_conditions,
            timeframe_minutes,
            created_at,
            salt,
        );
        Self {
            id,
            entry_conditions,
            exit_conditions,
            timeframe_minutes,
            created_at,
        }
    }

    /// Deterministic fingerprint of the hypothesis fields plus a uniqueness salt
    pub fn fingerprint(
        entry: &[Condition],
        exit: &[Condition],
        timeframe_minutes: u32,
        created_at: DateTime<Utc>,
        salt: u64,
    ) -> HypothesisId {
        let mut hasher = Sha256::new();
        for (tag, conditions) in [("entry", entry), ("exit", exit)] {
            hasher.update(tag.as_bytes());
            for c in conditions {
                hasher.update(c.metric.as_bytes());
                hasher.update(c.operator.to_string().as_bytes());
                hasher.update(c.value.to_le_bytes());
                hasher.update(c.weight.to_le_bytes());
            }
        }
        hasher.update(timeframe_minutes.to_le_bytes());
        hasher.update(created_at.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
        hasher.update(salt.to_le_bytes());

        let digest = hex::encode(hasher.finalize());
        HypothesisId(digest[..FINGERPRINT_LEN].to_string())
    }

    /// Minimum spacing between two triggers of the same pattern
    pub fn cooldown(&self) -> Duration {
        Duration::minutes(self.timeframe_minutes as i64)
    }

    /// Annualisation factor for per-trade returns on this timeframe
    pub fn annualization_factor(&self) -> f64 {
        let trades_per_day = (MINUTES_PER_DAY / self.timeframe_minutes.max(1) as f64).max(1.0);
        (TRADING_DAYS_PER_YEAR * trades_per_day).sqrt()
    }
}

/// Hypothesis plus the lineage it will carry once promoted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub hypothesis: Hypothesis,
    pub generation: u32,
    pub parent_ids: Vec<PatternId>,
    pub ai_enhanced: bool,
}

impl Candidate {
    /// A generation-zero candidate with no parents
    pub fn fresh(hypothesis: Hypothesis) -> Self {
        Self {
            hypothesis,
            generation: 0,
            parent_ids: Vec::new(),
            ai_enhanced: false,
        }
    }

    pub fn id(&self) -> &HypothesisId {
        &self.hypothesis.id
    }
}

/// One empirical trial of a hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub hypothesis_id: HypothesisId,
    pub profitable: bool,
    pub profit: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub duration_secs: u64,
}

/// Running trade statistics of a pattern
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub test_count: u32,
    pub win_count: u32,
    pub total_profit: Decimal,
    /// Sum of profits on winning trades
    pub gross_win: Decimal,
    /// Sum of absolute losses on losing trades
    pub gross_loss: Decimal,
    /// Welford running mean of per-trade returns
    pub return_mean: f64,
    /// Welford running sum of squared deviations
    pub return_m2: f64,
    pub last_triggered: Option<DateTime<Utc>>,
}

impl PatternStats {
    /// Fold one completed trade into the statistics; a win is a positive profit
    pub fn record(&mut self, profit: Decimal, trade_return: f64) {
        self.record_trade(profit > Decimal::ZERO, profit, trade_return);
    }

    /// Fold one completed trade whose win/loss verdict is decided by the caller
    pub fn record_trade(&mut self, won: bool, profit: Decimal, trade_return: f64) {
        self.test_count += 1;
        if won {
            self.win_count += 1;
            self.gross_win += profit;
        } else {
            self.gross_loss += profit.abs();
        }
        self.total_profit += profit;

        let n = self.test_count as f64;
        let delta = trade_return - self.return_mean;
        self.return_mean += delta / n;
        self.return_m2 += delta * (trade_return - self.return_mean);

        debug_assert!(self.win_count <= self.test_count);
    }

    /// An execution that never resolved counts as a losing trial with no profit
    pub fn record_unresolved(&mut self) {
        self.record(Decimal::ZERO, 0.0);
    }

    pub fn loss_count(&self) -> u32 {
        self.test_count - self.win_count
    }

    pub fn win_rate(&self) -> f64 {
        if self.test_count == 0 {
            return 0.0;
        }
        self.win_count as f64 / self.test_count as f64
    }

    pub fn avg_win(&self) -> Decimal {
        if self.win_count == 0 {
            return Decimal::ZERO;
        }
        self.gross_win / Decimal::from(self.win_count)
    }

    pub fn avg_loss(&self) -> Decimal {
        let losses = self.loss_count();
        if losses == 0 {
            return Decimal::ZERO;
        }
        self.gross_loss / Decimal::from(losses)
    }

    /// Annualised mean/stdev of per-trade returns (population stdev)
    pub fn sharpe_ratio(&self, annualization: f64) -> f64 {
        if self.test_count < 2 {
            return 0.0;
        }
        let std_dev = (self.return_m2 / self.test_count as f64).sqrt();
        if std_dev == 0.0 || !std_dev.is_finite() {
            return 0.0;
        }
        (self.return_mean / std_dev) * annualization
    }
}

/// A validated hypothesis eligible for live scheduling, as seen from outside
/// the registry (a consistent snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub hypothesis: Hypothesis,
    /// Running counts, profit and trigger time
    pub stats: PatternStats,
    pub win_rate: f64,
    pub sharpe_ratio: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub generation: u32,
    pub parent_ids: Vec<PatternId>,
    pub ai_enhanced: bool,
    pub is_active: bool,
}

impl Pattern {
    /// Snapshot a pattern from its lineage and statistics
    pub fn from_stats(candidate: &Candidate, stats: &PatternStats, is_active: bool) -> Self {
        let hypothesis = candidate.hypothesis.clone();
        let sharpe_ratio = stats.sharpe_ratio(hypothesis.annualization_factor());
        Self {
            id: hypothesis.id.clone(),
            stats: stats.clone(),
            win_rate: stats.win_rate(),
            sharpe_ratio,
            avg_win: stats.avg_win(),
            avg_loss: stats.avg_loss(),
            generation: candidate.generation,
            parent_ids: candidate.parent_ids.clone(),
            ai_enhanced: candidate.ai_enhanced,
            is_active,
            hypothesis,
        }
    }

    /// A requalifying pattern: zero statistics, inactive
    pub fn unproven(candidate: &Candidate) -> Self {
        Self::from_stats(candidate, &PatternStats::default(), false)
    }

    pub fn test_count(&self) -> u32 {
        self.stats.test_count
    }

    pub fn win_count(&self) -> u32 {
        self.stats.win_count
    }

    pub fn total_profit(&self) -> Decimal {
        self.stats.total_profit
    }

    pub fn last_triggered(&self) -> Option<DateTime<Utc>> {
        self.stats.last_triggered
    }

    pub fn candidate(&self) -> Candidate {
        Candidate {
            hypothesis: self.hypothesis.clone(),
            generation: self.generation,
            parent_ids: self.parent_ids.clone(),
            ai_enhanced: self.ai_enhanced,
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Identity of a reserved or open position
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub String);

impl PositionId {
    pub fn new() -> Self {
        PositionId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a position is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Capital reserved, entry order in flight
    Pending,
    /// Entry filled
    Open,
    /// Exit order in flight
    Closing,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Pending => write!(f, "PENDING"),
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closing => write!(f, "CLOSING"),
        }
    }
}

/// Capital committed to one execution of a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub pattern_id: PatternId,
    pub size: Decimal,
    /// Zero until the entry fills
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Fees paid on entry
    pub fees: Decimal,
    pub status: PositionStatus,
}

impl Position {
    /// Gross profit of closing `size` at `exit_price`
    pub fn gross_pnl(&self, exit_price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (exit_price - self.entry_price) / self.entry_price * self.size
    }

    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_time
    }
}

/// Immutable summary of one evolution cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation_number: u32,
    pub timestamp: DateTime<Utc>,
    pub population_before: usize,
    pub population_after: usize,
    pub avg_fitness_before: f64,
    pub avg_fitness_after: f64,
    pub top_performer_id: Option<PatternId>,
}

/// Convert a decimal amount to f64 for statistics; non-representable values map to 0
pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Convert an f64 ratio or amount to a decimal; NaN and infinities map to 0
pub fn f64_to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn condition() -> Condition {
        Condition::new("price_delta_5m", Operator::Gt, 1.5, 0.8)
    }

    #[test]
    fn fingerprint_is_deterministic_and_salted() {
        let at = Utc::now();
        let a = Hypothesis::fingerprint(&[condition()], &[condition()], 15, at, 7);
        let b = Hypothesis::fingerprint(&[condition()], &[condition()], 15, at, 7);
        let c = Hypothesis::fingerprint(&[condition()], &[condition()], 15, at, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn timeframe_is_clamped() {
        let h = Hypothesis::new(vec![condition()], vec![condition()], 5000, Utc::now(), 1);
        assert_eq!(h.timeframe_minutes, Hypothesis::MAX_TIMEFRAME);
        let h = Hypothesis::new(vec![condition()], vec![condition()], 0, Utc::now(), 1);
        assert_eq!(h.timeframe_minutes, Hypothesis::MIN_TIMEFRAME);
    }

    #[test]
    fn stats_keep_wins_within_tests() {
        let mut stats = PatternStats::default();
        assert_eq!(stats.win_rate(), 0.0);

        stats.record(dec!(2), 0.4);
        stats.record(dec!(-1), -0.2);
        stats.record_unresolved();

        assert_eq!(stats.test_count, 3);
        assert_eq!(stats.win_count, 1);
        assert!(stats.win_count <= stats.test_count);
        assert!((stats.win_rate() - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.total_profit, dec!(1));
        assert_eq!(stats.avg_win(), dec!(2));
        assert_eq!(stats.avg_loss(), dec!(0.5));
    }

    #[test]
    fn sharpe_zero_without_dispersion() {
        let mut stats = PatternStats::default();
        for _ in 0..10 {
            stats.record(dec!(1), 0.2);
        }
        assert_eq!(stats.sharpe_ratio(10.0), 0.0);

        stats.record(dec!(-1), -0.2);
        assert!(stats.sharpe_ratio(10.0) > 0.0);
    }

    #[test]
    fn position_pnl_scales_with_size() {
        let position = Position {
            id: PositionId::new(),
            pattern_id: "abc".into(),
            size: dec!(50),
            entry_price: dec!(100),
            entry_time: Utc::now(),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            fees: Decimal::ZERO,
            status: PositionStatus::Open,
        };
        assert_eq!(position.gross_pnl(dec!(110)), dec!(5));
        assert_eq!(position.gross_pnl(dec!(90)), dec!(-5));
    }
}
