//! Risk Manager - capital ownership, sizing and circuit breakers
//!
//! Implements:
//! - Fractional Kelly position sizing
//! - Atomic check-and-reserve approval (no double-spend)
//! - 15m / 1h / 24h sliding loss windows
//! - Self-clearing breakers with lazily checked deadlines
//! - Drawdown emergency stop with forced liquidation
//!
//! All mutable state lives in one [`RiskState`] behind a mutex; nothing
//! outside this module can touch it directly.

mod kelly;
mod windows;

pub use kelly::{compute_fractional_kelly, KellyQuote};
pub use windows::{Breaker, BreakerKind, LossWindow};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertSink, LogAlertSink, Severity};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{Error, Result};
use crate::types::{
    decimal_to_f64, f64_to_decimal, Pattern, PatternId, Position, PositionId, PositionStatus,
};

/// Risk configuration
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Patterns below this win rate are never sized
    pub min_win_rate: f64,
    /// Safety multiplier applied to raw Kelly (0.25 = quarter Kelly)
    pub kelly_fraction: f64,
    /// Cap on a single sized position as a share of capital
    pub max_position_pct: f64,
    /// Smallest tradable size
    pub min_position_size: Decimal,
    /// Approval ceiling for one request as a share of current capital
    pub max_single_allocation_pct: f64,
    /// Open positions allowed per pattern
    pub max_concurrent_per_pattern: usize,
    /// Correlation above which a new position is refused
    pub max_correlation: f64,
    /// Drawdown from the daily high-water mark that stops trading
    pub max_daily_drawdown_pct: f64,
    /// 15-minute loss, as a share of current capital, that trips the short breaker
    pub loss_limit_15m_pct: f64,
    /// 1-hour loss, as a share of current capital, that trips the long breaker
    pub loss_limit_1h_pct: f64,
    pub breaker_15m_cooldown: Duration,
    pub breaker_1h_cooldown: Duration,
    /// Stop-loss distance from entry (e.g., 0.02 = 2%)
    pub stop_loss_pct: f64,
    /// Take-profit distance from entry (e.g., 0.04 = 4%)
    pub take_profit_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_win_rate: 0.55,
            kelly_fraction: 0.25,
            max_position_pct: 0.25,
            min_position_size: Decimal::from(5),
            max_single_allocation_pct: 0.50,
            max_concurrent_per_pattern: 10,
            max_correlation: 0.7,
            max_daily_drawdown_pct: 0.30,
            loss_limit_15m_pct: 0.10,
            loss_limit_1h_pct: 0.20,
            breaker_15m_cooldown: Duration::hours(1),
            breaker_1h_cooldown: Duration::hours(6),
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
        }
    }
}

/// Why an approval was refused. Denials are policy, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    EmergencyStop,
    BreakerTripped(BreakerKind),
    ZeroSize,
    PatternSaturated { open: usize },
    Correlated { rho: f64 },
    OversizedRequest { limit: Decimal },
    InsufficientCapital { available: Decimal },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::EmergencyStop => write!(f, "emergency stop active"),
            DenialReason::BreakerTripped(kind) => write!(f, "{} tripped", kind),
            DenialReason::ZeroSize => write!(f, "non-positive size"),
            DenialReason::PatternSaturated { open } => {
                write!(f, "pattern already holds {} positions", open)
            }
            DenialReason::Correlated { rho } => write!(f, "correlation {:.2} too high", rho),
            DenialReason::OversizedRequest { limit } => {
                write!(f, "size exceeds single allocation limit {:.2}", limit)
            }
            DenialReason::InsufficientCapital { available } => {
                write!(f, "only {:.2} available", available)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Approval {
    /// Capital reserved under this position id
    Approved(PositionId),
    Denied(DenialReason),
}

impl Approval {
    pub fn is_approved(&self) -> bool {
        matches!(self, Approval::Approved(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskEventKind {
    BreakerTripped(BreakerKind),
    BreakerCleared(BreakerKind),
    EmergencyStop,
    EmergencyReset,
}

impl fmt::Display for RiskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskEventKind::BreakerTripped(kind) => write!(f, "{}_TRIPPED", kind),
            RiskEventKind::BreakerCleared(kind) => write!(f, "{}_CLEARED", kind),
            RiskEventKind::EmergencyStop => write!(f, "EMERGENCY_STOP"),
            RiskEventKind::EmergencyReset => write!(f, "EMERGENCY_RESET"),
        }
    }
}

/// Point-in-time view of the risk state, used for logging and post-mortems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub at: DateTime<Utc>,
    pub current_capital: Decimal,
    pub reserved: Decimal,
    pub daily_high_watermark: Decimal,
    pub drawdown: f64,
    pub loss_15m: Decimal,
    pub loss_1h: Decimal,
    pub loss_24h: Decimal,
    pub emergency_stop: bool,
    pub breaker_15m_until: Option<DateTime<Utc>>,
    pub breaker_1h_until: Option<DateTime<Utc>>,
    pub open_positions: usize,
}

impl RiskSnapshot {
    pub fn available(&self) -> Decimal {
        (self.current_capital - self.reserved).max(Decimal::ZERO)
    }
}

/// A risk state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub kind: RiskEventKind,
    pub description: String,
    pub snapshot: RiskSnapshot,
}

impl RiskEvent {
    pub fn severity(&self) -> Severity {
        match self.kind {
            RiskEventKind::EmergencyStop => Severity::Critical,
            RiskEventKind::BreakerTripped(_) => Severity::Warning,
            RiskEventKind::BreakerCleared(_) | RiskEventKind::EmergencyReset => Severity::Info,
        }
    }

    pub fn to_alert(&self) -> Alert {
        Alert {
            kind: self.kind.to_string(),
            severity: self.severity(),
            description: self.description.clone(),
            capital_at_event: self.snapshot.current_capital,
        }
    }
}

/// Process-wide risk state. Owned by [`RiskManager`].
#[derive(Debug)]
struct RiskState {
    current_capital: Decimal,
    reserved: Decimal,
    daily_high_watermark: Decimal,
    watermark_day: NaiveDate,
    loss_15m: LossWindow,
    loss_1h: LossWindow,
    loss_24h: LossWindow,
    emergency_stop: bool,
    breaker_15m: Breaker,
    breaker_1h: Breaker,
    open_positions: HashMap<PositionId, Position>,
    /// Pairwise correlations keyed with the smaller id first
    correlations: HashMap<(PatternId, PatternId), f64>,
    /// Positions force-closed by an emergency stop, waiting for exit orders
    liquidations: Vec<Position>,
}

impl RiskState {
    fn new(capital: Decimal, config: &RiskConfig, now: DateTime<Utc>) -> Self {
        Self {
            current_capital: capital,
            reserved: Decimal::ZERO,
            daily_high_watermark: capital,
            watermark_day: now.date_naive(),
            loss_15m: LossWindow::new(Duration::minutes(15)),
            loss_1h: LossWindow::new(Duration::hours(1)),
            loss_24h: LossWindow::new(Duration::hours(24)),
            emergency_stop: false,
            breaker_15m: Breaker::new(BreakerKind::Short, config.breaker_15m_cooldown),
            breaker_1h: Breaker::new(BreakerKind::Long, config.breaker_1h_cooldown),
            open_positions: HashMap::new(),
            correlations: HashMap::new(),
            liquidations: Vec::new(),
        }
    }

    fn available(&self) -> Decimal {
        (self.current_capital - self.reserved).max(Decimal::ZERO)
    }

    fn drawdown(&self) -> f64 {
        if self.daily_high_watermark <= Decimal::ZERO {
            return 0.0;
        }
        decimal_to_f64((self.daily_high_watermark - self.current_capital) / self.daily_high_watermark)
    }

    fn snapshot(&mut self, now: DateTime<Utc>) -> RiskSnapshot {
        RiskSnapshot {
            at: now,
            current_capital: self.current_capital,
            reserved: self.reserved,
            daily_high_watermark: self.daily_high_watermark,
            drawdown: self.drawdown(),
            loss_15m: self.loss_15m.total(now),
            loss_1h: self.loss_1h.total(now),
            loss_24h: self.loss_24h.total(now),
            emergency_stop: self.emergency_stop,
            breaker_15m_until: self.breaker_15m.deadline(),
            breaker_1h_until: self.breaker_1h.deadline(),
            open_positions: self.open_positions.len(),
        }
    }

    fn correlation(&self, a: &PatternId, b: &PatternId) -> f64 {
        let key = if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        self.correlations.get(&key).copied().unwrap_or(0.0)
    }

    fn open_for_pattern(&self, pattern_id: &PatternId) -> usize {
        self.open_positions
            .values()
            .filter(|p| &p.pattern_id == pattern_id)
            .count()
    }

    /// Max |rho| between `pattern_id` and every other pattern holding capital
    fn portfolio_correlation(&self, pattern_id: &PatternId) -> f64 {
        self.open_positions
            .values()
            .filter(|p| &p.pattern_id != pattern_id)
            .map(|p| self.correlation(pattern_id, &p.pattern_id).abs())
            .fold(0.0, f64::max)
    }
}

/// Owner of the single capital pool
pub struct RiskManager {
    config: RiskConfig,
    state: Mutex<RiskState>,
    clock: SharedClock,
    alerts: Arc<dyn AlertSink>,
    /// Transitions not yet picked up for persistence
    journal: Mutex<Vec<RiskEvent>>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, starting_capital: Decimal, clock: SharedClock) -> Self {
        let now = clock.now();
        let state = RiskState::new(starting_capital, &config, now);
        info!(
            capital = %starting_capital,
            max_drawdown = config.max_daily_drawdown_pct,
            "🛡️ RiskManager initialized"
        );
        Self {
            config,
            state: Mutex::new(state),
            clock,
            alerts: Arc::new(LogAlertSink),
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RiskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forward transitions to the alert sink and the journal, outside the state lock
    fn publish(&self, events: Vec<RiskEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            self.alerts.emit(&event.to_alert());
        }
        if let Ok(mut journal) = self.journal.lock() {
            journal.extend(events);
        }
    }

    // ─── Sizing ───

    /// Fractional-Kelly size for `pattern` given `available_capital`.
    /// Returns zero when the pattern should not trade.
    pub fn size_position(&self, pattern: &Pattern, available_capital: Decimal) -> Decimal {
        if pattern.win_rate < self.config.min_win_rate {
            return Decimal::ZERO;
        }
        if pattern.avg_win.is_zero() || pattern.avg_loss.is_zero() {
            return Decimal::ZERO;
        }

        let quote = compute_fractional_kelly(
            pattern.win_rate,
            decimal_to_f64(pattern.avg_win),
            decimal_to_f64(pattern.avg_loss),
            self.config.kelly_fraction,
            1.0,
        );
        if quote.f_fractional <= 0.0 {
            debug!(pattern_id = %pattern.id, f_raw = quote.f_raw, "No Kelly edge");
            return Decimal::ZERO;
        }

        let capped = available_capital * f64_to_decimal(self.config.max_position_pct);
        let kelly = available_capital * f64_to_decimal(quote.f_fractional);
        let size = capped.min(kelly).round_dp(2);

        if size < self.config.min_position_size {
            return Decimal::ZERO;
        }
        size
    }

    // ─── Approval ───

    /// Atomically check every limit and reserve `size` for `pattern_id`.
    pub fn approve(&self, pattern_id: &PatternId, size: Decimal) -> Approval {
        let now = self.clock.now();
        let mut events = Vec::new();
        let decision = {
            let mut state = self.lock();
            self.refresh_breakers(&mut state, now, &mut events);
            self.decide(&mut state, pattern_id, size, now)
        };
        self.publish(events);

        match &decision {
            Approval::Approved(position_id) => debug!(
                pattern_id = %pattern_id,
                position_id = %position_id,
                size = %size,
                "Approved allocation"
            ),
            Approval::Denied(reason) => debug!(
                pattern_id = %pattern_id,
                size = %size,
                reason = %reason,
                "Allocation denied"
            ),
        }
        decision
    }

    fn decide(
        &self,
        state: &mut RiskState,
        pattern_id: &PatternId,
        size: Decimal,
        now: DateTime<Utc>,
    ) -> Approval {
        if state.emergency_stop {
            return Approval::Denied(DenialReason::EmergencyStop);
        }
        for breaker in [&state.breaker_15m, &state.breaker_1h] {
            if breaker.is_tripped(now) {
                return Approval::Denied(DenialReason::BreakerTripped(breaker.kind()));
            }
        }
        if size <= Decimal::ZERO {
            return Approval::Denied(DenialReason::ZeroSize);
        }

        let open = state.open_for_pattern(pattern_id);
        if open >= self.config.max_concurrent_per_pattern {
            return Approval::Denied(DenialReason::PatternSaturated { open });
        }

        let rho = state.portfolio_correlation(pattern_id);
        if rho > self.config.max_correlation {
            return Approval::Denied(DenialReason::Correlated { rho });
        }

        let limit = state.current_capital * f64_to_decimal(self.config.max_single_allocation_pct);
        if size > limit {
            return Approval::Denied(DenialReason::OversizedRequest { limit });
        }

        let available = state.available();
        if size > available {
            return Approval::Denied(DenialReason::InsufficientCapital { available });
        }

        let position = Position {
            id: PositionId::new(),
            pattern_id: pattern_id.clone(),
            size,
            entry_price: Decimal::ZERO,
            entry_time: now,
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: PositionStatus::Pending,
        };
        let id = position.id.clone();
        state.reserved += size;
        state.open_positions.insert(id.clone(), position);
        Approval::Approved(id)
    }

    // ─── Position lifecycle ───

    /// Entry filled: stamp prices and charge entry fees.
    ///
    /// If an emergency stop landed while the order was in flight the position
    /// goes straight to the liquidation queue.
    pub fn confirm_fill(
        &self,
        position_id: &PositionId,
        fill_price: Decimal,
        fees: Decimal,
    ) -> Result<Position> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let position = {
            let mut state = self.lock();
            let stopped = state.emergency_stop;
            let position = {
                let position = state
                    .open_positions
                    .get_mut(position_id)
                    .ok_or_else(|| Error::UnknownPosition(position_id.clone()))?;
                position.entry_price = fill_price;
                position.entry_time = now;
                position.fees = fees;
                position.stop_loss =
                    fill_price * (Decimal::ONE - f64_to_decimal(self.config.stop_loss_pct));
                position.take_profit =
                    fill_price * (Decimal::ONE + f64_to_decimal(self.config.take_profit_pct));
                position.status = PositionStatus::Open;
                position.clone()
            };
            if stopped {
                if let Some(mut liquidated) = state.open_positions.remove(position_id) {
                    state.reserved -= liquidated.size;
                    liquidated.status = PositionStatus::Closing;
                    state.liquidations.push(liquidated);
                }
            }
            if !fees.is_zero() {
                self.apply_capital_change(&mut state, -fees, now, &mut events);
            }
            position
        };
        self.publish(events);
        Ok(position)
    }

    /// Drop a reservation whose entry never filled
    pub fn release(&self, position_id: &PositionId) -> Result<Position> {
        let mut state = self.lock();
        let position = state
            .open_positions
            .remove(position_id)
            .ok_or_else(|| Error::UnknownPosition(position_id.clone()))?;
        state.reserved -= position.size;
        Ok(position)
    }

    /// Mark an open position as exiting. Returns `None` if it is not open.
    pub fn begin_close(&self, position_id: &PositionId) -> Option<Position> {
        let mut state = self.lock();
        let position = state.open_positions.get_mut(position_id)?;
        if position.status != PositionStatus::Open {
            return None;
        }
        position.status = PositionStatus::Closing;
        Some(position.clone())
    }

    /// Exit order failed. The position reopens, or goes to the liquidation
    /// queue if an emergency stop landed while the exit was in flight.
    /// Returns true when it was queued for liquidation.
    pub fn abort_close(&self, position_id: &PositionId) -> bool {
        let mut state = self.lock();
        let closing = state
            .open_positions
            .get(position_id)
            .is_some_and(|p| p.status == PositionStatus::Closing);
        if !closing {
            return false;
        }
        if state.emergency_stop {
            if let Some(position) = state.open_positions.remove(position_id) {
                state.reserved -= position.size;
                state.liquidations.push(position);
            }
            return true;
        }
        if let Some(position) = state.open_positions.get_mut(position_id) {
            position.status = PositionStatus::Open;
        }
        false
    }

    /// Destroy a position and fold its realised profit into capital
    pub fn close_position(&self, position_id: &PositionId, realized_pnl: Decimal) -> Result<Position> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let position = {
            let mut state = self.lock();
            let position = state
                .open_positions
                .remove(position_id)
                .ok_or_else(|| Error::UnknownPosition(position_id.clone()))?;
            state.reserved -= position.size;
            self.apply_capital_change(&mut state, realized_pnl, now, &mut events);
            position
        };
        self.publish(events);
        Ok(position)
    }

    /// Book the exit of a force-closed position
    pub fn settle_liquidation(&self, position: &Position, realized_pnl: Decimal) {
        self.record_capital_change(realized_pnl);
        info!(
            position_id = %position.id,
            pattern_id = %position.pattern_id,
            pnl = %realized_pnl,
            "Liquidated position settled"
        );
    }

    /// Positions force-closed by the emergency stop, handed over exactly once
    pub fn take_liquidations(&self) -> Vec<Position> {
        std::mem::take(&mut self.lock().liquidations)
    }

    /// Exit order for a liquidation failed; retry on a later tick
    pub fn requeue_liquidation(&self, position: Position) {
        warn!(position_id = %position.id, "Liquidation exit failed, requeued");
        self.lock().liquidations.push(position);
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.lock().open_positions.values().cloned().collect()
    }

    pub fn open_position_count(&self) -> usize {
        self.lock().open_positions.len()
    }

    // ─── Capital and limits ───

    pub fn record_capital_change(&self, delta: Decimal) {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            self.apply_capital_change(&mut state, delta, now, &mut events);
        }
        self.publish(events);
    }

    fn apply_capital_change(
        &self,
        state: &mut RiskState,
        delta: Decimal,
        now: DateTime<Utc>,
        events: &mut Vec<RiskEvent>,
    ) {
        self.roll_watermark(state, now);
        state.current_capital += delta;
        if state.current_capital > state.daily_high_watermark {
            state.daily_high_watermark = state.current_capital;
        }
        if delta < Decimal::ZERO {
            state.loss_15m.record(now, delta);
            state.loss_1h.record(now, delta);
            state.loss_24h.record(now, delta);
        }
        self.evaluate_limits(state, now, events);
    }

    /// Re-evaluate drawdown and loss windows. Returns true when trading may continue.
    pub fn check_limits(&self) -> bool {
        let now = self.clock.now();
        let mut events = Vec::new();
        let allowed = {
            let mut state = self.lock();
            self.roll_watermark(&mut state, now);
            self.evaluate_limits(&mut state, now, &mut events)
        };
        self.publish(events);
        allowed
    }

    fn evaluate_limits(
        &self,
        state: &mut RiskState,
        now: DateTime<Utc>,
        events: &mut Vec<RiskEvent>,
    ) -> bool {
        if state.emergency_stop {
            return false;
        }
        self.refresh_breakers(state, now, events);

        let drawdown = state.drawdown();
        if drawdown > self.config.max_daily_drawdown_pct {
            self.enter_emergency_stop(state, now, drawdown, events);
            return false;
        }

        let capital = state.current_capital.max(Decimal::ZERO);
        let loss_15m = state.loss_15m.total(now);
        if loss_15m > capital * f64_to_decimal(self.config.loss_limit_15m_pct)
            && state.breaker_15m.trip(now)
        {
            warn!(loss = %loss_15m, capital = %capital, "15-minute loss breaker tripped");
            let description = format!(
                "15m loss {:.2} exceeds {:.0}% of capital {:.2}",
                loss_15m,
                self.config.loss_limit_15m_pct * 100.0,
                capital
            );
            events.push(RiskEvent {
                kind: RiskEventKind::BreakerTripped(BreakerKind::Short),
                description,
                snapshot: state.snapshot(now),
            });
        }

        let loss_1h = state.loss_1h.total(now);
        if loss_1h > capital * f64_to_decimal(self.config.loss_limit_1h_pct)
            && state.breaker_1h.trip(now)
        {
            warn!(loss = %loss_1h, capital = %capital, "1-hour loss breaker tripped");
            let description = format!(
                "1h loss {:.2} exceeds {:.0}% of capital {:.2}",
                loss_1h,
                self.config.loss_limit_1h_pct * 100.0,
                capital
            );
            events.push(RiskEvent {
                kind: RiskEventKind::BreakerTripped(BreakerKind::Long),
                description,
                snapshot: state.snapshot(now),
            });
        }

        !(state.breaker_15m.is_tripped(now) || state.breaker_1h.is_tripped(now))
    }

    fn refresh_breakers(&self, state: &mut RiskState, now: DateTime<Utc>, events: &mut Vec<RiskEvent>) {
        for kind in [BreakerKind::Short, BreakerKind::Long] {
            let breaker = match kind {
                BreakerKind::Short => &mut state.breaker_15m,
                BreakerKind::Long => &mut state.breaker_1h,
            };
            if breaker.refresh(now) {
                info!(breaker = %kind, "Breaker cooldown elapsed");
                events.push(RiskEvent {
                    kind: RiskEventKind::BreakerCleared(kind),
                    description: format!("{} cleared after cooldown", kind),
                    snapshot: state.snapshot(now),
                });
            }
        }
    }

    /// The high-water mark is monotonic within a UTC day and re-based on rollover
    fn roll_watermark(&self, state: &mut RiskState, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != state.watermark_day {
            debug!(
                previous = %state.daily_high_watermark,
                capital = %state.current_capital,
                "Daily high-water mark rolled"
            );
            state.watermark_day = today;
            state.daily_high_watermark = state.current_capital;
        }
    }

    fn enter_emergency_stop(
        &self,
        state: &mut RiskState,
        now: DateTime<Utc>,
        drawdown: f64,
        events: &mut Vec<RiskEvent>,
    ) {
        state.emergency_stop = true;

        // Pending entries and in-flight exits settle through their own orders.
        let to_close: Vec<PositionId> = state
            .open_positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.id.clone())
            .collect();
        for id in to_close {
            if let Some(mut position) = state.open_positions.remove(&id) {
                state.reserved -= position.size;
                position.status = PositionStatus::Closing;
                state.liquidations.push(position);
            }
        }

        error!(
            drawdown = drawdown,
            capital = %state.current_capital,
            liquidations = state.liquidations.len(),
            "EMERGENCY STOP - trading halted"
        );
        events.push(RiskEvent {
            kind: RiskEventKind::EmergencyStop,
            description: format!(
                "Drawdown {:.1}% exceeds {:.0}% limit, {} positions queued for liquidation",
                drawdown * 100.0,
                self.config.max_daily_drawdown_pct * 100.0,
                state.liquidations.len()
            ),
            snapshot: state.snapshot(now),
        });
    }

    /// Manual intervention: clear the emergency flag and re-base the watermark
    pub fn reset_emergency_stop(&self) {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            if !state.emergency_stop {
                return;
            }
            state.emergency_stop = false;
            state.daily_high_watermark = state.current_capital;
            state.watermark_day = now.date_naive();
            events.push(RiskEvent {
                kind: RiskEventKind::EmergencyReset,
                description: "Emergency stop manually reset".to_string(),
                snapshot: state.snapshot(now),
            });
        }
        info!("Emergency stop reset");
        self.publish(events);
    }

    // ─── Correlation ───

    pub fn set_correlation(&self, a: &PatternId, b: &PatternId, rho: f64) {
        if a == b {
            return;
        }
        let key = if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        self.lock().correlations.insert(key, rho.clamp(-1.0, 1.0));
    }

    // ─── Queries ───

    /// Approximate free capital for sizing; `approve` re-checks under the lock
    pub fn available_capital(&self) -> Decimal {
        self.lock().available()
    }

    pub fn current_capital(&self) -> Decimal {
        self.lock().current_capital
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.lock().emergency_stop
    }

    /// True while any breaker or the emergency stop blocks new entries
    pub fn is_trading_halted(&self) -> bool {
        let now = self.clock.now();
        let state = self.lock();
        state.emergency_stop || state.breaker_15m.is_tripped(now) || state.breaker_1h.is_tripped(now)
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let now = self.clock.now();
        self.lock().snapshot(now)
    }

    /// Drain transitions recorded since the last call
    pub fn take_events(&self) -> Vec<RiskEvent> {
        self.journal
            .lock()
            .map(|mut j| std::mem::take(&mut *j))
            .unwrap_or_default()
    }
}

impl Default for RiskManager {
    fn default() -> Self {
        Self::new(
            RiskConfig::default(),
            Decimal::from(1000),
            Arc::new(SystemClock),
        )
    }
}
