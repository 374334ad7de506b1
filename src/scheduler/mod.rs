//! Pattern Scheduler / Executor
//!
//! One fixed-interval driver. Every tick:
//! 1. re-checks risk limits, persists any risk transitions and picks up
//!    positions force-closed by an emergency stop
//! 2. manages exits of open positions (exit rule, stop-loss, take-profit,
//!    holding horizon)
//! 3. evaluates entry rules of the active set, ranks firing patterns by
//!    fitness and dispatches one concurrent attempt per approved pattern
//!
//! Evaluation never touches the risk lock; only `approve` does, one pattern
//! at a time. Orders run on a [`JoinSet`] so a slow venue never stalls a tick.

mod conditions;
mod registry;

pub use conditions::MetricFrame;
pub use registry::{ActiveSet, PatternEntry, PatternRegistry};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::ExecutionError;
use crate::evolution::fitness::{fitness, PROFIT_SCALE};
use crate::execution::{Fill, Order, OrderExecutor};
use crate::feed::MetricFeed;
use crate::persistence::{
    LifecycleStore, PatternEvent, PatternRecord, PositionEvent, PositionRecord, RiskEventRecord,
};
use crate::risk::{Approval, RiskEvent, RiskManager};
use crate::types::{
    decimal_to_f64, f64_to_decimal, Pattern, Position, PositionId, PositionStatus, Side,
};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Symbol every pattern is evaluated against
    pub symbol: String,
    pub tick_interval: Duration,
    /// Executions slower than this are logged as slow, never failed
    pub latency_budget: Duration,
    /// An order unresolved after this long is abandoned
    pub order_timeout: Duration,
    /// Weighted share of conditions that must hold (1.0 = all)
    pub entry_threshold: f64,
    /// How long in-flight executions may run after shutdown is signalled
    pub shutdown_grace: Duration,
    /// Profit scale used when ranking firing patterns by fitness
    pub profit_scale: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC".to_string(),
            tick_interval: Duration::from_millis(100),
            latency_budget: Duration::from_millis(100),
            order_timeout: Duration::from_secs(5),
            entry_threshold: 1.0,
            shutdown_grace: Duration::from_secs(10),
            profit_scale: PROFIT_SCALE,
        }
    }
}

/// Execution counters, updated lock-free from every task
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    filled: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    slow: AtomicU64,
    closed: AtomicU64,
    profitable: AtomicU64,
    liquidated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub filled: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub slow: u64,
    pub closed: u64,
    pub profitable: u64,
    pub liquidated: u64,
}

impl SchedulerStatsSnapshot {
    /// Share of closed trades that made money
    pub fn win_rate(&self) -> f64 {
        if self.closed == 0 {
            return 0.0;
        }
        self.profitable as f64 / self.closed as f64
    }
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            filled: self.filled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            profitable: self.profitable.load(Ordering::Relaxed),
            liquidated: self.liquidated.load(Ordering::Relaxed),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub fired: usize,
    pub dispatched: usize,
    pub exits: usize,
    pub liquidations: usize,
    /// Risk transitions handed to the store this tick
    pub risk_events: usize,
}

/// Why an open position is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    Horizon,
    Liquidation,
}

impl ExitReason {
    fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "exit_signal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Horizon => "horizon",
            ExitReason::Liquidation => "liquidation",
        }
    }
}

pub struct PatternScheduler {
    config: SchedulerConfig,
    registry: Arc<PatternRegistry>,
    risk: Arc<RiskManager>,
    executor: Arc<dyn OrderExecutor>,
    feed: Arc<dyn MetricFeed>,
    store: Arc<dyn LifecycleStore>,
    clock: SharedClock,
    /// Metric values of the previous tick, for crossing operators
    previous: Mutex<HashMap<String, f64>>,
    stats: SchedulerStats,
}

impl PatternScheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<PatternRegistry>,
        risk: Arc<RiskManager>,
        executor: Arc<dyn OrderExecutor>,
        feed: Arc<dyn MetricFeed>,
        store: Arc<dyn LifecycleStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            registry,
            risk,
            executor,
            feed,
            store,
            clock,
            previous: Mutex::new(HashMap::new()),
            stats: SchedulerStats::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drive ticks until `shutdown` flips, then wait for in-flight executions
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();

        info!(
            symbol = %self.config.symbol,
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "⏱️ Pattern scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut tasks);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Execution task failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(tasks).await;
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        let in_flight = tasks.len();
        if in_flight == 0 {
            info!("Pattern scheduler stopped");
            return;
        }
        info!(in_flight, "Waiting for in-flight executions");

        let finished = time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Execution task failed");
                }
            }
        })
        .await;

        if finished.is_err() {
            warn!(remaining = tasks.len(), "Shutdown grace elapsed, aborting executions");
            tasks.abort_all();
        }
        info!("Pattern scheduler stopped");
    }

    /// One evaluation pass. Spawns its executions onto `tasks` and returns
    /// without awaiting them.
    pub fn tick(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> TickReport {
        Self::bump(&self.stats.ticks);
        let mut report = TickReport::default();
        let now = self.clock.now();

        self.risk.check_limits();
        let events = self.risk.take_events();
        if !events.is_empty() {
            report.risk_events = events.len();
            let this = Arc::clone(self);
            tasks.spawn(async move { this.persist_risk_events(events).await });
        }
        for position in self.risk.take_liquidations() {
            report.liquidations += 1;
            let this = Arc::clone(self);
            tasks.spawn(async move { this.liquidate(position).await });
        }

        let previous = std::mem::take(&mut *self.lock_previous());
        let mut frame = MetricFrame::new(self.feed.as_ref(), &self.config.symbol, previous);

        report.exits = self.dispatch_exits(&mut frame, now, tasks);
        if !self.risk.is_trading_halted() {
            self.dispatch_entries(&mut frame, now, tasks, &mut report);
        }

        *self.lock_previous() = frame.into_previous();
        report
    }

    async fn persist_risk_events(&self, events: Vec<RiskEvent>) {
        for event in &events {
            if let Err(e) = self.store.save_risk_event(RiskEventRecord::from(event)).await {
                warn!(error = %e, kind = %event.kind, "Failed to persist risk event");
            }
        }
    }

    fn lock_previous(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.previous.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(counter: &AtomicU64) {
        SchedulerStats::bump(counter);
    }

    fn exit_reason(
        &self,
        frame: &mut MetricFrame<'_>,
        position: &Position,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        if let Some(price) = frame.price().map(f64_to_decimal) {
            if price <= position.stop_loss {
                return Some(ExitReason::StopLoss);
            }
            if price >= position.take_profit {
                return Some(ExitReason::TakeProfit);
            }
        }
        // Retired patterns still manage the positions they opened
        let entry = self.registry.get(&position.pattern_id)?;
        let hypothesis = &entry.candidate().hypothesis;
        if position.held_for(now) >= hypothesis.cooldown() {
            return Some(ExitReason::Horizon);
        }
        if frame.rule_fires(&hypothesis.exit_conditions, self.config.entry_threshold) {
            return Some(ExitReason::Signal);
        }
        None
    }

    fn dispatch_exits(
        self: &Arc<Self>,
        frame: &mut MetricFrame<'_>,
        now: DateTime<Utc>,
        tasks: &mut JoinSet<()>,
    ) -> usize {
        let mut exits = 0;
        for position in self.risk.open_positions() {
            if position.status != PositionStatus::Open {
                continue;
            }
            let Some(reason) = self.exit_reason(frame, &position, now) else {
                continue;
            };
            let Some(position) = self.risk.begin_close(&position.id) else {
                continue;
            };
            exits += 1;
            let this = Arc::clone(self);
            tasks.spawn(async move { this.exit(position, reason).await });
        }
        exits
    }

    fn dispatch_entries(
        self: &Arc<Self>,
        frame: &mut MetricFrame<'_>,
        now: DateTime<Utc>,
        tasks: &mut JoinSet<()>,
        report: &mut TickReport,
    ) {
        let active = self.registry.snapshot_active();
        let mut firing: Vec<(f64, Arc<PatternEntry>)> = Vec::new();

        for entry in &active.patterns {
            report.evaluated += 1;
            if !entry.is_active() || !entry.cooldown_elapsed(now) {
                continue;
            }
            let conditions = &entry.candidate().hypothesis.entry_conditions;
            if frame.rule_fires(conditions, self.config.entry_threshold) {
                let score = fitness(&entry.snapshot(), self.config.profit_scale);
                firing.push((score, Arc::clone(entry)));
            }
        }
        report.fired = firing.len();

        // Capital goes to the fittest pattern first
        firing.sort_by(|(fa, a), (fb, b)| {
            fb.partial_cmp(fa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(b.id()))
        });

        for (_, entry) in firing {
            let Some(previous) = entry.try_claim_trigger(now) else {
                continue;
            };
            let pattern = entry.snapshot();
            let size = self.risk.size_position(&pattern, self.risk.available_capital());
            if size.is_zero() {
                entry.release_trigger(now, previous);
                continue;
            }

            match self.risk.approve(&pattern.id, size) {
                Approval::Approved(position_id) => {
                    Self::bump(&self.stats.dispatched);
                    report.dispatched += 1;
                    let this = Arc::clone(self);
                    tasks.spawn(async move { this.enter(entry, position_id, size).await });
                }
                Approval::Denied(reason) => {
                    entry.release_trigger(now, previous);
                    debug!(pattern_id = %pattern.id, reason = %reason, "Entry not approved");
                }
            }
        }
    }

    /// Submit an order under the timeout and latency budget
    async fn submit(&self, order: Order) -> (Result<Fill, ExecutionError>, Duration) {
        let started = Instant::now();
        let timeout = self.config.order_timeout;
        let result = match time::timeout(timeout, self.executor.submit(order.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(timeout.as_millis() as u64)),
        };
        let latency = started.elapsed();

        if latency > self.config.latency_budget {
            Self::bump(&self.stats.slow);
            warn!(
                pattern_id = %order.pattern_id,
                side = %order.side,
                latency_ms = latency.as_millis() as u64,
                budget_ms = self.config.latency_budget.as_millis() as u64,
                "🐢 Slow execution"
            );
        }
        (result, latency)
    }

    async fn enter(&self, entry: Arc<PatternEntry>, position_id: PositionId, size: Decimal) {
        let pattern_id = entry.id().clone();
        let order = Order {
            pattern_id: pattern_id.clone(),
            position_id: position_id.clone(),
            side: Side::Buy,
            size,
        };
        let (result, latency) = self.submit(order).await;

        match result {
            Ok(fill) if fill.filled => {
                let position = match self.risk.confirm_fill(&position_id, fill.fill_price, fill.fees) {
                    Ok(position) => position,
                    Err(e) => {
                        warn!(pattern_id = %pattern_id, error = %e, "Fill for unknown reservation");
                        return;
                    }
                };
                Self::bump(&self.stats.filled);
                entry.mark_triggered(self.clock.now());
                info!(
                    pattern_id = %pattern_id,
                    position_id = %position_id,
                    size = %size,
                    price = %fill.fill_price,
                    latency_ms = latency.as_millis() as u64,
                    "📈 Position opened"
                );
                let record = PositionRecord::opened(&position, self.clock.now());
                if let Err(e) = self.store.save_position(record).await {
                    warn!(error = %e, "Failed to persist position");
                }
            }
            Ok(_) => {
                Self::bump(&self.stats.rejected);
                self.release(&position_id);
                debug!(pattern_id = %pattern_id, "Order not filled");
            }
            Err(e) if e.counts_as_loss() => {
                Self::bump(&self.stats.timed_out);
                self.release(&position_id);
                warn!(pattern_id = %pattern_id, error = %e, "Execution unresolved, counted as a loss");
                let pattern = entry.record_unresolved();
                self.after_trade(pattern).await;
            }
            Err(e) => {
                Self::bump(&self.stats.rejected);
                self.release(&position_id);
                debug!(pattern_id = %pattern_id, error = %e, "Order rejected");
            }
        }
    }

    fn release(&self, position_id: &PositionId) {
        if let Err(e) = self.risk.release(position_id) {
            warn!(position_id = %position_id, error = %e, "Reservation already gone");
        }
    }

    async fn exit(&self, position: Position, reason: ExitReason) {
        let order = Order {
            pattern_id: position.pattern_id.clone(),
            position_id: position.id.clone(),
            side: Side::Sell,
            size: position.size,
        };
        let fill = match self.submit(order).await {
            (Ok(fill), _) if fill.filled => fill,
            (result, _) => {
                let liquidating = self.risk.abort_close(&position.id);
                warn!(
                    position_id = %position.id,
                    reason = reason.as_str(),
                    liquidating,
                    error = ?result.err(),
                    "Exit order failed"
                );
                return;
            }
        };

        let pnl = position.gross_pnl(fill.fill_price) - fill.fees;
        if let Err(e) = self.risk.close_position(&position.id, pnl) {
            warn!(position_id = %position.id, error = %e, "Close for unknown position");
            return;
        }
        self.settle(&position, fill.fill_price, pnl, reason).await;
    }

    async fn liquidate(&self, position: Position) {
        let order = Order {
            pattern_id: position.pattern_id.clone(),
            position_id: position.id.clone(),
            side: Side::Sell,
            size: position.size,
        };
        let fill = match self.submit(order).await {
            (Ok(fill), _) if fill.filled => fill,
            _ => {
                self.risk.requeue_liquidation(position);
                return;
            }
        };

        let pnl = position.gross_pnl(fill.fill_price) - fill.fees;
        self.risk.settle_liquidation(&position, pnl);
        Self::bump(&self.stats.liquidated);
        self.settle(&position, fill.fill_price, pnl, ExitReason::Liquidation)
            .await;
    }

    /// Fold a finished trade into its pattern and persist both sides
    async fn settle(&self, position: &Position, exit_price: Decimal, pnl: Decimal, reason: ExitReason) {
        let profit = pnl - position.fees;
        let won = profit > Decimal::ZERO;
        let trade_return = profit
            .checked_div(position.size)
            .map(decimal_to_f64)
            .unwrap_or(0.0);

        Self::bump(&self.stats.closed);
        if won {
            Self::bump(&self.stats.profitable);
        }
        info!(
            pattern_id = %position.pattern_id,
            position_id = %position.id,
            reason = reason.as_str(),
            exit_price = %exit_price,
            profit = %profit,
            "📉 Position closed"
        );

        let event = if reason == ExitReason::Liquidation {
            PositionEvent::Liquidated
        } else {
            PositionEvent::Closed
        };
        let record = PositionRecord::closed(
            event,
            position,
            decimal_to_f64(exit_price),
            decimal_to_f64(pnl),
            reason.as_str(),
            self.clock.now(),
        );
        if let Err(e) = self.store.save_position(record).await {
            warn!(error = %e, "Failed to persist position");
        }

        if let Some(entry) = self.registry.get(&position.pattern_id) {
            let pattern = entry.record_trade(won, profit, trade_return);
            self.after_trade(pattern).await;
        }
    }

    /// Persist updated statistics and retire a pattern that fell below the bar
    async fn after_trade(&self, pattern: Pattern) {
        let now = self.clock.now();
        let record = PatternRecord::new(PatternEvent::StatsUpdated, &pattern, now);
        if let Err(e) = self.store.save_pattern(record).await {
            warn!(error = %e, "Failed to persist pattern statistics");
        }

        let min_win_rate = self.risk.config().min_win_rate;
        if pattern.is_active && pattern.win_rate < min_win_rate && self.registry.deactivate(&pattern.id) {
            info!(
                pattern_id = %pattern.id,
                win_rate = pattern.win_rate,
                tests = pattern.test_count(),
                "Pattern fell below minimum win rate, deactivated"
            );
            let pattern = Pattern {
                is_active: false,
                ..pattern
            };
            let record = PatternRecord::new(PatternEvent::Deactivated, &pattern, now);
            if let Err(e) = self.store.save_pattern(record).await {
                warn!(error = %e, "Failed to persist pattern deactivation");
            }
        }
    }
}
