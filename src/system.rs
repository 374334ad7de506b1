//! Orchestration
//!
//! Wires the engines together in paper mode and runs every loop under one
//! shared shutdown signal:
//! - scheduler tick loop
//! - discovery loop (generation + trial rounds)
//! - evolution loop
//! - simulated market stepper
//! - performance monitor

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::AppConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryStats, TrialRecorder};
use crate::evolution::EvolutionEngine;
use crate::execution::{PaperExecutor, PaperTrialRunner};
use crate::feed::{MetricFeed, SimulatedMarket};
use crate::persistence::{CsvPersistence, LifecycleStore, NoopStore, RiskEventRecord};
use crate::risk::{RiskManager, RiskSnapshot};
use crate::scheduler::{PatternRegistry, PatternScheduler, SchedulerStatsSnapshot};

/// What one monitor pass saw
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub scheduler: SchedulerStatsSnapshot,
    pub discovery: DiscoveryStats,
    pub risk: RiskSnapshot,
    pub active_patterns: usize,
    pub trading_allowed: bool,
    pub events_persisted: usize,
}

pub struct PatternBot {
    config: AppConfig,
    market: Arc<SimulatedMarket>,
    registry: Arc<PatternRegistry>,
    risk: Arc<RiskManager>,
    store: Arc<dyn LifecycleStore>,
    clock: SharedClock,
    scheduler: Arc<PatternScheduler>,
    discovery: Arc<DiscoveryEngine>,
    evolution: Arc<EvolutionEngine>,
}

impl PatternBot {
    /// Build every component from configuration, persisting to CSV when enabled
    pub async fn build(config: AppConfig) -> Result<Self> {
        let store: Arc<dyn LifecycleStore> = if config.persistence.csv_enabled {
            Arc::new(
                CsvPersistence::new(&config.persistence.data_dir)
                    .context("Failed to open CSV persistence")?,
            )
        } else {
            Arc::new(NoopStore)
        };
        let bot = Self::assemble(config, store, Arc::new(SystemClock));

        match bot.evolution.resume().await {
            Ok(generation) if generation > 0 => {
                info!(generation, "🧬 Resuming evolution after last recorded generation");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read generation history, starting at 0"),
        }
        Ok(bot)
    }

    /// Wire the engines around an explicit store and clock
    pub fn assemble(config: AppConfig, store: Arc<dyn LifecycleStore>, clock: SharedClock) -> Self {
        let symbol = config.bot.symbol.clone();
        let market = Arc::new(SimulatedMarket::new(
            symbol.clone(),
            config.paper.start_price,
            config.paper.volatility,
        ));
        market.step(clock.now());
        let feed: Arc<dyn MetricFeed> = market.clone();

        let registry = Arc::new(PatternRegistry::new());
        let risk = Arc::new(RiskManager::new(
            config.risk_config(),
            config.starting_capital(),
            clock.clone(),
        ));

        let discovery_config = config.discovery_config();
        let recorder = Arc::new(TrialRecorder::new(discovery_config.promotion.min_tests));

        let executor = Arc::new(PaperExecutor::new(
            config.paper_config(),
            feed.clone(),
            symbol.clone(),
        ));
        let runner =
            Arc::new(PaperTrialRunner::new(config.paper_config(), symbol).with_feed(feed.clone()));

        let scheduler = Arc::new(PatternScheduler::new(
            config.scheduler_config(),
            registry.clone(),
            risk.clone(),
            executor,
            feed,
            store.clone(),
            clock.clone(),
        ));
        let discovery = Arc::new(DiscoveryEngine::new(
            discovery_config,
            recorder.clone(),
            runner,
            registry.clone(),
            risk.clone(),
            store.clone(),
            clock.clone(),
        ));
        let evolution = Arc::new(EvolutionEngine::new(
            config.evolution_config(),
            config.generator_config(),
            registry.clone(),
            recorder,
            store.clone(),
            clock.clone(),
        ));

        Self {
            config,
            market,
            registry,
            risk,
            store,
            clock,
            scheduler,
            discovery,
            evolution,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PatternRegistry> {
        &self.registry
    }

    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    pub fn scheduler(&self) -> &Arc<PatternScheduler> {
        &self.scheduler
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    pub fn evolution(&self) -> &Arc<EvolutionEngine> {
        &self.evolution
    }

    /// Log a performance summary, re-run the risk checks and persist any
    /// risk transitions recorded since the last pass.
    pub async fn monitor_once(&self) -> MonitorReport {
        let trading_allowed = self.risk.check_limits();

        let events = self.risk.take_events();
        let mut events_persisted = 0;
        for event in &events {
            match self.store.save_risk_event(RiskEventRecord::from(event)).await {
                Ok(()) => events_persisted += 1,
                Err(e) => warn!(error = %e, kind = %event.kind, "Failed to persist risk event"),
            }
        }

        let report = MonitorReport {
            scheduler: self.scheduler.stats(),
            discovery: self.discovery.stats(),
            risk: self.risk.snapshot(),
            active_patterns: self.registry.active_len(),
            trading_allowed,
            events_persisted,
        };

        info!(
            executions = report.scheduler.filled,
            closed = report.scheduler.closed,
            win_rate = %format!("{:.1}%", report.scheduler.win_rate() * 100.0),
            slow = report.scheduler.slow,
            active_patterns = report.active_patterns,
            pending_hypotheses = report.discovery.pending,
            promoted = report.discovery.promoted,
            capital = %report.risk.current_capital,
            available = %report.risk.available(),
            drawdown = %format!("{:.2}%", report.risk.drawdown * 100.0),
            generation = self.evolution.current_generation(),
            "📊 Performance"
        );
        if !trading_allowed {
            warn!(emergency_stop = report.risk.emergency_stop, "Trading halted");
        }

        report
    }

    /// Run every loop until `shutdown` flips to true, then wait for all of
    /// them to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let bot = Arc::new(self);

        info!(
            symbol = %bot.config.bot.symbol,
            capital = %bot.config.starting_capital(),
            "🚀 PatternBot starting ({})",
            bot.config.digest()
        );

        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        handles.push((
            "scheduler",
            tokio::spawn(bot.scheduler.clone().run(shutdown.clone())),
        ));
        handles.push((
            "discovery",
            tokio::spawn(bot.discovery.clone().run(shutdown.clone())),
        ));
        handles.push((
            "evolution",
            tokio::spawn(bot.evolution.clone().run(shutdown.clone())),
        ));
        handles.push(("market", {
            let bot = bot.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bot.step_market(shutdown).await })
        }));
        handles.push(("monitor", {
            let bot = bot.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bot.monitor(shutdown).await })
        }));

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task ended abnormally");
            }
        }

        // Final pass so transitions from the last seconds reach the store
        let report = bot.monitor_once().await;
        if bot.config.persistence.csv_enabled {
            if let Err(e) = bot.save_report(&report) {
                warn!(error = %e, "Failed to save run summary");
            }
        }
        info!(
            capital = %report.risk.current_capital,
            pnl = %(report.risk.current_capital - bot.config.starting_capital()),
            "👋 PatternBot stopped"
        );
        Ok(())
    }

    /// Write the final monitor report as `last_run.json` under the data dir
    pub fn save_report(&self, report: &MonitorReport) -> Result<PathBuf> {
        let dir = Path::new(&self.config.persistence.data_dir);
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join("last_run.json");
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&path, json)?;
        info!(path = %path.display(), "💾 Run summary saved");
        Ok(path)
    }

    async fn step_market(&self, mut shutdown: watch::Receiver<bool>) {
        let step = Duration::from_millis(self.config.paper.market_step_ms.max(1));
        let mut interval = time::interval(step);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.market.step(self.clock.now()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn monitor(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.bot.monitor_interval_secs.max(1));
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.monitor_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
