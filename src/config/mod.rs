//! Configuration management for PatternBot
//!
//! Loads from TOML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use crate::discovery::{DiscoveryConfig, GeneratorConfig, PromotionConfig};
use crate::evolution::EvolutionConfig;
use crate::execution::PaperConfig;
use crate::risk::RiskConfig;
use crate::scheduler::SchedulerConfig;
use crate::types::f64_to_decimal;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotCfg,
    pub discovery: DiscoveryCfg,
    pub risk: RiskCfg,
    pub scheduler: SchedulerCfg,
    pub evolution: EvolutionCfg,
    pub persistence: PersistenceCfg,
    pub paper: PaperCfg,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.symbol", "BTC")?
            .set_default("bot.starting_capital", 10_000.0)?
            .set_default("bot.json_logs", false)?
            .set_default("bot.monitor_interval_secs", 60)?
            // Discovery defaults
            .set_default("discovery.hypotheses_per_hour", 50)?
            .set_default("discovery.trial_stake", 5.0)?
            .set_default("discovery.min_tests", 100)?
            .set_default("discovery.min_win_rate", 0.55)?
            .set_default("discovery.trial_concurrency", 32)?
            .set_default("discovery.round_interval_ms", 1000)?
            .set_default("discovery.trial_timeout_ms", 30_000)?
            .set_default("discovery.max_entry_conditions", 5)?
            .set_default("discovery.max_exit_conditions", 3)?
            // Risk defaults
            .set_default("risk.min_win_rate", 0.55)?
            .set_default("risk.kelly_fraction", 0.25)?
            .set_default("risk.max_position_pct", 0.25)?
            .set_default("risk.min_position_size", 5.0)?
            .set_default("risk.max_single_allocation_pct", 0.50)?
            .set_default("risk.max_concurrent_per_pattern", 10)?
            .set_default("risk.max_correlation", 0.7)?
            .set_default("risk.max_daily_drawdown_pct", 0.30)?
            .set_default("risk.loss_limit_15m_pct", 0.10)?
            .set_default("risk.loss_limit_1h_pct", 0.20)?
            .set_default("risk.breaker_15m_cooldown_mins", 60)?
            .set_default("risk.breaker_1h_cooldown_mins", 360)?
            .set_default("risk.stop_loss_pct", 0.02)?
            .set_default("risk.take_profit_pct", 0.04)?
            // Scheduler defaults
            .set_default("scheduler.tick_ms", 100)?
            .set_default("scheduler.latency_budget_ms", 100)?
            .set_default("scheduler.order_timeout_ms", 5000)?
            .set_default("scheduler.entry_threshold", 1.0)?
            .set_default("scheduler.shutdown_grace_ms", 10_000)?
            // Evolution defaults
            .set_default("evolution.cycle_hours", 24)?
            .set_default("evolution.survival_rate", 0.5)?
            .set_default("evolution.selection_pressure", 0.2)?
            .set_default("evolution.mutations_per_parent", 3)?
            .set_default("evolution.mutation_rate", 0.1)?
            .set_default("evolution.random_injection", 10)?
            .set_default("evolution.profit_scale", 1000.0)?
            .set_default("evolution.ai_timeout_ms", 30_000)?
            .set_default("evolution.ai_max_calls", 5)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            // Paper defaults
            .set_default("paper.trial_win_probability", 0.45)?
            .set_default("paper.min_latency_ms", 5)?
            .set_default("paper.max_latency_ms", 40)?
            .set_default("paper.fee_bps", 10.0)?
            .set_default("paper.slippage_bps", 5.0)?
            .set_default("paper.reject_probability", 0.02)?
            .set_default("paper.start_price", 100.0)?
            .set_default("paper.volatility", 0.001)?
            .set_default("paper.market_step_ms", 1000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PATTERNBOT__SECTION__KEY)
            .add_source(
                Environment::with_prefix("PATTERNBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bot.starting_capital <= 0.0 {
            bail!("bot.starting_capital must be positive");
        }
        if self.discovery.hypotheses_per_hour == 0 {
            bail!("discovery.hypotheses_per_hour must be at least 1");
        }
        if self.discovery.min_tests == 0 {
            bail!("discovery.min_tests must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.discovery.min_win_rate)
            || !(0.0..=1.0).contains(&self.risk.min_win_rate)
        {
            bail!("win rate thresholds must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.scheduler.entry_threshold) {
            bail!("scheduler.entry_threshold must lie in [0, 1]");
        }
        let evo = &self.evolution;
        if evo.survival_rate <= 0.0 || evo.survival_rate > 1.0 {
            bail!("evolution.survival_rate must lie in (0, 1]");
        }
        if evo.selection_pressure <= 0.0 || evo.selection_pressure > evo.survival_rate {
            bail!("evolution.selection_pressure must lie in (0, survival_rate]");
        }
        if self.paper.min_latency_ms > self.paper.max_latency_ms {
            bail!("paper.min_latency_ms exceeds paper.max_latency_ms");
        }
        Ok(())
    }

    pub fn starting_capital(&self) -> Decimal {
        f64_to_decimal(self.bot.starting_capital)
    }

    pub fn risk_config(&self) -> RiskConfig {
        let r = &self.risk;
        RiskConfig {
            min_win_rate: r.min_win_rate,
            kelly_fraction: r.kelly_fraction,
            max_position_pct: r.max_position_pct,
            min_position_size: f64_to_decimal(r.min_position_size),
            max_single_allocation_pct: r.max_single_allocation_pct,
            max_concurrent_per_pattern: r.max_concurrent_per_pattern,
            max_correlation: r.max_correlation,
            max_daily_drawdown_pct: r.max_daily_drawdown_pct,
            loss_limit_15m_pct: r.loss_limit_15m_pct,
            loss_limit_1h_pct: r.loss_limit_1h_pct,
            breaker_15m_cooldown: ChronoDuration::minutes(r.breaker_15m_cooldown_mins),
            breaker_1h_cooldown: ChronoDuration::minutes(r.breaker_1h_cooldown_mins),
            stop_loss_pct: r.stop_loss_pct,
            take_profit_pct: r.take_profit_pct,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            symbol: self.bot.symbol.clone(),
            tick_interval: Duration::from_millis(s.tick_ms.max(1)),
            latency_budget: Duration::from_millis(s.latency_budget_ms),
            order_timeout: Duration::from_millis(s.order_timeout_ms),
            entry_threshold: s.entry_threshold,
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
            profit_scale: self.evolution.profit_scale,
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            max_entry_conditions: self.discovery.max_entry_conditions.max(1),
            max_exit_conditions: self.discovery.max_exit_conditions.max(1),
            ..GeneratorConfig::default()
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        let d = &self.discovery;
        DiscoveryConfig {
            hypotheses_per_hour: d.hypotheses_per_hour,
            trial_stake: f64_to_decimal(d.trial_stake),
            trial_concurrency: d.trial_concurrency.max(1),
            round_interval: Duration::from_millis(d.round_interval_ms.max(1)),
            trial_timeout: Duration::from_millis(d.trial_timeout_ms),
            promotion: PromotionConfig {
                min_tests: d.min_tests,
                min_win_rate: d.min_win_rate,
            },
            generator: self.generator_config(),
        }
    }

    pub fn evolution_config(&self) -> EvolutionConfig {
        let e = &self.evolution;
        EvolutionConfig {
            cycle_interval: Duration::from_secs(e.cycle_hours.max(1) * 3600),
            survival_rate: e.survival_rate,
            selection_pressure: e.selection_pressure,
            mutations_per_parent: e.mutations_per_parent,
            mutation_rate: e.mutation_rate,
            random_injection: e.random_injection,
            profit_scale: e.profit_scale,
            enhancer_timeout: Duration::from_millis(e.ai_timeout_ms),
            enhancer_max_calls: e.ai_max_calls,
            ..EvolutionConfig::default()
        }
    }

    pub fn paper_config(&self) -> PaperConfig {
        let p = &self.paper;
        PaperConfig {
            slippage_bps: p.slippage_bps,
            fee_bps: p.fee_bps,
            min_latency_ms: p.min_latency_ms,
            max_latency_ms: p.max_latency_ms,
            reject_probability: p.reject_probability,
            trial_win_probability: p.trial_win_probability,
            fallback_price: p.start_price,
            ..PaperConfig::default()
        }
    }

    /// Generate a one-line digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} symbol={} capital={} hyp/h={} min_tests={} min_wr={:.2} kelly={:.2} tick={}ms evo={}h csv={}",
            self.bot.tag,
            self.bot.symbol,
            self.bot.starting_capital,
            self.discovery.hypotheses_per_hour,
            self.discovery.min_tests,
            self.discovery.min_win_rate,
            self.risk.kelly_fraction,
            self.scheduler.tick_ms,
            self.evolution.cycle_hours,
            self.persistence.csv_enabled,
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_module_defaults() {
        let config = AppConfig::load().unwrap();

        let risk = config.risk_config();
        let expected = RiskConfig::default();
        assert_eq!(risk.min_win_rate, expected.min_win_rate);
        assert_eq!(risk.kelly_fraction, expected.kelly_fraction);
        assert_eq!(risk.min_position_size, expected.min_position_size);
        assert_eq!(risk.breaker_15m_cooldown, expected.breaker_15m_cooldown);
        assert_eq!(risk.breaker_1h_cooldown, expected.breaker_1h_cooldown);

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.tick_interval, SchedulerConfig::default().tick_interval);
        assert_eq!(scheduler.order_timeout, SchedulerConfig::default().order_timeout);

        let discovery = config.discovery_config();
        assert_eq!(discovery.hypotheses_per_hour, 50);
        assert_eq!(discovery.trial_stake, Decimal::from(5));
        assert_eq!(discovery.promotion.min_tests, 100);

        let evolution = config.evolution_config();
        assert_eq!(evolution.cycle_interval, EvolutionConfig::default().cycle_interval);
        assert_eq!(evolution.enhancer_max_calls, 5);
    }

    #[test]
    fn digest_is_one_line() {
        let config = AppConfig::load().unwrap();
        let digest = config.digest();
        assert!(!digest.contains('\n'));
        assert!(digest.contains("symbol=BTC"));
    }

    #[test]
    fn validation_rejects_inverted_rates() {
        let mut config = AppConfig::load().unwrap();
        config.evolution.selection_pressure = 0.8;
        assert!(config.validate().is_err());

        let mut config = AppConfig::load().unwrap();
        config.paper.min_latency_ms = 100;
        config.paper.max_latency_ms = 10;
        assert!(config.validate().is_err());
    }
}
