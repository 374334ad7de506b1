//! Configuration sections
//!
//! Each section mirrors one `[section]` table of `config/default.toml` and
//! is converted into the owning module's config by [`AppConfig`](super::AppConfig).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct BotCfg {
    /// Version tag for logs and CSV records
    pub tag: String,
    /// Symbol every pattern trades
    pub symbol: String,
    pub starting_capital: f64,
    /// Emit logs as JSON lines
    pub json_logs: bool,
    /// Interval of the performance monitor in seconds
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryCfg {
    pub hypotheses_per_hour: u32,
    /// Fixed stake of each discovery trial
    pub trial_stake: f64,
    /// Outcomes required before a promotion verdict
    pub min_tests: usize,
    pub min_win_rate: f64,
    pub trial_concurrency: usize,
    pub round_interval_ms: u64,
    pub trial_timeout_ms: u64,
    pub max_entry_conditions: usize,
    pub max_exit_conditions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskCfg {
    /// Patterns below this win rate are never sized
    pub min_win_rate: f64,
    /// Multiplier on raw Kelly (0.25 = quarter Kelly)
    pub kelly_fraction: f64,
    pub max_position_pct: f64,
    pub min_position_size: f64,
    pub max_single_allocation_pct: f64,
    pub max_concurrent_per_pattern: usize,
    pub max_correlation: f64,
    pub max_daily_drawdown_pct: f64,
    pub loss_limit_15m_pct: f64,
    pub loss_limit_1h_pct: f64,
    pub breaker_15m_cooldown_mins: i64,
    pub breaker_1h_cooldown_mins: i64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerCfg {
    pub tick_ms: u64,
    /// Executions slower than this are logged as slow
    pub latency_budget_ms: u64,
    pub order_timeout_ms: u64,
    /// Weighted share of conditions that must hold (1.0 = all)
    pub entry_threshold: f64,
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionCfg {
    pub cycle_hours: u64,
    pub survival_rate: f64,
    pub selection_pressure: f64,
    pub mutations_per_parent: usize,
    pub mutation_rate: f64,
    pub random_injection: usize,
    /// Profit that earns the full profit component of fitness
    pub profit_scale: f64,
    pub ai_timeout_ms: u64,
    pub ai_max_calls: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceCfg {
    /// Directory for CSV files
    pub data_dir: String,
    pub csv_enabled: bool,
}

/// Simulated collaborators used in paper mode
#[derive(Debug, Clone, Deserialize)]
pub struct PaperCfg {
    pub trial_win_probability: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub reject_probability: f64,
    /// Opening price of the random-walk market
    pub start_price: f64,
    /// Per-step return standard deviation of the random walk
    pub volatility: f64,
    pub market_step_ms: u64,
}
