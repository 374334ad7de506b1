//! Market metric feed
//!
//! Condition evaluation only ever sees metrics through [`MetricFeed`]. The
//! feed may be stale; it must not block.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

/// Last traded price, used for fills and stop/take-profit checks
pub const PRICE_METRIC: &str = "price";

/// Fixed metric vocabulary understood by every feed
pub const METRICS: [&str; 12] = [
    "price_delta_1m",
    "price_delta_5m",
    "price_delta_15m",
    "volume_ratio_1m",
    "volume_ratio_5m",
    "volume_spike",
    "order_book_imbalance",
    "bid_ask_spread",
    "trade_count_1m",
    "buy_sell_ratio",
    "price_acceleration",
    "volume_acceleration",
];

pub trait MetricFeed: Send + Sync {
    /// Current value of `name` for `symbol`, or `None` if the feed has never
    /// seen it.
    fn get_metric(&self, name: &str, symbol: &str) -> Option<f64>;
}

/// Hand-set metric values
#[derive(Debug, Default)]
pub struct StaticMetricFeed {
    values: RwLock<HashMap<(String, String), f64>>,
}

impl StaticMetricFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: &str, name: &str, value: f64) {
        if let Ok(mut values) = self.values.write() {
            values.insert((symbol.to_string(), name.to_string()), value);
        }
    }

    pub fn clear(&self, symbol: &str, name: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(&(symbol.to_string(), name.to_string()));
        }
    }
}

impl MetricFeed for StaticMetricFeed {
    fn get_metric(&self, name: &str, symbol: &str) -> Option<f64> {
        let values = self.values.read().ok()?;
        values.get(&(symbol.to_string(), name.to_string())).copied()
    }
}

// ─────────────────────────────────────────────────────────────────
// Simulated market (paper mode)
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct MarketState {
    price: f64,
    prices: VecDeque<(DateTime<Utc>, f64)>,
    volumes: VecDeque<(DateTime<Utc>, f64)>,
    imbalance: f64,
    metrics: HashMap<&'static str, f64>,
}

/// Random-walk market for a single symbol
#[derive(Debug)]
pub struct SimulatedMarket {
    symbol: String,
    /// Per-step return standard deviation (e.g., 0.001 = 10 bps)
    volatility: f64,
    state: Mutex<MarketState>,
}

impl SimulatedMarket {
    pub fn new(symbol: impl Into<String>, start_price: f64, volatility: f64) -> Self {
        Self {
            symbol: symbol.into(),
            volatility: volatility.max(0.0),
            state: Mutex::new(MarketState {
                price: start_price.max(0.01),
                prices: VecDeque::new(),
                volumes: VecDeque::new(),
                imbalance: 0.0,
                metrics: HashMap::new(),
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Advance the walk by one step and recompute every metric
    pub fn step(&self, now: DateTime<Utc>) {
        let mut rng = rand::thread_rng();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let shock: f64 = rng.gen_range(-1.0..1.0) * self.volatility * 3f64.sqrt();
        state.price = (state.price * (1.0 + shock)).max(0.01);
        let volume = rng.gen_range(0.5..1.5) * if rng.gen_bool(0.02) { 5.0 } else { 1.0 };
        state.imbalance = (state.imbalance * 0.9 + rng.gen_range(-0.2..0.2)).clamp(-1.0, 1.0);

        let price = state.price;
        state.prices.push_back((now, price));
        state.volumes.push_back((now, volume));
        let horizon = now - Duration::minutes(16);
        while state.prices.front().map(|(t, _)| *t < horizon).unwrap_or(false) {
            state.prices.pop_front();
        }
        while state.volumes.front().map(|(t, _)| *t < horizon).unwrap_or(false) {
            state.volumes.pop_front();
        }

        let delta = |minutes: i64| -> f64 {
            let since = now - Duration::minutes(minutes);
            state
                .prices
                .iter()
                .find(|(t, _)| *t >= since)
                .map(|(_, p)| (price - p) / p * 100.0)
                .unwrap_or(0.0)
        };
        let volume_sum = |minutes: i64| -> (f64, usize) {
            let since = now - Duration::minutes(minutes);
            state
                .volumes
                .iter()
                .filter(|(t, _)| *t >= since)
                .fold((0.0, 0), |(sum, n), (_, v)| (sum + v, n + 1))
        };

        let d1 = delta(1);
        let d5 = delta(5);
        let d15 = delta(15);
        let (v1, n1) = volume_sum(1);
        let (v5, n5) = volume_sum(5);
        let (v15, n15) = volume_sum(15);
        let avg = |sum: f64, n: usize| if n > 0 { sum / n as f64 } else { 0.0 };
        let base = avg(v15, n15).max(f64::EPSILON);
        let ratio_1m = avg(v1, n1) / base;
        let ratio_5m = avg(v5, n5) / base;

        let prev_d1 = state.metrics.get("price_delta_1m").copied().unwrap_or(0.0);
        let prev_ratio = state.metrics.get("volume_ratio_1m").copied().unwrap_or(1.0);
        let buy_share = ((state.imbalance + 1.0) / 2.0).clamp(0.01, 0.99);
        let imbalance = state.imbalance;

        let metrics = [
            ("price_delta_1m", d1),
            ("price_delta_5m", d5),
            ("price_delta_15m", d15),
            ("volume_ratio_1m", ratio_1m),
            ("volume_ratio_5m", ratio_5m),
            ("volume_spike", volume / base),
            ("order_book_imbalance", imbalance),
            ("bid_ask_spread", rng.gen_range(0.01..0.10)),
            ("trade_count_1m", n1 as f64 * rng.gen_range(5.0..15.0)),
            ("buy_sell_ratio", buy_share / (1.0 - buy_share)),
            ("price_acceleration", d1 - prev_d1),
            ("volume_acceleration", ratio_1m - prev_ratio),
        ];
        for (name, value) in metrics {
            state.metrics.insert(name, value);
        }
    }
}

impl MetricFeed for SimulatedMarket {
    fn get_metric(&self, name: &str, symbol: &str) -> Option<f64> {
        if symbol != self.symbol {
            return None;
        }
        let state = self.state.lock().ok()?;
        if name == PRICE_METRIC {
            return Some(state.price);
        }
        state.metrics.get(name).copied()
    }
}
