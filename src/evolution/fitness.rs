//! Fitness scoring for selection

use crate::types::{decimal_to_f64, Pattern};

/// Profit that counts as one full unit of the profit term
pub const PROFIT_SCALE: f64 = 1000.0;

const ELITE_WIN_RATE: f64 = 0.6;
const ELITE_SHARPE: f64 = 1.5;
const ELITE_BONUS: f64 = 1.5;

/// Trades after which the confidence term saturates
const CONFIDENCE_TRADES: f64 = 100.0;

/// Weighted blend of win rate, Sharpe, profit and sample size.
///
/// A pattern with no completed trades scores zero.
pub fn fitness(pattern: &Pattern, profit_scale: f64) -> f64 {
    let tests = pattern.test_count();
    if tests == 0 {
        return 0.0;
    }
    let scale = if profit_scale > 0.0 {
        profit_scale
    } else {
        PROFIT_SCALE
    };

    let win_rate = pattern.win_rate;
    let sharpe = if pattern.sharpe_ratio.is_finite() {
        pattern.sharpe_ratio
    } else {
        0.0
    };
    let confidence = (tests as f64 / CONFIDENCE_TRADES).min(1.0);
    let profit = decimal_to_f64(pattern.total_profit()) / scale;

    let score = 0.3 * win_rate * win_rate
        + 0.3 * (sharpe / 3.0).max(0.0)
        + 0.2 * profit
        + 0.2 * confidence;

    if win_rate > ELITE_WIN_RATE && sharpe > ELITE_SHARPE {
        score * ELITE_BONUS
    } else {
        score
    }
}
