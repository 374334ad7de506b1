#[derive(Debug, Clone, Copy)]
pub struct KellyQuote {
    /// Full Kelly fraction, negative when the edge is negative
    pub f_raw: f64,
    pub f_fractional: f64,
}

/// Fractional Kelly for a repeated bet paying `b = avg_win / avg_loss`
pub fn compute_fractional_kelly(
    win_rate: f64,
    avg_win: f64,
    avg_loss: f64,
    fractional: f64,
    cap: f64,
) -> KellyQuote {
    let p = win_rate.clamp(0.0, 1.0);
    let q = 1.0 - p;
    let b = if avg_loss > 0.0 && avg_win > 0.0 {
        avg_win / avg_loss
    } else {
        0.0
    };

    let f_raw = if b > 0.0 { (p * b - q) / b } else { 0.0 };
    let f_capped = f_raw.max(0.0).min(cap.max(0.0));
    let f_fractional = f_capped * fractional.max(0.0);

    KellyQuote {
        f_raw,
        f_fractional,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kelly_zero_when_negative_edge() {
        let q = compute_fractional_kelly(0.40, 1.0, 1.0, 0.25, 1.0);
        assert!(q.f_raw < 0.0);
        assert!(q.f_fractional <= 0.0000001);
    }

    #[test]
    fn kelly_matches_closed_form() {
        // p=0.6, b=2 -> (1.2 - 0.4) / 2 = 0.4
        let q = compute_fractional_kelly(0.6, 20.0, 10.0, 0.25, 1.0);
        assert!((q.f_raw - 0.4).abs() < 1e-12);
        assert!((q.f_fractional - 0.1).abs() < 1e-12);
    }

    #[test]
    fn kelly_degenerate_payoff() {
        let q = compute_fractional_kelly(0.9, 5.0, 0.0, 0.25, 1.0);
        assert_eq!(q.f_raw, 0.0);
        assert_eq!(q.f_fractional, 0.0);
    }
}
