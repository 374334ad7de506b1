//! Time-bounded loss logs and self-clearing circuit breakers
//!
//! Both are evaluated lazily against the caller's `now`; nothing here spawns
//! timers.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Append-only log of losses that forgets entries older than `span`
#[derive(Debug, Clone)]
pub struct LossWindow {
    span: Duration,
    events: VecDeque<(DateTime<Utc>, Decimal)>,
}

impl LossWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            events: VecDeque::new(),
        }
    }

    /// Record a loss (positive amount)
    pub fn record(&mut self, at: DateTime<Utc>, amount: Decimal) {
        self.events.push_back((at, amount.abs()));
    }

    /// Sum of losses inside the window ending at `now`
    pub fn total(&mut self, now: DateTime<Utc>) -> Decimal {
        self.prune(now);
        self.events.iter().map(|(_, amount)| *amount).sum()
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.span;
        while let Some((at, _)) = self.events.front() {
            if *at > cutoff {
                break;
            }
            self.events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerKind {
    /// Trips on the 15-minute loss window
    Short,
    /// Trips on the 1-hour loss window
    Long,
}

impl fmt::Display for BreakerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerKind::Short => write!(f, "BREAKER_15M"),
            BreakerKind::Long => write!(f, "BREAKER_1H"),
        }
    }
}

/// `Normal -> Tripped(deadline) -> Normal`
#[derive(Debug, Clone)]
pub struct Breaker {
    kind: BreakerKind,
    cooldown: Duration,
    deadline: Option<DateTime<Utc>>,
}

impl Breaker {
    pub fn new(kind: BreakerKind, cooldown: Duration) -> Self {
        Self {
            kind,
            cooldown,
            deadline: None,
        }
    }

    pub fn kind(&self) -> BreakerKind {
        self.kind
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Clear the breaker if its cooldown has elapsed. Returns true on the
    /// `Tripped -> Normal` edge.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_tripped(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deadline, Some(deadline) if now < deadline)
    }

    /// Trip the breaker. Returns false when it was already tripped; the
    /// running deadline is not extended.
    pub fn trip(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_tripped(now) {
            return false;
        }
        self.deadline = Some(now + self.cooldown);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn window_forgets_old_losses() {
        let start = Utc::now();
        let mut window = LossWindow::new(Duration::minutes(15));
        window.record(start, dec!(10));
        window.record(start + Duration::minutes(10), dec!(-5));

        assert_eq!(window.total(start + Duration::minutes(14)), dec!(15));
        assert_eq!(window.total(start + Duration::minutes(16)), dec!(5));
        assert_eq!(window.total(start + Duration::minutes(30)), dec!(0));
        assert!(window.is_empty());
    }

    #[test]
    fn breaker_clears_after_cooldown() {
        let start = Utc::now();
        let mut breaker = Breaker::new(BreakerKind::Short, Duration::hours(1));

        assert!(breaker.trip(start));
        assert!(!breaker.trip(start + Duration::minutes(30)));
        assert_eq!(breaker.deadline(), Some(start + Duration::hours(1)));

        assert!(!breaker.refresh(start + Duration::minutes(59)));
        assert!(breaker.is_tripped(start + Duration::minutes(59)));

        assert!(breaker.refresh(start + Duration::minutes(60)));
        assert!(!breaker.is_tripped(start + Duration::minutes(60)));
        assert!(breaker.deadline().is_none());
    }
}
