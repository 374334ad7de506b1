//! Structured alert events
//!
//! Breaker trips and emergency stops are surfaced through an [`AlertSink`].
//! The default sink writes them to the tracing pipeline.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: String,
    pub severity: Severity,
    pub description: String,
    pub capital_at_event: Decimal,
}

pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Routes alerts to `tracing` at a level matching their severity
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, alert: &Alert) {
        match alert.severity {
            Severity::Info => info!(
                kind = %alert.kind,
                capital = %alert.capital_at_event,
                "🔔 {}", alert.description
            ),
            Severity::Warning => warn!(
                kind = %alert.kind,
                capital = %alert.capital_at_event,
                "⚠️ {}", alert.description
            ),
            Severity::Critical => error!(
                kind = %alert.kind,
                capital = %alert.capital_at_event,
                "🚨 {}", alert.description
            ),
        }
    }
}

/// Keeps every alert in memory
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl AlertSink for RecordingAlertSink {
    fn emit(&self, alert: &Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
    }
}
