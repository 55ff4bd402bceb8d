// Operator notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Where alerts go. Delivery (chat, e-mail, pager) lives outside the engine.
pub trait NotificationSink: Send + Sync {
    fn send(&self, message: &str, urgent: bool);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub urgent: bool,
}

/// Logs every alert and keeps a bounded history for status reporting
#[derive(Debug)]
pub struct AlertLog {
    history: Mutex<VecDeque<Alert>>,
    max_history: usize,
}

impl AlertLog {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(max_history)),
            max_history,
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn urgent_alerts(&self) -> Vec<Alert> {
        self.alerts().into_iter().filter(|a| a.urgent).collect()
    }

    /// True if any recorded alert contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.alerts().iter().any(|a| a.message.contains(needle))
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(500)
    }
}

impl NotificationSink for AlertLog {
    fn send(&self, message: &str, urgent: bool) {
        if urgent {
            error!("🚨 ALERT: {}", message);
        } else {
            info!("🔔 {}", message);
        }

        if let Ok(mut history) = self.history.lock() {
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(Alert {
                timestamp: Utc::now(),
                message: message.to_string(),
                urgent,
            });
        }
    }
}

/// Drops alerts to debug logs, for repeats of a failure already reported
pub struct Muted;

impl NotificationSink for Muted {
    fn send(&self, message: &str, urgent: bool) {
        debug!("🔕 suppressed{}: {}", if urgent { " urgent alert" } else { "" }, message);
    }
}
