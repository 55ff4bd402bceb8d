// Retry queue for counter-orders owed after fills
//
// Retries are data, not sleeps: each entry carries its attempt count and
// the earliest time it may run again. The engine drains due entries once
// per tick, oldest first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::GridConfig;
use crate::types::{FollowUpAction, PendingFollowUp};

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
    max_attempts: u32,
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        Self { delays, max_attempts }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        Self::new(
            config.retry_delays_minutes.iter().map(|m| Duration::minutes(*m)).collect(),
            config.max_followup_attempts,
        )
    }

    /// Wait before the next try after `failures` failed attempts.
    /// The last delay repeats if the schedule is shorter than the limit.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 || self.delays.is_empty() {
            return Duration::zero();
        }
        let idx = (failures as usize - 1).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_config(&GridConfig::default())
    }
}

/// FIFO of pending follow-ups for one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowUpQueue {
    entries: VecDeque<PendingFollowUp>,
}

impl FollowUpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a follow-up that is due immediately. A second follow-up for
    /// the same trigger order is ignored so a fill is never doubled.
    pub fn push(&mut self, trigger_order_id: &str, action: FollowUpAction, price: f64, quantity: f64, now: DateTime<Utc>) -> bool {
        if self.contains_trigger(trigger_order_id) {
            return false;
        }
        self.entries.push_back(PendingFollowUp {
            trigger_order_id: trigger_order_id.to_string(),
            action,
            price,
            quantity,
            attempt_count: 0,
            next_retry_at: now,
            failed: false,
        });
        true
    }

    pub fn contains_trigger(&self, trigger_order_id: &str) -> bool {
        self.entries.iter().any(|f| f.trigger_order_id == trigger_order_id)
    }

    /// Remove and return every entry due at `now`, oldest first.
    /// Entries not yet due keep their place in the queue.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<PendingFollowUp> {
        let (due, waiting): (VecDeque<_>, VecDeque<_>) =
            self.entries.drain(..).partition(|f| f.next_retry_at <= now);
        self.entries = waiting;
        due.into_iter().collect()
    }

    /// Put a failed entry back for a later retry, ahead of entries queued after it
    pub fn requeue(&mut self, followup: PendingFollowUp) {
        let position = self
            .entries
            .iter()
            .position(|f| f.next_retry_at > followup.next_retry_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, followup);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingFollowUp> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl From<Vec<PendingFollowUp>> for FollowUpQueue {
    fn from(entries: Vec<PendingFollowUp>) -> Self {
        Self { entries: entries.into() }
    }
}
