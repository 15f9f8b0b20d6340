//! Reconnection policy state.
//! Tracks per-device attempt counters and the cancellable timer for the next
//! scheduled attempt. Entries exist only for devices that disconnected
//! unexpectedly; they are removed on success, exhaustion, intentional
//! disconnect and adapter close.

use std::collections::HashMap;
use std::time::Duration;

use log::info;
use tokio_util::sync::CancellationToken;

/// Maximum reconnection attempts per unexpected disconnect.
pub(crate) const MAX_ATTEMPTS: u32 = 3;

/// Delay before the first attempt.
pub(crate) const INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Backoff multiplier applied per attempt.
pub(crate) const DELAY_MULTIPLIER: f64 = 1.5;

/// Delay before attempt `n` (1-indexed): initial × multiplier^(n−1).
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    INITIAL_DELAY.mul_f64(DELAY_MULTIPLIER.powi(attempt.saturating_sub(1) as i32))
}

struct ReconnectEntry {
    attempt: u32,
    timer: Option<CancellationToken>,
}

#[derive(Default)]
pub(crate) struct ReconnectTracker {
    entries: HashMap<String, ReconnectEntry>,
}

impl ReconnectTracker {
    /// Starts tracking a device after an unexpected disconnect.
    pub fn begin(&mut self, device_id: &str) {
        self.entries
            .insert(device_id.to_string(), ReconnectEntry { attempt: 0, timer: None });
    }

    pub fn is_tracking(&self, device_id: &str) -> bool {
        self.entries.contains_key(device_id)
    }

    pub fn attempt_of(&self, device_id: &str) -> Option<u32> {
        self.entries.get(device_id).map(|e| e.attempt)
    }

    /// Records the attempt number when its timer fires.
    pub fn set_attempt(&mut self, device_id: &str, attempt: u32) {
        if let Some(entry) = self.entries.get_mut(device_id) {
            entry.attempt = attempt;
        }
    }

    /// Stores the timer token for the next scheduled attempt, cancelling a
    /// previously armed one.
    pub fn arm_timer(&mut self, device_id: &str, token: CancellationToken) {
        if let Some(entry) = self.entries.get_mut(device_id) {
            if let Some(old) = entry.timer.replace(token) {
                old.cancel();
            }
        }
    }

    /// Cancels any scheduled attempt and stops tracking the device.
    /// Idempotent.
    pub fn cancel(&mut self, device_id: &str) {
        if let Some(entry) = self.entries.remove(device_id) {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
            info!("reconnection cancelled for {device_id}");
        }
    }

    pub fn cancel_all(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        info!("cancelling all reconnection tasks ({})", self.entries.len());
        for (_, entry) in self.entries.drain() {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
        }
    }
}
