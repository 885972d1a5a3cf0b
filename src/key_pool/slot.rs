// src/key_pool/slot.rs

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Length of the rolling quota window tracked per key.
pub const QUOTA_WINDOW: Duration = Duration::from_secs(60);

/// Observable lifecycle of a single key.
///
/// `Available` and `Leased` cycle freely; `Failed` is terminal for the
/// lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Available,
    Leased,
    Failed,
}

/// Per-key bookkeeping. Only ever touched while the pool mutex is held.
pub(crate) struct KeySlot {
    secret: SecretString,
    preview: String,
    pub(crate) usage: u64,
    pub(crate) failed: bool,
    pub(crate) failure_detail: Option<String>,
    pub(crate) locked: bool,
    pub(crate) window_usage: u64,
    pub(crate) window_start: Instant,
}

impl KeySlot {
    pub(crate) fn new(raw: String, now: Instant) -> Self {
        let preview = preview_key(&raw);
        Self {
            secret: SecretString::new(raw),
            preview,
            usage: 0,
            failed: false,
            failure_detail: None,
            locked: false,
            window_usage: 0,
            window_start: now,
        }
    }

    pub(crate) fn preview(&self) -> &str {
        &self.preview
    }

    /// Hands out an owned copy of the secret so callers never hold the lock.
    pub(crate) fn secret_copy(&self) -> SecretString {
        SecretString::new(self.secret.expose_secret().clone())
    }

    pub(crate) fn is_healthy(&self) -> bool {
        !self.failed
    }

    pub(crate) fn status(&self) -> KeyStatus {
        if self.failed {
            KeyStatus::Failed
        } else if self.locked {
            KeyStatus::Leased
        } else {
            KeyStatus::Available
        }
    }

    /// Zeroes the window counter once a full window has elapsed.
    /// Returns `true` if a reset happened.
    pub(crate) fn reset_window_if_needed(&mut self, now: Instant) -> bool {
        // Inclusive: the window ends exactly when `window_remaining` reaches zero.
        if now.saturating_duration_since(self.window_start) >= QUOTA_WINDOW {
            self.window_usage = 0;
            self.window_start = now;
            true
        } else {
            false
        }
    }

    pub(crate) fn fits(&self, cost: u64, capacity: u64) -> bool {
        self.window_usage.saturating_add(cost) <= capacity
    }

    /// Like [`fits`](Self::fits), but a request larger than the whole
    /// ceiling is admitted into an untouched window instead of never.
    pub(crate) fn admits(&self, cost: u64, capacity: u64) -> bool {
        self.fits(cost, capacity) || (cost > capacity && self.window_usage == 0)
    }

    pub(crate) fn window_remaining(&self, now: Instant) -> Duration {
        QUOTA_WINDOW.saturating_sub(now.saturating_duration_since(self.window_start))
    }
}

/// Masks a key for logs: first four and last four characters.
pub fn preview_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "*".repeat(chars.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_hides_the_middle_of_the_key() {
        let preview = preview_key("AIzaSyA1234567890abcdefghijklmnopqrs");
        assert_eq!(preview, "AIza...pqrs");
        assert!(!preview.contains("1234567890"));
    }

    #[test]
    fn preview_masks_short_keys_entirely() {
        assert_eq!(preview_key("abc"), "***");
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_a_full_minute() {
        let mut slot = KeySlot::new("k".repeat(24), Instant::now());
        slot.window_usage = 42;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!slot.reset_window_if_needed(Instant::now()));
        assert_eq!(slot.window_usage, 42);
        assert_eq!(slot.window_remaining(Instant::now()), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(slot.window_remaining(Instant::now()), Duration::ZERO);
        assert!(slot.reset_window_if_needed(Instant::now()));
        assert_eq!(slot.window_usage, 0);
        assert_eq!(slot.window_remaining(Instant::now()), QUOTA_WINDOW);
    }

    #[test]
    fn oversized_request_gets_a_fresh_window() {
        let mut slot = KeySlot::new("k".repeat(24), Instant::now());
        assert!(!slot.fits(150, 100));
        assert!(slot.admits(150, 100));
        slot.window_usage = 1;
        assert!(!slot.admits(150, 100));
    }

    #[test]
    fn status_reflects_flags() {
        let mut slot = KeySlot::new("k".repeat(24), Instant::now());
        assert_eq!(slot.status(), KeyStatus::Available);
        slot.locked = true;
        assert_eq!(slot.status(), KeyStatus::Leased);
        slot.failed = true;
        assert_eq!(slot.status(), KeyStatus::Failed);
    }
}
