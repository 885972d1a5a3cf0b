// src/key_pool/stats.rs

use super::KeyStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Per-key line of a [`UsageStats`] snapshot. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyUsage {
    pub index: usize,
    pub preview: String,
    pub calls: u64,
    pub window_tokens: u64,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Point-in-time view of the pool, used only for progress output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub keys: Vec<KeyUsage>,
    pub total_calls: u64,
    pub failed_keys: usize,
    pub available_keys: usize,
    pub taken_at: DateTime<Utc>,
}

impl UsageStats {
    pub(super) fn from_keys(keys: Vec<KeyUsage>) -> Self {
        let total_calls = keys.iter().map(|k| k.calls).sum();
        let failed_keys = keys
            .iter()
            .filter(|k| k.status == KeyStatus::Failed)
            .count();
        Self {
            available_keys: keys.len() - failed_keys,
            total_calls,
            failed_keys,
            keys,
            taken_at: Utc::now(),
        }
    }
}

impl fmt::Display for UsageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "API key usage: {} calls, {} available, {} failed",
            self.total_calls, self.available_keys, self.failed_keys
        )?;
        for key in &self.keys {
            write!(
                f,
                "  #{:<3} {:<13} calls={:<5} window_tokens={:<8} {:?}",
                key.index, key.preview, key.calls, key.window_tokens, key.status
            )?;
            if let Some(reason) = &key.failure {
                write!(f, " ({reason})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
