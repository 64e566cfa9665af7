use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::retry::RetryPolicy;

/// Pacing and safety limits shared by both synchronisers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Courtesy pause before every remote call.
    pub request_delay_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Longest root-first path a sweep will descend into.
    pub max_depth: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            request_delay_ms: 2_000,
            retry_attempts: 3,
            retry_delay_ms: 10_000,
            max_depth: 16,
        }
    }
}

impl SyncSettings {
    /// No pauses, a single attempt. Meant for tests and local fakes.
    pub fn immediate() -> Self {
        SyncSettings {
            request_delay_ms: 0,
            retry_attempts: 1,
            retry_delay_ms: 0,
            ..SyncSettings::default()
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            request_delay_ms = self.request_delay_ms,
            retry_attempts = self.retry_attempts,
            max_depth = self.max_depth,
            "Loaded SyncSettings"
        );
        debug!(?self, "SyncSettings loaded (full debug)");
    }
}
