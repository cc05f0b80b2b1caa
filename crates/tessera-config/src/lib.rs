//! Configuration management for Tessera
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TSR_* prefix, `__` between sections)
//! 2. tessera.local.toml (gitignored, local overrides)
//! 3. tessera.toml (git-tracked, project config)
//! 4. ~/.config/tessera/config.toml (user defaults)
//! 5. Built-in defaults, or a caller-supplied base (lowest precedence)

use serde::{Deserialize, Serialize};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Tessera configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub reactor: ReactorConfig,
    pub backfill: BackfillConfig,
    pub mailbox: MailboxConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Namespace the reactor serves.
    pub namespace: String,
    /// How long shutdown waits for activities to drain.
    pub shutdown_timeout_ms: u64,
    /// How long a failed activity's region stays reserved before dispatch
    /// retries it. Lost peers are retried at once.
    pub retry_backoff_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            shutdown_timeout_ms: 5000,
            retry_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Maximum key/value atoms per chunk.
    pub chunk_size: usize,
    /// Chunks a destination buffers before the source is throttled.
    pub chunk_mailbox: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            chunk_mailbox: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Capacity of backfill and broadcast mailboxes.
    pub capacity: usize,
    /// Writes a secondary may lag behind before its primary drops it.
    pub listener_capacity: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            listener_capacity: 1024,
        }
    }
}

impl TesseraConfig {
    /// Create a configuration for tests: small chunks and short timeouts
    pub fn testing() -> Self {
        Self {
            reactor: ReactorConfig {
                shutdown_timeout_ms: 2000,
                retry_backoff_ms: 50,
                ..Default::default()
            },
            backfill: BackfillConfig {
                chunk_size: 4,
                chunk_mailbox: 8,
            },
            mailbox: MailboxConfig {
                capacity: 32,
                listener_capacity: 256,
            },
        }
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("backfill.chunk_size", self.backfill.chunk_size),
            ("backfill.chunk_mailbox", self.backfill.chunk_mailbox),
            ("mailbox.capacity", self.mailbox.capacity),
            ("mailbox.listener_capacity", self.mailbox.listener_capacity),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue { field });
        }
        if self.reactor.namespace.is_empty() {
            return Err(ConfigError::ValidationError(
                "reactor.namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.reactor.shutdown_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.reactor.retry_backoff_ms)
    }
}
