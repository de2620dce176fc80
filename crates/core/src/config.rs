//! Runtime knobs, read from `SKEIN_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 800;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 30;
/// Kept under the 295s ceiling Kubernetes API servers enforce on watch timeouts.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;
pub const DEFAULT_SYNC_POLL_MS: u64 = 100;

/// What the delta queue does when a delete arrives for an object that still
/// has pending, unprocessed deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletePolicy {
    /// Drop the pending deltas; only the terminal delete is delivered.
    #[default]
    Collapse,
    /// Keep the full history and append the delete.
    Retain,
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collapse" => Ok(DeletePolicy::Collapse),
            "retain" => Ok(DeletePolicy::Retain),
            other => Err(format!("unknown delete policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Zero disables periodic resync.
    pub resync: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub watch_timeout_secs: u32,
    pub delete_policy: DeletePolicy,
    pub sync_poll: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync: Duration::ZERO,
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
            delete_policy: DeletePolicy::Collapse,
            sync_poll: Duration::from_millis(DEFAULT_SYNC_POLL_MS),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparseable values keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "config: ignoring unparseable value");
                    None
                }
            }
        }

        let mut cfg = Self::default();
        if let Some(secs) = parse::<u64>(&lookup, "SKEIN_RESYNC_SECS") {
            cfg.resync = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "SKEIN_WATCH_BACKOFF_INITIAL_MS") {
            cfg.backoff_initial = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "SKEIN_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff_max = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u32>(&lookup, "SKEIN_WATCH_TIMEOUT_SECS") {
            cfg.watch_timeout_secs = secs;
        }
        if let Some(policy) = parse::<DeletePolicy>(&lookup, "SKEIN_DELETE_POLICY") {
            cfg.delete_policy = policy;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SKEIN_SYNC_POLL_MS") {
            cfg.sync_poll = Duration::from_millis(ms.max(1));
        }
        cfg
    }
}
