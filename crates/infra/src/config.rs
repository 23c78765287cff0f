//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Tuning knobs of a [`SignalBus`](crate::dispatch::SignalBus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBusConfig {
    /// Grace period `flush` waits between snapshotting and delivering.
    pub flush_wait: Duration,
    /// Conflict retries around each type in `flush` and autoflush.
    pub flush_retry: RetryPolicy,
    /// Conflict retries around each `flushmany` burst and `flushordered` page.
    pub page_retry: RetryPolicy,
    /// Upper bound on rows claimed per `flushmany` burst.
    pub flushmany_limit: usize,
    /// Rows listed per `flushordered` page.
    pub flushordered_limit: usize,
    /// Global autoflush switch.
    pub autoflush: bool,
}

impl Default for SignalBusConfig {
    fn default() -> Self {
        Self {
            flush_wait: Duration::from_secs(3),
            flush_retry: RetryPolicy::for_flush(),
            page_retry: RetryPolicy::default(),
            flushmany_limit: 10_000,
            flushordered_limit: 10_000,
            autoflush: true,
        }
    }
}

impl SignalBusConfig {
    /// Defaults overlaid with `SIGNALBUS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("SIGNALBUS_FLUSH_WAIT") {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs >= 0.0 => config.flush_wait = Duration::from_secs_f64(secs),
                _ => tracing::warn!(key = "SIGNALBUS_FLUSH_WAIT", value = %raw, "ignoring invalid setting"),
            }
        }
        if let Some(limit) = positive(&lookup, "SIGNALBUS_FLUSHMANY_LIMIT") {
            config.flushmany_limit = limit;
        }
        if let Some(limit) = positive(&lookup, "SIGNALBUS_FLUSHORDERED_LIMIT") {
            config.flushordered_limit = limit;
        }
        if let Some(raw) = lookup("SIGNALBUS_AUTOFLUSH") {
            match parse_bool(&raw) {
                Some(enabled) => config.autoflush = enabled,
                None => tracing::warn!(key = "SIGNALBUS_AUTOFLUSH", value = %raw, "ignoring invalid setting"),
            }
        }
        config
    }

    pub fn with_flush_wait(mut self, wait: Duration) -> Self {
        self.flush_wait = wait;
        self
    }

    pub fn with_flush_retry(mut self, policy: RetryPolicy) -> Self {
        self.flush_retry = policy;
        self
    }

    pub fn with_page_retry(mut self, policy: RetryPolicy) -> Self {
        self.page_retry = policy;
        self
    }

    pub fn with_flushmany_limit(mut self, limit: usize) -> Self {
        self.flushmany_limit = limit.max(1);
        self
    }

    pub fn with_flushordered_limit(mut self, limit: usize) -> Self {
        self.flushordered_limit = limit.max(1);
        self
    }

    pub fn with_autoflush(mut self, enabled: bool) -> Self {
        self.autoflush = enabled;
        self
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid setting");
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
