//! Messaging configuration loaded from environment variables.
//!
//! Every setting has a default so a session can start with zero
//! configuration for local development.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use campus_shared::constants::DEFAULT_PAGE_SIZE;

/// What "clear chat" does to the other participant's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClearPolicy {
    /// Only the caller's own deletion flag is set.
    #[default]
    PerSide,
    /// Both flags are set on every message. Irreversible for both sides.
    Bilateral,
}

impl ClearPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerSide => "per-side",
            Self::Bilateral => "bilateral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-side" | "per_side" | "self" => Some(Self::PerSide),
            "bilateral" | "both" => Some(Self::Bilateral),
            _ => None,
        }
    }
}

/// How far back conversation history reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryWindow {
    #[default]
    Unbounded,
    Rolling(chrono::Duration),
}

impl HistoryWindow {
    /// Oldest `created_at` still inside the window, if any.
    pub fn floor(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Unbounded => None,
            Self::Rolling(span) => Some(now - *span),
        }
    }
}

/// Messaging configuration.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Maximum number of messages kept for the open conversation.
    /// Env: `CAMPUS_DM_PAGE_SIZE` (0 = unlimited)
    /// Default: `100`
    pub page_size: Option<u32>,

    /// Env: `CAMPUS_DM_HISTORY_HOURS` (0 = unbounded)
    /// Default: unbounded
    pub history_window: HistoryWindow,

    /// Env: `CAMPUS_DM_CLEAR_POLICY` (`per-side` / `bilateral`)
    /// Default: `per-side`
    pub clear_policy: ClearPolicy,

    /// Upper bound on every backend call.
    /// Env: `CAMPUS_DM_REQUEST_TIMEOUT_SECS`
    /// Default: 15 s
    pub request_timeout: Duration,

    /// How long a temporary message may stay unconfirmed before it is
    /// flagged as failed.
    /// Env: `CAMPUS_DM_RECONCILE_TIMEOUT_SECS`
    /// Default: 30 s
    pub reconcile_timeout: Duration,

    /// Time window for matching an echoed row without a correlation id
    /// against a temporary message.
    /// Env: `CAMPUS_DM_ECHO_WINDOW_SECS`
    /// Default: 10 s
    pub echo_match_window: Duration,

    /// Capacity of the event broadcast channel.
    /// Env: `CAMPUS_DM_EVENT_BUFFER`
    /// Default: `256`
    pub event_buffer: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            page_size: Some(DEFAULT_PAGE_SIZE),
            history_window: HistoryWindow::Unbounded,
            clear_policy: ClearPolicy::PerSide,
            request_timeout: Duration::from_secs(15),
            reconcile_timeout: Duration::from_secs(30),
            echo_match_window: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

impl MessagingConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("CAMPUS_DM_PAGE_SIZE") {
            match val.trim().parse::<u32>() {
                Ok(0) => config.page_size = None,
                Ok(n) => config.page_size = Some(n),
                Err(_) => tracing::warn!(value = %val, "Invalid CAMPUS_DM_PAGE_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("CAMPUS_DM_HISTORY_HOURS") {
            match val.trim().parse::<i64>() {
                Ok(0) => config.history_window = HistoryWindow::Unbounded,
                Ok(hours) if hours > 0 => {
                    config.history_window = HistoryWindow::Rolling(chrono::Duration::hours(hours))
                }
                _ => tracing::warn!(value = %val, "Invalid CAMPUS_DM_HISTORY_HOURS, using default"),
            }
        }

        if let Some(val) = lookup("CAMPUS_DM_CLEAR_POLICY") {
            match ClearPolicy::parse(&val) {
                Some(policy) => config.clear_policy = policy,
                None => tracing::warn!(value = %val, "Invalid CAMPUS_DM_CLEAR_POLICY, using default"),
            }
        }

        if let Some(d) = seconds(&lookup, "CAMPUS_DM_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = d;
        }
        if let Some(d) = seconds(&lookup, "CAMPUS_DM_RECONCILE_TIMEOUT_SECS") {
            config.reconcile_timeout = d;
        }
        if let Some(d) = seconds(&lookup, "CAMPUS_DM_ECHO_WINDOW_SECS") {
            config.echo_match_window = d;
        }

        if let Some(val) = lookup("CAMPUS_DM_EVENT_BUFFER") {
            match val.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.event_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid CAMPUS_DM_EVENT_BUFFER, using default"),
            }
        }

        config
    }

    /// The `since` bound for a fetch issued at `now`.
    pub fn history_floor(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.history_window.floor(now)
    }
}

/// Parse a strictly positive number of seconds.
fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let val = lookup(key)?;
    match val.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(Duration::from_secs(n)),
        _ => {
            tracing::warn!(key, value = %val, "Invalid duration, using default");
            None
        }
    }
}
