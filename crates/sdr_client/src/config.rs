//! Client configuration.

use std::path::PathBuf;

use sdr_cell::DEFAULT_MAX_ROUNDS;
use sdr_net::{BackoffPolicy, DEFAULT_NATS_URL, NATS_URL_ENV, subjects};

use crate::status::FailureReporting;

/// Configuration for a client process.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Subject prefix of the server to control (e.g. `"radio"`).
    pub prefix: String,
    /// Optional NATS URL override (defaults to `NATS_URL` env or localhost).
    pub nats_url: Option<String>,
    /// Delay between reconnection attempts.
    pub backoff: BackoffPolicy,
    /// When a repeated connection failure is reported again.
    pub failure_reporting: FailureReporting,
    /// Apply actions locally before the server confirms them.
    pub optimistic: bool,
    /// Round cap for each scheduler flush.
    pub max_rounds: usize,
    /// JSON file holding user preferences. In-memory when unset.
    pub state_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Create a config for the server under `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            nats_url: None,
            backoff: BackoffPolicy::default(),
            failure_reporting: FailureReporting::default(),
            optimistic: false,
            max_rounds: DEFAULT_MAX_ROUNDS,
            state_file: None,
        }
    }

    /// Override the NATS URL.
    #[must_use]
    pub fn with_nats_url(mut self, url: impl Into<String>) -> Self {
        self.nats_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_failure_reporting(mut self, policy: FailureReporting) -> Self {
        self.failure_reporting = policy;
        self
    }

    #[must_use]
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    #[must_use]
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// The URL to dial: the override, else `NATS_URL`, else the default.
    #[must_use]
    pub fn resolved_nats_url(&self) -> String {
        self.nats_url.clone().unwrap_or_else(|| {
            std::env::var(NATS_URL_ENV).unwrap_or_else(|_| DEFAULT_NATS_URL.to_string())
        })
    }

    /// Storage key prefix, so clients of different servers can share one
    /// state file.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("{}.", self.prefix)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(subjects::DEFAULT_PREFIX)
    }
}
