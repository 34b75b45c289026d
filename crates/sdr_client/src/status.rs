//! Connection status and the reports derived from it.
//!
//! [`ConnectionStatus`] is the state the session is in. [`StatusReport`] is
//! what observers are told, and [`StatusReporter`] decides which transitions
//! become reports: `Connecting` once per outage, `FailedConnect` once (or
//! once per connection, see [`FailureReporting`]).

use std::fmt;

use clap::ValueEnum;
use sdr_cell::ValueType;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Where the session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Shut down locally. Terminal.
    Failed,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 4] = [
        ConnectionStatus::Disconnected,
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
        }
    }

    /// Type of the status indicator cell.
    #[must_use]
    pub fn value_type() -> ValueType {
        ValueType::enumeration(Self::ALL.iter().map(|s| s.as_str()))
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition observers are told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    Connecting,
    Connected,
    Disconnected { reason: String },
    FailedConnect { reason: String },
}

/// When a connection failure is reported again after the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FailureReporting {
    /// Only the first failure in the client's lifetime is reported.
    #[default]
    FirstOnly,
    /// Re-arm after every successful connection.
    ResetOnConnect,
}

/// Turns session transitions into [`StatusReport`]s.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    policy: FailureReporting,
    in_outage: bool,
    failure_reported: bool,
    suppressed: u64,
}

impl StatusReporter {
    #[must_use]
    pub fn new(policy: FailureReporting) -> Self {
        Self {
            policy,
            in_outage: false,
            failure_reported: false,
            suppressed: 0,
        }
    }

    /// An attempt is starting. Reported only for the first attempt of an
    /// outage.
    pub fn connecting(&mut self, attempt: u64) -> Option<StatusReport> {
        if self.in_outage {
            debug!(attempt, "retrying connection");
            return None;
        }
        self.in_outage = true;
        info!(attempt, "connecting");
        Some(StatusReport::Connecting)
    }

    pub fn connected(&mut self, attempt: u64) -> StatusReport {
        self.in_outage = false;
        if self.policy == FailureReporting::ResetOnConnect {
            self.failure_reported = false;
        }
        info!(attempt, "connected");
        StatusReport::Connected
    }

    pub fn disconnected(&mut self, reason: &str) -> StatusReport {
        warn!(reason, "disconnected");
        StatusReport::Disconnected {
            reason: reason.to_string(),
        }
    }

    /// An attempt failed before the handshake.
    pub fn failed_connect(&mut self, attempt: u64, reason: &str) -> Option<StatusReport> {
        if self.failure_reported {
            self.suppressed += 1;
            debug!(
                attempt,
                reason,
                suppressed = self.suppressed,
                "connection failure suppressed"
            );
            return None;
        }
        self.failure_reported = true;
        warn!(attempt, reason, "failed to connect");
        Some(StatusReport::FailedConnect {
            reason: reason.to_string(),
        })
    }

    /// Failures not reported since startup.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connecting_reported_once_per_outage() {
        let mut reporter = StatusReporter::new(FailureReporting::FirstOnly);
        assert_eq!(reporter.connecting(1), Some(StatusReport::Connecting));
        assert!(reporter.failed_connect(1, "refused").is_some());
        assert_eq!(reporter.connecting(2), None);
        assert_eq!(reporter.connected(2), StatusReport::Connected);

        // A new outage is reported again.
        reporter.disconnected("eof");
        assert_eq!(reporter.connecting(3), Some(StatusReport::Connecting));
    }

    #[test]
    fn test_first_only_never_reports_failure_again() {
        let mut reporter = StatusReporter::new(FailureReporting::FirstOnly);
        reporter.connecting(1);
        assert!(reporter.failed_connect(1, "refused").is_some());
        assert!(reporter.failed_connect(2, "refused").is_none());
        reporter.connected(3);
        reporter.disconnected("eof");
        reporter.connecting(4);
        assert!(reporter.failed_connect(4, "refused").is_none());
        assert_eq!(reporter.suppressed(), 2);
    }

    #[test]
    fn test_reset_on_connect_rearms_failure_report() {
        let mut reporter = StatusReporter::new(FailureReporting::ResetOnConnect);
        reporter.connecting(1);
        assert!(reporter.failed_connect(1, "refused").is_some());
        assert!(reporter.failed_connect(2, "refused").is_none());
        reporter.connected(3);
        reporter.disconnected("eof");
        reporter.connecting(4);
        assert!(reporter.failed_connect(4, "refused").is_some());
    }

    #[test]
    fn test_status_cell_type_admits_every_status() {
        let ty = ConnectionStatus::value_type();
        for status in ConnectionStatus::ALL {
            assert!(ty.check(&status.as_str().into()).is_ok());
        }
        assert!(ty.check(&"bogus".into()).is_err());
    }

    #[test]
    fn test_failure_reporting_flag_values() {
        assert_eq!(
            FailureReporting::from_str("reset-on-connect", false),
            Ok(FailureReporting::ResetOnConnect)
        );
        assert_eq!(
            FailureReporting::from_str("first-only", false),
            Ok(FailureReporting::FirstOnly)
        );
        assert!(FailureReporting::from_str("sometimes", false).is_err());
    }
}
