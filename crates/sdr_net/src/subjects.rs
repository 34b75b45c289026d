//! NATS subject hierarchy.
//!
//! Every subject lives under a per-server prefix so several radios can share
//! one NATS cluster.

/// Prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "radio";

/// Handshake request. Client → server, answered with a snapshot.
///
/// `<prefix>.session.hello`
#[must_use]
pub fn hello(prefix: &str) -> String {
    format!("{prefix}.session.hello")
}

/// State changes broadcast by the server.
///
/// `<prefix>.state.delta`
#[must_use]
pub fn state_delta(prefix: &str) -> String {
    format!("{prefix}.state.delta")
}

/// Write requests. Client → server.
///
/// `<prefix>.action`
#[must_use]
pub fn action(prefix: &str) -> String {
    format!("{prefix}.action")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_subject() {
        assert_eq!(hello("radio"), "radio.session.hello");
    }

    #[test]
    fn test_state_delta_subject() {
        assert_eq!(state_delta("shack"), "shack.state.delta");
    }

    #[test]
    fn test_action_subject() {
        assert_eq!(action(DEFAULT_PREFIX), "radio.action");
    }
}
