//! Connection state machine.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a client session's connection to the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection; either never connected or the link dropped.
    #[default]
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Connected with a live server session.
    Connected,
    /// The server session expired. Ephemeral nodes and watches are gone.
    Expired,
    /// The owner closed the session.
    Closed,
}

impl ConnectionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Disconnected -> Connecting
    /// - Connecting -> Connected | Disconnected
    /// - Connected -> Disconnected (link lost)
    /// - Disconnected -> Connected (link recovered, session still alive)
    /// - Connected | Disconnected -> Expired
    /// - any state except Closed -> Closed
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (*self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Connected)
                | (Connected, Expired)
                | (Disconnected, Expired)
                | (Disconnected, Closed)
                | (Connecting, Closed)
                | (Connected, Closed)
                | (Expired, Closed)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: ConnectionState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::CoordError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Check if no further use of the session is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Expired | ConnectionState::Closed)
    }

    /// Check if requests can currently be sent.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Expired => "EXPIRED",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_lose_recover() {
        let mut state = ConnectionState::Disconnected;
        assert!(state.transition_to(ConnectionState::Connecting).is_ok());
        assert!(state.transition_to(ConnectionState::Connected).is_ok());
        assert!(state.transition_to(ConnectionState::Disconnected).is_ok());
        assert!(state.transition_to(ConnectionState::Connected).is_ok());
        assert!(state.transition_to(ConnectionState::Closed).is_ok());
        assert_eq!(state, ConnectionState::Closed);
    }

    #[test]
    fn test_expiry_then_close() {
        let mut state = ConnectionState::Connected;
        assert!(state.transition_to(ConnectionState::Expired).is_ok());
        assert!(state.transition_to(ConnectionState::Connected).is_err());
        assert!(state.transition_to(ConnectionState::Closed).is_ok());
    }

    #[test]
    fn test_invalid_from_closed() {
        let mut state = ConnectionState::Closed;
        assert!(state.transition_to(ConnectionState::Connecting).is_err());
        assert!(state.transition_to(ConnectionState::Closed).is_err());
        assert_eq!(state, ConnectionState::Closed);
    }

    #[test]
    fn test_connecting_cannot_expire() {
        let mut state = ConnectionState::Connecting;
        assert!(state.transition_to(ConnectionState::Expired).is_err());
        assert_eq!(state, ConnectionState::Connecting);
    }

    #[test]
    fn test_is_terminal() {
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Expired.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
