#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Disconnected,
    /// CONNECT sent, waiting for CONNACK
    Connecting,
    Connected {
        session_present: bool,
    },
}

impl ClientState {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_state_default() {
        let state = ClientState::default();
        assert_eq!(state, ClientState::Disconnected);
        assert!(state.is_disconnected());
        assert!(!state.is_connected());
        assert!(ClientState::Connected {
            session_present: false
        }
        .is_connected());
    }
}
