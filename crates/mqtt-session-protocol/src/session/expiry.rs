use crate::types::{ConnectOptions, ProtocolVersion};
use std::time::{Duration, Instant};

/// How long a session outlives the connection it was used on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionExpiry {
    /// v3.1.1 clean session, or v5.0 Session Expiry Interval 0
    #[default]
    OnDisconnect,
    After(Duration),
    /// v3.1.1 persistent session, or v5.0 interval 0xFFFFFFFF
    Never,
}

impl SessionExpiry {
    /// Maps a v5.0 Session Expiry Interval; an absent property means 0.
    #[must_use]
    pub fn from_interval(seconds: u32) -> Self {
        match seconds {
            0 => Self::OnDisconnect,
            u32::MAX => Self::Never,
            secs => Self::After(Duration::from_secs(u64::from(secs))),
        }
    }

    #[must_use]
    pub fn from_connect(options: &ConnectOptions) -> Self {
        match options.protocol_version {
            ProtocolVersion::V311 if options.clean_start => Self::OnDisconnect,
            ProtocolVersion::V311 => Self::Never,
            ProtocolVersion::V5 => {
                Self::from_interval(options.properties.session_expiry_interval.unwrap_or(0))
            }
        }
    }

    #[must_use]
    pub fn retains_session(&self) -> bool {
        !matches!(self, Self::OnDisconnect)
    }

    /// Whether a session released at `disconnected_at` is gone by `now`.
    #[must_use]
    pub fn is_expired(&self, disconnected_at: Instant, now: Instant) -> bool {
        match self {
            Self::OnDisconnect => true,
            Self::Never => false,
            Self::After(ttl) => now.saturating_duration_since(disconnected_at) >= *ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v311_mapping() {
        let clean = ConnectOptions::new("c").with_protocol_version(ProtocolVersion::V311);
        assert_eq!(SessionExpiry::from_connect(&clean), SessionExpiry::OnDisconnect);

        let persistent = clean.with_clean_start(false);
        assert_eq!(SessionExpiry::from_connect(&persistent), SessionExpiry::Never);
    }

    #[test]
    fn test_v311_ignores_expiry_interval() {
        let options = ConnectOptions::new("c")
            .with_protocol_version(ProtocolVersion::V311)
            .with_clean_start(false)
            .with_session_expiry_interval(0);
        assert_eq!(SessionExpiry::from_connect(&options), SessionExpiry::Never);
    }

    #[test]
    fn test_v5_mapping() {
        let options = ConnectOptions::new("c").with_clean_start(false);
        assert_eq!(SessionExpiry::from_connect(&options), SessionExpiry::OnDisconnect);

        let options = options.with_session_expiry_interval(u32::MAX);
        assert_eq!(SessionExpiry::from_connect(&options), SessionExpiry::Never);

        let options = options.with_session_expiry_interval(30);
        assert_eq!(
            SessionExpiry::from_connect(&options),
            SessionExpiry::After(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_is_expired() {
        let start = Instant::now();
        let later = start + Duration::from_secs(10);

        assert!(SessionExpiry::OnDisconnect.is_expired(start, start));
        assert!(!SessionExpiry::Never.is_expired(start, later));

        let ttl = SessionExpiry::After(Duration::from_secs(10));
        assert!(!ttl.is_expired(start, start + Duration::from_secs(9)));
        assert!(ttl.is_expired(start, later));
        assert!(!ttl.is_expired(later, start));
    }
}
