use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// PINGREQ after this share of the keep-alive interval without traffic
    pub ping_interval_percent: u8,
    /// Give up on a PINGRESP after this share of the interval
    pub timeout_percent: u8,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_percent: 75,
            timeout_percent: 150,
        }
    }
}

impl KeepaliveConfig {
    #[must_use]
    pub const fn new(ping_interval_percent: u8, timeout_percent: u8) -> Self {
        Self {
            ping_interval_percent,
            timeout_percent,
        }
    }

    #[must_use]
    pub const fn conservative() -> Self {
        Self {
            ping_interval_percent: 50,
            timeout_percent: 150,
        }
    }

    #[must_use]
    pub fn ping_interval(&self, keepalive: Duration) -> Duration {
        scale(keepalive, self.ping_interval_percent)
    }

    #[must_use]
    pub fn timeout_duration(&self, keepalive: Duration) -> Duration {
        scale(keepalive, self.timeout_percent)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn scale(keepalive: Duration, percent: u8) -> Duration {
    let millis = keepalive.as_millis() as u64;
    Duration::from_millis(millis * u64::from(percent) / 100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveStep {
    Idle,
    SendPing,
    TimedOut,
}

/// Tracks outbound traffic and the outstanding PINGREQ of one connection.
#[derive(Debug, Clone)]
pub struct KeepaliveState {
    config: KeepaliveConfig,
    keepalive: Duration,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepaliveState {
    #[must_use]
    pub fn new(config: KeepaliveConfig, keepalive: Duration, now: Instant) -> Self {
        Self {
            config,
            keepalive,
            last_sent: now,
            ping_sent_at: None,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.keepalive.is_zero()
    }

    pub fn on_packet_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.ping_sent_at = Some(now);
    }

    pub fn on_pingresp(&mut self) {
        self.ping_sent_at = None;
    }

    /// When [`Self::poll`] next has something to report.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }
        Some(match self.ping_sent_at {
            Some(sent) => sent + self.config.timeout_duration(self.keepalive),
            None => self.last_sent + self.config.ping_interval(self.keepalive),
        })
    }

    #[must_use]
    pub fn poll(&self, now: Instant) -> KeepaliveStep {
        match self.next_deadline() {
            Some(deadline) if now >= deadline => {
                if self.ping_sent_at.is_some() {
                    KeepaliveStep::TimedOut
                } else {
                    KeepaliveStep::SendPing
                }
            }
            _ => KeepaliveStep::Idle,
        }
    }
}
