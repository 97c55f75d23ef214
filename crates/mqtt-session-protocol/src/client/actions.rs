use crate::error::MqttError;
use crate::persist::PersistAction;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::types::Message;
use bytes::Bytes;

/// Everything the application can observe from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connack {
        session_present: bool,
        reason_code: ReasonCode,
    },
    Puback {
        packet_id: u16,
        reason_code: ReasonCode,
    },
    Pubrec {
        packet_id: u16,
        reason_code: ReasonCode,
    },
    Pubrel {
        packet_id: u16,
        reason_code: ReasonCode,
    },
    Pubcomp {
        packet_id: u16,
        reason_code: ReasonCode,
    },
    Suback {
        packet_id: u16,
        reason_codes: Vec<ReasonCode>,
    },
    Unsuback {
        packet_id: u16,
        reason_codes: Vec<ReasonCode>,
    },
    Publish(Message),
    Close,
    Error(MqttError),
}

impl ClientEvent {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Receives every [`ClientEvent`]. Returning `false` tears the connection
/// down.
pub trait EventHandler {
    fn on_event(&mut self, event: &ClientEvent) -> bool;
}

impl<F> EventHandler for F
where
    F: FnMut(&ClientEvent) -> bool,
{
    fn on_event(&mut self, event: &ClientEvent) -> bool {
        self(event)
    }
}

/// A step the driver of a [`super::ClientProtocol`] has to carry out, in
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolAction {
    /// Write an encoded frame to the transport
    Send(Bytes),
    Emit(ClientEvent),
    Persist(PersistAction),
    ScheduleKeepalive {
        interval_secs: u16,
    },
    /// Close the transport, then report `connection_lost`
    Close,
}

impl ProtocolAction {
    #[must_use]
    pub fn emit(event: ClientEvent) -> Self {
        Self::Emit(event)
    }

    #[must_use]
    pub fn error(err: MqttError) -> Self {
        Self::Emit(ClientEvent::Error(err))
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Emit(ClientEvent::Error(_)))
    }

    #[must_use]
    pub fn is_send(&self) -> bool {
        matches!(self, Self::Send(_))
    }

    #[must_use]
    pub fn as_frame(&self) -> Option<&Bytes> {
        match self {
            Self::Send(frame) => Some(frame),
            _ => None,
        }
    }
}
