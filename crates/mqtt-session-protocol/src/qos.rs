//! QoS 1 and QoS 2 acknowledgment transitions.
//!
//! Each handler looks only at the awaited packet type of the matching store
//! entry (if any) and returns the steps the caller has to carry out. The
//! handlers never touch the store themselves.

use crate::packet::PacketType;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::store::Direction;
use crate::types::QoS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoSAction {
    DeliverMessage {
        packet_id: Option<u16>,
    },
    SendPubAck {
        packet_id: u16,
    },
    /// Send a PUBREC and track the inbound exchange until PUBREL
    SendPubRec {
        packet_id: u16,
    },
    /// Retransmit the PUBREC retained for an inbound exchange
    ResendPubRec {
        packet_id: u16,
    },
    /// Send a PUBREL and move the outbound entry to awaiting PUBCOMP
    SendPubRel {
        packet_id: u16,
    },
    /// Retransmit the PUBREL retained for an outbound exchange
    ResendPubRel {
        packet_id: u16,
    },
    SendPubComp {
        packet_id: u16,
        reason_code: ReasonCode,
    },
    /// Remove the entry; outbound identifiers go back to the allocator
    CompleteFlow {
        packet_id: u16,
        direction: Direction,
        reason_code: ReasonCode,
    },
    Unsolicited {
        packet_id: u16,
        received: PacketType,
    },
    OutOfOrder {
        packet_id: u16,
        expected: PacketType,
        received: PacketType,
    },
}

fn unsolicited(packet_id: u16, received: PacketType) -> Vec<QoSAction> {
    vec![QoSAction::Unsolicited {
        packet_id,
        received,
    }]
}

fn out_of_order(packet_id: u16, expected: PacketType, received: PacketType) -> Vec<QoSAction> {
    vec![QoSAction::OutOfOrder {
        packet_id,
        expected,
        received,
    }]
}

#[must_use]
pub fn handle_incoming_puback(
    packet_id: u16,
    reason_code: ReasonCode,
    awaiting: Option<PacketType>,
) -> Vec<QoSAction> {
    match awaiting {
        None => unsolicited(packet_id, PacketType::PubAck),
        Some(PacketType::PubAck) => vec![QoSAction::CompleteFlow {
            packet_id,
            direction: Direction::Outbound,
            reason_code,
        }],
        Some(expected) => out_of_order(packet_id, expected, PacketType::PubAck),
    }
}

#[must_use]
pub fn handle_incoming_pubrec(
    packet_id: u16,
    reason_code: ReasonCode,
    awaiting: Option<PacketType>,
    auto_ack: bool,
) -> Vec<QoSAction> {
    match awaiting {
        None => unsolicited(packet_id, PacketType::PubRec),
        Some(PacketType::PubRec) if reason_code.is_error() => vec![QoSAction::CompleteFlow {
            packet_id,
            direction: Direction::Outbound,
            reason_code,
        }],
        Some(PacketType::PubRec) if auto_ack => vec![QoSAction::SendPubRel { packet_id }],
        Some(PacketType::PubRec) => vec![],
        // PUBREL already sent; the peer did not see it
        Some(PacketType::PubComp) => vec![QoSAction::ResendPubRel { packet_id }],
        Some(expected) => out_of_order(packet_id, expected, PacketType::PubRec),
    }
}

#[must_use]
pub fn handle_incoming_pubcomp(
    packet_id: u16,
    reason_code: ReasonCode,
    awaiting: Option<PacketType>,
) -> Vec<QoSAction> {
    match awaiting {
        None => unsolicited(packet_id, PacketType::PubComp),
        Some(PacketType::PubComp) => vec![QoSAction::CompleteFlow {
            packet_id,
            direction: Direction::Outbound,
            reason_code,
        }],
        Some(expected) => out_of_order(packet_id, expected, PacketType::PubComp),
    }
}

/// `inbound_awaiting` is the awaited type of the inbound entry for the
/// PUBLISH's identifier, present only for a QoS 2 exchange already underway.
///
/// Without `auto_ack` the entry only appears once the application sends
/// PUBREC, so a duplicate arriving before that is delivered again.
#[must_use]
pub fn handle_incoming_publish(
    packet_id: Option<u16>,
    qos: QoS,
    inbound_awaiting: Option<PacketType>,
    auto_ack: bool,
) -> Vec<QoSAction> {
    match (qos, packet_id) {
        (QoS::AtMostOnce, _) | (_, None) => vec![QoSAction::DeliverMessage { packet_id: None }],
        (QoS::AtLeastOnce, Some(id)) => {
            let mut actions = vec![QoSAction::DeliverMessage {
                packet_id: Some(id),
            }];
            if auto_ack {
                actions.push(QoSAction::SendPubAck { packet_id: id });
            }
            actions
        }
        (QoS::ExactlyOnce, Some(id)) => {
            if inbound_awaiting.is_some() {
                return vec![QoSAction::ResendPubRec { packet_id: id }];
            }
            let mut actions = vec![QoSAction::DeliverMessage {
                packet_id: Some(id),
            }];
            if auto_ack {
                actions.push(QoSAction::SendPubRec { packet_id: id });
            }
            actions
        }
    }
}

/// A PUBREL with no inbound entry is still answered: the exchange finished
/// earlier and only the PUBCOMP was lost.
#[must_use]
pub fn handle_incoming_pubrel(
    packet_id: u16,
    inbound_awaiting: Option<PacketType>,
    auto_ack: bool,
) -> Vec<QoSAction> {
    if !auto_ack {
        return vec![];
    }
    match inbound_awaiting {
        Some(PacketType::PubRel) => vec![
            QoSAction::CompleteFlow {
                packet_id,
                direction: Direction::Inbound,
                reason_code: ReasonCode::Success,
            },
            QoSAction::SendPubComp {
                packet_id,
                reason_code: ReasonCode::Success,
            },
        ],
        Some(expected) => out_of_order(packet_id, expected, PacketType::PubRel),
        None => vec![QoSAction::SendPubComp {
            packet_id,
            reason_code: ReasonCode::PacketIdentifierNotFound,
        }],
    }
}
