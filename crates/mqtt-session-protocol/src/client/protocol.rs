use crate::error::{MqttError, Result};
use crate::packet::{
    set_dup_flag, ConnAckPacket, ConnectPacket, DisconnectPacket, MqttPacket, Packet, PacketType,
    PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket, PublishPacket, SubAckPacket,
    SubscribePacket, TopicFilter, UnsubAckPacket, UnsubscribePacket,
};
use crate::persist;
use crate::protocol::v5::properties::Properties;
use crate::qos::{self, QoSAction};
use crate::session::{PendingSubscribe, PendingUnsubscribe, Session, SessionExpiry};
use crate::store::{Direction, StoreEntry, StoreKey};
use crate::types::{ConnectOptions, Message, ProtocolVersion, QoS, ReasonCode};
use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::actions::{ClientEvent, ProtocolAction};
use super::options::ClientOptions;
use super::state::ClientState;

/// Sans-IO MQTT client.
///
/// Every input (an application request, a decoded packet, a lost
/// connection) returns the [`ProtocolAction`]s the driver must carry out in
/// order. Persistence actions always precede the frame whose delivery they
/// describe.
#[derive(Debug)]
pub struct ClientProtocol {
    session: Session,
    state: ClientState,
    options: ClientOptions,
    protocol_version: ProtocolVersion,
    keep_alive: u16,
    resume_requested: bool,
    advertised_max_packet_size: Option<u32>,
}

impl Default for ClientProtocol {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl ClientProtocol {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            session: Session::new(),
            state: ClientState::Disconnected,
            options,
            protocol_version: ProtocolVersion::V5,
            keep_alive: 0,
            resume_requested: false,
            advertised_max_packet_size: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    #[must_use]
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Keep-alive in seconds, after any server override.
    #[must_use]
    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Number of exchanges waiting for an acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.session.store().len()
    }

    /// Largest frame accepted from the server.
    #[must_use]
    pub fn max_incoming_packet_size(&self) -> Option<usize> {
        let advertised = self
            .advertised_max_packet_size
            .and_then(|size| usize::try_from(size).ok());
        match (self.options.max_incoming_packet_size, advertised) {
            (Some(configured), Some(advertised)) => Some(configured.min(advertised)),
            (configured, advertised) => configured.or(advertised),
        }
    }

    /// Starts a connection.
    ///
    /// With `clean_start` the retained session is purged first. Otherwise
    /// it is kept unless its expiry ran out since the last disconnect.
    ///
    /// # Errors
    /// Returns `AlreadyConnected` unless disconnected, or an encoding error.
    pub fn connect(
        &mut self,
        options: &ConnectOptions,
        now: Instant,
    ) -> Result<Vec<ProtocolAction>> {
        if !self.state.is_disconnected() {
            return Err(MqttError::AlreadyConnected);
        }

        let frame = ConnectPacket::from_options(options).to_bytes()?;
        let mut actions = Vec::new();

        if options.clean_start {
            self.purge_session(&mut actions);
        } else if self.session.has_expired(now) {
            info!(
                client_id = %options.client_id,
                "Retained session expired while disconnected"
            );
            self.purge_session(&mut actions);
        }

        self.protocol_version = options.protocol_version;
        self.keep_alive = options.keep_alive_secs();
        self.resume_requested = !options.clean_start;
        self.advertised_max_packet_size = match options.protocol_version {
            ProtocolVersion::V5 => options.properties.maximum_packet_size,
            ProtocolVersion::V311 => None,
        };
        self.session.set_expiry(SessionExpiry::from_connect(options));
        self.state = ClientState::Connecting;

        debug!(
            client_id = %options.client_id,
            clean_start = options.clean_start,
            version = ?options.protocol_version,
            pending = self.session.store().len(),
            "Sending CONNECT"
        );
        actions.push(ProtocolAction::Send(frame));
        Ok(actions)
    }

    /// Dispatches a decoded packet received from the server.
    #[must_use]
    pub fn handle_packet(&mut self, packet: &Packet) -> Vec<ProtocolAction> {
        if !self.is_connected() && !matches!(packet, Packet::ConnAck(_)) {
            let packet_type = packet.packet_type();
            return self.guarded(|_, _| {
                Err(MqttError::ProtocolError(format!(
                    "Received {packet_type:?} before CONNACK"
                )))
            });
        }

        match packet {
            Packet::ConnAck(p) => self.handle_connack(p),
            Packet::Publish(p) => self.handle_publish(p),
            Packet::PubAck(p) => self.handle_puback(p),
            Packet::PubRec(p) => self.handle_pubrec(p),
            Packet::PubRel(p) => self.handle_pubrel(p),
            Packet::PubComp(p) => self.handle_pubcomp(p),
            Packet::SubAck(p) => self.handle_suback(p),
            Packet::UnsubAck(p) => self.handle_unsuback(p),
            Packet::PingResp => self.handle_pingresp(),
            Packet::Disconnect(p) => self.handle_disconnect(p),
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq => {
                let packet_type = packet.packet_type();
                self.guarded(|_, _| {
                    Err(MqttError::ProtocolError(format!(
                        "Server sent client-only packet {packet_type:?}"
                    )))
                })
            }
        }
    }

    #[must_use]
    pub fn handle_connack(&mut self, packet: &ConnAckPacket) -> Vec<ProtocolAction> {
        self.guarded(|this, actions| this.on_connack(packet, actions))
    }

    fn on_connack(
        &mut self,
        packet: &ConnAckPacket,
        actions: &mut Vec<ProtocolAction>,
    ) -> Result<()> {
        if self.state != ClientState::Connecting {
            return Err(MqttError::ProtocolError(
                "Received CONNACK in unexpected state".to_string(),
            ));
        }

        if packet.reason_code.is_error() {
            warn!(reason = ?packet.reason_code, "Connection refused");
            self.state = ClientState::Disconnected;
            actions.push(ProtocolAction::emit(ClientEvent::Connack {
                session_present: false,
                reason_code: packet.reason_code,
            }));
            actions.push(ProtocolAction::error(MqttError::ConnectionRefused(
                packet.reason_code,
            )));
            actions.push(ProtocolAction::Close);
            return Ok(());
        }

        if self.protocol_version == ProtocolVersion::V5 {
            if let Some(interval) = packet.properties.session_expiry_interval() {
                self.session
                    .set_expiry(SessionExpiry::from_interval(interval));
            }
            if let Some(keep_alive) = packet.properties.server_keep_alive() {
                self.keep_alive = keep_alive;
            }
        }

        if !packet.session_present && !self.session.is_empty() {
            if self.resume_requested {
                info!(
                    pending = self.session.store().len(),
                    "Server holds no session; discarding local state"
                );
            }
            self.purge_session(actions);
        }

        self.state = ClientState::Connected {
            session_present: packet.session_present,
        };
        self.session.mark_connected();

        actions.push(ProtocolAction::emit(ClientEvent::Connack {
            session_present: packet.session_present,
            reason_code: packet.reason_code,
        }));
        if self.keep_alive > 0 {
            actions.push(ProtocolAction::ScheduleKeepalive {
                interval_secs: self.keep_alive,
            });
        }

        if packet.session_present {
            self.replay(actions)?;
        }
        Ok(())
    }

    /// Resends every outbound exchange in the order it was started.
    fn replay(&mut self, actions: &mut Vec<ProtocolAction>) -> Result<()> {
        for key in self.session.store().keys() {
            if key.direction == Direction::Inbound {
                continue;
            }
            let Some(entry) = self.session.store().get(key) else {
                continue;
            };
            let expected = entry.expected;
            let stored_version = entry.protocol_version;
            let mut frame = entry.packet.clone();

            if stored_version != self.protocol_version {
                frame = convert_frame(&frame, stored_version, self.protocol_version)?;
                let update = self
                    .session
                    .reencode(key, frame.clone(), self.protocol_version)?;
                actions.push(ProtocolAction::Persist(update));
            }

            if expected != PacketType::PubComp {
                frame = set_dup_flag(&frame)?;
            }
            debug!(packet_id = key.packet_id, ?expected, "Retransmitting");
            actions.push(ProtocolAction::Send(frame));
        }
        Ok(())
    }

    /// Publishes with an identifier from the allocator.
    ///
    /// Returns the identifier used (`None` for QoS 0) and the actions.
    ///
    /// # Errors
    /// Returns `NotConnected`, `PacketIdExhausted` or an encoding error; no
    /// state changes in that case.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(Option<u16>, Vec<ProtocolAction>)> {
        let packet = PublishPacket::new(topic, payload, qos).with_retain(retain);
        self.publish_packet(packet)
    }

    /// Publishes with a caller-chosen identifier.
    ///
    /// # Errors
    /// Returns `InvalidPacketId` for 0, `PacketIdInUse` for an identifier
    /// that is still held, and `InvalidState` for QoS 0.
    pub fn publish_with_id(
        &mut self,
        packet_id: u16,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Vec<ProtocolAction>> {
        if qos == QoS::AtMostOnce {
            return Err(MqttError::InvalidState(
                "QoS 0 messages carry no packet identifier".to_string(),
            ));
        }
        if packet_id == 0 {
            return Err(MqttError::InvalidPacketId);
        }
        let packet = PublishPacket::new(topic, payload, qos)
            .with_retain(retain)
            .with_packet_id(packet_id);
        self.publish_packet(packet).map(|(_, actions)| actions)
    }

    /// Publishes a fully built packet. A packet that already carries an
    /// identifier is treated as a manual-id publish.
    ///
    /// # Errors
    /// See [`Self::publish`] and [`Self::publish_with_id`].
    pub fn publish_packet(
        &mut self,
        mut packet: PublishPacket,
    ) -> Result<(Option<u16>, Vec<ProtocolAction>)> {
        self.ensure_connected()?;
        packet.protocol_version = self.protocol_version;
        packet.dup = false;

        if packet.qos == QoS::AtMostOnce {
            packet.packet_id = None;
            let frame = packet.to_bytes()?;
            return Ok((None, vec![ProtocolAction::Send(frame)]));
        }

        let packet_id = self.claim_packet_id(packet.packet_id)?;
        packet.packet_id = Some(packet_id);

        let expected = match packet.qos {
            QoS::ExactlyOnce => PacketType::PubRec,
            _ => PacketType::PubAck,
        };
        let tracked = packet.to_bytes().and_then(|frame| {
            let entry = StoreEntry::new(
                packet_id,
                Direction::Outbound,
                expected,
                packet.qos,
                frame.clone(),
                self.protocol_version,
            )?;
            let store = self.session.track(entry)?;
            Ok((frame, store))
        });

        match tracked {
            Ok((frame, store)) => {
                trace!(packet_id, qos = ?packet.qos, topic = %packet.topic_name, "Publishing");
                Ok((
                    Some(packet_id),
                    vec![ProtocolAction::Persist(store), ProtocolAction::Send(frame)],
                ))
            }
            Err(err) => {
                let _ = self.session.packet_ids_mut().release(packet_id);
                Err(err)
            }
        }
    }

    /// Forgets an outbound PUBLISH whose frame never reached the transport
    /// and frees its identifier. Exchanges that already moved on to PUBREL
    /// are left alone.
    #[must_use]
    pub fn abandon_publish(&mut self, packet_id: u16) -> Vec<ProtocolAction> {
        let key = StoreKey::outbound(packet_id);
        let unsent = self
            .session
            .store()
            .get(key)
            .is_some_and(|entry| entry.stored_packet_type() == PacketType::Publish);
        if !unsent {
            return Vec::new();
        }
        debug!(packet_id, "Dropping PUBLISH that was never written");
        self.session
            .complete(key)
            .map(ProtocolAction::Persist)
            .into_iter()
            .collect()
    }

    /// # Errors
    /// Returns `NotConnected`, `PacketIdExhausted` or an encoding error.
    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(u16, Vec<ProtocolAction>)> {
        self.subscribe_filters(vec![TopicFilter::new(filter, qos)], None)
    }

    /// # Errors
    /// Returns `InvalidPacketId` or `PacketIdInUse` for a bad identifier.
    pub fn subscribe_with_id(
        &mut self,
        packet_id: u16,
        filter: &str,
        qos: QoS,
    ) -> Result<Vec<ProtocolAction>> {
        if packet_id == 0 {
            return Err(MqttError::InvalidPacketId);
        }
        self.subscribe_filters(vec![TopicFilter::new(filter, qos)], Some(packet_id))
            .map(|(_, actions)| actions)
    }

    /// Subscribes to several filters with one SUBSCRIBE.
    ///
    /// # Errors
    /// Returns `InvalidState` for an empty filter list, or the errors of
    /// [`Self::subscribe`].
    pub fn subscribe_filters(
        &mut self,
        filters: Vec<TopicFilter>,
        packet_id: Option<u16>,
    ) -> Result<(u16, Vec<ProtocolAction>)> {
        self.ensure_connected()?;
        if filters.is_empty() {
            return Err(MqttError::InvalidState(
                "SUBSCRIBE needs at least one topic filter".to_string(),
            ));
        }

        let packet_id = self.claim_packet_id(packet_id)?;
        let pending = PendingSubscribe {
            topic_filters: filters.iter().map(|f| f.filter.clone()).collect(),
            qos_levels: filters.iter().map(|f| f.options.qos).collect(),
        };
        let mut packet = SubscribePacket::new(packet_id, self.protocol_version);
        packet.filters = filters;

        match packet.to_bytes() {
            Ok(frame) => {
                self.session.track_pending_suback(packet_id, pending);
                Ok((packet_id, vec![ProtocolAction::Send(frame)]))
            }
            Err(err) => {
                let _ = self.session.packet_ids_mut().release(packet_id);
                Err(err)
            }
        }
    }

    /// # Errors
    /// Returns `NotConnected`, `PacketIdExhausted` or an encoding error.
    pub fn unsubscribe(&mut self, filter: &str) -> Result<(u16, Vec<ProtocolAction>)> {
        self.start_unsubscribe(filter, None)
    }

    /// # Errors
    /// Returns `InvalidPacketId` or `PacketIdInUse` for a bad identifier.
    pub fn unsubscribe_with_id(
        &mut self,
        packet_id: u16,
        filter: &str,
    ) -> Result<Vec<ProtocolAction>> {
        if packet_id == 0 {
            return Err(MqttError::InvalidPacketId);
        }
        self.start_unsubscribe(filter, Some(packet_id))
            .map(|(_, actions)| actions)
    }

    fn start_unsubscribe(
        &mut self,
        filter: &str,
        packet_id: Option<u16>,
    ) -> Result<(u16, Vec<ProtocolAction>)> {
        self.ensure_connected()?;
        let packet_id = self.claim_packet_id(packet_id)?;
        let packet = UnsubscribePacket::new(packet_id, self.protocol_version).add_filter(filter);

        match packet.to_bytes() {
            Ok(frame) => {
                self.session.track_pending_unsuback(
                    packet_id,
                    PendingUnsubscribe {
                        topic_filters: vec![filter.to_string()],
                    },
                );
                Ok((packet_id, vec![ProtocolAction::Send(frame)]))
            }
            Err(err) => {
                let _ = self.session.packet_ids_mut().release(packet_id);
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn handle_publish(&mut self, packet: &PublishPacket) -> Vec<ProtocolAction> {
        self.guarded(|this, actions| {
            let inbound = match (packet.qos, packet.packet_id) {
                (QoS::ExactlyOnce, Some(id)) => {
                    this.session.store().expected(StoreKey::inbound(id))
                }
                _ => None,
            };
            if inbound.is_some() {
                debug!(
                    packet_id = ?packet.packet_id,
                    "Duplicate QoS 2 PUBLISH not delivered again"
                );
            }
            let steps = qos::handle_incoming_publish(
                packet.packet_id,
                packet.qos,
                inbound,
                this.options.auto_ack,
            );
            this.apply(steps, Some(packet), actions)
        })
    }

    #[must_use]
    pub fn handle_puback(&mut self, packet: &PubAckPacket) -> Vec<ProtocolAction> {
        self.guarded(|this, actions| {
            let awaiting = this
                .session
                .store()
                .expected(StoreKey::outbound(packet.packet_id));
            let steps = qos::handle_incoming_puback(packet.packet_id, packet.reason_code, awaiting);
            this.apply(steps, None, actions)?;
            if awaiting == Some(PacketType::PubAck) {
                actions.push(ProtocolAction::emit(ClientEvent::Puback {
                    packet_id: packet.packet_id,
                    reason_code: packet.reason_code,
                }));
            }
            Ok(())
        })
    }

    #[must_use]
    pub fn handle_pubrec(&mut self, packet: &PubRecPacket) -> Vec<ProtocolAction> {
        self.guarded(|this, actions| {
            let awaiting = this
                .session
                .store()
                .expected(StoreKey::outbound(packet.packet_id));
            let steps = qos::handle_incoming_pubrec(
                packet.packet_id,
                packet.reason_code,
                awaiting,
                this.options.auto_ack,
            );
            this.apply(steps, None, actions)?;
            if awaiting == Some(PacketType::PubRec) {
                actions.push(ProtocolAction::emit(ClientEvent::Pubrec {
                    packet_id: packet.packet_id,
                    reason_code: packet.reason_code,
                }));
            }
            Ok(())
        })
    }

    #[must_use]
    pub fn handle_pubcomp(&mut self, packet: &PubCompPacket) -> Vec<ProtocolAction> {
        self.guarded(|this, actions| {
            let awaiting = this
                .session
                .store()
                .expected(StoreKey::outbound(packet.packet_id));
            let steps =
                qos::handle_incoming_pubcomp(packet.packet_id, packet.reason_code, awaiting);
            this.apply(steps, None, actions)?;
            if awaiting == Some(PacketType::PubComp) {
                actions.push(ProtocolAction::emit(ClientEvent::Pubcomp {
                    packet_id: packet.packet_id,
                    reason_code: packet.reason_code,
                }));
            }
            Ok(())
        })
    }

    #[must_use]
    pub fn handle_pubrel(&mut self, packet: &PubRelPacket) -> Vec<ProtocolAction> {
        self.guarded(|this, actions| {
            let awaiting = this
                .session
                .store()
                .expected(StoreKey::inbound(packet.packet_id));
            let steps =
                qos::handle_incoming_pubrel(packet.packet_id, awaiting, this.options.auto_ack);
            this.apply(steps, None, actions)?;
            actions.push(ProtocolAction::emit(ClientEvent::Pubrel {
                packet_id: packet.packet_id,
                reason_code: packet.reason_code,
            }));
            Ok(())
        })
    }

    #[must_use]
    pub fn handle_suback(&mut self, packet: &SubAckPacket) -> Vec<ProtocolAction> {
        let mut actions = Vec::new();
        let Some(pending) = self.session.complete_pending_suback(packet.packet_id) else {
            warn!(
                packet_id = packet.packet_id,
                packet_type = ?PacketType::SubAck,
                "Ignoring unsolicited acknowledgment"
            );
            return actions;
        };
        if pending.topic_filters.len() != packet.reason_codes.len() {
            warn!(
                packet_id = packet.packet_id,
                filters = pending.topic_filters.len(),
                reason_codes = packet.reason_codes.len(),
                "SUBACK reason code count does not match SUBSCRIBE"
            );
        }
        actions.push(ProtocolAction::emit(ClientEvent::Suback {
            packet_id: packet.packet_id,
            reason_codes: packet.reason_codes.clone(),
        }));
        actions
    }

    #[must_use]
    pub fn handle_unsuback(&mut self, packet: &UnsubAckPacket) -> Vec<ProtocolAction> {
        let mut actions = Vec::new();
        if self
            .session
            .complete_pending_unsuback(packet.packet_id)
            .is_none()
        {
            warn!(
                packet_id = packet.packet_id,
                packet_type = ?PacketType::UnsubAck,
                "Ignoring unsolicited acknowledgment"
            );
            return actions;
        }
        actions.push(ProtocolAction::emit(ClientEvent::Unsuback {
            packet_id: packet.packet_id,
            reason_codes: packet.reason_codes.clone(),
        }));
        actions
    }

    /// # Errors
    /// Returns `NotConnected` or an encoding error.
    pub fn send_puback(
        &mut self,
        packet_id: u16,
        reason_code: ReasonCode,
    ) -> Result<Vec<ProtocolAction>> {
        self.ensure_connected()?;
        let frame = ack_frame(
            self.protocol_version,
            PubAckPacket::new_with_reason(packet_id, reason_code),
            PubAckPacket::into_v311,
        )?;
        Ok(vec![ProtocolAction::Send(frame)])
    }

    /// Acknowledges an inbound QoS 2 PUBLISH and tracks it until PUBREL.
    /// An error reason code ends the exchange instead. Until this is called
    /// a retransmitted PUBLISH with the same identifier is delivered again.
    ///
    /// # Errors
    /// Returns `NotConnected` or an encoding error.
    pub fn send_pubrec(
        &mut self,
        packet_id: u16,
        reason_code: ReasonCode,
    ) -> Result<Vec<ProtocolAction>> {
        self.ensure_connected()?;
        let mut actions = Vec::new();
        if self.session.store().contains(StoreKey::inbound(packet_id)) {
            self.resend(StoreKey::inbound(packet_id), &mut actions)?;
        } else if reason_code.is_error() {
            let frame = ack_frame(
                self.protocol_version,
                PubRecPacket::new_with_reason(packet_id, reason_code),
                PubRecPacket::into_v311,
            )?;
            actions.push(ProtocolAction::Send(frame));
        } else {
            self.track_inbound(packet_id, reason_code, &mut actions)?;
        }
        Ok(actions)
    }

    /// # Errors
    /// Returns `PacketIdNotFound` if no outbound QoS 2 exchange uses
    /// `packet_id`, or `InvalidState` for a QoS 1 exchange.
    pub fn send_pubrel(
        &mut self,
        packet_id: u16,
        reason_code: ReasonCode,
    ) -> Result<Vec<ProtocolAction>> {
        self.ensure_connected()?;
        let mut actions = Vec::new();
        match self.session.store().expected(StoreKey::outbound(packet_id)) {
            Some(PacketType::PubRec) => {
                self.release_outbound(packet_id, reason_code, &mut actions)?;
            }
            Some(PacketType::PubComp) => self.resend(StoreKey::outbound(packet_id), &mut actions)?,
            Some(expected) => {
                return Err(MqttError::InvalidState(format!(
                    "Packet {packet_id} is waiting for {expected:?}, not PUBREC"
                )))
            }
            None => return Err(MqttError::PacketIdNotFound(packet_id)),
        }
        Ok(actions)
    }

    /// Completes an inbound QoS 2 exchange. Sending PUBCOMP for an
    /// identifier that is not tracked is allowed.
    ///
    /// # Errors
    /// Returns `NotConnected` or an encoding error.
    pub fn send_pubcomp(
        &mut self,
        packet_id: u16,
        reason_code: ReasonCode,
    ) -> Result<Vec<ProtocolAction>> {
        self.ensure_connected()?;
        let frame = ack_frame(
            self.protocol_version,
            PubCompPacket::new_with_reason(packet_id, reason_code),
            PubCompPacket::into_v311,
        )?;
        let mut actions = Vec::new();
        if let Some(erase) = self.session.complete(StoreKey::inbound(packet_id)) {
            actions.push(ProtocolAction::Persist(erase));
        }
        actions.push(ProtocolAction::Send(frame));
        Ok(actions)
    }

    #[must_use]
    pub fn ping(&mut self) -> Vec<ProtocolAction> {
        if !self.is_connected() {
            return Vec::new();
        }
        match Packet::PingReq.to_bytes() {
            Ok(frame) => vec![ProtocolAction::Send(frame)],
            Err(err) => vec![ProtocolAction::error(err), ProtocolAction::Close],
        }
    }

    #[must_use]
    pub fn handle_pingresp(&mut self) -> Vec<ProtocolAction> {
        trace!("PINGRESP received");
        Vec::new()
    }

    /// Server-initiated DISCONNECT (v5.0). The session is kept as for any
    /// lost connection.
    #[must_use]
    pub fn handle_disconnect(&mut self, packet: &DisconnectPacket) -> Vec<ProtocolAction> {
        info!(reason = ?packet.reason_code, "Server sent DISCONNECT");
        let mut actions = Vec::new();
        if packet.reason_code.is_error() {
            actions.push(ProtocolAction::error(MqttError::ConnectionError(format!(
                "Server disconnected: {:?}",
                packet.reason_code
            ))));
        }
        actions.push(ProtocolAction::Close);
        actions
    }

    /// Sends DISCONNECT. The session survives only if its expiry policy
    /// retains it.
    ///
    /// # Errors
    /// Returns `NotConnected` unless connected.
    pub fn disconnect(&mut self, now: Instant) -> Result<Vec<ProtocolAction>> {
        self.ensure_connected()?;
        let frame = DisconnectPacket::new(self.protocol_version).to_bytes()?;
        let mut actions = vec![ProtocolAction::Send(frame)];

        self.state = ClientState::Disconnected;
        self.session.release_pending_requests();
        if self.session.expiry().retains_session() {
            self.session.mark_disconnected(now);
        } else {
            self.purge_session(&mut actions);
        }
        debug!(
            retained = self.session.store().len(),
            "Disconnected gracefully"
        );

        actions.push(ProtocolAction::emit(ClientEvent::Close));
        actions.push(ProtocolAction::Close);
        Ok(actions)
    }

    /// Reports that the transport went away without DISCONNECT. The session
    /// is always kept; the next `connect` decides its fate.
    #[must_use]
    pub fn connection_lost(&mut self, now: Instant) -> Vec<ProtocolAction> {
        if self.state.is_disconnected() {
            return Vec::new();
        }
        self.state = ClientState::Disconnected;
        self.session.release_pending_requests();
        self.session.mark_disconnected(now);
        debug!(retained = self.session.store().len(), "Connection lost");
        vec![ProtocolAction::emit(ClientEvent::Close)]
    }

    /// Reinserts an entry produced by [`persist::serialize`]. Only allowed
    /// while disconnected; connect with `clean_start = false` afterwards to
    /// resend it.
    ///
    /// # Errors
    /// Returns `InvalidState` while connected, `CorruptSessionState` for
    /// bad data and `PacketIdInUse` for an identifier already tracked.
    pub fn restore_serialized(&mut self, packet_id: u16, data: &[u8]) -> Result<()> {
        if !self.state.is_disconnected() {
            return Err(MqttError::InvalidState(
                "Session entries can only be restored while disconnected".to_string(),
            ));
        }
        let entry = persist::restore(packet_id, data)?;
        self.session.restore(entry)
    }

    fn guarded<F>(&mut self, f: F) -> Vec<ProtocolAction>
    where
        F: FnOnce(&mut Self, &mut Vec<ProtocolAction>) -> Result<()>,
    {
        let mut actions = Vec::new();
        if let Err(err) = f(self, &mut actions) {
            warn!(error = %err, "Closing connection");
            actions.push(ProtocolAction::error(err));
            actions.push(ProtocolAction::Close);
        }
        actions
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }

    fn claim_packet_id(&mut self, requested: Option<u16>) -> Result<u16> {
        let packet_ids = self.session.packet_ids_mut();
        match requested {
            Some(id) => {
                packet_ids.acquire_specific(id)?;
                Ok(id)
            }
            None => packet_ids.acquire(),
        }
    }

    fn purge_session(&mut self, actions: &mut Vec<ProtocolAction>) {
        actions.extend(
            self.session
                .purge()
                .into_iter()
                .map(ProtocolAction::Persist),
        );
    }

    fn resend(&self, key: StoreKey, actions: &mut Vec<ProtocolAction>) -> Result<()> {
        let entry = self
            .session
            .store()
            .get(key)
            .ok_or(MqttError::PacketIdNotFound(key.packet_id))?;
        debug!(packet_id = key.packet_id, direction = ?key.direction, "Resending acknowledgment");
        actions.push(ProtocolAction::Send(entry.packet.clone()));
        Ok(())
    }

    fn track_inbound(
        &mut self,
        packet_id: u16,
        reason_code: ReasonCode,
        actions: &mut Vec<ProtocolAction>,
    ) -> Result<()> {
        let frame = ack_frame(
            self.protocol_version,
            PubRecPacket::new_with_reason(packet_id, reason_code),
            PubRecPacket::into_v311,
        )?;
        let entry = StoreEntry::new(
            packet_id,
            Direction::Inbound,
            PacketType::PubRel,
            QoS::ExactlyOnce,
            frame.clone(),
            self.protocol_version,
        )?;
        actions.push(ProtocolAction::Persist(self.session.track(entry)?));
        actions.push(ProtocolAction::Send(frame));
        Ok(())
    }

    fn release_outbound(
        &mut self,
        packet_id: u16,
        reason_code: ReasonCode,
        actions: &mut Vec<ProtocolAction>,
    ) -> Result<()> {
        let frame = ack_frame(
            self.protocol_version,
            PubRelPacket::new_with_reason(packet_id, reason_code),
            PubRelPacket::into_v311,
        )?;
        let key = StoreKey::outbound(packet_id);
        let update = self.session.advance(key, PacketType::PubComp, frame.clone())?;
        actions.push(ProtocolAction::Persist(update));
        actions.push(ProtocolAction::Send(frame));
        Ok(())
    }

    fn apply(
        &mut self,
        steps: Vec<QoSAction>,
        publish: Option<&PublishPacket>,
        actions: &mut Vec<ProtocolAction>,
    ) -> Result<()> {
        for step in steps {
            match step {
                QoSAction::DeliverMessage { .. } => {
                    if let Some(packet) = publish {
                        actions.push(ProtocolAction::emit(ClientEvent::Publish(Message::from(
                            packet.clone(),
                        ))));
                    }
                }
                QoSAction::SendPubAck { packet_id } => {
                    let frame = ack_frame(
                        self.protocol_version,
                        PubAckPacket::new(packet_id),
                        PubAckPacket::into_v311,
                    )?;
                    actions.push(ProtocolAction::Send(frame));
                }
                QoSAction::SendPubRec { packet_id } => {
                    self.track_inbound(packet_id, ReasonCode::Success, actions)?;
                }
                QoSAction::ResendPubRec { packet_id } => {
                    self.resend(StoreKey::inbound(packet_id), actions)?;
                }
                QoSAction::SendPubRel { packet_id } => {
                    self.release_outbound(packet_id, ReasonCode::Success, actions)?;
                }
                QoSAction::ResendPubRel { packet_id } => {
                    self.resend(StoreKey::outbound(packet_id), actions)?;
                }
                QoSAction::SendPubComp {
                    packet_id,
                    reason_code,
                } => {
                    let frame = ack_frame(
                        self.protocol_version,
                        PubCompPacket::new_with_reason(packet_id, reason_code),
                        PubCompPacket::into_v311,
                    )?;
                    actions.push(ProtocolAction::Send(frame));
                }
                QoSAction::CompleteFlow {
                    packet_id,
                    direction,
                    reason_code,
                } => {
                    if let Some(erase) = self.session.complete(StoreKey {
                        packet_id,
                        direction,
                    }) {
                        actions.push(ProtocolAction::Persist(erase));
                    }
                    trace!(packet_id, ?direction, ?reason_code, "Exchange complete");
                }
                QoSAction::Unsolicited {
                    packet_id,
                    received,
                } => {
                    warn!(
                        packet_id,
                        packet_type = ?received,
                        "Ignoring unsolicited acknowledgment"
                    );
                }
                QoSAction::OutOfOrder {
                    packet_id,
                    expected,
                    received,
                } => {
                    return Err(MqttError::OutOfOrderAcknowledgment {
                        packet_id,
                        expected,
                        received,
                    });
                }
            }
        }
        Ok(())
    }
}

fn ack_frame<P: MqttPacket>(
    protocol_version: ProtocolVersion,
    packet: P,
    into_v311: fn(P) -> P,
) -> Result<Bytes> {
    match protocol_version {
        ProtocolVersion::V311 => into_v311(packet).to_bytes(),
        ProtocolVersion::V5 => packet.to_bytes(),
    }
}

/// Re-encodes a retained frame for a connection that negotiated another
/// protocol version.
fn convert_frame(frame: &[u8], from: ProtocolVersion, to: ProtocolVersion) -> Result<Bytes> {
    match Packet::decode_frame(frame, from)? {
        Packet::Publish(mut publish) => {
            publish.protocol_version = to;
            if to == ProtocolVersion::V311 {
                publish.properties = Properties::default();
            }
            publish.to_bytes()
        }
        Packet::PubRel(pubrel) => ack_frame(to, pubrel, PubRelPacket::into_v311),
        Packet::PubRec(pubrec) => ack_frame(to, pubrec, PubRecPacket::into_v311),
        other => Err(MqttError::CorruptSessionState(format!(
            "Unexpected {:?} frame in session store",
            other.packet_type()
        ))),
    }
}
