//! Async driver for [`ClientProtocol`].
//!
//! [`MqttClient`] owns a [`Transport`] and carries out the actions produced
//! by the protocol core: frames are written, events queued for
//! [`MqttClient::poll`], store changes forwarded to the configured
//! [`SessionPersistence`], and keep-alive pings sent while waiting for input.

use bytes::{Bytes, BytesMut};
use mqtt_session_protocol::packet::PublishPacket;
use mqtt_session_protocol::{
    ClientEvent, ClientOptions, ClientProtocol, ConnectOptions, ConnectResult, EventHandler,
    KeepaliveState, KeepaliveStep, MqttError, Packet, PersistAction, ProtocolAction, QoS,
    ReasonCode, Result, SessionPersistence, Transport,
};
use std::collections::VecDeque;
use std::future::pending;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const READ_CHUNK_SIZE: usize = 4096;

/// Current time on the tokio clock, so paused test time drives keep-alive.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => pending::<()>().await,
    }
}

enum Wake {
    Read(Result<usize>),
    Keepalive,
}

pub struct MqttClient<T: Transport> {
    transport: T,
    protocol: ClientProtocol,
    persistence: Option<Box<dyn SessionPersistence>>,
    read_buf: BytesMut,
    keepalive: Option<KeepaliveState>,
    events: VecDeque<ClientEvent>,
}

impl<T: Transport> MqttClient<T> {
    #[must_use]
    pub fn new(transport: T, options: ClientOptions) -> Self {
        Self {
            transport,
            protocol: ClientProtocol::new(options),
            persistence: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            keepalive: None,
            events: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &ClientProtocol {
        &self.protocol
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.protocol.is_connected()
    }

    /// Number of QoS 1/2 exchanges still waiting for an acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.protocol.pending_count()
    }

    /// Forwards every future store change to `persistence`.
    pub fn set_persistence(&mut self, persistence: Box<dyn SessionPersistence>) {
        self.persistence = Some(persistence);
    }

    /// Reloads an entry saved through [`SessionPersistence`] before the
    /// first `connect`.
    ///
    /// # Errors
    /// See [`ClientProtocol::restore_serialized`].
    pub fn restore_serialized(&mut self, packet_id: u16, data: &[u8]) -> Result<()> {
        self.protocol.restore_serialized(packet_id, data)
    }

    /// Opens the transport, sends CONNECT and waits for CONNACK. Exchanges
    /// kept from an earlier connection are resent before this returns.
    ///
    /// # Errors
    /// Returns `ConnectionRefused` for a CONNACK error code, or any
    /// transport or protocol error.
    pub async fn connect(&mut self, options: &ConnectOptions) -> Result<ConnectResult> {
        if !self.protocol.state().is_disconnected() {
            return Err(MqttError::AlreadyConnected);
        }
        self.read_buf.clear();
        self.transport.connect().await?;

        let actions = self.protocol.connect(options, now())?;
        self.execute(actions).await?;

        loop {
            let packet = self.read_packet().await?;
            let connack = match &packet {
                Packet::ConnAck(connack) => Some((connack.session_present, connack.reason_code)),
                _ => None,
            };
            let actions = self.protocol.handle_packet(&packet);
            self.execute(actions).await?;

            if let Some((session_present, reason_code)) = connack {
                if self.protocol.is_connected() {
                    debug!(
                        session_present,
                        pending = self.protocol.pending_count(),
                        "Connected"
                    );
                    return Ok(ConnectResult {
                        session_present,
                        reason_code,
                    });
                }
                return Err(MqttError::ConnectionRefused(reason_code));
            }
            if self.protocol.state().is_disconnected() {
                return Err(MqttError::ConnectionError(
                    "Connection closed before CONNACK".to_string(),
                ));
            }
        }
    }

    /// Returns the identifier used, or `None` for QoS 0.
    ///
    /// # Errors
    /// See [`ClientProtocol::publish`]. When the frame cannot be written the
    /// exchange is dropped again and nothing is retransmitted later.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let (packet_id, actions) = self.protocol.publish(topic, payload, qos, retain)?;
        self.send_publish(packet_id, actions).await?;
        Ok(packet_id)
    }

    /// # Errors
    /// See [`ClientProtocol::publish_with_id`].
    pub async fn publish_with_id(
        &mut self,
        packet_id: u16,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let actions = self
            .protocol
            .publish_with_id(packet_id, topic, payload, qos, retain)?;
        self.send_publish(Some(packet_id), actions).await
    }

    /// Publishes a prepared packet, keeping its v5 properties. An identifier
    /// already set on the packet is used as is.
    ///
    /// # Errors
    /// See [`ClientProtocol::publish_packet`].
    pub async fn publish_packet(&mut self, packet: PublishPacket) -> Result<Option<u16>> {
        let (packet_id, actions) = self.protocol.publish_packet(packet)?;
        self.send_publish(packet_id, actions).await?;
        Ok(packet_id)
    }

    /// # Errors
    /// See [`ClientProtocol::subscribe`].
    pub async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16> {
        let (packet_id, actions) = self.protocol.subscribe(filter, qos)?;
        self.execute(actions).await?;
        Ok(packet_id)
    }

    /// # Errors
    /// See [`ClientProtocol::subscribe_with_id`].
    pub async fn subscribe_with_id(
        &mut self,
        packet_id: u16,
        filter: &str,
        qos: QoS,
    ) -> Result<()> {
        let actions = self.protocol.subscribe_with_id(packet_id, filter, qos)?;
        self.execute(actions).await
    }

    /// # Errors
    /// See [`ClientProtocol::unsubscribe`].
    pub async fn unsubscribe(&mut self, filter: &str) -> Result<u16> {
        let (packet_id, actions) = self.protocol.unsubscribe(filter)?;
        self.execute(actions).await?;
        Ok(packet_id)
    }

    /// # Errors
    /// See [`ClientProtocol::unsubscribe_with_id`].
    pub async fn unsubscribe_with_id(&mut self, packet_id: u16, filter: &str) -> Result<()> {
        let actions = self.protocol.unsubscribe_with_id(packet_id, filter)?;
        self.execute(actions).await
    }

    /// # Errors
    /// Returns `NotConnected` or a transport error.
    pub async fn send_puback(&mut self, packet_id: u16, reason_code: ReasonCode) -> Result<()> {
        let actions = self.protocol.send_puback(packet_id, reason_code)?;
        self.execute(actions).await
    }

    /// # Errors
    /// Returns `NotConnected` or a transport error.
    pub async fn send_pubrec(&mut self, packet_id: u16, reason_code: ReasonCode) -> Result<()> {
        let actions = self.protocol.send_pubrec(packet_id, reason_code)?;
        self.execute(actions).await
    }

    /// # Errors
    /// See [`ClientProtocol::send_pubrel`].
    pub async fn send_pubrel(&mut self, packet_id: u16, reason_code: ReasonCode) -> Result<()> {
        let actions = self.protocol.send_pubrel(packet_id, reason_code)?;
        self.execute(actions).await
    }

    /// # Errors
    /// Returns `NotConnected` or a transport error.
    pub async fn send_pubcomp(&mut self, packet_id: u16, reason_code: ReasonCode) -> Result<()> {
        let actions = self.protocol.send_pubcomp(packet_id, reason_code)?;
        self.execute(actions).await
    }

    /// Waits for the next event, reading from the transport as needed.
    ///
    /// Queued events are drained even after the connection went away; after
    /// that `NotConnected` is returned.
    ///
    /// # Errors
    /// Returns the transport, decode or keep-alive error that ended the
    /// connection.
    pub async fn poll(&mut self) -> Result<ClientEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            if !self.protocol.is_connected() {
                return Err(MqttError::NotConnected);
            }

            let packet = self.read_packet().await?;
            if matches!(packet, Packet::PingResp) {
                if let Some(keepalive) = self.keepalive.as_mut() {
                    keepalive.on_pingresp();
                }
            }
            let actions = self.protocol.handle_packet(&packet);
            self.execute(actions).await?;
        }
    }

    /// Hands every event to `handler` until the connection closes or the
    /// handler returns `false`, in which case the client disconnects.
    ///
    /// # Errors
    /// Returns the error that ended the connection.
    pub async fn run<H: EventHandler>(&mut self, mut handler: H) -> Result<()> {
        loop {
            let event = match self.poll().await {
                Ok(event) => event,
                Err(MqttError::NotConnected) => return Ok(()),
                Err(err) => {
                    handler.on_event(&ClientEvent::Error(err.clone()));
                    while let Some(event) = self.events.pop_front() {
                        handler.on_event(&event);
                    }
                    return Err(err);
                }
            };

            let closed = matches!(event, ClientEvent::Close);
            if !handler.on_event(&event) {
                if self.protocol.is_connected() {
                    self.disconnect().await?;
                }
                return Ok(());
            }
            if closed && !self.protocol.is_connected() && self.events.is_empty() {
                return Ok(());
            }
        }
    }

    /// Sends DISCONNECT and closes the transport. The session is kept only
    /// if the negotiated expiry allows it.
    ///
    /// # Errors
    /// Returns `NotConnected` or a transport error.
    pub async fn disconnect(&mut self) -> Result<()> {
        let actions = self.protocol.disconnect(now())?;
        self.execute(actions).await
    }

    /// Drops the transport without DISCONNECT, as a network failure would.
    /// The session is always kept.
    pub async fn force_disconnect(&mut self) {
        self.lose_connection().await;
    }

    async fn execute(&mut self, actions: Vec<ProtocolAction>) -> Result<()> {
        for action in actions {
            match action {
                ProtocolAction::Send(frame) => {
                    trace!(len = frame.len(), "Writing frame");
                    if let Err(err) = self.transport.write(&frame).await {
                        warn!(error = %err, "Write failed");
                        self.lose_connection().await;
                        return Err(err);
                    }
                    if let Some(keepalive) = self.keepalive.as_mut() {
                        keepalive.on_packet_sent(now());
                    }
                }
                ProtocolAction::Emit(event) => self.events.push_back(event),
                ProtocolAction::Persist(change) => self.persist(&change),
                ProtocolAction::ScheduleKeepalive { interval_secs } => {
                    self.keepalive = Some(KeepaliveState::new(
                        self.protocol.options().keepalive,
                        Duration::from_secs(u64::from(interval_secs)),
                        now(),
                    ));
                }
                ProtocolAction::Close => self.lose_connection().await,
            }
        }
        Ok(())
    }

    async fn send_publish(
        &mut self,
        packet_id: Option<u16>,
        actions: Vec<ProtocolAction>,
    ) -> Result<()> {
        let Err(err) = self.execute(actions).await else {
            return Ok(());
        };
        if let Some(packet_id) = packet_id {
            for action in self.protocol.abandon_publish(packet_id) {
                if let ProtocolAction::Persist(change) = action {
                    self.persist(&change);
                }
            }
        }
        Err(err)
    }

    fn persist(&mut self, change: &PersistAction) {
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.apply(change);
        }
    }

    async fn lose_connection(&mut self) {
        self.keepalive = None;
        if let Err(err) = self.transport.close().await {
            debug!(error = %err, "Error closing transport");
        }
        for action in self.protocol.connection_lost(now()) {
            if let ProtocolAction::Emit(event) = action {
                self.events.push_back(event);
            }
        }
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            let decoded = Packet::decode_from(
                &mut self.read_buf,
                self.protocol.protocol_version(),
                self.protocol.max_incoming_packet_size(),
            );
            match decoded {
                Ok(Some(packet)) => {
                    trace!(packet_type = ?packet.packet_type(), "Received packet");
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Dropping connection on undecodable input");
                    self.lose_connection().await;
                    return Err(err);
                }
            }

            let deadline = self.keepalive.as_ref().and_then(KeepaliveState::next_deadline);
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let wake = tokio::select! {
                read = self.transport.read(&mut chunk) => Wake::Read(read),
                () = sleep_until(deadline) => Wake::Keepalive,
            };

            match wake {
                Wake::Read(Ok(0)) => {
                    debug!("Connection closed by peer");
                    self.lose_connection().await;
                    return Err(MqttError::ConnectionClosedByPeer);
                }
                Wake::Read(Ok(n)) => self.read_buf.extend_from_slice(&chunk[..n]),
                Wake::Read(Err(err)) => {
                    self.lose_connection().await;
                    return Err(err);
                }
                Wake::Keepalive => self.on_keepalive_deadline().await?,
            }
        }
    }

    async fn on_keepalive_deadline(&mut self) -> Result<()> {
        let Some(step) = self.keepalive.as_ref().map(|k| k.poll(now())) else {
            return Ok(());
        };
        match step {
            KeepaliveStep::Idle => Ok(()),
            KeepaliveStep::SendPing => {
                trace!("Sending PINGREQ");
                let actions = self.protocol.ping();
                self.execute(actions).await?;
                if let Some(keepalive) = self.keepalive.as_mut() {
                    keepalive.on_ping_sent(now());
                }
                Ok(())
            }
            KeepaliveStep::TimedOut => {
                warn!("Keep-alive timeout, no PINGRESP received");
                self.lose_connection().await;
                Err(MqttError::KeepAliveTimeout)
            }
        }
    }
}
