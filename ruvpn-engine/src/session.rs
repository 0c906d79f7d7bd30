//! OpenVPN client session state machine
//!
//! Orchestrates hard reset → TLS → authentication → push → connected,
//! rotates keys across soft renegotiations and keeps the tunnel alive.
//! The machine is synchronous: every entry point takes the current time
//! and returns an [`Output`] batch of link writes, tunnel writes and
//! events, so the async driver stays a thin pump and tests can assert on
//! exact ordering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ovpn_protocol::{
    derive_data_channel_keys, parse_opcode_byte, pem_md5, Authenticator, ControlChannel,
    ControlPacket, DataHeader, DataPath, PacketCode, PushReply, SessionId, TlsWrap, WrapStrategy,
    DATA_CHANNEL_PING, NUMBER_OF_KEYS, RETRANSMISSION_INTERVAL,
};

use crate::config::{Credentials, SessionConfig};
use crate::error::{Error, Result};
use crate::event::{SessionEvent, SessionStats, SessionStatus};
use crate::keys::{ControlState, KeyState, SessionKey};
use crate::tls::{rustls_factory, TlsError, TlsFactory};

/// The plaintext request repeated until the server answers with a push reply
const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";

/// Batched results of one state-machine entry
#[derive(Debug, Default)]
pub struct Output {
    /// Frames to write to the link, in order
    pub link: Vec<Vec<u8>>,
    /// Decrypted IP packets to write to the tunnel, in order
    pub tunnel: Vec<Vec<u8>>,
    /// Events for the owner, in order
    pub events: Vec<SessionEvent>,
}

/// Client session engine
pub struct Session {
    config: SessionConfig,
    credentials: Credentials,
    /// Server-pushed token replacing the password on renegotiation
    auth_token: Option<String>,
    tls_factory: TlsFactory,
    control: ControlChannel,
    keys: HashMap<u8, SessionKey>,
    current_key_id: Option<u8>,
    /// Key currently negotiating, if any
    negotiation_key_id: Option<u8>,
    /// Previous current key, kept one generation for late in-flight data
    old_key_id: Option<u8>,
    remote: Option<SocketAddr>,
    link_mtu: usize,
    link_reliable: bool,
    status: SessionStatus,
    is_stopping: bool,
    last_error: Option<Error>,
    last_inbound: Instant,
    last_outbound_data: Instant,
    last_push_request: Option<Instant>,
    /// Keep-alive interval in effect (pushed value overrides configured)
    effective_keep_alive: Option<Duration>,
    /// Liveness timeout in effect (pushed `ping-restart` overrides default)
    effective_ping_timeout: Duration,
    peer_id: Option<u32>,
    reply: Option<PushReply>,
    stats: SessionStats,
    stats_reported: SessionStats,
    connected_at: Option<Instant>,
}

impl Session {
    /// Create a session using the production rustls TLS engine
    pub fn new(config: SessionConfig, credentials: Credentials) -> Result<Self> {
        Self::with_tls_factory(config, credentials, rustls_factory())
    }

    /// Create a session with a custom TLS factory (tests, embedding)
    pub fn with_tls_factory(
        config: SessionConfig,
        credentials: Credentials,
        tls_factory: TlsFactory,
    ) -> Result<Self> {
        config.validate()?;
        let wrap = config.tls_wrap.as_ref().map(|wrap| match wrap.strategy {
            WrapStrategy::Auth => TlsWrap::auth(wrap.key.clone(), config.digest),
            WrapStrategy::Crypt => TlsWrap::crypt(wrap.key.clone()),
        });
        let now = Instant::now();
        Ok(Self {
            effective_ping_timeout: config.ping_timeout,
            config,
            credentials,
            auth_token: None,
            tls_factory,
            control: ControlChannel::new(SessionId::random(), wrap),
            keys: HashMap::new(),
            current_key_id: None,
            negotiation_key_id: None,
            old_key_id: None,
            remote: None,
            link_mtu: ovpn_protocol::DEFAULT_MTU,
            link_reliable: false,
            status: SessionStatus::Disconnected,
            is_stopping: false,
            last_error: None,
            last_inbound: now,
            last_outbound_data: now,
            last_push_request: None,
            effective_keep_alive: None,
            peer_id: None,
            reply: None,
            stats: SessionStats::default(),
            stats_reported: SessionStats::default(),
            connected_at: None,
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.stats;
        if let Some(connected_at) = self.connected_at {
            stats.uptime = connected_at.elapsed();
        }
        stats
    }

    pub fn local_session_id(&self) -> SessionId {
        self.control.local_session_id()
    }

    pub fn current_key_id(&self) -> Option<u8> {
        self.current_key_id
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopping
    }

    /// The error that stopped the session, if it stopped on one
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// The last push reply, once connected
    pub fn push_reply(&self) -> Option<&PushReply> {
        self.reply.as_ref()
    }

    /// Link rebinding is only possible when the server assigned a peer id
    pub fn can_rebind_link(&self) -> bool {
        self.peer_id.is_some()
    }

    /// Begin the session: emit the initial hard reset on key 0
    pub fn start(
        &mut self,
        remote: SocketAddr,
        link_mtu: usize,
        link_reliable: bool,
        now: Instant,
    ) -> Output {
        let mut out = Output::default();
        if self.is_stopping {
            return out;
        }
        self.remote = Some(remote);
        self.link_mtu = link_mtu.min(self.config.mtu);
        self.link_reliable = link_reliable;
        self.last_inbound = now;
        self.last_outbound_data = now;
        self.set_status(SessionStatus::Connecting, &mut out);

        log::info!(
            "starting session to {} (local session id {})",
            remote,
            self.control.local_session_id()
        );
        if let Err(error) = self
            .start_negotiation(0, false, true, now)
            .and_then(|_| self.flush_control(now, &mut out))
        {
            self.shutdown_with(error, &mut out);
        }
        out
    }

    /// Process a batch of raw packets read from the link
    pub fn received_link_packets(&mut self, packets: &[Vec<u8>], now: Instant) -> Output {
        let mut out = Output::default();
        if self.is_stopping {
            return out;
        }
        if let Err(error) = self.process_link_packets(packets, now, &mut out) {
            self.shutdown_with(error, &mut out);
            return out;
        }
        if let Err(error) = self.flush_control(now, &mut out) {
            self.shutdown_with(error, &mut out);
        }
        self.report_data_count(&mut out);
        out
    }

    /// Encrypt a batch of outbound IP packets read from the tunnel
    pub fn send_tunnel_packets(&mut self, packets: &[Vec<u8>], now: Instant) -> Output {
        let mut out = Output::default();
        if self.is_stopping {
            return out;
        }
        let Some(data_path) = self
            .current_key_id
            .and_then(|id| self.keys.get_mut(&id))
            .filter(|key| key.can_handle_data())
            .and_then(|key| key.data_path.as_mut())
        else {
            log::debug!("dropping {} tunnel packets: no current key", packets.len());
            return out;
        };
        for packet in packets {
            match data_path.encrypt(packet) {
                Ok(frame) => {
                    self.stats.record_tx(packet.len());
                    out.link.push(frame);
                }
                Err(e) => log::warn!("dropping outbound packet: {}", e),
            }
        }
        if !out.link.is_empty() {
            self.last_outbound_data = now;
        }
        self.report_data_count(&mut out);
        out
    }

    /// Timer-driven work: retransmission, push-request retries, liveness,
    /// renegotiation and negotiation deadlines
    pub fn tick(&mut self, now: Instant) -> Output {
        let mut out = Output::default();
        if self.is_stopping {
            return out;
        }
        if let Err(error) = self.tick_inner(now, &mut out) {
            self.shutdown_with(error, &mut out);
        }
        out
    }

    /// Final stop; the owner should not reconnect
    pub fn shutdown(&mut self) -> Output {
        self.stop(false, "stopped by owner")
    }

    /// Recoverable stop; the owner is asked to re-establish the session
    pub fn reconnect(&mut self) -> Output {
        self.stop(true, "reconnect requested")
    }

    /// Record a link I/O failure; stops the session recoverably
    pub fn link_failed(&mut self, reason: &str) -> Output {
        let mut out = Output::default();
        self.shutdown_with(Error::FailedLinkWrite(reason.to_string()), &mut out);
        out
    }

    /// Swap the link in place after a network change. Requires a pushed
    /// peer id; keys and session ids are untouched.
    pub fn rebind_link(&mut self, remote: SocketAddr, link_mtu: usize, link_reliable: bool) -> bool {
        if !self.can_rebind_link() {
            log::warn!("cannot rebind link: server did not assign a peer id");
            return false;
        }
        log::info!("rebinding link to {}", remote);
        self.remote = Some(remote);
        self.link_mtu = link_mtu.min(self.config.mtu);
        self.link_reliable = link_reliable;
        true
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn process_link_packets(
        &mut self,
        packets: &[Vec<u8>],
        now: Instant,
        out: &mut Output,
    ) -> Result<()> {
        for frame in packets {
            if frame.is_empty() {
                continue;
            }
            self.last_inbound = now;
            let code = match parse_opcode_byte(frame[0]) {
                Ok((code, _)) => code,
                Err(e) => {
                    log::warn!("dropping packet: {}", e);
                    continue;
                }
            };
            if code.is_data() {
                self.process_data_frame(frame, out)?;
            } else {
                self.process_control_frame(frame, now, out)?;
            }
        }
        Ok(())
    }

    fn process_data_frame(&mut self, frame: &[u8], out: &mut Output) -> Result<()> {
        let header = match DataHeader::parse(frame) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("dropping malformed data packet: {}", e);
                return Ok(());
            }
        };
        let Some(key) = self.keys.get_mut(&header.key_id) else {
            return Err(Error::BadKey(header.key_id));
        };
        if !key.can_handle_data() {
            log::warn!(
                "dropping data packet for key {} with no data keys yet",
                header.key_id
            );
            return Ok(());
        }
        let Some(data_path) = key.data_path.as_mut() else {
            return Ok(());
        };
        match data_path.decrypt(frame) {
            Ok(packet) if packet == DATA_CHANNEL_PING => {
                log::debug!("received keep-alive ping");
            }
            Ok(packet) => {
                self.stats.record_rx(packet.len());
                out.tunnel.push(packet);
            }
            Err(e) => log::warn!("dropping data packet: {}", e),
        }
        Ok(())
    }

    fn process_control_frame(
        &mut self,
        frame: &[u8],
        now: Instant,
        out: &mut Output,
    ) -> Result<()> {
        let packet = match self.control.read_inbound(frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("dropping control packet: {}", e);
                return Ok(());
            }
        };

        match self.control.remote_session_id() {
            Some(remote) => {
                if packet.session_id != remote {
                    // A different session id on a hard reset means the
                    // server restarted; on anything else it is an imposter
                    return Err(if packet.code == PacketCode::HardResetServerV2 {
                        Error::StaleSession
                    } else {
                        Error::SessionMismatch
                    });
                }
                if packet.code == PacketCode::HardResetServerV2 {
                    let duplicate = packet
                        .packet_id
                        .is_some_and(|id| self.control.is_duplicate(id));
                    if !duplicate {
                        return Err(Error::StaleSession);
                    }
                }
            }
            None => {
                if packet.code == PacketCode::HardResetServerV2 {
                    self.control.set_remote_session_id(packet.session_id);
                    log::info!("remote session id {}", packet.session_id);
                } else {
                    return Err(Error::MissingSessionId);
                }
            }
        }

        if !packet.ack_ids.is_empty() {
            self.control.process_acks(&packet.ack_ids);
        }
        if packet.code == PacketCode::AckV1 {
            return Ok(());
        }

        for delivered in self.control.enqueue_inbound(packet) {
            self.dispatch_control_packet(delivered, now, out)?;
        }
        Ok(())
    }

    fn dispatch_control_packet(
        &mut self,
        packet: ControlPacket,
        now: Instant,
        out: &mut Output,
    ) -> Result<()> {
        match packet.code {
            PacketCode::HardResetServerV2 => self.handle_hard_reset_server(out),
            PacketCode::SoftResetV1 => self.handle_soft_reset(packet.key_id, now),
            PacketCode::ControlV1 => self.handle_control_payload(packet, now, out),
            other => {
                log::warn!("ignoring unexpected control packet {:?}", other);
                Ok(())
            }
        }
    }

    fn handle_hard_reset_server(&mut self, out: &mut Output) -> Result<()> {
        let key_id = self.negotiation_key_id.ok_or(Error::StaleSession)?;
        let key = self
            .keys
            .get_mut(&key_id)
            .ok_or(Error::BadKey(key_id))?;
        if key.state != KeyState::HardReset {
            return Err(Error::StaleSession);
        }
        key.state = KeyState::Tls;
        key.tls.start().map_err(map_tls_error)?;
        self.set_status(SessionStatus::Handshaking, out);
        self.drain_tls_ciphertext(key_id)
    }

    fn handle_soft_reset(&mut self, key_id: u8, now: Instant) -> Result<()> {
        if self.negotiation_key_id == Some(key_id) {
            // Our own renegotiation; TLS is already running on this key
            log::debug!("ignoring soft reset echo for key {}", key_id);
            return Ok(());
        }
        log::info!("server-initiated soft reset on key {}", key_id);
        self.start_negotiation(key_id, true, false, now)?;
        self.begin_tls(key_id)
    }

    fn handle_control_payload(
        &mut self,
        packet: ControlPacket,
        now: Instant,
        out: &mut Output,
    ) -> Result<()> {
        let Some(key) = self.keys.get_mut(&packet.key_id) else {
            log::warn!("dropping control payload for unknown key {}", packet.key_id);
            return Ok(());
        };
        key.tls
            .put_cipher_text(&packet.payload)
            .map_err(map_tls_error)?;
        self.pump_negotiation(packet.key_id, now, out)
    }

    // ------------------------------------------------------------------
    // Negotiation pipeline
    // ------------------------------------------------------------------

    fn start_negotiation(
        &mut self,
        key_id: u8,
        soft: bool,
        send_reset: bool,
        now: Instant,
    ) -> Result<()> {
        let tls = (self.tls_factory)(&self.config).map_err(map_tls_error)?;
        self.keys
            .insert(key_id, SessionKey::new(key_id, soft, tls, now));
        self.negotiation_key_id = Some(key_id);

        if send_reset {
            let (code, payload) = if soft {
                (PacketCode::SoftResetV1, Vec::new())
            } else {
                (PacketCode::HardResetClientV2, self.hard_reset_payload())
            };
            let mtu = self.link_mtu;
            self.control.enqueue_outbound(code, key_id, &payload, mtu);
        }
        Ok(())
    }

    /// Hard-reset payload: empty, unless the PIA patches bind it to the CA
    /// digest and the negotiated suite
    fn hard_reset_payload(&self) -> Vec<u8> {
        if !self.config.uses_pia_patches {
            return Vec::new();
        }
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(&pem_md5(self.config.ca.as_bytes()));
        let cipher = self.config.cipher.name().as_bytes();
        payload.push(cipher.len() as u8);
        payload.extend_from_slice(cipher);
        let digest = self.config.digest.name().as_bytes();
        payload.push(digest.len() as u8);
        payload.extend_from_slice(digest);
        payload
    }

    /// Client-side TLS kick-off for soft resets (the client always
    /// initiates the handshake)
    fn begin_tls(&mut self, key_id: u8) -> Result<()> {
        let key = self.keys.get_mut(&key_id).ok_or(Error::BadKey(key_id))?;
        key.state = KeyState::Tls;
        key.tls.start().map_err(map_tls_error)?;
        self.drain_tls_ciphertext(key_id)
    }

    fn pump_negotiation(&mut self, key_id: u8, now: Instant, out: &mut Output) -> Result<()> {
        self.drain_tls_ciphertext(key_id)?;
        self.maybe_begin_authentication(key_id)?;
        self.consume_tls_plaintext(key_id, now, out)?;
        self.drain_tls_ciphertext(key_id)?;
        Ok(())
    }

    /// Move pending TLS records into the reliable outbound queue
    fn drain_tls_ciphertext(&mut self, key_id: u8) -> Result<()> {
        let mut chunks = Vec::new();
        {
            let Some(key) = self.keys.get_mut(&key_id) else {
                return Ok(());
            };
            while let Some(chunk) = key.tls.pull_cipher_text().map_err(map_tls_error)? {
                chunks.push(chunk);
            }
        }
        let mtu = self.link_mtu;
        for chunk in chunks {
            self.control
                .enqueue_outbound(PacketCode::ControlV1, key_id, &chunk, mtu);
        }
        Ok(())
    }

    /// Once the TLS handshake completes, push the key-material blob
    fn maybe_begin_authentication(&mut self, key_id: u8) -> Result<()> {
        let username = self.credentials.username();
        let password = self
            .auth_token
            .clone()
            .unwrap_or_else(|| self.credentials.password());

        {
            let Some(key) = self.keys.get_mut(&key_id) else {
                return Ok(());
            };
            if key.state != KeyState::Tls || !key.tls.is_connected() {
                return Ok(());
            }
            log::debug!("TLS handshake complete on key {}", key_id);
            key.state = KeyState::Authenticating;

            let authenticator = Authenticator::new(&username, &password);
            key.tls
                .put_plain_text(&authenticator.request_blob())
                .map_err(map_tls_error)?;
            key.authenticator = Some(authenticator);
        }
        self.drain_tls_ciphertext(key_id)
    }

    /// Route decrypted TLS plaintext through the authenticator
    fn consume_tls_plaintext(&mut self, key_id: u8, now: Instant, out: &mut Output) -> Result<()> {
        let (header_completed, messages) = {
            let Some(key) = self.keys.get_mut(&key_id) else {
                return Ok(());
            };
            let Some(authenticator) = key.authenticator.as_mut() else {
                return Ok(());
            };
            let mut header_completed = false;
            loop {
                let Some(plain) = key.tls.pull_plain_text().map_err(map_tls_error)? else {
                    break;
                };
                if authenticator.put_plain_text(&plain)? {
                    header_completed = true;
                }
            }
            let messages = authenticator.next_messages();
            if header_completed {
                key.control_state = ControlState::PreIfConfig;
            }
            (header_completed, messages)
        };
        if header_completed {
            log::debug!("server key material received on key {}", key_id);
            self.send_push_request(key_id, now)?;
        }
        for message in messages {
            self.handle_control_message(key_id, &message, now, out)?;
        }
        Ok(())
    }

    fn send_push_request(&mut self, key_id: u8, now: Instant) -> Result<()> {
        {
            let Some(key) = self.keys.get_mut(&key_id) else {
                return Ok(());
            };
            key.tls
                .put_plain_text(PUSH_REQUEST)
                .map_err(map_tls_error)?;
        }
        self.last_push_request = Some(now);
        self.drain_tls_ciphertext(key_id)
    }

    fn handle_control_message(
        &mut self,
        key_id: u8,
        message: &str,
        now: Instant,
        out: &mut Output,
    ) -> Result<()> {
        if message.starts_with("AUTH_FAILED") {
            return Err(Error::BadCredentials);
        }
        match PushReply::parse(message)? {
            Some(reply) => self.complete_connection(key_id, reply, now, out),
            None => {
                log::debug!("ignoring control message: {}", message);
                Ok(())
            }
        }
    }

    /// Push reply received: derive data keys, rotate generations, go live
    fn complete_connection(
        &mut self,
        key_id: u8,
        reply: PushReply,
        now: Instant,
        out: &mut Output,
    ) -> Result<()> {
        let local_sid = self.control.local_session_id();
        let remote_sid = self
            .control
            .remote_session_id()
            .ok_or(Error::MissingSessionId)?;

        let cipher = reply.cipher.unwrap_or(self.config.cipher);
        let framing = reply
            .compression_framing
            .unwrap_or(self.config.compression_framing);
        let digest = self.config.digest;

        {
            let Some(key) = self.keys.get_mut(&key_id) else {
                return Ok(());
            };
            if !key.is_negotiating() {
                log::debug!("ignoring duplicate push reply on key {}", key_id);
                return Ok(());
            }
            let Some(authenticator) = key.authenticator.as_ref() else {
                log::warn!("push reply before key material on key {}", key_id);
                return Ok(());
            };
            let Some(server) = authenticator.server_key_source() else {
                log::warn!("push reply before server randoms on key {}", key_id);
                return Ok(());
            };

            if reply.peer_id.is_none() {
                log::warn!("server pushed no peer id; stamping the disabled sentinel");
            }
            let material = derive_data_channel_keys(
                authenticator.key_source(),
                server,
                &local_sid,
                &remote_sid,
            );
            key.data_path = Some(DataPath::new(
                key_id,
                material,
                cipher,
                digest,
                framing,
                reply.peer_id,
            ));
            key.state = KeyState::Connected;
            key.control_state = ControlState::Connected;
            key.authenticator = None;
        }

        self.effective_keep_alive = reply.ping_interval.or(self.config.keep_alive_interval);
        self.effective_ping_timeout = reply.ping_restart.unwrap_or(self.config.ping_timeout);
        self.peer_id = reply.peer_id;
        if let Some(token) = &reply.auth_token {
            self.auth_token = Some(token.clone());
        }
        self.last_push_request = None;
        self.negotiation_key_id = None;

        // Rotate generations: the previous old key dies, the previous
        // current key survives one more generation for late packets
        if let Some(old) = self.old_key_id.take() {
            log::debug!("dropping old key {}", old);
            self.keys.remove(&old);
        }
        let previous = self.current_key_id.take();
        if let Some(previous) = previous {
            if previous != key_id {
                self.old_key_id = Some(previous);
            }
        }
        self.current_key_id = Some(key_id);

        if previous.is_none() {
            self.connected_at = Some(now);
            self.set_status(SessionStatus::Connected, out);
            let remote = self
                .remote
                .map(|addr| addr.to_string())
                .unwrap_or_default();
            log::info!(
                "session established with {} (cipher {}, key {})",
                remote,
                cipher,
                key_id
            );
            out.events.push(SessionEvent::Started {
                remote,
                reply: reply.clone(),
            });
        } else {
            log::info!("renegotiation complete, key {} is current", key_id);
            out.events.push(SessionEvent::Renegotiated { key_id });
        }
        self.reply = Some(reply);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn tick_inner(&mut self, now: Instant, out: &mut Output) -> Result<()> {
        self.check_negotiation_deadline(now)?;
        self.retry_push_request(now)?;

        if now.duration_since(self.last_inbound) > self.effective_ping_timeout {
            return Err(Error::PingTimeout);
        }
        self.send_keep_alive(now, out);
        self.maybe_renegotiate(now)?;
        self.flush_control(now, out)?;
        self.report_data_count(out);
        Ok(())
    }

    fn check_negotiation_deadline(&self, now: Instant) -> Result<()> {
        let Some(key) = self
            .negotiation_key_id
            .and_then(|id| self.keys.get(&id))
        else {
            return Ok(());
        };
        if !key.is_negotiating() {
            return Ok(());
        }
        let hard_reset = key.state == KeyState::HardReset;
        let deadline = if hard_reset {
            self.config.hard_reset_timeout
        } else {
            self.config.negotiation_timeout
        };
        if now.duration_since(key.start_time) > deadline {
            return Err(Error::NegotiationTimeout { hard_reset });
        }
        Ok(())
    }

    /// Repeat `PUSH_REQUEST` until the reply arrives. On unreliable links
    /// this is interval-based; on reliable links, only once the ack queue
    /// drained (nothing of ours is still in flight).
    fn retry_push_request(&mut self, now: Instant) -> Result<()> {
        let Some(key_id) = self.negotiation_key_id else {
            return Ok(());
        };
        let waiting = self
            .keys
            .get(&key_id)
            .is_some_and(|key| key.control_state == ControlState::PreIfConfig);
        if !waiting {
            return Ok(());
        }
        let due = if self.link_reliable {
            !self.control.has_unacked()
        } else {
            self.last_push_request
                .map_or(true, |at| now.duration_since(at) >= RETRANSMISSION_INTERVAL)
        };
        if due {
            self.send_push_request(key_id, now)?;
        }
        Ok(())
    }

    fn send_keep_alive(&mut self, now: Instant, out: &mut Output) {
        let Some(interval) = self.effective_keep_alive else {
            return;
        };
        if self.status != SessionStatus::Connected
            || now.duration_since(self.last_outbound_data) < interval
        {
            return;
        }
        let Some(data_path) = self
            .current_key_id
            .and_then(|id| self.keys.get_mut(&id))
            .filter(|key| key.can_handle_data())
            .and_then(|key| key.data_path.as_mut())
        else {
            return;
        };
        match data_path.encrypt(&DATA_CHANNEL_PING) {
            Ok(frame) => {
                log::debug!("sending keep-alive ping");
                out.link.push(frame);
                self.last_outbound_data = now;
            }
            Err(e) => log::warn!("failed to build keep-alive ping: {}", e),
        }
    }

    fn maybe_renegotiate(&mut self, now: Instant) -> Result<()> {
        let Some(interval) = self.config.renegotiates_after else {
            return Ok(());
        };
        if self.negotiation_key_id.is_some() {
            return Ok(());
        }
        let Some(current) = self
            .current_key_id
            .and_then(|id| self.keys.get(&id))
        else {
            return Ok(());
        };
        if now.duration_since(current.start_time) <= interval {
            return Ok(());
        }

        // Key id 0 is reserved for the initial hard reset
        let next = ((current.id + 1) % NUMBER_OF_KEYS).max(1);
        log::info!("soft reset: renegotiating on key {}", next);
        self.start_negotiation(next, true, true, now)?;
        self.begin_tls(next)
    }

    // ------------------------------------------------------------------
    // Output assembly
    // ------------------------------------------------------------------

    /// Serialize pending acks (first) and due control packets
    fn flush_control(&mut self, now: Instant, out: &mut Output) -> Result<()> {
        let unix_time = unix_time();
        let ack_key = self
            .negotiation_key_id
            .or(self.current_key_id)
            .unwrap_or(0);
        if self.control.has_pending_acks() {
            match self.control.write_acks(ack_key, unix_time) {
                Ok(Some(frame)) => out.link.push(frame),
                Ok(None) => {}
                Err(e) => log::warn!("unable to write acks: {}", e),
            }
        }
        let frames = self
            .control
            .write_outbound(now, self.link_reliable, unix_time)?;
        out.link.extend(frames);
        Ok(())
    }

    fn report_data_count(&mut self, out: &mut Output) {
        if self.stats != self.stats_reported {
            self.stats_reported = self.stats;
            out.events.push(SessionEvent::DataCount(self.stats()));
        }
    }

    fn set_status(&mut self, new: SessionStatus, out: &mut Output) {
        if self.status != new {
            let old = self.status;
            self.status = new;
            log::debug!("session status: {} -> {}", old, new);
            out.events.push(SessionEvent::StatusChanged { old, new });
        }
    }

    // ------------------------------------------------------------------
    // Stop paths
    // ------------------------------------------------------------------

    fn stop(&mut self, reconnect: bool, reason: &str) -> Output {
        let mut out = Output::default();
        if self.is_stopping {
            return out;
        }
        self.is_stopping = true;
        log::info!("stopping session: {} (reconnect: {})", reason, reconnect);
        self.set_status(SessionStatus::Disconnecting, &mut out);
        self.cleanup();
        self.set_status(SessionStatus::Disconnected, &mut out);
        out.events.push(SessionEvent::Stopped {
            reconnect,
            reason: reason.to_string(),
        });
        out
    }

    fn shutdown_with(&mut self, error: Error, out: &mut Output) {
        if self.is_stopping {
            return;
        }
        self.is_stopping = true;
        let reconnect = error.is_recoverable();
        log::error!("session failed: {} (reconnect: {})", error, reconnect);
        self.set_status(SessionStatus::Disconnecting, out);
        self.cleanup();
        self.set_status(SessionStatus::Disconnected, out);
        out.events.push(SessionEvent::Stopped {
            reconnect,
            reason: error.to_string(),
        });
        self.last_error = Some(error);
    }

    /// Drop all key generations; their secrets scrub themselves on drop
    fn cleanup(&mut self) {
        self.keys.clear();
        self.current_key_id = None;
        self.negotiation_key_id = None;
        self.old_key_id = None;
        self.connected_at = None;
    }
}

fn map_tls_error(error: TlsError) -> Error {
    match error {
        TlsError::PeerVerification | TlsError::ServerEku => Error::PeerVerificationFailed,
        other => Error::TlsHandshake(other.to_string()),
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}
