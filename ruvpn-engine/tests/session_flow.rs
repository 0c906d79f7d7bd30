//! End-to-end session scenarios against a scripted server
//!
//! The server side is simulated packet-by-packet: control packets are
//! built with the protocol crate, TLS is the transparent scripted channel,
//! and data-channel keys are derived from the key material the client
//! actually sent, so tunnel traffic is decrypted for real.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ovpn_protocol::{
    derive_data_channel_keys, Cipher, CompressionFraming, ControlPacket, DataChannelKeys,
    DataPath, Digest, KeySource, PacketCode, SecureBytes, ServerKeySource, SessionId,
};
use ruvpn_engine::tls::mock::{ScriptedTls, ScriptedTlsHandle};
use ruvpn_engine::{
    Credentials, Error, Session, SessionConfig, SessionEvent, SessionStatus, TlsError, TlsFactory,
};

const TEST_CA: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

const SERVER_RANDOM_1: [u8; 32] = [0x01; 32];
const SERVER_RANDOM_2: [u8; 32] = [0x02; 32];

fn remote() -> SocketAddr {
    "203.0.113.5:1194".parse().unwrap()
}

/// TLS factory handing out transparent scripted channels, one per key
/// generation, with the handles collected for inspection
fn scripted_factory() -> (TlsFactory, Arc<Mutex<Vec<ScriptedTlsHandle>>>) {
    let handles: Arc<Mutex<Vec<ScriptedTlsHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = handles.clone();
    let factory: TlsFactory = Box::new(move |_| {
        let (tls, handle) = ScriptedTls::new();
        collected.lock().unwrap().push(handle);
        Ok(Box::new(tls))
    });
    (factory, handles)
}

fn session_with(
    config: SessionConfig,
    factory: TlsFactory,
) -> Session {
    Session::with_tls_factory(config, Credentials::new("user", "pass"), factory).unwrap()
}

fn cbc_config() -> SessionConfig {
    SessionConfig::builder(TEST_CA)
        .cipher(Cipher::Aes128Cbc)
        .digest(Digest::Sha1)
        .build()
        .unwrap()
}

/// Packet-by-packet server simulation
struct ServerSim {
    session_id: SessionId,
    client_session_id: SessionId,
    next_packet_id: u32,
}

impl ServerSim {
    fn new(client_session_id: SessionId) -> Self {
        Self {
            session_id: SessionId::new([0xA5; 8]),
            client_session_id,
            next_packet_id: 0,
        }
    }

    fn frame(
        &mut self,
        code: PacketCode,
        key_id: u8,
        payload: Vec<u8>,
        acks: Vec<u32>,
    ) -> Vec<u8> {
        let packet_id = self.next_packet_id;
        self.next_packet_id += 1;
        let mut packet =
            ControlPacket::new(code, key_id, self.session_id, packet_id, payload);
        if !acks.is_empty() {
            packet = packet.with_acks(acks, self.client_session_id);
        }
        packet.serialize()
    }

    fn hard_reset(&mut self, acks: Vec<u32>) -> Vec<u8> {
        self.frame(PacketCode::HardResetServerV2, 0, Vec::new(), acks)
    }

    fn control(&mut self, key_id: u8, payload: &[u8], acks: Vec<u32>) -> Vec<u8> {
        self.frame(PacketCode::ControlV1, key_id, payload.to_vec(), acks)
    }

    fn auth_reply(&self) -> Vec<u8> {
        let mut reply = vec![0, 0, 0, 0];
        reply.extend_from_slice(&SERVER_RANDOM_1);
        reply.extend_from_slice(&SERVER_RANDOM_2);
        reply.extend_from_slice(&0u16.to_be_bytes());
        reply
    }

    /// Build the server-side data path mirroring the keys the client
    /// derived, from the auth blob the client sent through TLS.
    fn data_path(
        &self,
        auth_blob: &[u8],
        cipher: Cipher,
        peer_id: Option<u32>,
        key_id: u8,
    ) -> DataPath {
        let client = KeySource::from_parts(
            &auth_blob[4..52],
            &auth_blob[52..84],
            &auth_blob[84..116],
        );
        let server = ServerKeySource::new(&SERVER_RANDOM_1, &SERVER_RANDOM_2);
        let keys = derive_data_channel_keys(
            &client,
            &server,
            &self.client_session_id,
            &self.session_id,
        );

        let mut swapped = SecureBytes::with_capacity(256);
        swapped.append(keys.decrypt_key());
        swapped.append(keys.encrypt_key());
        swapped.append(keys.decrypt_hmac_key());
        swapped.append(keys.encrypt_hmac_key());
        DataPath::new(
            key_id,
            DataChannelKeys::from_material(swapped).unwrap(),
            cipher,
            Digest::Sha1,
            CompressionFraming::Disabled,
            peer_id,
        )
    }
}

/// Packet ids of reliable client control packets in `frames`
fn reliable_pids(frames: &[Vec<u8>]) -> Vec<u32> {
    frames
        .iter()
        .filter_map(|frame| ControlPacket::parse(frame).ok())
        .filter_map(|packet| packet.packet_id)
        .collect()
}

fn codes(frames: &[Vec<u8>]) -> Vec<PacketCode> {
    frames
        .iter()
        .filter_map(|frame| ControlPacket::parse(frame).ok())
        .map(|packet| packet.code)
        .collect()
}

/// Drive a full negotiation on `key_id` from the point where the client
/// has emitted its reset packet(s). Returns all events plus the auth blob
/// the client pushed through TLS.
fn negotiate(
    session: &mut Session,
    server: &mut ServerSim,
    handle: &ScriptedTlsHandle,
    key_id: u8,
    client_frames: &[Vec<u8>],
    push_reply: &str,
    now: Instant,
) -> (Vec<SessionEvent>, Vec<u8>) {
    let mut events = Vec::new();

    // Server answers the reset (hard resets only originate on key 0)
    let first = if key_id == 0 {
        server.hard_reset(reliable_pids(client_frames))
    } else {
        server.control(key_id, b"tls:server-hello", reliable_pids(client_frames))
    };
    let mut out = session.received_link_packets(&[first], now);
    events.append(&mut out.events);

    // On key 0 the TLS hello only goes out after the server hard reset
    if key_id == 0 {
        let hello = server.control(key_id, b"tls:server-hello", reliable_pids(&out.link));
        out = session.received_link_packets(&[hello], now);
        events.append(&mut out.events);
    }

    // TLS is up; the client pushed its key material
    assert!(handle.is_connected());
    let auth_blob = handle.plain_written()[0].clone();

    // Server key material, then the push reply
    let reply = server.auth_reply();
    let frame = server.control(key_id, &reply, reliable_pids(&out.link));
    out = session.received_link_packets(&[frame], now);
    events.append(&mut out.events);

    let mut terminated = push_reply.as_bytes().to_vec();
    terminated.push(0);
    let frame = server.control(key_id, &terminated, reliable_pids(&out.link));
    out = session.received_link_packets(&[frame], now);
    events.append(&mut out.events);

    (events, auth_blob)
}

#[test]
fn test_happy_path_udp_cbc() {
    let (factory, handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    assert_eq!(codes(&out.link), vec![PacketCode::HardResetClientV2]);
    assert_eq!(session.status(), SessionStatus::Connecting);

    let mut server = ServerSim::new(session.local_session_id());
    let (events, auth_blob) = negotiate(
        &mut session,
        &mut server,
        &handles.lock().unwrap()[0].clone(),
        0,
        &out.link,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 42,ping 10",
        now,
    );

    assert_eq!(session.status(), SessionStatus::Connected);
    assert_eq!(session.current_key_id(), Some(0));
    let started = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Started { remote, reply } => Some((remote.clone(), reply.clone())),
            _ => None,
        })
        .expect("Started event");
    assert_eq!(started.0, "203.0.113.5:1194");
    assert_eq!(started.1.peer_id, Some(42));
    assert_eq!(
        started.1.address,
        Some("10.8.0.2".parse().unwrap())
    );

    // Data flows both ways through real crypto
    let mut server_data = server.data_path(&auth_blob, Cipher::Aes128Cbc, Some(42), 0);

    let ip_out = b"\x45\x00\x00\x14client-to-server".to_vec();
    let out = session.send_tunnel_packets(&[ip_out.clone()], now);
    assert_eq!(out.link.len(), 1);
    assert_eq!(server_data.decrypt(&out.link[0]).unwrap(), ip_out);

    let ip_in = b"\x45\x00\x00\x14server-to-client".to_vec();
    let frame = server_data.encrypt(&ip_in).unwrap();
    let out = session.received_link_packets(&[frame], now);
    assert_eq!(out.tunnel, vec![ip_in]);
}

#[test]
fn test_acks_precede_control_data() {
    let (factory, _handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    let mut server = ServerSim::new(session.local_session_id());

    // The server hard reset must be acked before the TLS hello goes out
    let out = session.received_link_packets(&[server.hard_reset(reliable_pids(&out.link))], now);
    let codes = codes(&out.link);
    assert_eq!(codes[0], PacketCode::AckV1);
    assert!(codes.contains(&PacketCode::ControlV1));
}

#[test]
fn test_auth_failed_stops_without_reconnect() {
    let (factory, _handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    let mut server = ServerSim::new(session.local_session_id());

    let out = session.received_link_packets(&[server.hard_reset(reliable_pids(&out.link))], now);
    let out = session.received_link_packets(
        &[server.control(0, b"tls:server-hello", reliable_pids(&out.link))],
        now,
    );
    let out = session.received_link_packets(
        &[server.control(0, &server.auth_reply(), reliable_pids(&out.link))],
        now,
    );

    let events = session
        .received_link_packets(&[server.control(0, b"AUTH_FAILED\0", reliable_pids(&out.link))], now)
        .events;

    assert!(session.is_stopped());
    assert!(matches!(session.last_error(), Some(Error::BadCredentials)));
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::Stopped {
            reconnect: false,
            ..
        }
    )));
}

#[test]
fn test_soft_reset_rotates_keys_and_drops_old() {
    let (factory, handles) = scripted_factory();
    let config = SessionConfig::builder(TEST_CA)
        .cipher(Cipher::Aes128Cbc)
        .digest(Digest::Sha1)
        .renegotiates_after(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut session = session_with(config, factory);
    let t0 = Instant::now();

    let out = session.start(remote(), 1400, false, t0);
    let mut server = ServerSim::new(session.local_session_id());
    let handle0 = handles.lock().unwrap()[0].clone();
    let (_, blob0) = negotiate(
        &mut session,
        &mut server,
        &handle0,
        0,
        &out.link,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 7",
        t0,
    );
    assert_eq!(session.current_key_id(), Some(0));
    let mut server_data_0 = server.data_path(&blob0, Cipher::Aes128Cbc, Some(7), 0);

    // 1.2s later the client initiates a soft reset on key id 1
    let t1 = t0 + Duration::from_millis(1200);
    let out = session.tick(t1);
    let codes_sent = codes(&out.link);
    assert!(codes_sent.contains(&PacketCode::SoftResetV1));
    assert!(codes_sent.contains(&PacketCode::ControlV1));
    let soft = out
        .link
        .iter()
        .filter_map(|frame| ControlPacket::parse(frame).ok())
        .find(|packet| packet.code == PacketCode::SoftResetV1)
        .unwrap();
    assert_eq!(soft.key_id, 1);

    // Complete the renegotiation on key 1
    let handle1 = handles.lock().unwrap()[1].clone();
    let (events, blob1) = negotiate(
        &mut session,
        &mut server,
        &handle1,
        1,
        &out.link,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 7",
        t1,
    );
    assert_eq!(session.current_key_id(), Some(1));
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::Renegotiated { key_id: 1 })));

    // Key 0 is now old but still decrypts one late in-flight packet
    let late = server_data_0.encrypt(b"late packet").unwrap();
    let out = session.received_link_packets(&[late], t1);
    assert_eq!(out.tunnel, vec![b"late packet".to_vec()]);

    // New traffic flows on key 1
    let mut server_data_1 = server.data_path(&blob1, Cipher::Aes128Cbc, Some(7), 1);
    let out = session.send_tunnel_packets(&[b"fresh".to_vec()], t1);
    assert_eq!(server_data_1.decrypt(&out.link[0]).unwrap(), b"fresh");

    // A second rotation drops key 0 for good
    let t2 = t1 + Duration::from_millis(1200);
    let out = session.tick(t2);
    let handle2 = handles.lock().unwrap()[2].clone();
    negotiate(
        &mut session,
        &mut server,
        &handle2,
        2,
        &out.link,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 7",
        t2,
    );
    assert_eq!(session.current_key_id(), Some(2));

    // Data on the dropped key id is now fatal
    let stale = server_data_0.encrypt(b"too late").unwrap();
    session.received_link_packets(&[stale], t2);
    assert!(session.is_stopped());
    assert!(matches!(session.last_error(), Some(Error::BadKey(0))));
}

#[test]
fn test_link_rebind_with_peer_id() {
    let (factory, handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    let mut server = ServerSim::new(session.local_session_id());
    let handle = handles.lock().unwrap()[0].clone();
    let (_, blob) = negotiate(
        &mut session,
        &mut server,
        &handle,
        0,
        &out.link,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 7",
        now,
    );

    assert!(session.can_rebind_link());
    let new_remote: SocketAddr = "198.51.100.9:1194".parse().unwrap();
    assert!(session.rebind_link(new_remote, 1400, false));

    // No new handshake: the same keys keep flowing
    let mut server_data = server.data_path(&blob, Cipher::Aes128Cbc, Some(7), 0);
    let out = session.send_tunnel_packets(&[b"after rebind".to_vec()], now);
    assert_eq!(server_data.decrypt(&out.link[0]).unwrap(), b"after rebind");
    assert_eq!(session.status(), SessionStatus::Connected);
}

#[test]
fn test_replayed_data_packet_delivered_once() {
    let (factory, handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    let mut server = ServerSim::new(session.local_session_id());
    let handle = handles.lock().unwrap()[0].clone();
    let (_, blob) = negotiate(
        &mut session,
        &mut server,
        &handle,
        0,
        &out.link,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 7",
        now,
    );

    let mut server_data = server.data_path(&blob, Cipher::Aes128Cbc, Some(7), 0);
    let frame = server_data.encrypt(b"only once").unwrap();

    let out = session.received_link_packets(&[frame.clone()], now);
    assert_eq!(out.tunnel.len(), 1);

    // Byte-identical replay is dropped, session stays up
    let out = session.received_link_packets(&[frame], now);
    assert!(out.tunnel.is_empty());
    assert!(!session.is_stopped());
}

#[test]
fn test_missing_eku_fails_peer_verification() {
    let factory: TlsFactory = Box::new(|_| Ok(Box::new(ScriptedTls::failing(TlsError::ServerEku).0)));
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    let mut server = ServerSim::new(session.local_session_id());

    let out = session.received_link_packets(&[server.hard_reset(reliable_pids(&out.link))], now);
    let events = session
        .received_link_packets(
            &[server.control(0, b"tls:server-hello", reliable_pids(&out.link))],
            now,
        )
        .events;

    assert!(session.is_stopped());
    assert!(matches!(
        session.last_error(),
        Some(Error::PeerVerificationFailed)
    ));
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::Stopped {
            reconnect: false,
            ..
        }
    )));
}

#[test]
fn test_session_id_mismatch_is_fatal() {
    let (factory, _handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    let mut server = ServerSim::new(session.local_session_id());
    session.received_link_packets(&[server.hard_reset(reliable_pids(&out.link))], now);

    // A control packet from a different session id
    let imposter = ControlPacket::new(
        PacketCode::ControlV1,
        0,
        SessionId::new([0xEE; 8]),
        1,
        b"bogus".to_vec(),
    );
    session.received_link_packets(&[imposter.serialize()], now);
    assert!(matches!(
        session.last_error(),
        Some(Error::SessionMismatch)
    ));
}

#[test]
fn test_hard_reset_after_negotiation_is_stale() {
    let (factory, handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let now = Instant::now();

    let out = session.start(remote(), 1400, false, now);
    let mut server = ServerSim::new(session.local_session_id());
    let handle = handles.lock().unwrap()[0].clone();
    negotiate(
        &mut session,
        &mut server,
        &handle,
        0,
        &out.link,
        "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,peer-id 7",
        now,
    );
    assert_eq!(session.status(), SessionStatus::Connected);

    // A restarted server hard-resets under a fresh session id
    let mut restarted = ServerSim::new(session.local_session_id());
    restarted.session_id = SessionId::new([0x77; 8]);
    let events = session
        .received_link_packets(&[restarted.hard_reset(vec![])], now)
        .events;

    assert!(session.is_stopped());
    assert!(matches!(session.last_error(), Some(Error::StaleSession)));
    // Shutdown happens exactly once
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, SessionEvent::Stopped { .. }))
            .count(),
        1
    );
    assert!(session
        .received_link_packets(&[restarted.hard_reset(vec![])], now)
        .events
        .is_empty());
}

#[test]
fn test_push_request_repeats_until_reply() {
    let (factory, handles) = scripted_factory();
    let mut session = session_with(cbc_config(), factory);
    let t0 = Instant::now();

    let out = session.start(remote(), 1400, false, t0);
    let mut server = ServerSim::new(session.local_session_id());

    let out = session.received_link_packets(&[server.hard_reset(reliable_pids(&out.link))], t0);
    let out = session.received_link_packets(
        &[server.control(0, b"tls:server-hello", reliable_pids(&out.link))],
        t0,
    );
    session.received_link_packets(
        &[server.control(0, &server.auth_reply(), reliable_pids(&out.link))],
        t0,
    );

    let handle = handles.lock().unwrap()[0].clone();
    let requests = |handle: &ScriptedTlsHandle| {
        handle
            .plain_written()
            .iter()
            .filter(|plain| plain.as_slice() == b"PUSH_REQUEST\0")
            .count()
    };
    assert_eq!(requests(&handle), 1);

    // Not due before the retransmission interval
    session.tick(t0 + Duration::from_millis(500));
    assert_eq!(requests(&handle), 1);

    // Due once per interval
    session.tick(t0 + Duration::from_millis(2100));
    assert_eq!(requests(&handle), 2);
}
