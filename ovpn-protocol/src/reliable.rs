//! Control-channel reliability layer
//!
//! OpenVPN's control channel is a reliable, ordered, ack'd sub-protocol
//! running over an unreliable datagram link. This module owns the outbound
//! retransmission queue, the inbound reordering buffer, pending acks and
//! the optional TLS wrap applied to every serialized control packet.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::packet::{ControlPacket, PacketCode, MAX_ACKS_PER_PACKET};
use crate::session::SessionId;
use crate::wrap::TlsWrap;
use crate::{Error, Result};

/// Resend unacked control packets after this long (unreliable links only)
pub const RETRANSMISSION_INTERVAL: Duration = Duration::from_secs(2);

/// Fixed control header: opcode byte, session id, ack count, packet id
const CONTROL_OVERHEAD: usize = 1 + 8 + 1 + 4;

/// Worst-case extra bytes added by a TLS wrap (SHA512 tag + replay header)
const WRAP_OVERHEAD: usize = 64 + 8;

/// Room reserved for piggybacked acks when chunking payloads
const ACK_RESERVE: usize = 4 * 8 + 8;

struct OutboundPacket {
    packet_id: u32,
    code: PacketCode,
    key_id: u8,
    payload: Vec<u8>,
    last_sent: Option<Instant>,
}

/// Reliable control channel for one session
pub struct ControlChannel {
    local_session_id: SessionId,
    remote_session_id: Option<SessionId>,
    /// Next outbound control packet id
    tx_packet_id: u32,
    /// Unacked outbound packets in ascending packet-id order
    outbound: Vec<OutboundPacket>,
    /// Next inbound packet id expected for in-order delivery
    rx_packet_id: u32,
    /// Out-of-order inbound packets awaiting delivery
    inbound: BTreeMap<u32, ControlPacket>,
    /// Received packet ids not yet acknowledged
    pending_acks: Vec<u32>,
    wrap: Option<TlsWrap>,
    retransmission_interval: Duration,
}

impl ControlChannel {
    /// Create a channel with a fresh local session id
    pub fn new(local_session_id: SessionId, wrap: Option<TlsWrap>) -> Self {
        Self {
            local_session_id,
            remote_session_id: None,
            tx_packet_id: 0,
            outbound: Vec::new(),
            rx_packet_id: 0,
            inbound: BTreeMap::new(),
            pending_acks: Vec::new(),
            wrap,
            retransmission_interval: RETRANSMISSION_INTERVAL,
        }
    }

    pub fn local_session_id(&self) -> SessionId {
        self.local_session_id
    }

    pub fn remote_session_id(&self) -> Option<SessionId> {
        self.remote_session_id
    }

    /// Pin the remote session id (learned from the server hard reset)
    pub fn set_remote_session_id(&mut self, session_id: SessionId) {
        self.remote_session_id = Some(session_id);
    }

    /// Override the retransmission interval
    pub fn set_retransmission_interval(&mut self, interval: Duration) {
        self.retransmission_interval = interval;
    }

    /// Whether any outbound packet still awaits an ack
    pub fn has_unacked(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Whether any received packet id still awaits acknowledgment
    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    /// Queue `payload` for reliable transmission, chunked to fit `mtu`.
    ///
    /// An empty payload still produces one packet (resets are empty).
    pub fn enqueue_outbound(&mut self, code: PacketCode, key_id: u8, payload: &[u8], mtu: usize) {
        let mut overhead = CONTROL_OVERHEAD + ACK_RESERVE;
        if self.wrap.is_some() {
            overhead += WRAP_OVERHEAD;
        }
        let max_chunk = mtu.saturating_sub(overhead).max(64);

        let mut offset = 0;
        loop {
            let end = (offset + max_chunk).min(payload.len());
            self.outbound.push(OutboundPacket {
                packet_id: self.tx_packet_id,
                code,
                key_id,
                payload: payload[offset..end].to_vec(),
                last_sent: None,
            });
            self.tx_packet_id = self.tx_packet_id.wrapping_add(1);
            offset = end;
            if offset >= payload.len() {
                break;
            }
        }
    }

    /// Serialize every outbound packet that is due: never-sent packets
    /// always go; on unreliable links, packets whose last transmission is
    /// older than the retransmission interval are resent. Ascending
    /// packet-id order. Pending acks ride along, up to 255 per packet.
    pub fn write_outbound(
        &mut self,
        now: Instant,
        reliable_link: bool,
        unix_time: u32,
    ) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        let interval = self.retransmission_interval;
        let remote = self.remote_session_id;
        let local = self.local_session_id;

        let mut acks = std::mem::take(&mut self.pending_acks);
        for item in &mut self.outbound {
            let due = match item.last_sent {
                None => true,
                Some(at) => !reliable_link && now.duration_since(at) >= interval,
            };
            if !due {
                continue;
            }

            let mut packet = ControlPacket::new(
                item.code,
                item.key_id,
                local,
                item.packet_id,
                item.payload.clone(),
            );
            if !acks.is_empty() {
                if let Some(remote) = remote {
                    let take = acks.len().min(MAX_ACKS_PER_PACKET);
                    packet = packet.with_acks(acks.drain(..take).collect(), remote);
                }
            }

            let plain = packet.serialize();
            let frame = match &mut self.wrap {
                Some(wrap) => wrap.wrap(&plain, unix_time)?,
                None => plain,
            };
            frames.push(frame);
            item.last_sent = Some(now);
        }
        self.pending_acks = acks;
        Ok(frames)
    }

    /// Whether an inbound packet id was already delivered or buffered
    pub fn is_duplicate(&self, packet_id: u32) -> bool {
        packet_id < self.rx_packet_id || self.inbound.contains_key(&packet_id)
    }

    /// Remove acked packet ids from the retransmission queue
    pub fn process_acks(&mut self, ack_ids: &[u32]) {
        self.outbound
            .retain(|item| !ack_ids.contains(&item.packet_id));
    }

    /// Parse (and unwrap, if configured) a raw inbound control frame
    pub fn read_inbound(&mut self, frame: &[u8]) -> Result<ControlPacket> {
        match &mut self.wrap {
            Some(wrap) => {
                let plain = wrap.unwrap_packet(frame)?;
                ControlPacket::parse(&plain)
            }
            None => ControlPacket::parse(frame),
        }
    }

    /// Buffer a reliable inbound packet and return the contiguous in-order
    /// prefix that became deliverable. Duplicates are dropped (but still
    /// re-acked, in case the previous ack was lost).
    pub fn enqueue_inbound(&mut self, packet: ControlPacket) -> Vec<ControlPacket> {
        let packet_id = match packet.packet_id {
            Some(id) => id,
            None => return Vec::new(),
        };

        if !self.pending_acks.contains(&packet_id) {
            self.pending_acks.push(packet_id);
        }

        if packet_id < self.rx_packet_id || self.inbound.contains_key(&packet_id) {
            log::debug!("dropping duplicate control packet id {}", packet_id);
            return Vec::new();
        }
        self.inbound.insert(packet_id, packet);

        let mut delivered = Vec::new();
        while let Some(next) = self.inbound.remove(&self.rx_packet_id) {
            delivered.push(next);
            self.rx_packet_id = self.rx_packet_id.wrapping_add(1);
        }
        delivered
    }

    /// Serialize a standalone ack packet for all pending acks (up to 255),
    /// or `None` when nothing is pending.
    pub fn write_acks(&mut self, key_id: u8, unix_time: u32) -> Result<Option<Vec<u8>>> {
        if self.pending_acks.is_empty() {
            return Ok(None);
        }
        let remote = self
            .remote_session_id
            .ok_or_else(|| Error::Handshake("cannot ack without a remote session id".to_string()))?;

        let take = self.pending_acks.len().min(MAX_ACKS_PER_PACKET);
        let ack_ids: Vec<u32> = self.pending_acks.drain(..take).collect();
        let packet = ControlPacket::ack(key_id, self.local_session_id, ack_ids, remote);

        let plain = packet.serialize();
        let frame = match &mut self.wrap {
            Some(wrap) => wrap.wrap(&plain, unix_time)?,
            None => plain,
        };
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ControlChannel {
        let mut channel = ControlChannel::new(SessionId::new([0x01; 8]), None);
        channel.set_remote_session_id(SessionId::new([0x02; 8]));
        channel
    }

    fn inbound(packet_id: u32) -> ControlPacket {
        ControlPacket::new(
            PacketCode::ControlV1,
            0,
            SessionId::new([0x02; 8]),
            packet_id,
            vec![packet_id as u8],
        )
    }

    #[test]
    fn test_outbound_chunking() {
        let mut channel = channel();
        let payload = vec![0xAB; 3000];
        channel.enqueue_outbound(PacketCode::ControlV1, 0, &payload, 1000);

        let frames = channel.write_outbound(Instant::now(), false, 0).unwrap();
        assert!(frames.len() >= 4);

        // Reassemble and compare
        let mut collected = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.len() <= 1000);
            let packet = ControlPacket::parse(frame).unwrap();
            assert_eq!(packet.packet_id, Some(i as u32));
            collected.extend_from_slice(&packet.payload);
        }
        assert_eq!(collected, payload);
    }

    #[test]
    fn test_empty_payload_still_sends_one_packet() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::HardResetClientV2, 0, &[], 1400);
        let frames = channel.write_outbound(Instant::now(), false, 0).unwrap();
        assert_eq!(frames.len(), 1);

        let packet = ControlPacket::parse(&frames[0]).unwrap();
        assert_eq!(packet.code, PacketCode::HardResetClientV2);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_retransmission_after_interval() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"hello", 1400);

        let start = Instant::now();
        assert_eq!(channel.write_outbound(start, false, 0).unwrap().len(), 1);
        // Not due yet
        assert!(channel
            .write_outbound(start + Duration::from_millis(500), false, 0)
            .unwrap()
            .is_empty());
        // Due exactly once per interval
        assert_eq!(
            channel
                .write_outbound(start + Duration::from_secs(2), false, 0)
                .unwrap()
                .len(),
            1
        );
        assert!(channel
            .write_outbound(start + Duration::from_millis(2500), false, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ack_stops_retransmission() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"payload", 1400);
        let start = Instant::now();
        channel.write_outbound(start, false, 0).unwrap();
        assert!(channel.has_unacked());

        channel.process_acks(&[0]);
        assert!(!channel.has_unacked());
        assert!(channel
            .write_outbound(start + Duration::from_secs(10), false, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_reliable_link_never_retransmits() {
        let mut channel = channel();
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"tcp", 1400);
        let start = Instant::now();
        assert_eq!(channel.write_outbound(start, true, 0).unwrap().len(), 1);
        assert!(channel
            .write_outbound(start + Duration::from_secs(60), true, 0)
            .unwrap()
            .is_empty());
        // Still tracked until acked
        assert!(channel.has_unacked());
    }

    #[test]
    fn test_inbound_in_order_delivery() {
        let mut channel = channel();
        let delivered = channel.enqueue_inbound(inbound(0));
        assert_eq!(delivered.len(), 1);
        let delivered = channel.enqueue_inbound(inbound(1));
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn test_inbound_reordering_all_permutations() {
        use std::collections::VecDeque;

        // All permutations of four packets must surface in ascending order
        fn permutations(ids: Vec<u32>) -> Vec<Vec<u32>> {
            if ids.len() <= 1 {
                return vec![ids];
            }
            let mut out = Vec::new();
            for i in 0..ids.len() {
                let mut rest: VecDeque<u32> = ids.iter().copied().collect();
                let head = rest.remove(i).unwrap();
                for mut tail in permutations(rest.into_iter().collect()) {
                    tail.insert(0, head);
                    out.push(tail);
                }
            }
            out
        }

        for order in permutations(vec![0, 1, 2, 3]) {
            let mut channel = channel();
            let mut surfaced = Vec::new();
            for id in &order {
                for packet in channel.enqueue_inbound(inbound(*id)) {
                    surfaced.push(packet.packet_id.unwrap());
                }
            }
            assert_eq!(surfaced, vec![0, 1, 2, 3], "order {:?}", order);
        }
    }

    #[test]
    fn test_inbound_duplicates_idempotent() {
        let mut channel = channel();
        assert_eq!(channel.enqueue_inbound(inbound(0)).len(), 1);
        assert!(channel.enqueue_inbound(inbound(0)).is_empty());

        // Future packet buffered, duplicate of it dropped
        assert!(channel.enqueue_inbound(inbound(2)).is_empty());
        assert!(channel.enqueue_inbound(inbound(2)).is_empty());
        let delivered = channel.enqueue_inbound(inbound(1));
        assert_eq!(delivered.len(), 2);
    }

    #[test]
    fn test_duplicates_are_reacked() {
        let mut channel = channel();
        channel.enqueue_inbound(inbound(0));
        channel.write_acks(0, 0).unwrap();
        assert!(!channel.has_pending_acks());

        // Peer retransmits: our ack was lost, so ack again
        channel.enqueue_inbound(inbound(0));
        assert!(channel.has_pending_acks());
    }

    #[test]
    fn test_standalone_ack() {
        let mut channel = channel();
        channel.enqueue_inbound(inbound(0));
        channel.enqueue_inbound(inbound(1));

        let frame = channel.write_acks(0, 0).unwrap().unwrap();
        let packet = ControlPacket::parse(&frame).unwrap();
        assert_eq!(packet.code, PacketCode::AckV1);
        assert_eq!(packet.ack_ids, vec![0, 1]);
        assert_eq!(
            packet.ack_remote_session_id,
            Some(SessionId::new([0x02; 8]))
        );
        assert_eq!(packet.packet_id, None);

        assert!(channel.write_acks(0, 0).unwrap().is_none());
    }

    #[test]
    fn test_piggybacked_acks() {
        let mut channel = channel();
        channel.enqueue_inbound(inbound(0));
        channel.enqueue_outbound(PacketCode::ControlV1, 0, b"data", 1400);

        let frames = channel.write_outbound(Instant::now(), false, 0).unwrap();
        let packet = ControlPacket::parse(&frames[0]).unwrap();
        assert_eq!(packet.ack_ids, vec![0]);
        assert!(!channel.has_pending_acks());
    }

    #[test]
    fn test_ack_limit_per_packet() {
        let mut channel = channel();
        for id in 0..300 {
            channel.enqueue_inbound(inbound(id));
        }
        let frame = channel.write_acks(0, 0).unwrap().unwrap();
        let packet = ControlPacket::parse(&frame).unwrap();
        assert_eq!(packet.ack_ids.len(), MAX_ACKS_PER_PACKET);

        let frame = channel.write_acks(0, 0).unwrap().unwrap();
        let packet = ControlPacket::parse(&frame).unwrap();
        assert_eq!(packet.ack_ids.len(), 300 - MAX_ACKS_PER_PACKET);
    }

    #[test]
    fn test_wrapped_channel_roundtrip() {
        use crate::wrap::{StaticKey, TlsWrap};

        let key_bytes: Vec<u8> = (0..256).map(|i| i as u8).collect();
        let client_key = StaticKey::new(&key_bytes).unwrap();
        // Server-side mirror of the same static key
        let mut mirrored = Vec::with_capacity(256);
        mirrored.extend_from_slice(client_key.decrypt_key());
        mirrored.extend_from_slice(client_key.encrypt_key());
        mirrored.extend_from_slice(client_key.decrypt_hmac_key());
        mirrored.extend_from_slice(client_key.encrypt_hmac_key());
        let server_key = StaticKey::new(&mirrored).unwrap();

        let mut client = ControlChannel::new(
            SessionId::new([0x01; 8]),
            Some(TlsWrap::crypt(client_key)),
        );
        client.set_remote_session_id(SessionId::new([0x02; 8]));
        let mut server = ControlChannel::new(
            SessionId::new([0x02; 8]),
            Some(TlsWrap::crypt(server_key)),
        );

        client.enqueue_outbound(PacketCode::ControlV1, 0, b"wrapped tls record", 1400);
        let frames = client.write_outbound(Instant::now(), false, 1_700_000_000).unwrap();
        assert_eq!(frames.len(), 1);

        let packet = server.read_inbound(&frames[0]).unwrap();
        assert_eq!(packet.payload, b"wrapped tls record");
    }
}
