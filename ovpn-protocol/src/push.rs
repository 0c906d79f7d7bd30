//! Server push-reply parsing
//!
//! After authentication the server pushes its session settings as a CSV
//! message: `PUSH_REPLY,option 1,option 2,...`. Only the options the
//! client core consumes are modeled; unknown options are ignored.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::crypto::Cipher;
use crate::data::CompressionFraming;
use crate::Result;

/// A pushed IPv4 route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

/// Parsed server push reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReply {
    /// Cipher renegotiated by the server (overrides the configured one)
    pub cipher: Option<Cipher>,
    /// Compression framing pushed by the server
    pub compression_framing: Option<CompressionFraming>,
    /// Keep-alive interval (`ping`)
    pub ping_interval: Option<Duration>,
    /// Liveness timeout (`ping-restart`)
    pub ping_restart: Option<Duration>,
    /// 24-bit peer id enabling link rebinding
    pub peer_id: Option<u32>,
    /// Token replacing the password on renegotiation
    pub auth_token: Option<String>,
    /// Assigned tunnel address
    pub address: Option<Ipv4Addr>,
    /// Assigned tunnel netmask
    pub netmask: Option<Ipv4Addr>,
    /// Default gateway inside the tunnel
    pub route_gateway: Option<Ipv4Addr>,
    /// Pushed routes
    pub routes: Vec<Route>,
    /// Pushed DNS servers
    pub dns_servers: Vec<IpAddr>,
    /// Pushed tunnel MTU
    pub mtu: Option<u16>,
}

impl PushReply {
    /// Parse a control message. Returns `Ok(None)` when the message is not
    /// a push reply at all. Malformed individual options are skipped with
    /// a warning, never fatal.
    pub fn parse(message: &str) -> Result<Option<Self>> {
        let Some(body) = message.strip_prefix("PUSH_REPLY") else {
            return Ok(None);
        };
        let body = body.strip_prefix(',').unwrap_or(body);

        let mut reply = PushReply::default();
        for option in body.split(',') {
            let option = option.trim();
            if option.is_empty() {
                continue;
            }
            let mut words = option.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            let args: Vec<&str> = words.collect();
            if !reply.apply_option(keyword, &args) {
                log::debug!("ignoring push option: {}", option);
            }
        }
        Ok(Some(reply))
    }

    fn apply_option(&mut self, keyword: &str, args: &[&str]) -> bool {
        match keyword {
            "cipher" => {
                if let Some(cipher) = args.first().and_then(|name| Cipher::from_name(name)) {
                    self.cipher = Some(cipher);
                    return true;
                }
                log::warn!("unsupported pushed cipher: {:?}", args.first());
                false
            }
            "comp-lzo" => {
                self.compression_framing = Some(CompressionFraming::CompLzo);
                true
            }
            "compress" => {
                self.compression_framing = Some(CompressionFraming::Compress);
                true
            }
            "ping" => {
                if let Some(seconds) = parse_u64(args.first()) {
                    self.ping_interval = Some(Duration::from_secs(seconds));
                    return true;
                }
                false
            }
            "ping-restart" => {
                if let Some(seconds) = parse_u64(args.first()) {
                    self.ping_restart = Some(Duration::from_secs(seconds));
                    return true;
                }
                false
            }
            "peer-id" => {
                if let Some(id) = parse_u64(args.first()) {
                    self.peer_id = Some(id as u32);
                    return true;
                }
                false
            }
            "auth-token" => {
                if let Some(token) = args.first() {
                    self.auth_token = Some((*token).to_string());
                    return true;
                }
                false
            }
            "ifconfig" => {
                let address = args.first().and_then(|a| a.parse().ok());
                let netmask = args.get(1).and_then(|a| a.parse().ok());
                if let (Some(address), Some(netmask)) = (address, netmask) {
                    self.address = Some(address);
                    self.netmask = Some(netmask);
                    return true;
                }
                log::warn!("malformed ifconfig option: {:?}", args);
                false
            }
            "route-gateway" => {
                if let Some(gateway) = args.first().and_then(|a| a.parse().ok()) {
                    self.route_gateway = Some(gateway);
                    return true;
                }
                false
            }
            "route" => {
                let network = args.first().and_then(|a| a.parse().ok());
                let netmask = args
                    .get(1)
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(Ipv4Addr::new(255, 255, 255, 255));
                let gateway = args.get(2).and_then(|a| a.parse().ok());
                if let Some(network) = network {
                    self.routes.push(Route {
                        network,
                        netmask,
                        gateway,
                    });
                    return true;
                }
                log::warn!("malformed route option: {:?}", args);
                false
            }
            "dhcp-option" => {
                if args.first() == Some(&"DNS") || args.first() == Some(&"DNS6") {
                    if let Some(server) = args.get(1).and_then(|a| a.parse().ok()) {
                        self.dns_servers.push(server);
                        return true;
                    }
                }
                false
            }
            "tun-mtu" => {
                if let Some(mtu) = parse_u64(args.first()) {
                    self.mtu = Some(mtu as u16);
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

fn parse_u64(arg: Option<&&str>) -> Option<u64> {
    arg.and_then(|a| a.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_a_push_reply() {
        assert_eq!(PushReply::parse("AUTH_FAILED").unwrap(), None);
        assert_eq!(PushReply::parse("PUSH_REQUEST").unwrap(), None);
    }

    #[test]
    fn test_minimal_reply() {
        let reply = PushReply::parse("PUSH_REPLY").unwrap().unwrap();
        assert_eq!(reply, PushReply::default());
    }

    #[test]
    fn test_full_reply() {
        let reply = PushReply::parse(
            "PUSH_REPLY,route 192.168.0.0 255.255.255.0,route-gateway 10.8.0.1,\
             dhcp-option DNS 8.8.8.8,dhcp-option DNS 1.1.1.1,\
             ifconfig 10.8.0.2 255.255.255.0,ping 10,ping-restart 120,\
             peer-id 42,cipher AES-256-GCM,auth-token SESS_abc123,tun-mtu 1500",
        )
        .unwrap()
        .unwrap();

        assert_eq!(reply.address, Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(reply.netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(reply.route_gateway, Some(Ipv4Addr::new(10, 8, 0, 1)));
        assert_eq!(reply.ping_interval, Some(Duration::from_secs(10)));
        assert_eq!(reply.ping_restart, Some(Duration::from_secs(120)));
        assert_eq!(reply.peer_id, Some(42));
        assert_eq!(reply.cipher, Some(Cipher::Aes256Gcm));
        assert_eq!(reply.auth_token.as_deref(), Some("SESS_abc123"));
        assert_eq!(reply.mtu, Some(1500));
        assert_eq!(reply.dns_servers.len(), 2);
        assert_eq!(
            reply.routes,
            vec![Route {
                network: Ipv4Addr::new(192, 168, 0, 0),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: None,
            }]
        );
    }

    #[test]
    fn test_compression_framing_options() {
        let reply = PushReply::parse("PUSH_REPLY,comp-lzo no").unwrap().unwrap();
        assert_eq!(reply.compression_framing, Some(CompressionFraming::CompLzo));

        let reply = PushReply::parse("PUSH_REPLY,compress stub-v2")
            .unwrap()
            .unwrap();
        assert_eq!(reply.compression_framing, Some(CompressionFraming::Compress));
    }

    #[test]
    fn test_unknown_and_malformed_options_ignored() {
        let reply = PushReply::parse(
            "PUSH_REPLY,unknown-opt 1 2 3,ifconfig not-an-ip,peer-id 7",
        )
        .unwrap()
        .unwrap();
        assert_eq!(reply.peer_id, Some(7));
        assert_eq!(reply.address, None);
    }

    #[test]
    fn test_peer_id_gates_rebind() {
        let with = PushReply::parse("PUSH_REPLY,peer-id 9").unwrap().unwrap();
        let without = PushReply::parse("PUSH_REPLY,ping 10").unwrap().unwrap();
        assert!(with.peer_id.is_some());
        assert!(without.peer_id.is_none());
    }
}
