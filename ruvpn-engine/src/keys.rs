//! Per-generation session key state
//!
//! Each negotiation (hard reset or soft reset) runs on its own key id and
//! carries its own TLS engine, authenticator and, once material is
//! derived, data path. At most one key negotiates at a time; the previous
//! current key is retained for one generation to decrypt late in-flight
//! packets.

use std::time::Instant;

use ovpn_protocol::{Authenticator, DataPath};

use crate::tls::TlsChannel;

/// Negotiation state of one key generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyState {
    /// Waiting for the server's hard reset
    HardReset,
    /// Waiting for the server to engage a soft reset
    SoftReset,
    /// TLS handshake in progress
    Tls,
    /// TLS up; key-material and credential exchange in progress
    Authenticating,
    /// Data keys derived; key is usable for tunnel traffic
    Connected,
}

/// Post-TLS control progress of one key generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlState {
    /// Key-material blob not yet acknowledged by the server
    PreAuth,
    /// Server randoms received; waiting for the push reply
    PreIfConfig,
    /// Push reply processed
    Connected,
}

/// One key generation and everything negotiated under it
pub(crate) struct SessionKey {
    pub id: u8,
    pub state: KeyState,
    pub control_state: ControlState,
    /// When this negotiation began; drives the per-phase deadlines
    pub start_time: Instant,
    /// Whether this generation was started by a soft reset
    pub is_soft_reset: bool,
    pub tls: Box<dyn TlsChannel>,
    pub authenticator: Option<Authenticator>,
    /// Present once data keys are derived
    pub data_path: Option<DataPath>,
}

impl SessionKey {
    pub fn new(id: u8, is_soft_reset: bool, tls: Box<dyn TlsChannel>, now: Instant) -> Self {
        Self {
            id,
            state: if is_soft_reset {
                KeyState::SoftReset
            } else {
                KeyState::HardReset
            },
            control_state: ControlState::PreAuth,
            start_time: now,
            is_soft_reset,
            tls,
            authenticator: None,
            data_path: None,
        }
    }

    /// Whether this key can encrypt/decrypt tunnel traffic
    pub fn can_handle_data(&self) -> bool {
        self.state == KeyState::Connected && self.data_path.is_some()
    }

    /// Whether this key is still negotiating
    pub fn is_negotiating(&self) -> bool {
        self.state != KeyState::Connected
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("control_state", &self.control_state)
            .field("is_soft_reset", &self.is_soft_reset)
            .field("has_data_path", &self.data_path.is_some())
            .finish()
    }
}
