//! ruvpn session engine
//!
//! Client-side OpenVPN 2.3+ session engine: negotiates a TLS-protected
//! control channel over the reliable sub-protocol, derives data-plane
//! keys, and moves IP packets between a tunnel interface and a network
//! link, with soft renegotiation, keep-alive and link rebinding.
//!
//! Wire-level machinery lives in the `ovpn-protocol` crate; this crate
//! owns the state machine, the TLS engine, configuration, events and the
//! async driver.

mod config;
mod error;
mod event;
mod keys;
mod runner;
mod session;
mod socket;
pub mod tls;

pub use config::{
    Credentials, SessionConfig, SessionConfigBuilder, TlsWrapConfig, HARD_RESET_TIMEOUT,
    NEGOTIATION_TIMEOUT, PING_TIMEOUT,
};
pub use error::{Error, Result};
pub use event::{SessionEvent, SessionStats, SessionStatus};
pub use runner::{SessionCommand, SessionRunner};
pub use session::{Output, Session};
pub use socket::{TcpLink, UdpLink};
pub use tls::{rustls_factory, RustlsChannel, TlsChannel, TlsError, TlsFactory};
