//! Error types for the session engine

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop a session.
///
/// Recoverable errors ask the owner to re-establish the session
/// (`Stopped { reconnect: true }`); everything else is a final shutdown.
#[derive(Debug, Error)]
pub enum Error {
    /// A negotiation key exceeded its per-phase deadline
    #[error("negotiation timed out (hard reset: {hard_reset})")]
    NegotiationTimeout {
        /// Whether the key was still waiting for the initial hard reset
        hard_reset: bool,
    },

    /// Server rejected the credentials (`AUTH_FAILED`)
    #[error("authentication failed")]
    BadCredentials,

    /// No inbound traffic within the liveness timeout
    #[error("no inbound traffic within the ping timeout")]
    PingTimeout,

    /// Server sent a hard reset after negotiation had advanced
    #[error("stale session: server restarted the handshake")]
    StaleSession,

    /// Control packet session id diverged from the pinned remote id
    #[error("session id mismatch")]
    SessionMismatch,

    /// A control packet required a remote session id that was never pinned
    #[error("missing remote session id")]
    MissingSessionId,

    /// A data packet referenced an unknown key id
    #[error("data packet references unknown key id {0}")]
    BadKey(u8),

    /// Authenticator prefix bytes did not match
    #[error("control data prefix mismatch")]
    WrongControlDataPrefix,

    /// Underlying link I/O failed
    #[error("link write failed: {0}")]
    FailedLinkWrite(String),

    /// TLS certificate or EKU verification rejected the peer
    #[error("peer verification failed")]
    PeerVerificationFailed,

    /// Unrecoverable TLS error
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Wire-level protocol error
    #[error("protocol error: {0}")]
    Protocol(ovpn_protocol::Error),

    /// Transport closed or failed outside of a write
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether the owner should re-establish the session.
    ///
    /// Only a timed-out initial hard reset and link write failures are
    /// worth retrying; everything else indicates a condition a blind
    /// reconnect would hit again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NegotiationTimeout { hard_reset: true } | Error::FailedLinkWrite(_)
        )
    }
}

impl From<ovpn_protocol::Error> for Error {
    fn from(error: ovpn_protocol::Error) -> Self {
        match error {
            ovpn_protocol::Error::WrongControlDataPrefix => Error::WrongControlDataPrefix,
            other => Error::Protocol(other),
        }
    }
}
