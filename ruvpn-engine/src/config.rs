//! Session configuration

use std::time::Duration;

use ovpn_protocol::{
    Cipher, CompressionFraming, Digest, SecureBytes, StaticKey, WrapStrategy, DEFAULT_MTU,
};

use crate::error::{Error, Result};

/// Default deadline for the server to answer the initial hard reset
pub const HARD_RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a full negotiation (TLS + auth + push)
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default liveness timeout when the server pushes no `ping-restart`
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Username/password pair handed to the authenticator.
///
/// Held in scrubbed buffers; an empty pair selects certificate-only
/// authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    username: SecureBytes,
    password: SecureBytes,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: SecureBytes::from(username.as_bytes()),
            password: SecureBytes::from(password.as_bytes()),
        }
    }

    /// Certificate-only authentication
    pub fn none() -> Self {
        Self::new("", "")
    }

    pub fn username(&self) -> String {
        String::from_utf8_lossy(&self.username).into_owned()
    }

    pub fn password(&self) -> String {
        String::from_utf8_lossy(&self.password).into_owned()
    }
}

/// Control-channel TLS wrap configuration
#[derive(Debug, Clone)]
pub struct TlsWrapConfig {
    /// `Auth` (`--tls-auth`) or `Crypt` (`--tls-crypt`)
    pub strategy: WrapStrategy,
    /// The 256-byte pre-shared static key
    pub key: StaticKey,
}

/// Immutable per-session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Data-channel cipher (the server may renegotiate it via push)
    pub cipher: Cipher,
    /// HMAC digest for CBC suites and `--tls-auth` (ignored for GCM)
    pub digest: Digest,
    /// CA certificate(s), PEM (required)
    pub ca: String,
    /// Client certificate, PEM (mutual TLS; requires `client_key`)
    pub client_certificate: Option<String>,
    /// Client private key, PEM
    pub client_key: Option<String>,
    /// Compression framing expected by the server
    pub compression_framing: CompressionFraming,
    /// Optional control-channel wrap
    pub tls_wrap: Option<TlsWrapConfig>,
    /// Keep-alive ping interval; `None` disables client pings
    pub keep_alive_interval: Option<Duration>,
    /// Trigger a soft renegotiation after this long; `None` disables
    pub renegotiates_after: Option<Duration>,
    /// Send the CA-MD5-bound hard-reset payload some providers require
    pub uses_pia_patches: bool,
    /// Link MTU hint
    pub mtu: usize,
    /// Deadline for the server to answer the hard reset
    pub hard_reset_timeout: Duration,
    /// Deadline for a full negotiation; also bounds soft renegotiations
    pub negotiation_timeout: Duration,
    /// Liveness timeout (overridden by a pushed `ping-restart`)
    pub ping_timeout: Duration,
    /// Server name for TLS (defaults to a placeholder; OpenVPN peers are
    /// validated against the CA, not by name)
    pub tls_server_name: Option<String>,
}

impl SessionConfig {
    /// Start building a configuration around the required CA
    pub fn builder(ca: &str) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig {
                cipher: Cipher::Aes256Gcm,
                digest: Digest::Sha1,
                ca: ca.to_string(),
                client_certificate: None,
                client_key: None,
                compression_framing: CompressionFraming::Disabled,
                tls_wrap: None,
                keep_alive_interval: None,
                renegotiates_after: None,
                uses_pia_patches: false,
                mtu: DEFAULT_MTU,
                hard_reset_timeout: HARD_RESET_TIMEOUT,
                negotiation_timeout: NEGOTIATION_TIMEOUT,
                ping_timeout: PING_TIMEOUT,
                tls_server_name: None,
            },
        }
    }

    /// Validate invariants the rest of the engine relies on
    pub fn validate(&self) -> Result<()> {
        if !self.ca.contains("BEGIN CERTIFICATE") {
            return Err(Error::Config("ca must be a PEM certificate".to_string()));
        }
        if self.client_certificate.is_some() != self.client_key.is_some() {
            return Err(Error::Config(
                "client certificate and key must be provided together".to_string(),
            ));
        }
        if self.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.mtu
            )));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn cipher(mut self, cipher: Cipher) -> Self {
        self.config.cipher = cipher;
        self
    }

    pub fn digest(mut self, digest: Digest) -> Self {
        self.config.digest = digest;
        self
    }

    pub fn client_certificate(mut self, certificate: &str, key: &str) -> Self {
        self.config.client_certificate = Some(certificate.to_string());
        self.config.client_key = Some(key.to_string());
        self
    }

    pub fn compression_framing(mut self, framing: CompressionFraming) -> Self {
        self.config.compression_framing = framing;
        self
    }

    pub fn tls_wrap(mut self, strategy: WrapStrategy, key: StaticKey) -> Self {
        self.config.tls_wrap = Some(TlsWrapConfig { strategy, key });
        self
    }

    /// Zero disables keep-alive pings
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Zero disables client-initiated renegotiation
    pub fn renegotiates_after(mut self, interval: Duration) -> Self {
        self.config.renegotiates_after = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn uses_pia_patches(mut self, enabled: bool) -> Self {
        self.config.uses_pia_patches = enabled;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn hard_reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.hard_reset_timeout = timeout;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn tls_server_name(mut self, name: &str) -> Self {
        self.config.tls_server_name = Some(name.to_string());
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
