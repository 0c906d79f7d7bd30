//! Key-material handshake exchanged over the established TLS channel
//!
//! Once TLS is up, the client pushes a single blob carrying its key-exchange
//! randoms and credentials; the server answers with its own randoms and
//! options, followed by NUL-terminated control messages (`AUTH_FAILED`,
//! `PUSH_REPLY,...`). The inbound parser is re-entrant: TLS plaintext
//! arrives in arbitrary fragments.

use crate::prf::{KeySource, ServerKeySource};
use crate::secure::SecureBytes;
use crate::{Error, Result};

/// Fixed four-zero-byte prefix opening both directions of the exchange
const TLS_PREFIX: [u8; 4] = [0, 0, 0, 0];

/// Offset of the server randoms in the inbound blob
const SERVER_RANDOMS_OFFSET: usize = TLS_PREFIX.len();

/// Offset of the u16 options length in the inbound blob
const SERVER_OPTS_LEN_OFFSET: usize = SERVER_RANDOMS_OFFSET + 64;

/// Minimum inbound bytes before the header can be parsed
const SERVER_HEADER_MIN: usize = SERVER_OPTS_LEN_OFFSET + 2;

/// Builds the outbound key-material blob and incrementally parses the
/// server's reply.
pub struct Authenticator {
    key_source: KeySource,
    username: SecureBytes,
    password: SecureBytes,
    peer_info: String,
    inbound: SecureBytes,
    server: Option<ServerKeySource>,
    server_opts: Option<String>,
}

impl Authenticator {
    /// Create an authenticator with a fresh key source.
    ///
    /// Empty credentials produce zero-length username/password fields
    /// (certificate-only authentication).
    pub fn new(username: &str, password: &str) -> Self {
        Self::with_key_source(KeySource::random(), username, password)
    }

    /// Create with a fixed key source (scripted negotiations, tests)
    pub fn with_key_source(key_source: KeySource, username: &str, password: &str) -> Self {
        Self {
            key_source,
            username: SecureBytes::from(username.as_bytes()),
            password: SecureBytes::from(password.as_bytes()),
            peer_info: default_peer_info(),
            inbound: SecureBytes::new(),
            server: None,
            server_opts: None,
        }
    }

    /// The client-side randoms feeding key derivation
    pub fn key_source(&self) -> &KeySource {
        &self.key_source
    }

    /// The server randoms, once the reply header has been parsed
    pub fn server_key_source(&self) -> Option<&ServerKeySource> {
        self.server.as_ref()
    }

    /// The server options string, once the reply header has been parsed
    pub fn server_opts(&self) -> Option<&str> {
        self.server_opts.as_deref()
    }

    /// Serialize the outbound key-material + credentials blob
    pub fn request_blob(&self) -> SecureBytes {
        let mut blob = SecureBytes::with_capacity(256);
        blob.append(&TLS_PREFIX);
        blob.append(&self.key_source.pre_master);
        blob.append(&self.key_source.random1);
        blob.append(&self.key_source.random2);
        // Options: the single placeholder byte modern servers expect
        blob.append_u16(1);
        blob.append_u8(0);
        blob.append_length_prefixed(&self.username);
        blob.append_length_prefixed(&self.password);
        blob.append_length_prefixed(self.peer_info.as_bytes());
        blob
    }

    /// Feed decrypted TLS plaintext received from the server.
    ///
    /// Returns `Ok(true)` when the fixed header (randoms + options) became
    /// complete during this call.
    pub fn put_plain_text(&mut self, data: &[u8]) -> Result<bool> {
        self.inbound.append(data);
        if self.server.is_some() {
            return Ok(false);
        }

        let check = self.inbound.len().min(TLS_PREFIX.len());
        if self.inbound.as_slice()[..check] != TLS_PREFIX[..check] {
            return Err(Error::WrongControlDataPrefix);
        }
        if self.inbound.len() < SERVER_HEADER_MIN {
            return Ok(false);
        }

        let opts_len = u16::from_be_bytes([
            self.inbound[SERVER_OPTS_LEN_OFFSET],
            self.inbound[SERVER_OPTS_LEN_OFFSET + 1],
        ]) as usize;
        if self.inbound.len() < SERVER_HEADER_MIN + opts_len {
            return Ok(false);
        }

        let randoms = &self.inbound.as_slice()[SERVER_RANDOMS_OFFSET..SERVER_RANDOMS_OFFSET + 64];
        self.server = Some(ServerKeySource::new(&randoms[..32], &randoms[32..]));

        let opts = &self.inbound.as_slice()[SERVER_HEADER_MIN..SERVER_HEADER_MIN + opts_len];
        // Options are ASCII; servers commonly NUL-terminate them
        let opts = opts.strip_suffix(&[0]).unwrap_or(opts);
        self.server_opts = Some(String::from_utf8_lossy(opts).into_owned());

        self.inbound.drain_front(SERVER_HEADER_MIN + opts_len);
        Ok(true)
    }

    /// Drain complete NUL-terminated control messages that followed the
    /// header. Returns nothing until the header has been parsed.
    pub fn next_messages(&mut self) -> Vec<String> {
        if self.server.is_none() {
            return Vec::new();
        }
        let mut messages = Vec::new();
        while let Some((message, next)) = self.inbound.null_terminated_string(0) {
            self.inbound.drain_front(next);
            // Trailing newlines are padding, not content
            let message = message.trim_end_matches(['\r', '\n']).to_string();
            if !message.is_empty() {
                messages.push(message);
            }
        }
        messages
    }
}

/// Peer info advertised to the server alongside the credentials
fn default_peer_info() -> String {
    format!(
        "IV_VER=2.4\nIV_PLAT={}\nIV_PROTO=2\nIV_NCP=2\nIV_LZO_STUB=1\nIV_COMP_STUB=1\n",
        std::env::consts::OS
    )
}
