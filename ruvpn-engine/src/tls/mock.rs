//! Scripted TLS channel for protocol tests
//!
//! [`ScriptedTls`] stands in for a real TLS engine: one handshake round
//! trip, then transparent pass-through in both directions. Tests script
//! the server side by feeding "ciphertext" (which is delivered verbatim as
//! plaintext once connected) and inspect what the session wrote through
//! the shared [`ScriptedTlsHandle`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{TlsChannel, TlsError};

/// Handshake bytes the scripted client emits on start
pub const CLIENT_HELLO: &[u8] = b"tls:client-hello";

/// Handshake bytes the scripted client emits after the server's reply
pub const CLIENT_FINISH: &[u8] = b"tls:client-finish";

#[derive(Default)]
struct ScriptState {
    started: bool,
    connected: bool,
    fail_on_connect: Option<TlsError>,
    cipher_out: VecDeque<Vec<u8>>,
    plain_out: VecDeque<Vec<u8>>,
    plain_written: Vec<Vec<u8>>,
}

/// Scripted in-memory TLS channel
pub struct ScriptedTls {
    state: Arc<Mutex<ScriptState>>,
}

/// Test-side handle observing and steering a [`ScriptedTls`]
#[derive(Clone)]
pub struct ScriptedTlsHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTls {
    /// A channel that completes its handshake on the first server bytes
    pub fn new() -> (Self, ScriptedTlsHandle) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        (
            Self {
                state: state.clone(),
            },
            ScriptedTlsHandle { state },
        )
    }

    /// A channel whose handshake fails with `error`
    pub fn failing(error: TlsError) -> (Self, ScriptedTlsHandle) {
        let (tls, handle) = Self::new();
        tls.state
            .lock()
            .expect("script lock poisoned")
            .fail_on_connect = Some(error);
        (tls, handle)
    }
}

impl ScriptedTlsHandle {
    /// Everything the session pushed as plaintext (auth blob, push requests)
    pub fn plain_written(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .expect("script lock poisoned")
            .plain_written
            .clone()
    }

    /// Concatenation of all plaintext the session wrote
    pub fn plain_written_bytes(&self) -> Vec<u8> {
        self.plain_written().concat()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().expect("script lock poisoned").connected
    }
}

impl TlsChannel for ScriptedTls {
    fn start(&mut self) -> Result<(), TlsError> {
        let mut state = self.state.lock().expect("script lock poisoned");
        state.started = true;
        state.cipher_out.push_back(CLIENT_HELLO.to_vec());
        Ok(())
    }

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let mut state = self.state.lock().expect("script lock poisoned");
        if !state.started {
            return Err(TlsError::Handshake("channel not started".to_string()));
        }
        if state.connected {
            // Transparent tunnel after the handshake
            state.plain_out.push_back(data.to_vec());
            return Ok(());
        }
        if let Some(error) = state.fail_on_connect.take() {
            return Err(error);
        }
        state.connected = true;
        state.cipher_out.push_back(CLIENT_FINISH.to_vec());
        Ok(())
    }

    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>, TlsError> {
        Ok(self
            .state
            .lock()
            .expect("script lock poisoned")
            .cipher_out
            .pop_front())
    }

    fn put_plain_text(&mut self, data: &[u8]) -> Result<(), TlsError> {
        let mut state = self.state.lock().expect("script lock poisoned");
        if !state.connected {
            return Err(TlsError::Handshake("handshake not complete".to_string()));
        }
        state.plain_written.push(data.to_vec());
        state.cipher_out.push_back(data.to_vec());
        Ok(())
    }

    fn pull_plain_text(&mut self) -> Result<Option<Vec<u8>>, TlsError> {
        Ok(self
            .state
            .lock()
            .expect("script lock poisoned")
            .plain_out
            .pop_front())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().expect("script lock poisoned").connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_handshake_flow() {
        let (mut tls, handle) = ScriptedTls::new();
        tls.start().unwrap();
        assert_eq!(tls.pull_cipher_text().unwrap().unwrap(), CLIENT_HELLO);
        assert!(!tls.is_connected());

        tls.put_cipher_text(b"tls:server-hello").unwrap();
        assert!(tls.is_connected());
        assert!(handle.is_connected());
        assert_eq!(tls.pull_cipher_text().unwrap().unwrap(), CLIENT_FINISH);
        assert!(tls.pull_cipher_text().unwrap().is_none());
    }

    #[test]
    fn test_transparent_after_handshake() {
        let (mut tls, handle) = ScriptedTls::new();
        tls.start().unwrap();
        tls.put_cipher_text(b"hs").unwrap();
        tls.pull_cipher_text().unwrap();
        tls.pull_cipher_text().unwrap();

        tls.put_plain_text(b"auth-blob").unwrap();
        assert_eq!(tls.pull_cipher_text().unwrap().unwrap(), b"auth-blob");
        assert_eq!(handle.plain_written(), vec![b"auth-blob".to_vec()]);

        tls.put_cipher_text(b"server-plain").unwrap();
        assert_eq!(tls.pull_plain_text().unwrap().unwrap(), b"server-plain");
    }

    #[test]
    fn test_failing_handshake() {
        let (mut tls, _) = ScriptedTls::failing(TlsError::ServerEku);
        tls.start().unwrap();
        assert!(matches!(
            tls.put_cipher_text(b"hs"),
            Err(TlsError::ServerEku)
        ));
    }

    #[test]
    fn test_plaintext_requires_handshake() {
        let (mut tls, _) = ScriptedTls::new();
        tls.start().unwrap();
        assert!(tls.put_plain_text(b"early").is_err());
    }
}
