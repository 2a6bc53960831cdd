//! Record-layer interface the connection state machine drives, and the
//! rustls-backed implementation of it.
//!
//! The engine never sees TLS internals: a [`Session`] either wants more wire
//! bytes, wants a flight sent, or is done handshaking; after that it turns
//! wire bytes into plaintext and plaintext into records. Any failure closes
//! the connection without an HTTP response.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("record processing failed: {0}")]
    Record(String),
    #[error("certificate material rejected: {0}")]
    Material(String),
}

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Wait for more bytes from the peer.
    WantRecv,
    /// Transmit the bytes the session just produced.
    WantSend,
    /// The handshake is finished; switch to record I/O.
    Complete,
}

/// One TLS session, paired by slot index with its connection.
pub trait Session: Send {
    /// Drive the handshake. `input` carries bytes just received (empty when
    /// re-entering after a completed send). On [`HandshakeStep::WantSend`]
    /// the flight to transmit has been written into `out`.
    fn advance(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<HandshakeStep, TlsError>;

    /// Decrypt received wire bytes, appending plaintext to `out`. Zero
    /// plaintext bytes is normal (a partial record, or post-handshake
    /// traffic).
    fn decrypt(&mut self, wire: &[u8], out: &mut Vec<u8>) -> Result<(), TlsError>;

    /// Encrypt one plaintext window, appending records to `out`.
    fn encrypt(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), TlsError>;
}

/// Creates one [`Session`] per accepted connection.
pub trait Acceptor: Send + Sync {
    fn session(&self) -> Result<Box<dyn Session>, TlsError>;
}

#[cfg(feature = "tls")]
pub use rustls_backend::TlsContext;

#[cfg(feature = "tls")]
mod rustls_backend {
    use std::fs;
    use std::io::{self, Read, Write};
    use std::path::Path;
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::{ServerConfig, ServerConnection};

    use super::{Acceptor, HandshakeStep, Session, TlsError};

    /// Shared server-side TLS configuration; sessions are cheap clones off
    /// the `Arc`'d config.
    pub struct TlsContext {
        config: Arc<ServerConfig>,
    }

    impl TlsContext {
        /// Build from PEM files. `cert_name` / `key_name` pick the PEM
        /// section labels to read; non-standard labels are re-labelled to the
        /// standard ones before parsing so bundles with custom markers work.
        pub fn from_files(
            cert: &Path,
            key: &Path,
            cert_name: &str,
            key_name: &str,
        ) -> Result<TlsContext, TlsError> {
            let certs = load_certs(cert, cert_name)?;
            let key = load_key(key, key_name)?;
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| TlsError::Material(e.to_string()))?;
            Ok(TlsContext {
                config: Arc::new(config),
            })
        }
    }

    impl Acceptor for TlsContext {
        fn session(&self) -> Result<Box<dyn Session>, TlsError> {
            let conn = ServerConnection::new(self.config.clone())
                .map_err(|e| TlsError::Handshake(e.to_string()))?;
            Ok(Box::new(RustlsSession { conn }))
        }
    }

    struct RustlsSession {
        conn: ServerConnection,
    }

    impl RustlsSession {
        /// Feed wire bytes through the record layer.
        fn feed(&mut self, wire: &[u8]) -> Result<(), TlsError> {
            let mut cursor = io::Cursor::new(wire);
            while (cursor.position() as usize) < wire.len() {
                let n = self
                    .conn
                    .read_tls(&mut cursor)
                    .map_err(|e| TlsError::Record(e.to_string()))?;
                if n == 0 {
                    break;
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| TlsError::Record(e.to_string()))?;
            }
            Ok(())
        }

        fn flush_records(&mut self, out: &mut Vec<u8>) -> Result<(), TlsError> {
            while self.conn.wants_write() {
                self.conn
                    .write_tls(out)
                    .map_err(|e| TlsError::Record(e.to_string()))?;
            }
            Ok(())
        }
    }

    impl Session for RustlsSession {
        fn advance(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<HandshakeStep, TlsError> {
            if !input.is_empty() {
                self.feed(input)
                    .map_err(|e| TlsError::Handshake(e.to_string()))?;
            }
            out.clear();
            if self.conn.wants_write() {
                self.flush_records(out)?;
                return Ok(HandshakeStep::WantSend);
            }
            if self.conn.is_handshaking() {
                Ok(HandshakeStep::WantRecv)
            } else {
                Ok(HandshakeStep::Complete)
            }
        }

        fn decrypt(&mut self, wire: &[u8], out: &mut Vec<u8>) -> Result<(), TlsError> {
            self.feed(wire)?;
            let mut chunk = [0u8; 4096];
            loop {
                match self.conn.reader().read(&mut chunk) {
                    Ok(0) => break, // clean close from the peer
                    Ok(n) => out.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(TlsError::Record(e.to_string())),
                }
            }
            Ok(())
        }

        fn encrypt(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), TlsError> {
            self.conn
                .writer()
                .write_all(plain)
                .map_err(|e| TlsError::Record(e.to_string()))?;
            self.flush_records(out)
        }
    }

    fn read_pem(path: &Path, section: &str, standard: &str) -> Result<String, TlsError> {
        let text = fs::read_to_string(path)
            .map_err(|e| TlsError::Material(format!("{}: {}", path.display(), e)))?;
        if section == standard {
            return Ok(text);
        }
        let begin = format!("-----BEGIN {}-----", section);
        let end = format!("-----END {}-----", section);
        if !text.contains(&begin) {
            return Err(TlsError::Material(format!(
                "no `{}` section in {}",
                section,
                path.display()
            )));
        }
        Ok(text
            .replace(&begin, &format!("-----BEGIN {}-----", standard))
            .replace(&end, &format!("-----END {}-----", standard)))
    }

    fn load_certs(path: &Path, section: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let pem = read_pem(path, section, "CERTIFICATE")?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::Material(e.to_string()))?;
        if certs.is_empty() {
            return Err(TlsError::Material(format!(
                "no certificates in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn load_key(path: &Path, section: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
        let pem = read_pem(path, section, "PRIVATE KEY")?;
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .map_err(|e| TlsError::Material(e.to_string()))?
            .ok_or_else(|| TlsError::Material(format!("no private key in {}", path.display())))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted session for exercising the state machine without real
    //! cryptography: identity record layer, configurable handshake flights.

    use std::collections::VecDeque;

    use super::{Acceptor, HandshakeStep, Session, TlsError};

    /// One scripted handshake reaction, consumed per `advance` call.
    pub enum Scripted {
        WantRecv,
        WantSend(Vec<u8>),
        Complete,
        Fail,
    }

    pub struct ScriptSession {
        pub steps: VecDeque<Scripted>,
        pub decrypt_log: Vec<usize>,
        pub encrypt_log: Vec<usize>,
    }

    impl ScriptSession {
        pub fn new(steps: Vec<Scripted>) -> Self {
            ScriptSession {
                steps: steps.into(),
                decrypt_log: Vec::new(),
                encrypt_log: Vec::new(),
            }
        }

        /// A session whose handshake is already over.
        pub fn established() -> Self {
            Self::new(vec![])
        }
    }

    impl Session for ScriptSession {
        fn advance(&mut self, _input: &[u8], out: &mut Vec<u8>) -> Result<HandshakeStep, TlsError> {
            out.clear();
            match self.steps.pop_front() {
                None => Ok(HandshakeStep::Complete),
                Some(Scripted::WantRecv) => Ok(HandshakeStep::WantRecv),
                Some(Scripted::WantSend(bytes)) => {
                    out.extend_from_slice(&bytes);
                    Ok(HandshakeStep::WantSend)
                }
                Some(Scripted::Complete) => Ok(HandshakeStep::Complete),
                Some(Scripted::Fail) => Err(TlsError::Handshake("scripted failure".into())),
            }
        }

        fn decrypt(&mut self, wire: &[u8], out: &mut Vec<u8>) -> Result<(), TlsError> {
            self.decrypt_log.push(wire.len());
            out.extend_from_slice(wire);
            Ok(())
        }

        fn encrypt(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), TlsError> {
            self.encrypt_log.push(plain.len());
            out.extend_from_slice(plain);
            Ok(())
        }
    }

    /// Acceptor handing out already-established identity sessions.
    pub struct ScriptAcceptor;

    impl Acceptor for ScriptAcceptor {
        fn session(&self) -> Result<Box<dyn Session>, TlsError> {
            Ok(Box::new(ScriptSession::established()))
        }
    }
}
