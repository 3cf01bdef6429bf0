//! QUIC transport.
//!
//! Each filament connection maps to one QUIC connection carrying a single
//! bidirectional stream; frames are length-prefixed on that stream. Keeping
//! everything on one stream is what preserves per-connection frame order,
//! which the runtime's delivery guarantees depend on.
//!
//! Credentials come from a PEM cert/key pair on disk, or are minted
//! self-signed at bind time. The client accepts any server certificate —
//! chain validation is skipped, though handshake signatures are still
//! checked — which is acceptable for development and closed clusters only.

use crate::{ConnReceiver, ConnSender, Connection, Transport, TransportError};
use async_trait::async_trait;
use filament_core::EndpointAddr;
use quinn::{ClientConfig, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};

/// Server name presented during the QUIC handshake. The client does not
/// verify it.
const SERVER_NAME: &str = "filament";

/// Refuse frames larger than this; a longer length prefix means a corrupt
/// or hostile peer.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Tuning and certificate options for [`QuicTransport`].
#[derive(Clone, Debug)]
pub struct QuicOptions {
    /// PEM certificate chain path; self-signed when absent.
    pub cert_path: Option<PathBuf>,
    /// PEM private key path; self-signed when absent.
    pub key_path: Option<PathBuf>,
    /// Keep-alive ping interval.
    pub keep_alive: Duration,
    /// Idle timeout after which the connection is failed.
    pub idle_timeout: Duration,
}

impl Default for QuicOptions {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            keep_alive: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl QuicOptions {
    /// Uses a certificate chain and key from PEM files.
    pub fn with_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert.into());
        self.key_path = Some(key.into());
        self
    }
}

/// A QUIC endpoint serving as a filament transport.
pub struct QuicTransport {
    endpoint: Endpoint,
    addr: EndpointAddr,
}

impl QuicTransport {
    /// Binds an endpoint with default options.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::bind_with(addr, QuicOptions::default())
    }

    /// Binds an endpoint that can both accept and originate connections.
    pub fn bind_with(addr: SocketAddr, options: QuicOptions) -> Result<Self, TransportError> {
        let server = server_config(&options)?;
        let client = client_config(&options)?;

        let mut endpoint =
            Endpoint::server(server, addr).map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client);

        let local = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(%local, "quic transport listening");

        Ok(Self {
            endpoint,
            addr: EndpointAddr::new(local.to_string()),
        })
    }

    /// Closes the endpoint; peers observe connection failure.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn addr(&self) -> EndpointAddr {
        self.addr.clone()
    }

    async fn connect(&self, remote: &EndpointAddr) -> Result<Connection, TransportError> {
        let sa: SocketAddr = remote
            .as_str()
            .parse()
            .map_err(|_| TransportError::InvalidAddr(remote.as_str().to_string()))?;

        let connection = self
            .endpoint
            .connect(sa, SERVER_NAME)
            .map_err(|e| TransportError::Connect {
                addr: remote.as_str().to_string(),
                detail: e.to_string(),
            })?
            .await
            .map_err(|e| TransportError::Connect {
                addr: remote.as_str().to_string(),
                detail: e.to_string(),
            })?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        tracing::debug!(%sa, "quic connection opened");
        Ok(split(connection, send, recv))
    }

    async fn accept(&self) -> Result<Connection, TransportError> {
        let incoming = self.endpoint.accept().await.ok_or(TransportError::Shutdown)?;
        let connection = incoming
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        tracing::debug!(remote = %connection.remote_address(), "quic connection accepted");
        Ok(split(connection, send, recv))
    }
}

fn split(connection: quinn::Connection, send: SendStream, recv: RecvStream) -> Connection {
    (
        Box::new(QuicSender {
            _connection: connection.clone(),
            stream: send,
        }),
        Box::new(QuicReceiver {
            _connection: connection,
            stream: recv,
        }),
    )
}

struct QuicSender {
    // Held so the connection outlives whichever half is dropped first.
    _connection: quinn::Connection,
    stream: SendStream,
}

#[async_trait]
impl ConnSender for QuicSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let framed = filament_core::wire::length_prefix(frame);
        self.stream
            .write_all(&framed)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}

struct QuicReceiver {
    _connection: quinn::Connection,
    stream: RecvStream,
}

#[async_trait]
impl ConnReceiver for QuicReceiver {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(_)) => return Ok(None),
            Err(quinn::ReadExactError::ReadError(e)) => {
                return Err(TransportError::Io(e.to_string()));
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::Io(format!("oversized frame: {} bytes", len)));
        }

        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Some(buf))
    }
}

/// A certificate chain plus the private key that goes with it.
type Credentials = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn tls_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(err.to_string())
}

/// Assembles the server configuration from whichever credential source
/// the options name.
fn server_config(options: &QuicOptions) -> Result<ServerConfig, TransportError> {
    let (chain, key) = match (&options.cert_path, &options.key_path) {
        (Some(cert), Some(key)) => credentials_from_pem(cert, key)?,
        _ => generated_credentials()?,
    };
    let mut config = ServerConfig::with_single_cert(chain, key).map_err(tls_error)?;
    config.transport_config(tuning(options)?);
    Ok(config)
}

/// Mints a fresh self-signed certificate for this endpoint's lifetime.
fn generated_credentials() -> Result<Credentials, TransportError> {
    let minted =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).map_err(tls_error)?;
    let key = PrivateKeyDer::Pkcs8(minted.key_pair.serialize_der().into());
    Ok((vec![minted.cert.into()], key))
}

/// Reads a certificate chain and private key from PEM files.
fn credentials_from_pem(cert_path: &Path, key_path: &Path) -> Result<Credentials, TransportError> {
    let mut cert_reader = open_pem(cert_path)?;
    let chain = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| tls_error(format_args!("{}: {}", cert_path.display(), err)))?;
    if chain.is_empty() {
        return Err(tls_error(format_args!(
            "{}: no certificates in file",
            cert_path.display()
        )));
    }

    let mut key_reader = open_pem(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|err| tls_error(format_args!("{}: {}", key_path.display(), err)))?
        .ok_or_else(|| {
            tls_error(format_args!("{}: no private key in file", key_path.display()))
        })?;

    Ok((chain, key))
}

fn open_pem(path: &Path) -> Result<io::BufReader<fs::File>, TransportError> {
    fs::File::open(path)
        .map(io::BufReader::new)
        .map_err(|err| tls_error(format_args!("{}: {}", path.display(), err)))
}

/// Builds the client configuration around the [`TrustAnyServer`]
/// verifier.
fn client_config(options: &QuicOptions) -> Result<ClientConfig, TransportError> {
    let tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAnyServer::new()))
        .with_no_client_auth();

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(tls_error)?;
    let mut config = ClientConfig::new(Arc::new(quic));
    config.transport_config(tuning(options)?);
    Ok(config)
}

fn tuning(options: &QuicOptions) -> Result<Arc<TransportConfig>, TransportError> {
    let idle = options
        .idle_timeout
        .try_into()
        .map_err(|_| tls_error("idle timeout too large for quic"))?;
    let mut tuning = TransportConfig::default();
    tuning.keep_alive_interval(Some(options.keep_alive));
    tuning.max_idle_timeout(Some(idle));
    Ok(Arc::new(tuning))
}

/// A verifier that accepts any server certificate chain.
///
/// Handshake signatures are still verified against the configured crypto
/// provider, and the advertised scheme list is whatever that provider
/// supports. Development and closed clusters only.
#[derive(Debug)]
struct TrustAnyServer {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl TrustAnyServer {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for TrustAnyServer {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localhost_roundtrip() {
        let a = QuicTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = QuicTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.addr();

        let accept = tokio::spawn(async move { b.accept().await });

        let (mut a_tx, _a_rx) = a.connect(&b_addr).await.unwrap();
        a_tx.send(b"ping").await.unwrap();

        let (_b_tx, mut b_rx) = accept.await.unwrap().unwrap();
        assert_eq!(b_rx.recv().await.unwrap().unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_invalid_addr() {
        let a = QuicTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let result = a.connect(&EndpointAddr::new("not-a-socket-addr")).await;
        assert!(matches!(result, Err(TransportError::InvalidAddr(_))));
    }
}
