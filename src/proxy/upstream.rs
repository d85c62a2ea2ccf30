//! Upstream mTLS client and connection pool.
//!
//! Every relayed request checks out an exclusively-owned connection: either
//! an idle pooled one or a freshly dialed one. Check-in is only accepted for
//! connections the relay proved clean (fully-drained buffered response, or a
//! `[DONE]`-terminated stream with no trailing bytes); anything else is
//! dropped so a pooled connection never carries unread data. Idle
//! connections expire after a fixed timeout so stale mTLS sessions are not
//! kept alive indefinitely.

use crate::error::{Error, Result};
use crate::proxy::types::{RelayError, RelayResult};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Client-side TLS material for authenticating against the upstream.
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl UpstreamTls {
    /// Load the client certificate/key pair and the upstream CA into a
    /// rustls client configuration.
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        ca_path: Option<&Path>,
        server_name: &str,
        verify_hostname: bool,
    ) -> Result<Self> {
        let certs = load_certificates(cert_path)?;
        if certs.is_empty() {
            return Err(Error::certificate(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }
        let key = load_private_key(key_path)?;

        let mut roots = RootCertStore::empty();
        if let Some(ca_path) = ca_path {
            for cert in load_certificates(ca_path)? {
                roots.add(cert)?;
            }
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        if !verify_hostname {
            // Development escape hatch for upstreams with self-signed or
            // mismatched certificates. The client certificate is still sent.
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoServerVerification::new()));
        }

        let server_name = ServerName::try_from(server_name.to_string())?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        Error::certificate(format!("no private key found in {}", path.display()))
    })
}

/// One exclusively-owned HTTP/1 connection to the upstream.
///
/// The hyper connection driver runs in its own task and terminates when the
/// sender half is dropped, so an un-pooled connection cannot leak.
#[derive(Debug)]
pub struct UpstreamConnection {
    sender: http1::SendRequest<Full<Bytes>>,
}

impl UpstreamConnection {
    /// Issue one request on this connection.
    pub async fn send(
        &mut self,
        request: Request<Full<Bytes>>,
    ) -> hyper::Result<Response<Incoming>> {
        self.sender.ready().await?;
        self.sender.send_request(request).await
    }

    /// Whether the transport is still open for another exchange.
    pub fn is_reusable(&self) -> bool {
        !self.sender.is_closed()
    }
}

struct IdleConnection {
    connection: UpstreamConnection,
    since: Instant,
}

/// Pool of idle authenticated connections to a single upstream target.
pub struct UpstreamPool {
    authority: String,
    tls: Option<UpstreamTls>,
    idle: Mutex<Vec<IdleConnection>>,
    idle_timeout: Duration,
}

impl UpstreamPool {
    /// `authority` is the `host:port` dialed for every connection. `tls`
    /// of `None` speaks plain HTTP, used by the test double.
    pub fn new(authority: String, tls: Option<UpstreamTls>, idle_timeout: Duration) -> Self {
        Self {
            authority,
            tls,
            idle: Mutex::new(Vec::new()),
            idle_timeout,
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Hand out an exclusively-owned connection, reusing an idle one when a
    /// live, unexpired candidate exists.
    pub async fn checkout(&self) -> RelayResult<UpstreamConnection> {
        {
            let mut idle = self.idle.lock();
            while let Some(entry) = idle.pop() {
                if entry.since.elapsed() < self.idle_timeout && entry.connection.is_reusable() {
                    tracing::debug!(authority = %self.authority, "reusing pooled upstream connection");
                    return Ok(entry.connection);
                }
                // Expired or closed while idle: fall through and drop it.
            }
        }

        self.dial().await
    }

    /// Return a connection to the pool. Callers only invoke this after
    /// proving the connection clean; a closed transport is still refused.
    pub fn check_in(&self, connection: UpstreamConnection) {
        if !connection.is_reusable() {
            return;
        }
        self.idle.lock().push(IdleConnection {
            connection,
            since: Instant::now(),
        });
    }

    /// Number of idle connections currently pooled.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Close idle connections past their expiry or dead underneath us.
    /// Checkout also discards these lazily; the periodic sweep keeps stale
    /// mTLS sessions from sitting open between requests.
    pub fn prune_expired(&self) {
        let mut idle = self.idle.lock();
        idle.retain(|entry| {
            entry.since.elapsed() < self.idle_timeout && entry.connection.is_reusable()
        });
    }

    async fn dial(&self) -> RelayResult<UpstreamConnection> {
        let tcp = TcpStream::connect(&self.authority).await.map_err(|e| {
            RelayError::UpstreamUnavailable(format!(
                "connect to {} failed: {e}",
                self.authority
            ))
        })?;
        let _ = tcp.set_nodelay(true);

        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|e| classify_handshake_error(&self.authority, e))?;
                tracing::debug!(authority = %self.authority, "established mTLS upstream connection");
                self.handshake_http(stream).await
            }
            None => self.handshake_http(tcp).await,
        }
    }

    async fn handshake_http<S>(&self, stream: S) -> RelayResult<UpstreamConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| {
                RelayError::UpstreamUnavailable(format!(
                    "HTTP handshake with {} failed: {e}",
                    self.authority
                ))
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "upstream connection ended with error");
            }
        });

        Ok(UpstreamConnection { sender })
    }
}

/// tokio-rustls surfaces handshake failures as `InvalidData` IO errors
/// wrapping the rustls error; those are authentication failures
/// (certificate rejected, CA mismatch, expiry). Anything else is transport.
fn classify_handshake_error(authority: &str, error: std::io::Error) -> RelayError {
    if error.kind() == std::io::ErrorKind::InvalidData {
        RelayError::UpstreamAuth(format!("TLS handshake with {authority} failed: {error}"))
    } else {
        RelayError::UpstreamUnavailable(format!(
            "connection to {authority} lost during TLS handshake: {error}"
        ))
    }
}

/// Certificate verifier that accepts any server certificate. Signature
/// checks still run against the real algorithms so the handshake remains
/// well-formed.
#[derive(Debug)]
struct NoServerVerification {
    schemes: Vec<SignatureScheme>,
}

impl NoServerVerification {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::ErrorKind;
    use std::io::Write;

    #[test]
    fn handshake_error_classification() {
        let auth = classify_handshake_error(
            "upstream:443",
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad certificate"),
        );
        assert_eq!(auth.kind(), ErrorKind::UpstreamAuthError);

        let transport = classify_handshake_error(
            "upstream:443",
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        );
        assert_eq!(transport.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn load_rejects_empty_cert_file() {
        let mut cert = tempfile::NamedTempFile::new().expect("temp cert");
        let mut key = tempfile::NamedTempFile::new().expect("temp key");
        cert.write_all(b"").expect("write");
        key.write_all(b"").expect("write");

        let result = UpstreamTls::load(cert.path(), key.path(), None, "localhost", true);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn checkout_dials_when_pool_is_empty() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            // Accept and hold the socket so the HTTP handshake succeeds.
            let _socket = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let pool = UpstreamPool::new(addr.to_string(), None, Duration::from_secs(90));
        let connection = pool.checkout().await.expect("checkout");
        assert!(connection.is_reusable());
        assert_eq!(pool.idle_len(), 0);

        pool.check_in(connection);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn checkout_fails_fast_when_upstream_is_down() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let pool = UpstreamPool::new(addr.to_string(), None, Duration::from_secs(90));
        let err = pool.checkout().await.expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn expired_idle_connections_are_not_reused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        // Zero idle timeout: everything checked in is immediately stale.
        let pool = UpstreamPool::new(addr.to_string(), None, Duration::from_millis(0));
        let connection = pool.checkout().await.expect("checkout");
        pool.check_in(connection);
        assert_eq!(pool.idle_len(), 1);

        let _fresh = pool.checkout().await.expect("re-checkout");
        // The stale entry was discarded rather than handed out.
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn prune_closes_expired_idle_connections() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let pool = UpstreamPool::new(addr.to_string(), None, Duration::from_millis(0));
        let connection = pool.checkout().await.expect("checkout");
        pool.check_in(connection);
        assert_eq!(pool.idle_len(), 1);

        pool.prune_expired();
        assert_eq!(pool.idle_len(), 0);
    }
}
