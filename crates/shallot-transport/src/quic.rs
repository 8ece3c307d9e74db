//! QUIC/TLS 1.3 endpoints for the overlay's services.
//!
//! Every service owns one [`QuicEndpoint`] bound to its port. The endpoint
//! answers inbound requests and also originates the service's outbound ones,
//! so a relay forwards from the same socket it listens on.
//!
//! Certificates are self-signed and not verified. TLS only encrypts the hop;
//! nothing in the overlay authenticates peers.
//!
//! ## Exchange
//!
//! 1. The client connects and opens one bidirectional stream.
//! 2. It writes one length-prefixed [`Request`] and finishes the stream.
//! 3. The server writes one length-prefixed [`Response`] and finishes.
//! 4. The client closes the connection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use shallot_onion::forward::{ForwardError, HopTransport};
use shallot_types::network::MessageBody;
use shallot_types::Address;
use tracing::{debug, info, warn};

use crate::messages::{decode, encode, Request, Response, MAX_FRAME_SIZE};
use crate::service::{deliver_message, Fabric, RequestHandler, RequestSender, ServiceHandle};
use crate::{Result, TransportError};

/// ALPN protocol identifier.
pub const ALPN_SHALLOT_V1: &[u8] = b"shallot/1";

/// TLS server name presented on connect. Not verified.
pub const SERVER_NAME: &str = "shallot-node";

/// Default QUIC idle timeout in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 30_000;

/// Default maximum number of concurrent bidirectional streams.
pub const DEFAULT_MAX_BI_STREAMS: u32 = 128;

/// Configuration for one endpoint.
#[derive(Clone, Debug)]
pub struct QuicConfig {
    /// Local address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_bi_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_bi_streams: DEFAULT_MAX_BI_STREAMS,
        }
    }
}

/// A QUIC endpoint that both serves and sends.
pub struct QuicEndpoint {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl QuicEndpoint {
    /// Bind an endpoint with a fresh self-signed certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if TLS configuration fails.
    /// Returns [`TransportError::Io`] if the socket cannot be bound.
    pub fn new(config: QuicConfig) -> Result<Self> {
        let server_config = build_server_config(config.idle_timeout_ms, config.max_bi_streams)?;
        let client_config = build_client_config(config.idle_timeout_ms)?;

        let mut endpoint = Endpoint::server(server_config, config.bind_addr)
            .map_err(|e| TransportError::Io(format!("bind {}: {e}", config.bind_addr)))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        info!(%local_addr, "QUIC endpoint bound");

        Ok(Self {
            endpoint,
            local_addr,
        })
    }

    /// The socket address this endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Answer requests with `handler` until the endpoint is closed.
    pub async fn serve<H: RequestHandler>(self: Arc<Self>, handler: Arc<H>) {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(error = %e, "Inbound handshake failed");
                        return;
                    }
                };
                serve_connection(connection, handler).await;
            });
        }
        debug!(local_addr = %self.local_addr, "Endpoint closed, serve loop exiting");
    }

    /// Send one request to `addr` and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the peer cannot be reached,
    /// and [`TransportError::Io`] if the exchange is cut short.
    pub async fn request(&self, addr: SocketAddr, request: &Request) -> Result<Response> {
        let connection = self.connect(addr).await?;
        let result = exchange(&connection, request).await;
        connection.close(quinn::VarInt::from_u32(0), b"done");
        result
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Connection> {
        let connecting = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::Connection(format!("{addr}: {e}")))?;

        debug!(remote = %connection.remote_address(), "QUIC connection established");
        Ok(connection)
    }

    /// Close the endpoint and every connection on it.
    pub fn close(&self, error_code: u32, reason: &[u8]) {
        self.endpoint
            .close(quinn::VarInt::from_u32(error_code), reason);
    }
}

impl std::fmt::Debug for QuicEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicEndpoint")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn exchange(connection: &Connection, request: &Request) -> Result<Response> {
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    send_frame(&mut send, &encode(request)?).await?;
    send.finish()
        .map_err(|e| TransportError::Io(e.to_string()))?;

    let bytes = recv_frame(&mut recv, MAX_FRAME_SIZE).await?;
    decode(&bytes)
}

async fn serve_connection<H: RequestHandler>(connection: Connection, handler: Arc<H>) {
    let remote = connection.remote_address();
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!(%remote, reason = %e, "Connection finished");
                return;
            }
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = serve_stream(send, recv, handler.as_ref()).await {
                warn!(%remote, error = %e, "Failed to answer request");
            }
        });
    }
}

async fn serve_stream<H: RequestHandler>(
    mut send: SendStream,
    mut recv: RecvStream,
    handler: &H,
) -> Result<()> {
    let bytes = recv_frame(&mut recv, MAX_FRAME_SIZE).await?;
    let response = match decode::<Request>(&bytes) {
        Ok(request) => handler.handle(request).await,
        Err(e) => Response::error(e),
    };
    send_frame(&mut send, &encode(&response)?).await?;
    send.finish()
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}

/// Write `[length:4 LE][data:length]`.
pub async fn send_frame(stream: &mut SendStream, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        TransportError::InvalidFrame("message too large for 4-byte length prefix".to_string())
    })?;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    stream
        .write_all(data)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}

/// Read `[length:4 LE][data:length]`, rejecting lengths above `max_size`.
pub async fn recv_frame(stream: &mut RecvStream, max_size: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > max_size {
        return Err(TransportError::InvalidFrame(format!(
            "message length {len} exceeds maximum {max_size}"
        )));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(buf)
}

/// A service's outbound side: its own endpoint plus the host every address
/// resolves to.
#[derive(Clone, Debug)]
pub struct QuicTransport {
    endpoint: Arc<QuicEndpoint>,
    host: IpAddr,
}

impl QuicTransport {
    pub fn new(endpoint: Arc<QuicEndpoint>, host: IpAddr) -> Self {
        Self { endpoint, host }
    }

    pub fn endpoint(&self) -> &Arc<QuicEndpoint> {
        &self.endpoint
    }

    /// Socket address for an overlay address. Addresses are ports.
    pub fn socket_addr(&self, to: Address) -> Result<SocketAddr> {
        let port = to
            .port()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(SocketAddr::new(self.host, port))
    }

    async fn send(&self, to: Address, request: Request) -> Result<Response> {
        let addr = self.socket_addr(to)?;
        self.endpoint.request(addr, &request).await
    }
}

impl RequestSender for QuicTransport {
    fn request(
        &self,
        to: Address,
        request: Request,
    ) -> impl std::future::Future<Output = Result<Response>> + Send {
        self.send(to, request)
    }
}

impl HopTransport for QuicTransport {
    fn deliver(
        &self,
        to: Address,
        body: MessageBody,
    ) -> impl std::future::Future<Output = std::result::Result<(), ForwardError>> + Send {
        deliver_message(self, to, body)
    }
}

/// Services on one host, one UDP port each.
#[derive(Clone, Debug)]
pub struct QuicFabric {
    pub host: IpAddr,
    pub idle_timeout_ms: u32,
}

impl Default for QuicFabric {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl Fabric for QuicFabric {
    type Client = QuicTransport;

    fn open(&self, at: Address) -> Result<Self::Client> {
        let port = at
            .port()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let endpoint = QuicEndpoint::new(QuicConfig {
            bind_addr: SocketAddr::new(self.host, port),
            idle_timeout_ms: self.idle_timeout_ms,
            ..QuicConfig::default()
        })?;
        Ok(QuicTransport::new(Arc::new(endpoint), self.host))
    }

    async fn serve<H: RequestHandler>(
        &self,
        client: &Self::Client,
        at: Address,
        handler: Arc<H>,
    ) -> Result<ServiceHandle> {
        let endpoint = Arc::clone(client.endpoint());
        let task = tokio::spawn(Arc::clone(&endpoint).serve(handler));
        Ok(ServiceHandle::quic(at, endpoint, task))
    }
}

// ---------------------------------------------------------------------------
// TLS / certificate helpers
// ---------------------------------------------------------------------------

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;

    let params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-signed cert generation failed: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((cert_der, key_der))
}

fn build_transport_config(idle_timeout_ms: u32, max_bi_streams: u32) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_millis(u64::from(idle_timeout_ms)))
            .map_err(|e| TransportError::Tls(format!("idle timeout config failed: {e}")))?,
    ));
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(max_bi_streams));
    Ok(transport)
}

fn build_server_config(idle_timeout_ms: u32, max_bi_streams: u32) -> Result<ServerConfig> {
    let (cert_der, key_der) = generate_self_signed_cert()?;

    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS version config failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(format!("server TLS config failed: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_SHALLOT_V1.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(build_transport_config(
        idle_timeout_ms,
        max_bi_streams,
    )?));

    Ok(server_config)
}

fn build_client_config(idle_timeout_ms: u32) -> Result<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS version config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    tls_config.alpn_protocols = vec![ALPN_SHALLOT_V1.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto config failed: {e}")))?,
    ));
    // Outbound connections give up on a silent peer after the same timeout.
    client_config.transport_config(Arc::new(build_transport_config(
        idle_timeout_ms,
        DEFAULT_MAX_BI_STREAMS,
    )?));

    Ok(client_config)
}

/// Accepts any server certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_alpn_value() {
        assert_eq!(ALPN_SHALLOT_V1, b"shallot/1");
    }

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.max_bi_streams, DEFAULT_MAX_BI_STREAMS);
        assert!(config.bind_addr.ip().is_loopback());
    }

    #[test]
    fn test_generate_self_signed_cert() {
        let (cert, key) = generate_self_signed_cert().expect("cert generation");
        assert!(!cert.is_empty());
        match &key {
            PrivateKeyDer::Pkcs8(k) => assert!(!k.secret_pkcs8_der().is_empty()),
            _ => unreachable!("expected PKCS8 key"),
        }
    }

    #[test]
    fn test_build_configs_succeed() {
        assert!(build_server_config(DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_BI_STREAMS).is_ok());
        assert!(build_client_config(DEFAULT_IDLE_TIMEOUT_MS).is_ok());
    }

    #[tokio::test]
    async fn test_socket_addr_uses_port() {
        let endpoint = Arc::new(QuicEndpoint::new(QuicConfig::default()).expect("bind"));
        let transport = QuicTransport::new(Arc::clone(&endpoint), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let addr = transport
            .socket_addr(Address::from_port(4002))
            .expect("port");
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 4002)));

        let too_big = Address::new(70_000).expect("ten digits");
        assert!(matches!(
            transport.socket_addr(too_big),
            Err(TransportError::Unreachable(_))
        ));
        endpoint.close(0, b"test");
    }

    struct Counter {
        seen: AtomicUsize,
    }

    impl RequestHandler for Counter {
        async fn handle(&self, request: Request) -> Response {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match request {
                Request::Status => Response::Live,
                Request::Message(_) => Response::Ok,
                other => Response::unsupported(&other),
            }
        }
    }

    #[tokio::test]
    async fn test_request_over_loopback() {
        let server = Arc::new(QuicEndpoint::new(QuicConfig::default()).expect("server"));
        let client = QuicEndpoint::new(QuicConfig::default()).expect("client");
        let handler = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        let task = tokio::spawn(Arc::clone(&server).serve(Arc::clone(&handler)));

        let resp = client
            .request(server.local_addr(), &Request::Status)
            .await
            .expect("status");
        assert_eq!(resp, Response::Live);

        let resp = client
            .request(server.local_addr(), &Request::GetNodeRegistry)
            .await
            .expect("registry");
        assert!(matches!(resp, Response::Error { .. }));
        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);

        server.close(0, b"test");
        task.await.expect("serve loop exits on close");
        client.close(0, b"test");
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let client = QuicEndpoint::new(QuicConfig {
            idle_timeout_ms: 500,
            ..QuicConfig::default()
        })
        .expect("client");
        // Bind and drop a socket to find a port nobody is listening on.
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .and_then(|s| s.local_addr())
            .expect("probe")
            .port();
        let result = client
            .request(SocketAddr::from(([127, 0, 0, 1], port)), &Request::Status)
            .await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
