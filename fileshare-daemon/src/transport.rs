//! Secure transport: QUIC endpoint (listener and dialer) with an ephemeral self-signed identity.
//!
//! Every process start generates a fresh certificate. Dialers accept any server
//! certificate, so the channel is encrypted but the peer is not authenticated.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connection, Endpoint, Incoming};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::TransportError;

/// Application protocol negotiated on every connection.
pub const ALPN: &[u8] = b"fileshare/1";
/// Name presented in the certificate and used as SNI when dialing.
const SERVER_NAME: &str = "fileshare";

/// Self-signed certificate and key, generated once per process start.
pub struct Identity {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl Identity {
    pub fn generate_ephemeral() -> Result<Self, TransportError> {
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
        Ok(Self {
            cert: certified.cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()),
        })
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    fn server_config(&self) -> Result<quinn::ServerConfig, TransportError> {
        let provider = Arc::new(ring::default_provider());
        let mut tls = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(
                vec![self.cert.clone()],
                PrivateKeyDer::Pkcs8(self.key.clone_key()),
            )
            .map_err(tls_error)?;
        tls.alpn_protocols = vec![ALPN.to_vec()];
        let crypto = QuicServerConfig::try_from(tls).map_err(tls_error)?;
        Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
    }
}

fn client_config() -> Result<quinn::ClientConfig, TransportError> {
    let provider = Arc::new(ring::default_provider());
    let mut tls = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let crypto = QuicClientConfig::try_from(tls).map_err(tls_error)?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

fn tls_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

/// Skips chain and name validation; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// A QUIC endpoint. A listening transport can also dial.
#[derive(Clone)]
pub struct Transport {
    endpoint: Endpoint,
}

impl Transport {
    /// Bind the listening endpoint. A bind failure here aborts service start.
    pub fn listen(addr: SocketAddr, identity: &Identity) -> Result<Self, TransportError> {
        let mut endpoint = Endpoint::server(identity.server_config()?, addr)
            .map_err(|source| TransportError::Listen { addr, source })?;
        endpoint.set_default_client_config(client_config()?);
        debug!(%addr, "quic endpoint listening");
        Ok(Self { endpoint })
    }

    /// Client-only endpoint for outbound sends.
    pub fn dialer(bind: SocketAddr) -> Result<Self, TransportError> {
        let mut endpoint =
            Endpoint::client(bind).map_err(|source| TransportError::Listen { addr: bind, source })?;
        endpoint.set_default_client_config(client_config()?);
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Next inbound connection attempt; `None` once the endpoint is closed.
    /// The handshake is finished by awaiting the returned `Incoming`.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub async fn dial(&self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let connecting = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| TransportError::Dial {
                addr,
                reason: e.to_string(),
            })?;
        connecting.await.map_err(|e| TransportError::Dial {
            addr,
            reason: e.to_string(),
        })
    }

    /// Refuse new inbound connections; established ones keep running.
    pub fn stop_accepting(&self) {
        self.endpoint.set_server_config(None);
    }

    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }
}

/// One bidirectional byte stream multiplexed over a connection.
pub struct BiStream {
    pub recv: Box<dyn AsyncRead + Send + Unpin>,
    pub send: Box<dyn AsyncWrite + Send + Unpin>,
}

impl BiStream {
    pub fn new<R, W>(recv: R, send: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            recv: Box::new(recv),
            send: Box::new(send),
        }
    }

    /// Finish the send side. Unread inbound data is discarded when the stream is dropped.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.send.shutdown().await
    }
}

/// Open one stream on an established connection.
pub async fn open_stream(conn: &Connection) -> Result<BiStream, TransportError> {
    let (send, recv) = conn.open_bi().await?;
    Ok(BiStream::new(recv, send))
}

/// Wait for the peer to open a stream.
pub async fn accept_stream(conn: &Connection) -> Result<BiStream, TransportError> {
    let (send, recv) = conn.accept_bi().await?;
    Ok(BiStream::new(recv, send))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quinn::VarInt;
    use tokio::io::AsyncReadExt;

    #[test]
    fn identity_is_fresh_each_time() {
        let a = Identity::generate_ephemeral().unwrap();
        let b = Identity::generate_ephemeral().unwrap();
        assert!(!a.certificate().is_empty());
        assert_ne!(a.certificate().as_ref(), b.certificate().as_ref());
    }

    #[tokio::test]
    async fn listen_fails_when_port_taken() {
        let identity = Identity::generate_ephemeral().unwrap();
        let first = Transport::listen("127.0.0.1:0".parse().unwrap(), &identity).unwrap();
        let taken = first.local_addr().unwrap();
        assert!(matches!(
            Transport::listen(taken, &identity),
            Err(TransportError::Listen { .. })
        ));
    }

    #[tokio::test]
    async fn dial_open_and_echo_stream() {
        let identity = Identity::generate_ephemeral().unwrap();
        let server = Transport::listen("127.0.0.1:0".parse().unwrap(), &identity).unwrap();
        let server_addr = server.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let conn = server.accept().await.unwrap().await.unwrap();
            let mut stream = accept_stream(&conn).await.unwrap();
            let mut buf = [0u8; 5];
            stream.recv.read_exact(&mut buf).await.unwrap();
            stream.send.write_all(&buf).await.unwrap();
            stream.close().await.unwrap();
            conn.closed().await;
        });

        let client = Transport::dialer("127.0.0.1:0".parse().unwrap()).unwrap();
        let conn = client.dial(server_addr).await.unwrap();
        let mut stream = open_stream(&conn).await.unwrap();
        stream.send.write_all(b"hello").await.unwrap();
        let mut echoed = Vec::new();
        stream.recv.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello");
        conn.close(VarInt::from_u32(0), b"done");
        accept.await.unwrap();
    }
}
