//! The TLS transport between relays.
//!
//! Every node presents a throwaway self-signed certificate generated at
//! startup.  Peers do not verify it: transport identity is meaningless
//! here, since every hop is authenticated end-to-end by the tunnel
//! handshake.  TLS provides confidentiality and integrity on the link,
//! nothing more.

use anyhow::Context;
use async_trait::async_trait;
use bawang_proto::{BoxedPeerStream, LinkConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS state shared by the listener and every outgoing connection.
pub(crate) struct TlsContext {
    /// Accepts inbound peer connections.
    acceptor: TlsAcceptor,
    /// Dials outbound peer connections.
    connector: TlsConnector,
}

impl TlsContext {
    /// Generate a fresh self-signed certificate for `hostname` and
    /// build both sides of the transport.
    pub(crate) fn new(hostname: &str) -> anyhow::Result<TlsContext> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let certified = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .context("generating self-signed certificate")?;
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

        let server_config = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .context("selecting TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .context("installing TLS certificate")?;

        let client_config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .context("selecting TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth();

        Ok(TlsContext {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Return the acceptor for the peer listener.
    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// Return a [`LinkConnector`] dialing TLS to peers.
    pub(crate) fn link_connector(&self) -> TlsLinkConnector {
        TlsLinkConnector {
            connector: self.connector.clone(),
        }
    }
}

/// Opens outgoing TLS links for the router.
pub(crate) struct TlsLinkConnector {
    /// The shared client-side TLS configuration.
    connector: TlsConnector,
}

#[async_trait]
impl LinkConnector for TlsLinkConnector {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxedPeerStream> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let name = ServerName::IpAddress(addr.ip().into());
        let tls = self.connector.connect(name, tcp).await?;
        Ok(Box::new(tls))
    }
}

/// Certificate "verifier" that accepts anything with a valid TLS
/// handshake signature.  Self-signed peer certificates are the normal
/// case.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
