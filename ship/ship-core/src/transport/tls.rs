//! TLS configuration, dialling and accepting.
//!
//! Both directions run the same discipline: ECDSA P-256 preferred cipher
//! suites, mutual certificates, no chain validation, mandatory SKI
//! extraction afterwards. The websocket layer on top pins the `/ship/` path
//! and the `ship` subprotocol.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::{
    client,
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
            WebPkiSupportedAlgorithms},
        pki_types::{CertificateDer, ServerName, UnixTime},
        server::danger::{ClientCertVerified, ClientCertVerifier},
        ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
    },
    server, TlsAcceptor, TlsConnector,
};
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderValue, StatusCode},
    },
    WebSocketStream,
};

use crate::{
    constants::{SHIP_PATH, SHIP_SUBPROTOCOL},
    error::ShipError,
    transport::{ski::ski_from_certificate, ShipCredentials},
    types::Ski,
};

/// An outbound SHIP transport connection.
pub type ClientStream = WebSocketStream<client::TlsStream<TcpStream>>;
/// An inbound SHIP transport connection.
pub type ServerStream = WebSocketStream<server::TlsStream<TcpStream>>;

/// Dials `host:port`, verifies the peer presents the expected SKI and runs
/// the websocket client handshake on the `/ship/` path.
pub async fn connect(
    host: &str,
    port: u16,
    expected_ski: &Ski,
    credentials: &ShipCredentials,
) -> Result<ClientStream, ShipError> {
    let tcp = TcpStream::connect((host, port)).await?;

    let connector = TlsConnector::from(Arc::new(client_config(credentials)?));
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| ShipError::Certificate("invalid server name"))?;
    let tls = connector.connect(server_name, tcp).await?;

    let ski = peer_ski(tls.get_ref().1.peer_certificates())?;
    if ski != *expected_ski {
        tracing::warn!(expected = %expected_ski, got = %ski, "Peer presented a different SKI, dropping");
        return Err(ShipError::IdentityMismatch("certificate ski"));
    }

    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let mut request = format!("wss://{authority}{SHIP_PATH}").into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SHIP_SUBPROTOCOL),
    );

    let (ws, response) = tokio_tungstenite::client_async(request, tls).await?;

    if response.headers().get("Sec-WebSocket-Protocol")
        != Some(&HeaderValue::from_static(SHIP_SUBPROTOCOL))
    {
        return Err(ShipError::UnexpectedMessage(
            "peer did not select the ship subprotocol",
        ));
    }

    Ok(ws)
}

/// Accepts one inbound TLS + websocket connection and returns it together
/// with the peer's SKI.
pub async fn accept(
    tcp: TcpStream,
    credentials: &ShipCredentials,
) -> Result<(ServerStream, Ski), ShipError> {
    let acceptor = TlsAcceptor::from(Arc::new(server_config(credentials)?));
    let tls = acceptor.accept(tcp).await?;

    let ski = peer_ski(tls.get_ref().1.peer_certificates())?;

    let ws = tokio_tungstenite::accept_hdr_async(tls, check_ship_request).await?;

    Ok((ws, ski))
}

/// Rejects websocket upgrades that are not SHIP: wrong path or missing
/// subprotocol offer.
fn check_ship_request(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() != SHIP_PATH {
        return Err(plain_error_response(StatusCode::NOT_FOUND));
    }

    let offers_ship = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|header| header.to_str().ok())
        .is_some_and(|protocols| {
            protocols
                .split(',')
                .any(|protocol| protocol.trim() == SHIP_SUBPROTOCOL)
        });

    if !offers_ship {
        return Err(plain_error_response(StatusCode::BAD_REQUEST));
    }

    response.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SHIP_SUBPROTOCOL),
    );
    Ok(response)
}

fn plain_error_response(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

fn peer_ski(certs: Option<&[CertificateDer<'_>]>) -> Result<Ski, ShipError> {
    let cert = certs
        .and_then(<[_]>::first)
        .ok_or(ShipError::Certificate("peer presented no certificate"))?;

    ski_from_certificate(cert)
}

/// AES-128-GCM with ECDSA is the suite SHIP requires, TLS 1.3 gets its
/// equivalent.
fn crypto_provider() -> CryptoProvider {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![
        ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ];
    provider
}

fn client_config(credentials: &ShipCredentials) -> Result<ClientConfig, ShipError> {
    let provider = Arc::new(crypto_provider());

    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintTrust::new(&provider)))
        .with_client_auth_cert(credentials.certs.clone(), credentials.key.clone_key())?;

    Ok(config)
}

fn server_config(credentials: &ShipCredentials) -> Result<ServerConfig, ShipError> {
    let provider = Arc::new(crypto_provider());

    let config = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(FingerprintTrust::new(&provider)))
        .with_single_cert(credentials.certs.clone(), credentials.key.clone_key())?;

    Ok(config)
}

/// Accepts any syntactically valid peer certificate.
///
/// Chain validation is intentionally skipped: trust is decided above the
/// transport from the SKI, which is extracted right after the handshake.
/// Handshake signatures are still verified so the peer must actually hold
/// the key it presents.
#[derive(Debug)]
struct FingerprintTrust {
    algorithms: WebPkiSupportedAlgorithms,
}

impl FingerprintTrust {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for FingerprintTrust {
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for FingerprintTrust {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}
