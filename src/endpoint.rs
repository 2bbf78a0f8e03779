//! QUIC endpoint construction for both sides of the tunnel.
//!
//! The host runs a server endpoint with a freshly generated self-signed
//! certificate; the DER bytes travel to the client inside the signaling
//! offer, and the client accepts exactly that certificate and nothing else.

use std::{io, sync::Arc, time::Duration};

use quinn::{ClientConfig, Endpoint, EndpointConfig, IdleTimeout, ServerConfig, TokioRuntime, TransportConfig, VarInt};

/// TLS server name both sides agree on; the generated certificate's only SAN.
pub const SERVER_NAME: &str = "burrow";

pub const KEEPALIVE_INTERVAL_MILLIS: u64 = 2000;
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 10_000;

/// Streams carry one packet each, so allow plenty in flight.
const MAX_CONCURRENT_UNI_STREAMS: u32 = 4096;

fn transport_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.max_concurrent_uni_streams(VarInt::from_u32(MAX_CONCURRENT_UNI_STREAMS));
    config.max_concurrent_bidi_streams(VarInt::from_u32(0));
    config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_MILLIS)));
    config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    config
}

fn config_error(what: &str, error: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{what}: {error}"))
}

/// Creates the host-side endpoint on the given socket. Returns the endpoint
/// together with the DER certificate to advertise through signaling.
pub fn make_server_endpoint(socket: std::net::UdpSocket) -> io::Result<(Endpoint, Vec<u8>)> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])
        .map_err(|error| config_error("certificate generation failed", error))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|error| config_error("certificate serialization failed", error))?;
    let priv_key = rustls::PrivateKey(cert.serialize_private_key_der());
    let cert_chain = vec![rustls::Certificate(cert_der.clone())];

    let mut server_config = ServerConfig::with_single_cert(cert_chain, priv_key)
        .map_err(|error| config_error("invalid generated certificate", error))?;
    server_config.transport = Arc::new(transport_config());

    let endpoint = Endpoint::new(EndpointConfig::default(), Some(server_config), socket, Arc::new(TokioRuntime))?;
    Ok((endpoint, cert_der))
}

/// Creates the client-side endpoint on the given socket, accepting only the
/// pinned certificate received through signaling.
pub fn make_client_endpoint(socket: std::net::UdpSocket, pinned_cert_der: Vec<u8>) -> io::Result<Endpoint> {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(PinnedCertificate::new(pinned_cert_der))
        .with_no_client_auth();

    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()));

    let mut endpoint = Endpoint::new(EndpointConfig::default(), None, socket, Arc::new(TokioRuntime))?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Accepts exactly the certificate exchanged through signaling.
struct PinnedCertificate {
    der: Vec<u8>,
}

impl PinnedCertificate {
    fn new(der: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { der })
    }
}

impl rustls::client::ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        match end_entity.0 == self.der {
            true => Ok(rustls::client::ServerCertVerified::assertion()),
            false => Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            )),
        }
    }
}
