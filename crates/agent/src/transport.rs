//! TLS dial helper shared by tunnel connections and HTTP origin services.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::DigitallySignedStruct;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::config::EdgeTlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
	#[error("tcp connect to {0} failed: {1}")]
	Connect(SocketAddr, std::io::Error),
	#[error("tls handshake with {0:?} failed: {1}")]
	Tls(ServerName<'static>, std::io::Error),
	#[error("dial timed out after {0:?}")]
	Timeout(Duration),
	#[error("invalid server name: {0}")]
	InvalidServerName(String),
}

/// Builds a `rustls` config trusting the platform's native certificate store.
pub fn system_trust_config() -> Arc<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}
	Arc::new(
		rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth(),
	)
}

/// Disables server certificate verification. Only reachable through
/// `EdgeTlsConfig.insecure_skip_verify`, for talking to edge servers behind a
/// test harness's self-signed certificate.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer,
		_intermediates: &[CertificateDer],
		_server_name: &ServerName,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(&self, _message: &[u8], _cert: &CertificateDer, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(&self, _message: &[u8], _cert: &CertificateDer, _dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::RSA_PKCS1_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::RSA_PKCS1_SHA384,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PKCS1_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}

/// Builds the `rustls` config to dial the edge with, honoring
/// `insecure_skip_verify`. Used instead of [`system_trust_config`] whenever
/// the caller has an `EdgeTlsConfig` in hand.
pub fn edge_tls_config(config: &EdgeTlsConfig) -> Arc<rustls::ClientConfig> {
	if !config.insecure_skip_verify {
		return system_trust_config();
	}
	let mut cc = rustls::ClientConfig::builder().with_root_certificates(rustls::RootCertStore::empty()).with_no_client_auth();
	cc.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	Arc::new(cc)
}

/// The server name to present in the TLS handshake: an explicit override from
/// config, or the dial target's own hostname.
pub fn server_name_for<'a>(config: &'a EdgeTlsConfig, dial_hostname: &'a str) -> &'a str {
	config.server_name_override.as_deref().unwrap_or(dial_hostname)
}

/// Dials `addr` over TCP then performs a TLS handshake for `server_name`,
/// bounded by `dial_timeout`.
pub async fn dial_tls(
	addr: SocketAddr,
	server_name: &str,
	tls_config: Arc<rustls::ClientConfig>,
	dial_timeout: Duration,
) -> Result<TlsStream<TcpStream>, DialError> {
	let name = ServerName::try_from(server_name.to_string()).map_err(|_| DialError::InvalidServerName(server_name.to_string()))?;
	let owned_name = name.to_owned();

	let attempt = async move {
		debug!(%addr, %server_name, "dialing edge");
		let tcp = TcpStream::connect(addr).await.map_err(|e| DialError::Connect(addr, e))?;
		tcp.set_nodelay(true).ok();
		let connector = TlsConnector::from(tls_config);
		connector
			.connect(owned_name.clone(), tcp)
			.await
			.map_err(|e| DialError::Tls(owned_name, e))
	};

	match tokio::time::timeout(dial_timeout, attempt).await {
		Ok(result) => result,
		Err(_) => Err(DialError::Timeout(dial_timeout)),
	}
}
