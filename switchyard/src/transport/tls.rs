//! TLS plumbing for both directions of the proxy: terminating downstream
//! connections (spec §4.3/§4.6) and connecting upstream without verifying
//! the peer (spec §3: "upstream TLS connections do not verify the peer
//! certificate — the backend is assumed trusted by virtue of being
//! explicitly configured").
//!
//! TLS versions are restricted to 1.2 and 1.3; the `insecure` submodule
//! holds a peer verifier that always succeeds, used only for upstream
//! connections where the backend is trusted by configuration rather than
//! by certificate chain. Crypto is provided by `ring`, the default
//! provider for this dependency combination.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ServerConfig};
use tokio::net::TcpStream;

use crate::error::ProxyError;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds a server config presenting `chain`/`key` for every connection;
/// callers construct a fresh one per hostname since the CA mints leaves
/// per hostname (spec §4.3).
pub fn server_config(
	chain: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, ProxyError> {
	let mut cfg = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.map_err(|e| ProxyError::TlsHandshakeFailed(format!("protocol versions: {e}")))?
		.with_no_client_auth()
		.with_single_cert(chain, key)
		.map_err(|e| ProxyError::TlsHandshakeFailed(format!("server cert: {e}")))?;
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(Arc::new(cfg))
}

pub async fn accept(
	tcp: TcpStream,
	cfg: Arc<ServerConfig>,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>, ProxyError> {
	tokio_rustls::TlsAcceptor::from(cfg)
		.accept(tcp)
		.await
		.map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))
}

/// Client config for connecting to a backend over TLS without verifying
/// its certificate (spec §3). Built fresh per backend rather than cached,
/// since backends are few and config reloads are infrequent.
pub fn insecure_upstream_client_config() -> Arc<ClientConfig> {
	let mut cfg = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.expect("protocol versions are statically valid")
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
		.with_no_client_auth();
	cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
	Arc::new(cfg)
}

pub mod insecure {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::{DigitallySignedStruct, SignatureScheme};

	/// Accepts any server certificate for any name. Used only for upstream
	/// connections, which are explicit operator configuration rather than
	/// arbitrary internet hosts.
	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
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
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA1,
				SignatureScheme::ECDSA_SHA1_Legacy,
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
			]
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insecure_client_config_accepts_construction() {
		let cfg = insecure_upstream_client_config();
		assert_eq!(cfg.alpn_protocols, vec![b"http/1.1".to_vec()]);
	}
}
