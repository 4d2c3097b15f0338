//! Error taxonomy (spec §7). Kinds, not type names: every failure mode the
//! runtime can hit maps to one of these variants so callers can branch on
//! `ProxyError::kind()` without matching on Display text.

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	ConfigInvalid,
	BindFailed,
	UpstreamUnreachable,
	TlsHandshakeFailed,
	IpDenied,
	RateLimited,
	OverCapacity,
	IdleTimeout,
	UpstreamProtocolError,
	Internal,
}

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("invalid configuration: {0}")]
	ConfigInvalid(String),

	#[error("failed to bind {0}: {1}")]
	BindFailed(std::net::SocketAddr, #[source] std::io::Error),

	#[error("upstream {0} unreachable: {1}")]
	UpstreamUnreachable(String, #[source] std::io::Error),

	#[error("TLS handshake failed: {0}")]
	TlsHandshakeFailed(String),

	#[error("source address denied")]
	IpDenied,

	#[error("rate limited")]
	RateLimited,

	#[error("over capacity")]
	OverCapacity,

	#[error("idle timeout")]
	IdleTimeout,

	#[error("upstream protocol error: {0}")]
	UpstreamProtocolError(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			ProxyError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
			ProxyError::BindFailed(..) => ErrorKind::BindFailed,
			ProxyError::UpstreamUnreachable(..) => ErrorKind::UpstreamUnreachable,
			ProxyError::TlsHandshakeFailed(_) => ErrorKind::TlsHandshakeFailed,
			ProxyError::IpDenied => ErrorKind::IpDenied,
			ProxyError::RateLimited => ErrorKind::RateLimited,
			ProxyError::OverCapacity => ErrorKind::OverCapacity,
			ProxyError::IdleTimeout => ErrorKind::IdleTimeout,
			ProxyError::UpstreamProtocolError(_) => ErrorKind::UpstreamProtocolError,
			ProxyError::Internal(_) => ErrorKind::Internal,
		}
	}

	/// Per-flow errors recover locally: record to `last_error`, bump the
	/// failed counter, close the flow. The frontend itself keeps running.
	pub fn is_per_flow(&self) -> bool {
		matches!(
			self.kind(),
			ErrorKind::UpstreamUnreachable
				| ErrorKind::TlsHandshakeFailed
				| ErrorKind::IdleTimeout
				| ErrorKind::UpstreamProtocolError
		)
	}

	/// Gate/filter rejections are expected outcomes, not errors; they are
	/// logged at debug level only (spec §7).
	pub fn is_admission_rejection(&self) -> bool {
		matches!(
			self.kind(),
			ErrorKind::IpDenied | ErrorKind::RateLimited | ErrorKind::OverCapacity
		)
	}

	/// Maps a flow-level error to the HTTP status the spec mandates (§7).
	pub fn http_status(&self) -> StatusCode {
		match self.kind() {
			ErrorKind::IpDenied => StatusCode::FORBIDDEN,
			ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::OverCapacity => StatusCode::SERVICE_UNAVAILABLE,
			ErrorKind::UpstreamUnreachable | ErrorKind::UpstreamProtocolError => {
				StatusCode::BAD_GATEWAY
			},
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl From<std::io::Error> for ProxyError {
	fn from(e: std::io::Error) -> Self {
		ProxyError::Internal(e.to_string())
	}
}

pub type Result<T> = std::result::Result<T, ProxyError>;
