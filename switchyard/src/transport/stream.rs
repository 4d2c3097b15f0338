//! A frontend accepts either a plain TCP connection or, once TLS
//! termination completes, a `rustls` stream over the same socket, and
//! dials an upstream that's either plain or client-TLS-wrapped. Both
//! cases are represented directly as `tokio_util::either::Either`, which
//! already implements `AsyncRead` + `AsyncWrite` when both branches do, so
//! the relay loop never needs to know which side terminated TLS.

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_util::either::Either;

/// A downstream connection after the admission checkpoint, either plain or
/// TLS-terminated.
pub type DownstreamStream = Either<ServerTlsStream<TcpStream>, TcpStream>;

/// An upstream connection dialed for a backend, either plain or, when
/// `BackendSpec::upstream_tls` is set, wrapped in a client-side TLS
/// handshake (spec §3/§4.4).
pub type UpstreamStream = Either<ClientTlsStream<TcpStream>, TcpStream>;
