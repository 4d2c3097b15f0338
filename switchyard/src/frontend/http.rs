//! HTTP reverse proxy frontend (spec §4.6): Host-based routing, hop-by-hop
//! header canonicalisation, cookie-jar reassembly, and response rewriting
//! (`Location`, `Set-Cookie`, and textual URL rewriting in HTML/JS bodies).
//!
//! Serves HTTP/1.1 only, via `hyper::server::conn::http1`. Bodies are
//! buffered in full (`http_body_util::Full<Bytes>`) rather than streamed,
//! since response rewriting needs the whole body in hand before it can be
//! forwarded.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::admission::AdmissionControl;
use crate::admission::ip_filter::IpFilter;
use crate::ca::CertificateAuthority;
use crate::config::{BackendSpec, FrontendSpec};
use crate::error::ProxyError;
use crate::frontend::{
	ConnectionRecord, FrontendHandle, Outcome, RoutingTable, STOP_DRAIN_DEADLINE, Stats,
};
use crate::transport::tls;

type Body = Full<Bytes>;

const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Request headers dropped before forwarding upstream (spec §4.6).
const REQUEST_HOP_BY_HOP: &[&str] = &[
	"host",
	"connection",
	"keep-alive",
	"proxy-connection",
	"transfer-encoding",
	"upgrade",
	"content-length",
	"te",
	"trailer",
	"proxy-authorization",
	"proxy-authenticate",
	"accept-encoding",
	"cookie",
];

/// Response headers dropped before relaying to the client (spec §4.6).
const RESPONSE_HOP_BY_HOP: &[&str] = &[
	"connection",
	"keep-alive",
	"transfer-encoding",
	"content-encoding",
	"content-length",
];

pub async fn start(
	spec: FrontendSpec,
	routing: RoutingTable,
	ip_filter_dir: &Path,
	ip_filter_seed: (Vec<std::net::IpAddr>, Vec<std::net::IpAddr>),
	ca: Option<Arc<CertificateAuthority>>,
) -> Result<FrontendHandle, ProxyError> {
	let bind_addr: SocketAddr = spec
		.bind_addr()
		.parse()
		.map_err(|e| ProxyError::ConfigInvalid(format!("frontend {}: {e}", spec.name)))?;
	let listener = tokio::net::TcpListener::bind(bind_addr)
		.await
		.map_err(|e| ProxyError::BindFailed(bind_addr, e))?;

	let ip_filter = IpFilter::load(ip_filter_dir)?;
	ip_filter.seed(ip_filter_seed.0, ip_filter_seed.1);
	let admission = Arc::new(AdmissionControl::new(
		Arc::new(ip_filter),
		spec.max_in_flight,
		spec.accept_rate_per_sec,
	));
	let stats = Arc::new(Stats::new());
	let (drain_trigger, drain_watcher) = switchyard_core::drain::new();

	let name = spec.name.clone();
	let terminate_tls = spec.terminate_tls;
	let bind_host_wildcard = spec.bind_host_is_wildcard();
	let bind_host = spec.bind_host.clone();

	let task_admission = admission.clone();
	let task_stats = stats.clone();
	let accept_task = tokio::spawn(switchyard_core::drain::run_with_drain(
		name.clone(),
		drain_watcher,
		STOP_DRAIN_DEADLINE,
		async move |sub_drain, mut force_shutdown| {
			accept_loop(
				name,
				listener,
				routing,
				task_admission,
				task_stats,
				terminate_tls,
				ca,
				bind_host_wildcard,
				bind_host,
				sub_drain,
				&mut force_shutdown,
			)
			.await;
		},
	));

	Ok(FrontendHandle::new(
		spec,
		admission,
		stats,
		accept_task,
		drain_trigger,
	))
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
	name: String,
	listener: tokio::net::TcpListener,
	routing: RoutingTable,
	admission: Arc<AdmissionControl>,
	stats: Arc<Stats>,
	terminate_tls: bool,
	ca: Option<Arc<CertificateAuthority>>,
	bind_host_wildcard: bool,
	bind_host: String,
	drain: switchyard_core::drain::DrainWatcher,
	force_shutdown: &mut tokio::sync::watch::Receiver<()>,
) {
	let routing = Arc::new(routing);
	loop {
		tokio::select! {
			biased;
			_ = force_shutdown.changed() => {
				debug!(frontend = %name, "http accept loop stopping");
				return;
			}
			accepted = listener.accept() => {
				let (socket, peer) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(frontend = %name, error = %e, "accept failed");
						continue;
					}
				};

				let name = name.clone();
				let routing = routing.clone();
				let admission = admission.clone();
				let stats = stats.clone();
				let ca = ca.clone();
				let bind_host = bind_host.clone();
				let conn_drain = drain.clone();
				tokio::spawn(async move {
					let _conn_drain = conn_drain;
					// Held for the lifetime of the connection: admission is
					// checked once per accepted socket (not per request),
					// since the forced `Connection: close` policy keeps a
					// connection to roughly one request anyway.
					let mut socket = socket;
					let admission_guard = match admission.admit(peer.ip()) {
						Ok(guard) => guard,
						Err(ProxyError::IpDenied) => {
							stats.blocked_by_ip.fetch_add(1, Ordering::Relaxed);
							record(&stats, SystemTime::now(), Instant::now(), Some(peer.ip()), 0, 0, Outcome::Denied);
							write_error_response(&mut socket, ProxyError::IpDenied.http_status(), "IP denied").await;
							return;
						},
						Err(e) => {
							let outcome = match e {
								ProxyError::RateLimited => Outcome::RateLimited,
								ProxyError::OverCapacity => Outcome::OverCapacity,
								_ => Outcome::Failed,
							};
							record(&stats, SystemTime::now(), Instant::now(), Some(peer.ip()), 0, 0, outcome);
							write_error_response(&mut socket, e.http_status(), "Admission rejected").await;
							return;
						},
					};
					let socket = socket;
					serve(
						&name,
						socket,
						peer,
						routing,
						stats,
						terminate_tls,
						ca.as_deref(),
						bind_host_wildcard,
						&bind_host,
					)
					.await;
					drop(admission_guard);
				});
			}
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn serve(
	name: &str,
	socket: TcpStream,
	peer: SocketAddr,
	routing: Arc<RoutingTable>,
	stats: Arc<Stats>,
	terminate_tls: bool,
	ca: Option<&CertificateAuthority>,
	bind_host_wildcard: bool,
	bind_host: &str,
) {
	let io = if terminate_tls {
		let Some(ca) = ca else {
			warn!(frontend = %name, "terminate_tls set but no certificate authority configured");
			return;
		};
		let hostname = if bind_host_wildcard { "localhost" } else { bind_host };
		let ip_sans = [peer.ip()];
		let material = match ca.get_server_tls_material(hostname, &ip_sans) {
			Ok(m) => m,
			Err(e) => {
				warn!(frontend = %name, error = %e, "failed to mint TLS material");
				return;
			},
		};
		let server_cfg = match tls::server_config(material.0, material.1) {
			Ok(cfg) => cfg,
			Err(e) => {
				warn!(frontend = %name, error = %e, "failed to build TLS server config");
				return;
			},
		};
		match tls::accept(socket, server_cfg).await {
			Ok(tls_stream) => Io::Tls(TokioIo::new(tls_stream)),
			Err(e) => {
				debug!(frontend = %name, peer = %peer, error = %e, "TLS handshake failed");
				return;
			},
		}
	} else {
		Io::Plain(TokioIo::new(socket))
	};

	let name = name.to_string();
	let client_scheme = if terminate_tls { "https" } else { "http" };
	let svc = service_fn(move |req: Request<Incoming>| {
		let name = name.clone();
		let routing = routing.clone();
		let stats = stats.clone();
		async move { Ok::<_, std::convert::Infallible>(handle(&name, req, peer, &routing, &stats, client_scheme, terminate_tls).await) }
	});

	let builder = hyper::server::conn::http1::Builder::new();
	let result = match io {
		Io::Plain(io) => builder.serve_connection(io, svc).await,
		Io::Tls(io) => builder.serve_connection(io, svc).await,
	};
	if let Err(e) = result {
		debug!(peer = %peer, error = %e, "http connection ended with an error");
	}
}

enum Io {
	Plain(TokioIo<TcpStream>),
	Tls(TokioIo<tokio_rustls::server::TlsStream<TcpStream>>),
}

#[allow(clippy::too_many_arguments)]
async fn handle(
	name: &str,
	req: Request<Incoming>,
	peer: SocketAddr,
	routing: &RoutingTable,
	stats: &Stats,
	client_scheme: &str,
	terminate_tls: bool,
) -> Response<Body> {
	let start = SystemTime::now();
	let started_at = Instant::now();

	let method = req.method().as_str().to_string();
	stats.record_method(&method);

	let raw_host_header = req
		.headers()
		.get(hyper::header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
		.unwrap_or_default();
	let routing_host = raw_host_header
		.rsplit_once(':')
		.map(|(host, _port)| host)
		.unwrap_or(&raw_host_header)
		.to_string();
	let domain_key = if routing_host.is_empty() { "unknown".to_string() } else { routing_host.clone() };

	let backend = match routing.resolve(&routing_host) {
		Ok(b) => b.clone(),
		Err(_) => {
			record(stats, start, started_at, Some(peer.ip()), 0, 0, Outcome::Failed);
			stats.record_domain(&domain_key, 0, 0);
			return error_response(StatusCode::BAD_GATEWAY, "No backend configured");
		},
	};

	match proxy_one_request(req, &backend, &raw_host_header, client_scheme, terminate_tls).await {
		Ok((resp, bytes_in, bytes_out)) => {
			record(stats, start, started_at, Some(peer.ip()), bytes_in, bytes_out, Outcome::Success);
			stats.record_domain(&domain_key, bytes_in, bytes_out);
			resp
		},
		Err(e) => {
			warn!(frontend = %name, upstream = %backend.host, error = %e, "upstream request failed");
			record(stats, start, started_at, Some(peer.ip()), 0, 0, Outcome::Failed);
			stats.record_domain(&domain_key, 0, 0);
			error_response(StatusCode::BAD_GATEWAY, "Upstream request failed")
		},
	}
}

async fn proxy_one_request(
	req: Request<Incoming>,
	backend: &BackendSpec,
	raw_host_header: &str,
	client_scheme: &str,
	terminate_tls: bool,
) -> Result<(Response<Body>, u64, u64), ProxyError> {
	let (parts, body) = req.into_parts();
	let body_bytes = body
		.collect()
		.await
		.map_err(|e| ProxyError::UpstreamProtocolError(format!("reading request body: {e}")))?
		.to_bytes();
	let bytes_in = body_bytes.len() as u64;

	let path_and_query = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	let upstream_scheme = if backend.upstream_tls { "https" } else { "http" };
	let uri: Uri = format!(
		"{upstream_scheme}://{}:{}{path_and_query}",
		backend.host, backend.port
	)
	.parse()
	.map_err(|e| ProxyError::UpstreamProtocolError(format!("invalid upstream URI: {e}")))?;

	let mut upstream_req = Request::builder()
		.method(parts.method.clone())
		.uri(uri)
		.version(hyper::Version::HTTP_11);
	{
		let headers = upstream_req.headers_mut().expect("builder headers");
		let mut cookie_values = Vec::new();
		for (name, value) in parts.headers.iter() {
			if name.as_str().eq_ignore_ascii_case("cookie") {
				if let Ok(v) = value.to_str() {
					cookie_values.push(v.to_string());
				}
				continue;
			}
			if REQUEST_HOP_BY_HOP
				.iter()
				.any(|h| name.as_str().eq_ignore_ascii_case(h))
			{
				continue;
			}
			headers.append(name.clone(), value.clone());
		}
		if !cookie_values.is_empty() {
			let joined = cookie_values.join("; ");
			headers.insert(
				hyper::header::COOKIE,
				HeaderValue::from_str(&joined)
					.map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?,
			);
		}
		headers.insert(
			hyper::header::HOST,
			HeaderValue::from_str(&host_header_value(&backend.host, backend.port, backend.upstream_tls))
				.map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?,
		);
		headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
		headers.insert(
			hyper::header::ACCEPT_ENCODING,
			HeaderValue::from_static("identity"),
		);
	}
	let upstream_req = upstream_req
		.body(Full::new(body_bytes))
		.map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?;

	let upstream_addr = format!("{}:{}", backend.host, backend.port);
	let tcp = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&upstream_addr))
		.await
		.map_err(|_| {
			ProxyError::UpstreamUnreachable(
				upstream_addr.clone(),
				std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"),
			)
		})?
		.map_err(|e| ProxyError::UpstreamUnreachable(upstream_addr.clone(), e))?;

	let response = if backend.upstream_tls {
		let connector = TlsConnector::from(tls::insecure_upstream_client_config());
		let server_name = rustls_pki_types::ServerName::try_from(backend.host.clone())
			.map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))?;
		let tls_stream = connector
			.connect(server_name, tcp)
			.await
			.map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))?;
		send_over(TokioIo::new(tls_stream), upstream_req).await?
	} else {
		send_over(TokioIo::new(tcp), upstream_req).await?
	};

	let (resp, bytes_out) =
		rewrite_response(response, backend, raw_host_header, client_scheme, terminate_tls).await?;
	Ok((resp, bytes_in, bytes_out))
}

async fn send_over<IO>(io: TokioIo<IO>, req: Request<Body>) -> Result<Response<Incoming>, ProxyError>
where
	IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
	let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.handshake(io)
		.await
		.map_err(|e| ProxyError::UpstreamProtocolError(format!("handshake: {e}")))?;
	tokio::spawn(async move {
		if let Err(e) = connection.await {
			debug!(error = %e, "upstream connection task ended");
		}
	});
	sender
		.send_request(req)
		.await
		.map_err(|e| ProxyError::UpstreamProtocolError(format!("send_request: {e}")))
}

/// Host header value using the default-port rule (spec §4.6): omit the
/// port when it's the scheme's default (80 for http, 443 for https).
fn host_header_value(host: &str, port: u16, tls: bool) -> String {
	let default_port = if tls { 443 } else { 80 };
	if port == default_port {
		host.to_string()
	} else {
		format!("{host}:{port}")
	}
}

async fn rewrite_response(
	response: Response<Incoming>,
	backend: &BackendSpec,
	raw_host_header: &str,
	client_scheme: &str,
	terminate_tls: bool,
) -> Result<(Response<Body>, u64), ProxyError> {
	let (mut parts, body) = response.into_parts();
	let body_bytes = body
		.collect()
		.await
		.map_err(|e| ProxyError::UpstreamProtocolError(format!("reading response body: {e}")))?
		.to_bytes();

	let upstream_scheme = if backend.upstream_tls { "https" } else { "http" };
	let authorities = upstream_authority_variants(&backend.host, backend.port, backend.upstream_tls);

	let mut headers = hyper::HeaderMap::new();
	for (name, value) in parts.headers.iter() {
		if RESPONSE_HOP_BY_HOP
			.iter()
			.any(|h| name.as_str().eq_ignore_ascii_case(h))
		{
			continue;
		}
		if name == hyper::header::LOCATION {
			if let Ok(v) = value.to_str() {
				let rewritten = rewrite_location(v, &authorities, client_scheme, raw_host_header);
				headers.append(
					name.clone(),
					HeaderValue::from_str(&rewritten)
						.map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?,
				);
				continue;
			}
		}
		if name == hyper::header::SET_COOKIE {
			if let Ok(v) = value.to_str() {
				let rewritten = rewrite_set_cookie(v, terminate_tls);
				headers.append(
					name.clone(),
					HeaderValue::from_str(&rewritten)
						.map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?,
				);
				continue;
			}
		}
		headers.append(name.clone(), value.clone());
	}
	parts.headers = headers;

	let content_type = parts
		.headers
		.get(hyper::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_ascii_lowercase();
	let is_rewritable_text = ["text/html", "application/javascript", "text/javascript"]
		.iter()
		.any(|ct| content_type.starts_with(ct));

	let final_body = if is_rewritable_text {
		match std::str::from_utf8(&body_bytes) {
			Ok(text) => {
				let rewritten = rewrite_body_text(
					text,
					upstream_scheme,
					&backend.host,
					backend.port,
					client_scheme,
					raw_host_header,
				);
				Bytes::from(rewritten)
			},
			Err(_) => body_bytes,
		}
	} else {
		body_bytes
	};

	let bytes_out = final_body.len() as u64;
	Ok((Response::from_parts(parts, Full::new(final_body)), bytes_out))
}

/// The textual forms an absolute reference to the upstream can take,
/// matching the default-port rule so `host:80` and bare `host` are both
/// recognised when the backend uses the scheme's default port.
fn upstream_authority_variants(host: &str, port: u16, tls: bool) -> Vec<String> {
	let default_port = if tls { 443 } else { 80 };
	let mut variants = vec![format!("{host}:{port}")];
	if port == default_port {
		variants.push(host.to_string());
	}
	variants
}

fn rewrite_location(
	location: &str,
	upstream_authorities: &[String],
	client_scheme: &str,
	client_host: &str,
) -> String {
	for scheme in ["http", "https"] {
		let prefix = format!("{scheme}://");
		let Some(rest) = location.strip_prefix(&prefix) else {
			continue;
		};
		for authority in upstream_authorities {
			if let Some(tail) = rest.strip_prefix(authority.as_str()) {
				if tail.is_empty() || tail.starts_with('/') || tail.starts_with('?') || tail.starts_with('#') {
					return format!("{client_scheme}://{client_host}{tail}");
				}
			}
		}
	}
	location.to_string()
}

fn rewrite_set_cookie(value: &str, terminate_tls: bool) -> String {
	let attrs: Vec<&str> = value
		.split(';')
		.map(str::trim)
		.filter(|attr| !attr.to_ascii_lowercase().starts_with("domain="))
		.collect();
	let has_secure = attrs
		.iter()
		.any(|attr| attr.eq_ignore_ascii_case("secure"));
	let mut rebuilt = attrs.join("; ");
	if terminate_tls && !has_secure {
		if !rebuilt.is_empty() {
			rebuilt.push_str("; ");
		}
		rebuilt.push_str("Secure");
	}
	rebuilt
}

/// Replaces textual occurrences of the four absolute/protocol-relative
/// forms of the upstream's address with the client-facing equivalent
/// (spec §4.6). UTF-8 is assumed already validated by the caller.
fn rewrite_body_text(
	text: &str,
	upstream_scheme: &str,
	upstream_host: &str,
	upstream_port: u16,
	client_scheme: &str,
	client_host: &str,
) -> String {
	let authority = format!("{upstream_host}:{upstream_port}");
	let replacement = format!("{client_scheme}://{client_host}");
	let mut out = text.replace(&format!("{upstream_scheme}://{authority}"), &replacement);
	out = out.replace(&format!("http://{authority}"), &replacement);
	out = out.replace(&format!("https://{authority}"), &replacement);
	out = out.replace(&format!("//{authority}"), &format!("//{client_host}"));
	out
}

fn record(
	stats: &Stats,
	start: SystemTime,
	started_at: Instant,
	peer: Option<std::net::IpAddr>,
	bytes_in: u64,
	bytes_out: u64,
	outcome: Outcome,
) {
	if !matches!(outcome, Outcome::Denied | Outcome::RateLimited | Outcome::OverCapacity) {
		stats.total_flows.fetch_add(1, Ordering::Relaxed);
		if outcome != Outcome::Success {
			stats.failed_flows.fetch_add(1, Ordering::Relaxed);
		}
		stats.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
		stats.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
	}
	stats.record(ConnectionRecord {
		start,
		peer,
		duration: started_at.elapsed(),
		bytes_in,
		bytes_out,
		outcome,
	});
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "text/plain")
		.body(Full::new(Bytes::from(message.to_string())))
		.expect("static error response is well-formed")
}

/// Writes `error_response(status, message)` directly to a socket that
/// never reached the hyper server loop (an admission rejection happens
/// before the per-connection service is built). There is no live
/// `Connection` to hand the response to, so the status line and headers
/// are serialised by hand instead.
async fn write_error_response(socket: &mut TcpStream, status: StatusCode, message: &str) {
	let response = error_response(status, message);
	let body = response
		.into_body()
		.collect()
		.await
		.map(|collected| collected.to_bytes())
		.unwrap_or_default();
	let head = format!(
		"HTTP/1.1 {} {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
		status.as_u16(),
		status.canonical_reason().unwrap_or(""),
		body.len(),
	);
	if socket.write_all(head.as_bytes()).await.is_ok() {
		let _ = socket.write_all(&body).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn host_header_omits_default_port() {
		assert_eq!(host_header_value("api.internal", 80, false), "api.internal");
		assert_eq!(host_header_value("api.internal", 443, true), "api.internal");
		assert_eq!(host_header_value("api.internal", 8080, false), "api.internal:8080");
	}

	#[test]
	fn location_rewrite_matches_default_port_bare_host() {
		let authorities = upstream_authority_variants("backend.internal", 80, false);
		let rewritten = rewrite_location(
			"http://backend.internal/next?x=1",
			&authorities,
			"https",
			"edge.example",
		);
		assert_eq!(rewritten, "https://edge.example/next?x=1");
	}

	#[test]
	fn location_rewrite_ignores_unrelated_host() {
		let authorities = upstream_authority_variants("backend.internal", 9090, false);
		let original = "http://other.example/next";
		assert_eq!(
			rewrite_location(original, &authorities, "https", "edge.example"),
			original
		);
	}

	#[test]
	fn set_cookie_strips_domain_and_adds_secure_under_tls() {
		let rewritten = rewrite_set_cookie("sid=abc; Domain=backend.internal; Path=/", true);
		assert_eq!(rewritten, "sid=abc; Path=/; Secure");
	}

	#[test]
	fn set_cookie_leaves_existing_secure_alone() {
		let rewritten = rewrite_set_cookie("sid=abc; Secure", true);
		assert_eq!(rewritten, "sid=abc; Secure");
	}

	#[test]
	fn body_rewrite_covers_all_four_forms() {
		let text = "a http://backend.internal:9090/x b https://backend.internal:9090/y c //backend.internal:9090/z";
		let rewritten = rewrite_body_text(
			text,
			"http",
			"backend.internal",
			9090,
			"https",
			"edge.example",
		);
		assert_eq!(
			rewritten,
			"a https://edge.example/x b https://edge.example/y c //edge.example/z"
		);
	}
}
