//! TCP frontend (spec §4.4): accept, admit, dial the configured backend,
//! relay bytes in both directions until either side closes, then record
//! one `ConnectionRecord`.
//!
//! Admission happens before dial (IP filter, then the rate/concurrency
//! gate); one upstream connection is opened per accepted client. The
//! relay runs two directions concurrently and ends the flow as soon as
//! either side finishes, with an idle timeout applied to the whole relay
//! rather than to individual reads. Byte-for-byte copying uses
//! `tokio::io::copy_bidirectional`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::either::Either;
use tracing::{debug, info, warn};

use crate::admission::AdmissionControl;
use crate::admission::ip_filter::IpFilter;
use crate::ca::CertificateAuthority;
use crate::config::{BackendSpec, FrontendSpec};
use crate::error::ProxyError;
use crate::frontend::{ConnectionRecord, FrontendHandle, Outcome, STOP_DRAIN_DEADLINE, Stats};
use crate::transport::tls;

/// Binds the listener and spawns the accept loop under `drain::run_with_drain`,
/// returning a handle the manager can later `stop()`. `ip_filter_dir` is this
/// frontend's own subdirectory for its persisted allow/deny sets (spec §4.1);
/// each frontend gets one so two frontends never share a denylist file.
pub async fn start(
	spec: FrontendSpec,
	backend: BackendSpec,
	ip_filter_dir: &Path,
	ip_filter_seed: (Vec<std::net::IpAddr>, Vec<std::net::IpAddr>),
	ca: Option<Arc<CertificateAuthority>>,
) -> Result<FrontendHandle, ProxyError> {
	let bind_addr: SocketAddr = spec
		.bind_addr()
		.parse()
		.map_err(|e| ProxyError::ConfigInvalid(format!("frontend {}: {e}", spec.name)))?;
	let listener = TcpListener::bind(bind_addr)
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
	let idle_timeout = Duration::from_millis(spec.idle_timeout_ms);
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
				backend,
				task_admission,
				task_stats,
				idle_timeout,
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
	listener: TcpListener,
	backend: BackendSpec,
	admission: Arc<AdmissionControl>,
	stats: Arc<Stats>,
	idle_timeout: Duration,
	terminate_tls: bool,
	ca: Option<Arc<CertificateAuthority>>,
	bind_host_wildcard: bool,
	bind_host: String,
	drain: switchyard_core::drain::DrainWatcher,
	force_shutdown: &mut tokio::sync::watch::Receiver<()>,
) {
	loop {
		tokio::select! {
			biased;
			_ = force_shutdown.changed() => {
				debug!(frontend = %name, "tcp accept loop stopping");
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
				let backend = backend.clone();
				let admission = admission.clone();
				let stats = stats.clone();
				let ca = ca.clone();
				let bind_host = bind_host.clone();
				// Held for the lifetime of the connection: a clone keeps the
				// per-frontend drain signal from completing until every
				// in-flight connection has dropped its handle (spec §4.7's
				// drain deadline tracks this, not the accept task alone).
				let conn_drain = drain.clone();
				tokio::spawn(async move {
					let _conn_drain = conn_drain;
					handle_connection(
						&name,
						socket,
						peer,
						&backend,
						&admission,
						&stats,
						idle_timeout,
						terminate_tls,
						ca.as_deref(),
						bind_host_wildcard,
						&bind_host,
					)
					.await;
				});
			}
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
	name: &str,
	socket: TcpStream,
	peer: SocketAddr,
	backend: &BackendSpec,
	admission: &AdmissionControl,
	stats: &Stats,
	idle_timeout: Duration,
	terminate_tls: bool,
	ca: Option<&CertificateAuthority>,
	bind_host_wildcard: bool,
	bind_host: &str,
	) {
	let start = SystemTime::now();
	let started_at = Instant::now();

	let admission_guard = match admission.admit(peer.ip()) {
		Ok(guard) => guard,
		Err(ProxyError::IpDenied) => {
			stats.blocked_by_ip.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			record_rejected(stats, start, started_at, Some(peer.ip()), Outcome::Denied);
			return;
		},
		Err(e) => {
			let outcome = match e {
				ProxyError::RateLimited => Outcome::RateLimited,
				ProxyError::OverCapacity => Outcome::OverCapacity,
				_ => Outcome::Failed,
			};
			record_rejected(stats, start, started_at, Some(peer.ip()), outcome);
			return;
		},
	};

	let downstream = if terminate_tls {
		let ca = match ca {
			Some(ca) => ca,
			None => {
				warn!(frontend = %name, "terminate_tls set but no certificate authority configured");
				record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
				return;
			},
		};
		let hostname = if bind_host_wildcard { "localhost" } else { bind_host };
		let ip_sans: Vec<std::net::IpAddr> = vec![peer.ip()];
		let material = match ca.get_server_tls_material(hostname, &ip_sans) {
			Ok(m) => m,
			Err(e) => {
				warn!(frontend = %name, error = %e, "failed to mint TLS material");
				record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
				return;
			},
		};
		let server_cfg = match tls::server_config(material.0, material.1) {
			Ok(cfg) => cfg,
			Err(e) => {
				warn!(frontend = %name, error = %e, "failed to build TLS server config");
				record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
				return;
			},
		};
		match tls::accept(socket, server_cfg).await {
			Ok(tls_stream) => Either::Left(tls_stream),
			Err(e) => {
				debug!(frontend = %name, peer = %peer, error = %e, "TLS handshake failed");
				record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
				return;
			},
		}
	} else {
		Either::Right(socket)
	};

	let upstream_addr = format!("{}:{}", backend.host, backend.port);
	let upstream_tcp = match tokio::time::timeout(
		Duration::from_secs(10),
		TcpStream::connect(&upstream_addr),
	)
	.await
	{
		Ok(Ok(stream)) => stream,
		Ok(Err(e)) => {
			warn!(frontend = %name, upstream = %upstream_addr, error = %e, "upstream unreachable");
			record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
			return;
		},
		Err(_) => {
			warn!(frontend = %name, upstream = %upstream_addr, "upstream dial timed out");
			record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
			return;
		},
	};

	let upstream = if backend.upstream_tls {
		let connector = tokio_rustls::TlsConnector::from(tls::insecure_upstream_client_config());
		let server_name = match rustls_pki_types::ServerName::try_from(backend.host.clone()) {
			Ok(name) => name,
			Err(e) => {
				warn!(frontend = %name, upstream = %upstream_addr, error = %e, "invalid upstream TLS server name");
				record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
				return;
			},
		};
		match connector.connect(server_name, upstream_tcp).await {
			Ok(tls_stream) => Either::Left(tls_stream),
			Err(e) => {
				warn!(frontend = %name, upstream = %upstream_addr, error = %e, "upstream TLS handshake failed");
				record_flow(stats, start, started_at, Some(peer.ip()), Outcome::Failed);
				return;
			},
		}
	} else {
		Either::Right(upstream_tcp)
	};

	let (outcome, bytes_in, bytes_out) = relay(downstream, upstream, idle_timeout).await;
	stats.total_flows.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	if outcome != Outcome::Success {
		stats.failed_flows.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	}
	stats.bytes_in.fetch_add(bytes_in, std::sync::atomic::Ordering::Relaxed);
	stats.bytes_out.fetch_add(bytes_out, std::sync::atomic::Ordering::Relaxed);
	let _ = admission_guard;
	stats.record(ConnectionRecord {
		start,
		peer: Some(peer.ip()),
		duration: started_at.elapsed(),
		bytes_in,
		bytes_out,
		outcome,
	});
	info!(frontend = %name, peer = %peer, ?outcome, bytes_in, bytes_out, "tcp flow closed");
}

/// Relays bytes in both directions until one side closes or `idle_timeout`
/// elapses with no traffic in either direction, whichever comes first
/// (spec §4.4's "relaying" state).
async fn relay(
	mut downstream: crate::transport::stream::DownstreamStream,
	mut upstream: crate::transport::stream::UpstreamStream,
	idle_timeout: Duration,
) -> (Outcome, u64, u64) {
	match tokio::time::timeout(
		idle_timeout,
		tokio::io::copy_bidirectional(&mut downstream, &mut upstream),
	)
	.await
	{
		Ok(Ok((from_downstream, from_upstream))) => {
			(Outcome::Success, from_downstream, from_upstream)
		},
		Ok(Err(_)) => (Outcome::Failed, 0, 0),
		Err(_) => (Outcome::IdleTimeout, 0, 0),
	}
}

/// A connection that reached the relay stage (or failed trying to):
/// counted in `total_flows`/`failed_flows` as well as the history ring.
fn record_flow(
	stats: &Stats,
	start: SystemTime,
	started_at: Instant,
	peer: Option<std::net::IpAddr>,
	outcome: Outcome,
) {
	stats.total_flows.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	if outcome != Outcome::Success {
		stats.failed_flows.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	}
	stats.record(ConnectionRecord {
		start,
		peer,
		duration: started_at.elapsed(),
		bytes_in: 0,
		bytes_out: 0,
		outcome,
	});
}

/// A connection turned away at admission (IP denied, rate limited, over
/// capacity): kept in the history ring for operator visibility but not
/// counted as a flow, since no connection to any backend was ever
/// attempted.
fn record_rejected(
	stats: &Stats,
	start: SystemTime,
	started_at: Instant,
	peer: Option<std::net::IpAddr>,
	outcome: Outcome,
) {
	stats.record(ConnectionRecord {
		start,
		peer,
		duration: started_at.elapsed(),
		bytes_in: 0,
		bytes_out: 0,
		outcome,
	});
}
