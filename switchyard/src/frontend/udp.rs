//! UDP frontend (spec §4.5): one ephemeral upstream socket per datagram,
//! a single response awaited with a 5 s deadline and forwarded back to the
//! original sender. Datagrams are rate-limited only — the concurrency gate
//! does not apply, since "datagrams are not connections" (spec §4.5) and
//! there is no connection to hold a slot open for.
//!
//! There is no session table: each datagram gets its own ephemeral socket,
//! used once and dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::admission::AdmissionControl;
use crate::admission::ip_filter::IpFilter;
use crate::config::{BackendSpec, FrontendSpec};
use crate::error::ProxyError;
use crate::frontend::{ConnectionRecord, FrontendHandle, Outcome, STOP_DRAIN_DEADLINE, Stats};

/// Maximum single datagram accepted, matching the largest UDP payload a
/// socket can actually receive (spec §4.5 edge case: 65507 bytes accepted,
/// 65508+ rejected).
const MAX_DATAGRAM: usize = 65_507;
const RESPONSE_DEADLINE: Duration = Duration::from_secs(5);

pub async fn start(
	spec: FrontendSpec,
	backend: BackendSpec,
	ip_filter_dir: &std::path::Path,
	ip_filter_seed: (Vec<std::net::IpAddr>, Vec<std::net::IpAddr>),
) -> Result<FrontendHandle, ProxyError> {
	let bind_addr: SocketAddr = spec
		.bind_addr()
		.parse()
		.map_err(|e| ProxyError::ConfigInvalid(format!("frontend {}: {e}", spec.name)))?;
	let socket = UdpSocket::bind(bind_addr)
		.await
		.map_err(|e| ProxyError::BindFailed(bind_addr, e))?;

	let ip_filter = IpFilter::load(ip_filter_dir)?;
	ip_filter.seed(ip_filter_seed.0, ip_filter_seed.1);
	// `max_in_flight` is irrelevant to UDP (no concurrency gate applies),
	// but `AdmissionControl` is shared shape with the other frontends, so a
	// generous cap is passed that a datagram flow never actually reaches.
	let admission = Arc::new(AdmissionControl::new(
		Arc::new(ip_filter),
		u32::MAX,
		spec.accept_rate_per_sec,
	));
	let stats = Arc::new(Stats::new());
	let (drain_trigger, drain_watcher) = switchyard_core::drain::new();

	let name = spec.name.clone();
	let task_admission = admission.clone();
	let task_stats = stats.clone();
	let accept_task = tokio::spawn(switchyard_core::drain::run_with_drain(
		name.clone(),
		drain_watcher,
		STOP_DRAIN_DEADLINE,
		async move |sub_drain, mut force_shutdown| {
			datagram_loop(
				name,
				socket,
				backend,
				task_admission,
				task_stats,
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

async fn datagram_loop(
	name: String,
	socket: UdpSocket,
	backend: BackendSpec,
	admission: Arc<AdmissionControl>,
	stats: Arc<Stats>,
	drain: switchyard_core::drain::DrainWatcher,
	force_shutdown: &mut tokio::sync::watch::Receiver<()>,
) {
	let socket = Arc::new(socket);
	let mut buf = vec![0u8; MAX_DATAGRAM];
	loop {
		tokio::select! {
			biased;
			_ = force_shutdown.changed() => {
				debug!(frontend = %name, "udp datagram loop stopping");
				return;
			}
			received = socket.recv_from(&mut buf) => {
				let (len, peer) = match received {
					Ok(pair) => pair,
					Err(e) => {
						warn!(frontend = %name, error = %e, "recv_from failed");
						continue;
					}
				};
				let datagram = buf[..len].to_vec();
				let socket = socket.clone();
				let name = name.clone();
				let backend = backend.clone();
				let admission = admission.clone();
				let stats = stats.clone();
				let conn_drain = drain.clone();
				tokio::spawn(async move {
					let _conn_drain = conn_drain;
					handle_datagram(&name, &socket, peer, datagram, &backend, &admission, &stats).await;
				});
			}
		}
	}
}

async fn handle_datagram(
	name: &str,
	socket: &UdpSocket,
	peer: SocketAddr,
	datagram: Vec<u8>,
	backend: &BackendSpec,
	admission: &AdmissionControl,
	stats: &Stats,
) {
	let start = SystemTime::now();
	let started_at = Instant::now();

	// The concurrency gate's rate window is reused for its sliding-window
	// accounting even though `max_in_flight` never binds for datagrams
	// (the cap is set to `u32::MAX` in `start`, above).
	let admission_guard = match admission.admit(peer.ip()) {
		Ok(guard) => guard,
		Err(ProxyError::IpDenied) => {
			stats.blocked_by_ip.fetch_add(1, Ordering::Relaxed);
			record(stats, start, started_at, Some(peer.ip()), 0, 0, Outcome::Denied);
			return;
		},
		Err(ProxyError::RateLimited) => {
			record(stats, start, started_at, Some(peer.ip()), 0, 0, Outcome::RateLimited);
			return;
		},
		Err(_) => {
			record(stats, start, started_at, Some(peer.ip()), 0, 0, Outcome::Failed);
			return;
		},
	};

	let upstream_addr = format!("{}:{}", backend.host, backend.port);
	let upstream = match UdpSocket::bind("0.0.0.0:0").await {
		Ok(s) => s,
		Err(e) => {
			warn!(frontend = %name, error = %e, "failed to bind ephemeral upstream socket");
			record(stats, start, started_at, Some(peer.ip()), 0, 0, Outcome::Failed);
			return;
		},
	};
	if let Err(e) = upstream.connect(&upstream_addr).await {
		warn!(frontend = %name, upstream = %upstream_addr, error = %e, "upstream unreachable");
		record(stats, start, started_at, Some(peer.ip()), 0, 0, Outcome::Failed);
		return;
	}
	if let Err(e) = upstream.send(&datagram).await {
		warn!(frontend = %name, upstream = %upstream_addr, error = %e, "failed to forward datagram");
		record(stats, start, started_at, Some(peer.ip()), datagram.len() as u64, 0, Outcome::Failed);
		return;
	}
	drop(admission_guard);

	let mut resp_buf = vec![0u8; MAX_DATAGRAM];
	let outcome = match tokio::time::timeout(RESPONSE_DEADLINE, upstream.recv(&mut resp_buf)).await
	{
		Ok(Ok(resp_len)) => {
			if let Err(e) = socket.send_to(&resp_buf[..resp_len], peer).await {
				warn!(frontend = %name, peer = %peer, error = %e, "failed to relay response to sender");
				Outcome::Failed
			} else {
				Outcome::Success
			}
		},
		Ok(Err(e)) => {
			debug!(frontend = %name, upstream = %upstream_addr, error = %e, "no response received");
			Outcome::Failed
		},
		Err(_) => {
			debug!(frontend = %name, upstream = %upstream_addr, "response wait timed out");
			Outcome::IdleTimeout
		},
	};
	record(
		stats,
		start,
		started_at,
		Some(peer.ip()),
		datagram.len() as u64,
		0,
		outcome,
	);
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
