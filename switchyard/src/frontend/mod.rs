//! Shared frontend machinery (spec §4.4-§4.6): the lifecycle state
//! machine, the bounded stats ring, and the routing-table lookup used by
//! both the TCP and HTTP frontends. Each protocol module (`tcp`, `udp`,
//! `http`) owns its accept loop and per-flow handling; this module only
//! owns what's common across them — the bounded connection history (a
//! 100-entry ring), per-method and per-domain counters, and the
//! accept-task/drain/abort-handle bundle returned to the manager.

pub mod http;
pub mod tcp;
pub mod udp;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::admission::AdmissionControl;
use crate::config::{BackendSpec, FrontendSpec};
use crate::error::ProxyError;

/// Deadline the manager allows a stopping frontend to drain in-flight work
/// before forcing the accept task down (spec §4.7: "waits up to 10 s for
/// drain").
pub const STOP_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Lifecycle state of one frontend runtime (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendState {
	Starting,
	Running,
	Stopping,
	Stopped,
	Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Success,
	Failed,
	Denied,
	RateLimited,
	OverCapacity,
	IdleTimeout,
}

/// One entry in a frontend's bounded connection/request history.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
	pub start: SystemTime,
	pub peer: Option<IpAddr>,
	pub duration: Duration,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub outcome: Outcome,
}

const HISTORY_CAPACITY: usize = 100;

/// Per-domain request/byte accounting, keyed by `Host` header (HTTP
/// frontends only; TCP/UDP have no notion of "domain").
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainStat {
	pub requests: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
}

/// Per-frontend counters and bounded history (spec §4.4 "append a
/// `ConnectionRecord`..."; §4.6 "Per-request accounting"). All counters are
/// monotonically non-decreasing for the life of the runtime.
#[derive(Default)]
pub struct Stats {
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
	pub total_flows: AtomicU64,
	pub failed_flows: AtomicU64,
	pub blocked_by_ip: AtomicU64,
	history: Mutex<VecDeque<ConnectionRecord>>,
	method_stats: Mutex<HashMap<String, u64>>,
	domain_stats: Mutex<HashMap<String, DomainStat>>,
}

impl Stats {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record(&self, record: ConnectionRecord) {
		let mut history = self.history.lock();
		if history.len() == HISTORY_CAPACITY {
			history.pop_front();
		}
		history.push_back(record);
	}

	pub fn recent(&self) -> Vec<ConnectionRecord> {
		self.history.lock().iter().cloned().collect()
	}

	/// Arithmetic mean of recorded durations (spec §4.6: "cumulative mean
	/// response time (arithmetic mean over the ring)").
	pub fn mean_duration(&self) -> Duration {
		let history = self.history.lock();
		if history.is_empty() {
			return Duration::ZERO;
		}
		let total: Duration = history.iter().map(|r| r.duration).sum();
		total / history.len() as u32
	}

	/// Bumps the per-method request count (HTTP only; spec §4.6 "statistics
	/// per HTTP method").
	pub fn record_method(&self, method: &str) {
		let mut methods = self.method_stats.lock();
		*methods.entry(method.to_string()).or_insert(0) += 1;
	}

	pub fn method_counts(&self) -> HashMap<String, u64> {
		self.method_stats.lock().clone()
	}

	/// Bumps the per-domain request/byte counters (HTTP only; spec §4.6
	/// "statistics per routed domain"), keyed by the `Host` header with any
	/// port stripped, or `"unknown"` when absent.
	pub fn record_domain(&self, domain: &str, bytes_in: u64, bytes_out: u64) {
		let mut domains = self.domain_stats.lock();
		let entry = domains.entry(domain.to_string()).or_default();
		entry.requests += 1;
		entry.bytes_in += bytes_in;
		entry.bytes_out += bytes_out;
	}

	pub fn domain_counts(&self) -> HashMap<String, DomainStat> {
		self.domain_stats.lock().clone()
	}
}

/// A point-in-time copy of one frontend's observable state, returned by
/// `Manager::stats` (spec §4.7: "a lock-protected copy").
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
	pub name: String,
	pub bind_addr: String,
	pub state: FrontendState,
	pub last_error: Option<String>,
	pub in_flight: u32,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub total_flows: u64,
	pub failed_flows: u64,
	pub blocked_by_ip: u64,
	pub mean_duration: Duration,
	pub recent: Vec<ConnectionRecord>,
	pub method_stats: HashMap<String, u64>,
	pub domain_stats: HashMap<String, DomainStat>,
}

/// Pre-resolved host routing for one frontend (spec §3's `RoutingDecision`,
/// computed once at start/reload rather than re-read from the store on
/// every flow).
#[derive(Clone)]
pub struct RoutingTable {
	exact: Vec<(String, BackendSpec)>,
	default: Option<BackendSpec>,
}

impl RoutingTable {
	pub fn new(exact: Vec<(String, BackendSpec)>, default: Option<BackendSpec>) -> Self {
		Self { exact, default }
	}

	/// Host-lookup order from spec §4.6: exact `domain_routes` match, then
	/// `default_backend`, then a "no backend configured" error.
	pub fn resolve(&self, host: &str) -> Result<&BackendSpec, ProxyError> {
		if let Some((_, backend)) = self.exact.iter().find(|(pattern, _)| pattern == host) {
			return Ok(backend);
		}
		self
			.default
			.as_ref()
			.ok_or_else(|| ProxyError::UpstreamProtocolError("No backend configured".into()))
	}
}

/// A started frontend as held by the `Manager`: its shared, externally
/// observable state plus the handle needed to stop it.
pub struct FrontendHandle {
	pub spec: FrontendSpec,
	pub state: Mutex<FrontendState>,
	pub last_error: Mutex<Option<String>>,
	pub stats: Arc<Stats>,
	pub admission: Arc<AdmissionControl>,
	accept_task: JoinHandle<()>,
	drain: switchyard_core::drain::DrainTrigger,
}

impl FrontendHandle {
	/// `stats` is shared with (and written to by) the accept task spawned
	/// for this frontend, so callers build it before spawning and hand the
	/// same `Arc` to both sides.
	pub fn new(
		spec: FrontendSpec,
		admission: Arc<AdmissionControl>,
		stats: Arc<Stats>,
		accept_task: JoinHandle<()>,
		drain: switchyard_core::drain::DrainTrigger,
	) -> Self {
		Self {
			spec,
			state: Mutex::new(FrontendState::Starting),
			last_error: Mutex::new(None),
			stats,
			admission,
			accept_task,
			drain,
		}
	}

	pub fn mark_running(&self) {
		*self.state.lock() = FrontendState::Running;
	}

	pub fn mark_failed(&self, error: String) {
		*self.state.lock() = FrontendState::Failed;
		*self.last_error.lock() = Some(error);
	}

	pub fn state(&self) -> FrontendState {
		*self.state.lock()
	}

	pub fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			name: self.spec.name.clone(),
			bind_addr: self.spec.bind_addr(),
			state: self.state(),
			last_error: self.last_error.lock().clone(),
			in_flight: self.admission.in_flight(),
			bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
			total_flows: self.stats.total_flows.load(Ordering::Relaxed),
			failed_flows: self.stats.failed_flows.load(Ordering::Relaxed),
			blocked_by_ip: self.stats.blocked_by_ip.load(Ordering::Relaxed),
			mean_duration: self.stats.mean_duration(),
			recent: self.stats.recent(),
			method_stats: self.stats.method_counts(),
			domain_stats: self.stats.domain_counts(),
		}
	}

	/// Stop semantics from spec §4.7: signal cancellation, then wait for
	/// the accept task (and, transitively, its drain-tracked children) to
	/// finish, bounded by `deadline`. After the deadline the task is
	/// aborted outright. The accept task itself enforces `deadline`
	/// internally (it was started under `drain::run_with_drain`), so this
	/// outer timeout is a safety net against a wedged or panicked task
	/// rather than the primary enforcement point.
	pub async fn stop(self, deadline: Duration) {
		*self.state.lock() = FrontendState::Stopping;
		let FrontendHandle {
			accept_task, drain, ..
		} = self;
		let mut accept_task = accept_task;
		if tokio::time::timeout(
			deadline,
			drain.start_drain_and_wait(switchyard_core::drain::DrainMode::Graceful),
		)
		.await
		.is_err()
		{
			accept_task.abort();
		}
		let _ = accept_task.await;
		*self.state.lock() = FrontendState::Stopped;
	}
}
