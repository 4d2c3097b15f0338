//! Proxy Manager (C7, spec §4.7): the single owner of every frontend
//! runtime's lifecycle. One `FrontendHandle` lives per running frontend
//! name in a `tokio::sync::Mutex`-guarded registry — a `tokio` mutex
//! rather than `parking_lot`, since `start`/`stop`/`restart` hold the
//! guard across socket binds, drain waits, and the restart sleep, all of
//! which are `.await` points.
//!
//! The registry drives per-bind accept tasks under `drain`, with explicit
//! `start`/`stop`/`restart` entry points; watching the store for changes
//! is the Reconciler's job (§4.8), not the Manager's.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ca::CertificateAuthority;
use crate::config::{BackendSpec, FrontendMode, FrontendSpec};
use crate::error::ProxyError;
use crate::frontend::{self, FrontendHandle, RoutingTable, STOP_DRAIN_DEADLINE, StatsSnapshot};
use crate::store::ConfigStore;

/// Sleep between `stop` and `start` in `restart`, giving the kernel a
/// moment to release the bound port (spec §4.7: "a short sleep between to
/// release the port").
const RESTART_SETTLE: Duration = Duration::from_millis(200);

pub struct Manager {
	data_dir: PathBuf,
	ca: Option<Arc<CertificateAuthority>>,
	store: Arc<dyn ConfigStore>,
	runtimes: Mutex<HashMap<String, FrontendHandle>>,
}

impl Manager {
	pub fn new(
		data_dir: PathBuf,
		ca: Option<Arc<CertificateAuthority>>,
		store: Arc<dyn ConfigStore>,
	) -> Self {
		Self {
			data_dir,
			ca,
			store,
			runtimes: Mutex::new(HashMap::new()),
		}
	}

	fn ip_filter_dir(&self, frontend_name: &str) -> PathBuf {
		self.data_dir.join("ip_filters").join(frontend_name)
	}

	/// Idempotent: if a runtime for `spec.name` already exists, this is a
	/// no-op (spec §4.7).
	pub async fn start(&self, spec: FrontendSpec) -> Result<(), ProxyError> {
		spec.validate()?;
		let mut runtimes = self.runtimes.lock().await;
		if runtimes.contains_key(&spec.name) {
			return Ok(());
		}
		let name = spec.name.clone();
		let handle = self.spawn_frontend(spec).await?;
		handle.mark_running();
		runtimes.insert(name, handle);
		Ok(())
	}

	/// Signals cancellation, waits for the accept task (and, transitively,
	/// its drained connections) to finish bounded by a 10 s deadline, then
	/// removes the runtime. A name with no runtime is a no-op.
	pub async fn stop(&self, name: &str) -> Result<(), ProxyError> {
		let handle = {
			let mut runtimes = self.runtimes.lock().await;
			runtimes.remove(name)
		};
		let Some(handle) = handle else {
			return Ok(());
		};
		handle.stop(STOP_DRAIN_DEADLINE).await;
		info!(frontend = name, "frontend stopped");
		Ok(())
	}

	/// `stop` followed by `start(new_spec)` with a settling sleep between,
	/// so the new listener doesn't race the old one's socket teardown.
	pub async fn restart(&self, name: &str, new_spec: FrontendSpec) -> Result<(), ProxyError> {
		self.stop(name).await?;
		tokio::time::sleep(RESTART_SETTLE).await;
		self.start(new_spec).await
	}

	/// Fetches the latest spec for `name` from the configuration store and
	/// restarts (or stops, if it's no longer enabled) the runtime. Other
	/// frontends are never touched (spec §4.7's restart-isolation
	/// invariant), since each name's entry in `runtimes` is independent.
	pub async fn reload_single(&self, name: &str) -> Result<(), ProxyError> {
		let enabled = self.store.list_enabled_frontends().await?;
		match enabled.into_iter().find(|s| s.name == name) {
			Some(spec) => self.restart(name, spec).await,
			None => self.stop(name).await,
		}
	}

	/// Non-blocking, lock-protected snapshot of every running frontend's
	/// counters and recent-events ring (spec §4.7).
	pub async fn stats(&self) -> Vec<StatsSnapshot> {
		let runtimes = self.runtimes.lock().await;
		runtimes.values().map(FrontendHandle::snapshot).collect()
	}

	async fn spawn_frontend(&self, spec: FrontendSpec) -> Result<FrontendHandle, ProxyError> {
		let ip_filter_dir = self.ip_filter_dir(&spec.name);
		let ip_filter_seed = self.store.list_ip_filters(&spec.name).await?;
		match spec.mode {
			FrontendMode::Tcp => {
				let backend = self.resolve_backend(spec.default_backend.as_deref(), &spec.name).await?;
				frontend::tcp::start(spec, backend, &ip_filter_dir, ip_filter_seed, self.ca.clone()).await
			},
			FrontendMode::Udp => {
				let backend = self.resolve_backend(spec.default_backend.as_deref(), &spec.name).await?;
				frontend::udp::start(spec, backend, &ip_filter_dir, ip_filter_seed).await
			},
			FrontendMode::Http => {
				let routing = self.build_routing_table(&spec).await?;
				frontend::http::start(spec, routing, &ip_filter_dir, ip_filter_seed, self.ca.clone()).await
			},
		}
	}

	async fn resolve_backend(
		&self,
		backend_ref: Option<&str>,
		frontend_name: &str,
	) -> Result<BackendSpec, ProxyError> {
		let backend_ref = backend_ref.ok_or_else(|| {
			ProxyError::ConfigInvalid(format!("frontend {frontend_name}: no default_backend"))
		})?;
		self.store.get_backend(backend_ref).await
	}

	async fn build_routing_table(&self, spec: &FrontendSpec) -> Result<RoutingTable, ProxyError> {
		let domain_routes = self.store.get_domain_routes(&spec.name).await?;
		let mut exact = Vec::with_capacity(domain_routes.len());
		for route in &domain_routes {
			let backend = self.store.get_backend(&route.backend_ref).await?;
			exact.push((route.host_pattern.clone(), backend));
		}
		let default = match &spec.default_backend {
			Some(backend_ref) => Some(self.store.get_backend(backend_ref).await?),
			None => None,
		};
		if exact.is_empty() && default.is_none() {
			warn!(frontend = %spec.name, "http frontend has neither domain_routes nor a default_backend");
		}
		Ok(RoutingTable::new(exact, default))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::IpFilterSpec;
	use crate::store::StaticStore;

	fn backend(name: &str, port: u16) -> BackendSpec {
		BackendSpec {
			name: name.into(),
			host: "127.0.0.1".into(),
			port,
			upstream_tls: false,
		}
	}

	fn tcp_spec(name: &str, port: u16, backend_ref: &str) -> FrontendSpec {
		FrontendSpec {
			name: name.into(),
			mode: FrontendMode::Tcp,
			bind_host: "127.0.0.1".into(),
			bind_port: port,
			enabled: true,
			terminate_tls: false,
			default_backend: Some(backend_ref.into()),
			domain_routes: vec![],
			max_in_flight: 16,
			accept_rate_per_sec: 100,
			idle_timeout_ms: 5_000,
			ip_filter: IpFilterSpec::default(),
		}
	}

	#[tokio::test]
	async fn start_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(StaticStore::new().with_backend(backend("b1", 19_999)));
		let manager = Manager::new(dir.path().to_path_buf(), None, store);

		let spec = tcp_spec("front-a", 0, "b1");
		// bind_port 0 lets the OS pick a free port; this only tests that a
		// second `start` with the same name is a no-op.
		manager.start(spec.clone()).await.unwrap();
		manager.start(spec).await.unwrap();
		assert_eq!(manager.stats().await.len(), 1);
		manager.stop("front-a").await.unwrap();
		assert!(manager.stats().await.is_empty());
	}

	#[tokio::test]
	async fn restarting_one_frontend_leaves_another_untouched() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(
			StaticStore::new()
				.with_backend(backend("b1", 19_998))
				.with_backend(backend("b2", 19_997)),
		);
		let manager = Manager::new(dir.path().to_path_buf(), None, store);

		manager.start(tcp_spec("front-a", 0, "b1")).await.unwrap();
		manager.start(tcp_spec("front-b", 0, "b2")).await.unwrap();

		let before = manager
			.stats()
			.await
			.into_iter()
			.find(|s| s.name == "front-b")
			.unwrap();

		manager
			.restart("front-a", tcp_spec("front-a", 0, "b1"))
			.await
			.unwrap();

		let after = manager
			.stats()
			.await
			.into_iter()
			.find(|s| s.name == "front-b")
			.unwrap();
		assert_eq!(before.total_flows, after.total_flows);
		assert_eq!(before.state, after.state);

		manager.stop("front-a").await.unwrap();
		manager.stop("front-b").await.unwrap();
	}
}
