//! Switchyard: a configurable, multi-protocol reverse proxy core.
//!
//! The crate root wires together the reverse proxy's collaborators — the
//! IP Filter (C1), the admission Gate (C2), the on-demand TLS Certificate
//! Authority (C3), the protocol frontends (C4-C6), the Proxy Manager
//! (C7), and the Configuration Reconciler (C8) — behind one composition
//! root, [`Switchyard`]. Each module is independently usable; `Switchyard`
//! just saves callers from wiring the pieces themselves.

pub mod admission;
pub mod ca;
pub mod config;
pub mod error;
pub mod frontend;
pub mod manager;
pub mod reconciler;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::ca::CertificateAuthority;
use crate::config::FrontendSpec;
use crate::error::ProxyError;
use crate::frontend::StatsSnapshot;
use crate::manager::Manager;
use crate::reconciler::Reconciler;
use crate::store::ConfigStore;

/// The composition root: a `Manager` and `Reconciler` sharing one data
/// directory (the CA's root material plus each frontend's persisted IP
/// filter sets) and one `ConfigStore`. Owns the reconciler's "what's
/// currently running" view across calls, since the store contract (spec
/// §6) is read-only and stateless — nothing else remembers it.
pub struct Switchyard {
	manager: Arc<Manager>,
	reconciler: Reconciler,
	current: Mutex<Vec<FrontendSpec>>,
	changed: Notify,
}

impl Switchyard {
	/// `data_dir` holds `ca.crt`/`ca.key` and each frontend's
	/// `ip_filters/<name>/{blacklist,whitelist}.json`. `mint_tls` enables
	/// the on-demand CA for frontends with `terminate_tls = true`; pass
	/// `false` to run without TLS termination support at all.
	pub fn new(
		data_dir: impl Into<PathBuf>,
		mint_tls: bool,
		store: Arc<dyn ConfigStore>,
	) -> Result<Self, ProxyError> {
		let data_dir = data_dir.into();
		let ca = if mint_tls {
			Some(Arc::new(CertificateAuthority::load_or_create(
				data_dir.join("ca"),
			)?))
		} else {
			None
		};
		let manager = Arc::new(Manager::new(data_dir, ca, store.clone()));
		let reconciler = Reconciler::new(manager.clone(), store);
		Ok(Self {
			manager,
			reconciler,
			current: Mutex::new(Vec::new()),
			changed: Notify::new(),
		})
	}

	/// Runs one reconciliation pass against the store (spec §4.8). Safe to
	/// call repeatedly, e.g. once at startup and again on every admin-API
	/// change notification.
	pub async fn reconcile(&self) -> Result<(), ProxyError> {
		let mut current = self.current.lock().await;
		*current = self.reconciler.reconcile(&current).await?;
		Ok(())
	}

	pub async fn stats(&self) -> Vec<StatsSnapshot> {
		self.manager.stats().await
	}

	pub fn manager(&self) -> &Arc<Manager> {
		&self.manager
	}

	/// Wakes one pending [`Switchyard::wait_for_change`] call. A future
	/// admin API that edits the configuration store would call this after
	/// committing its change; nothing in this crate calls it today.
	pub fn notify_changed(&self) {
		self.changed.notify_one();
	}

	/// Resolves the next time [`Switchyard::notify_changed`] is called. The
	/// CLI entrypoint loops `reconcile` then `wait_for_change` (raced
	/// against shutdown) so a long-running process re-reconciles whenever
	/// told to, without polling the store on a timer.
	pub async fn wait_for_change(&self) {
		self.changed.notified().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{BackendSpec, FrontendMode, IpFilterSpec};
	use crate::store::StaticStore;

	#[tokio::test]
	async fn reconcile_brings_up_a_static_store_frontend() {
		let dir = tempfile::tempdir().unwrap();
		let store: Arc<dyn ConfigStore> = Arc::new(
			StaticStore::new()
				.with_backend(BackendSpec {
					name: "b1".into(),
					host: "127.0.0.1".into(),
					port: 19_995,
					upstream_tls: false,
				})
				.with_frontend(FrontendSpec {
					name: "front-a".into(),
					mode: FrontendMode::Tcp,
					bind_host: "127.0.0.1".into(),
					bind_port: 0,
					enabled: true,
					terminate_tls: false,
					default_backend: Some("b1".into()),
					domain_routes: vec![],
					max_in_flight: 16,
					accept_rate_per_sec: 100,
					idle_timeout_ms: 5_000,
					ip_filter: IpFilterSpec::default(),
				}),
		);
		let switchyard = Switchyard::new(dir.path(), false, store).unwrap();
		switchyard.reconcile().await.unwrap();
		assert_eq!(switchyard.stats().await.len(), 1);
	}
}
