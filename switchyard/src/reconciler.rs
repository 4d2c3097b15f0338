//! Configuration Reconciler (C8, spec §4.8): diffs desired state from the
//! configuration store against the Manager's current runtime set and
//! drives `start`/`stop`/`restart` accordingly.
//!
//! The overall shape is snapshot desired state, diff against current,
//! drive the owner — as an explicit, one-shot `reconcile()` step invoked
//! at startup and on each admin-API change notification, rather than a
//! long-running subscription loop.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::warn;

use crate::config::{FrontendSpec, specs_equal};
use crate::error::ProxyError;
use crate::manager::Manager;
use crate::store::ConfigStore;

pub struct Reconciler {
	manager: Arc<Manager>,
	store: Arc<dyn ConfigStore>,
}

impl Reconciler {
	pub fn new(manager: Arc<Manager>, store: Arc<dyn ConfigStore>) -> Self {
		Self { manager, store }
	}

	/// One reconciliation pass. `current` is the caller's view of what's
	/// presently running (name -> spec it was started with); the Manager
	/// itself doesn't expose this, so the caller — typically whatever last
	/// called `reconcile` — is expected to track it across calls.
	///
	/// Returns the new `current` set, to be threaded into the next call.
	pub async fn reconcile(
		&self,
		current: &[FrontendSpec],
	) -> Result<Vec<FrontendSpec>, ProxyError> {
		let desired = self.store.list_enabled_frontends().await?;

		let desired_names: HashSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();
		let current_by_name: std::collections::HashMap<&str, &FrontendSpec> =
			current.iter().map(|s| (s.name.as_str(), s)).collect();

		let to_start: Vec<FrontendSpec> = desired
			.iter()
			.filter(|s| !current_by_name.contains_key(s.name.as_str()))
			.cloned()
			.collect();
		let to_stop: Vec<String> = current
			.iter()
			.filter(|s| !desired_names.contains(s.name.as_str()))
			.map(|s| s.name.clone())
			.collect();
		let to_restart: Vec<FrontendSpec> = desired
			.iter()
			.filter(|s| {
				current_by_name
					.get(s.name.as_str())
					.is_some_and(|running| !specs_equal(running, s))
			})
			.cloned()
			.collect();

		// Operations on distinct names are independent (spec §4.8) and run
		// concurrently; a failure on one name is recorded on its own
		// runtime by the Manager and must not abort the others' futures.
		let stop_futs = to_stop.iter().map(|name| {
			let manager = &self.manager;
			async move {
				if let Err(e) = manager.stop(name).await {
					warn!(frontend = %name, error = %e, "failed to stop frontend during reconciliation");
				}
			}
		});
		join_all(stop_futs).await;

		let restart_futs = to_restart.iter().map(|spec| {
			let manager = &self.manager;
			async move {
				if let Err(e) = manager.restart(&spec.name, spec.clone()).await {
					warn!(frontend = %spec.name, error = %e, "failed to restart frontend during reconciliation");
				}
			}
		});
		join_all(restart_futs).await;

		let start_futs = to_start.iter().map(|spec| {
			let manager = &self.manager;
			async move {
				if let Err(e) = manager.start(spec.clone()).await {
					warn!(frontend = %spec.name, error = %e, "failed to start frontend during reconciliation");
				}
			}
		});
		join_all(start_futs).await;

		Ok(desired)
	}
}
