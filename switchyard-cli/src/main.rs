//! `switchyard`: runs the reverse proxy core against a static YAML
//! configuration file, parsed with `clap` and loaded straight into a
//! [`switchyard::store::StaticStore`] — the demo/test store the core ships
//! is also the CLI's production store, since backing `ConfigStore` with a
//! database is a separate deployment's concern, not this binary's.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use switchyard::config::{BackendSpec, FrontendSpec};
use switchyard::store::StaticStore;
use switchyard::Switchyard;

#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about = "Configurable multi-protocol reverse proxy")]
struct Args {
	/// Path to a YAML file describing backends, frontends, and settings.
	#[arg(short, long, value_name = "FILE")]
	config: PathBuf,

	/// Directory for CA material and per-frontend IP filter persistence.
	#[arg(long, value_name = "DIR", default_value = "./switchyard-data")]
	data_dir: PathBuf,

	/// Disable the on-demand TLS certificate authority; frontends with
	/// `terminate_tls: true` will fail to start.
	#[arg(long)]
	no_tls: bool,

	/// Log level used when `RUST_LOG` is unset.
	#[arg(long, default_value = "info")]
	log_level: String,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
	#[serde(default)]
	backends: Vec<BackendSpec>,
	#[serde(default)]
	frontends: Vec<FrontendSpec>,
	#[serde(default)]
	settings: HashMap<String, String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	switchyard_core::telemetry::init(&args.log_level);

	let raw = tokio::fs::read_to_string(&args.config)
		.await
		.with_context(|| format!("reading {}", args.config.display()))?;
	let file_cfg: FileConfig =
		serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", args.config.display()))?;

	let mut store = StaticStore::new();
	for backend in file_cfg.backends {
		backend.validate()?;
		store = store.with_backend(backend);
	}
	for frontend in file_cfg.frontends {
		frontend.validate()?;
		store = store.with_frontend(frontend);
	}
	for (key, value) in file_cfg.settings {
		store = store.with_setting(key, value);
	}

	let switchyard = Arc::new(Switchyard::new(args.data_dir, !args.no_tls, Arc::new(store))?);
	switchyard.reconcile().await?;
	tracing::info!(
		frontends = switchyard.stats().await.len(),
		"switchyard reconciled initial configuration"
	);

	let shutdown = switchyard_core::signal::Shutdown::new();
	let reconcile_loop = {
		let switchyard = switchyard.clone();
		async move {
			loop {
				switchyard.wait_for_change().await;
				if let Err(e) = switchyard.reconcile().await {
					tracing::warn!(error = %e, "reconciliation after change notification failed");
				}
			}
		}
	};
	tokio::select! {
		_ = shutdown.wait() => {},
		_ = reconcile_loop => {},
	}
	tracing::info!("shutdown requested, draining frontends");

	let names: Vec<String> = switchyard.stats().await.into_iter().map(|s| s.name).collect();
	let manager = switchyard.manager();
	let stops = names.iter().map(|name| manager.stop(name));
	for result in futures_util::future::join_all(stops).await {
		if let Err(e) = result {
			tracing::warn!(error = %e, "error stopping frontend during shutdown");
		}
	}

	Ok(())
}
