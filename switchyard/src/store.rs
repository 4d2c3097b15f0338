//! The configuration store contract (spec §6). The core only ever issues
//! these five calls; it never embeds the store's schema. A `StaticStore`
//! in-memory implementation is provided for tests and for the CLI's
//! `--config <file>` mode — it is demo/test tooling, not the production
//! contract, which stays abstract.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::config::{BackendSpec, DomainRoute, FrontendSpec};
use crate::error::ProxyError;

/// An update to a watched collection, mirroring the add/remove events a
/// real store streams to the reconciler.
#[derive(Debug, Clone)]
pub enum Event<T> {
	Add(T),
	Remove(T),
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
	async fn list_enabled_frontends(&self) -> Result<Vec<FrontendSpec>, ProxyError>;
	async fn get_backend(&self, backend_ref: &str) -> Result<BackendSpec, ProxyError>;
	async fn get_domain_routes(&self, frontend_name: &str) -> Result<Vec<DomainRoute>, ProxyError>;
	async fn list_ip_filters(
		&self,
		frontend_name: &str,
	) -> Result<(Vec<IpAddr>, Vec<IpAddr>), ProxyError>;
	async fn settings(&self, key: &str) -> Option<String>;
}

/// A fixed, in-memory `ConfigStore`. Good enough to drive the reconciler in
/// tests and in the CLI's file-config mode; a production deployment is
/// expected to back `ConfigStore` with a real database (out of scope, per
/// spec §1).
#[derive(Debug, Clone, Default)]
pub struct StaticStore {
	frontends: HashMap<String, FrontendSpec>,
	backends: HashMap<String, BackendSpec>,
	settings: HashMap<String, String>,
}

impl StaticStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_frontend(mut self, spec: FrontendSpec) -> Self {
		self.frontends.insert(spec.name.clone(), spec);
		self
	}

	pub fn with_backend(mut self, spec: BackendSpec) -> Self {
		self.backends.insert(spec.name.clone(), spec);
		self
	}

	pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.settings.insert(key.into(), value.into());
		self
	}
}

#[async_trait]
impl ConfigStore for StaticStore {
	async fn list_enabled_frontends(&self) -> Result<Vec<FrontendSpec>, ProxyError> {
		Ok(
			self
				.frontends
				.values()
				.filter(|f| f.enabled)
				.cloned()
				.collect(),
		)
	}

	async fn get_backend(&self, backend_ref: &str) -> Result<BackendSpec, ProxyError> {
		self
			.backends
			.get(backend_ref)
			.cloned()
			.ok_or_else(|| ProxyError::ConfigInvalid(format!("unknown backend {backend_ref}")))
	}

	async fn get_domain_routes(&self, frontend_name: &str) -> Result<Vec<DomainRoute>, ProxyError> {
		Ok(
			self
				.frontends
				.get(frontend_name)
				.map(|f| f.domain_routes.clone())
				.unwrap_or_default(),
		)
	}

	async fn list_ip_filters(
		&self,
		frontend_name: &str,
	) -> Result<(Vec<IpAddr>, Vec<IpAddr>), ProxyError> {
		Ok(self
			.frontends
			.get(frontend_name)
			.map(|f| (f.ip_filter.allowlist.clone(), f.ip_filter.denylist.clone()))
			.unwrap_or_default())
	}

	async fn settings(&self, key: &str) -> Option<String> {
		self.settings.get(key).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{FrontendMode, IpFilterSpec};

	fn backend(name: &str) -> BackendSpec {
		BackendSpec {
			name: name.into(),
			host: "127.0.0.1".into(),
			port: 9102,
			upstream_tls: false,
		}
	}

	fn frontend(name: &str, enabled: bool) -> FrontendSpec {
		FrontendSpec {
			name: name.into(),
			mode: FrontendMode::Tcp,
			bind_host: "127.0.0.1".into(),
			bind_port: 9101,
			enabled,
			terminate_tls: false,
			default_backend: Some("b1".into()),
			domain_routes: vec![],
			max_in_flight: 10,
			accept_rate_per_sec: 10,
			idle_timeout_ms: 5000,
			ip_filter: IpFilterSpec::default(),
		}
	}

	#[tokio::test]
	async fn only_enabled_frontends_are_listed() {
		let store = StaticStore::new()
			.with_frontend(frontend("a", true))
			.with_frontend(frontend("b", false))
			.with_backend(backend("b1"));
		let enabled = store.list_enabled_frontends().await.unwrap();
		assert_eq!(enabled.len(), 1);
		assert_eq!(enabled[0].name, "a");
	}

	#[tokio::test]
	async fn unknown_backend_is_an_error() {
		let store = StaticStore::new();
		assert!(store.get_backend("missing").await.is_err());
	}
}
