//! Desired-state data model (spec §3). `FrontendSpec` and `BackendSpec` are
//! validated exhaustively at construction so an invalid record never makes
//! it into the store: unknown fields are rejected by `serde`'s
//! `deny_unknown_fields`, and field-level invariants are checked by
//! `FrontendSpec::validate`.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendMode {
	Tcp,
	Udp,
	Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainRoute {
	pub host_pattern: String,
	pub backend_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IpFilterSpec {
	#[serde(default)]
	pub allowlist: Vec<IpAddr>,
	#[serde(default)]
	pub denylist: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendSpec {
	pub name: String,
	pub mode: FrontendMode,
	pub bind_host: String,
	pub bind_port: u16,
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub terminate_tls: bool,
	#[serde(default)]
	pub default_backend: Option<String>,
	#[serde(default)]
	pub domain_routes: Vec<DomainRoute>,
	pub max_in_flight: u32,
	pub accept_rate_per_sec: u32,
	#[serde(default = "default_idle_timeout_ms")]
	pub idle_timeout_ms: u64,
	#[serde(default)]
	pub ip_filter: IpFilterSpec,
}

fn default_idle_timeout_ms() -> u64 {
	5 * 60 * 1000
}

impl FrontendSpec {
	/// Exhaustive validation at the store boundary (spec §9: "unknown
	/// fields are rejected, not silently ignored" — extended here to
	/// invalid field *values*, not just unknown keys).
	pub fn validate(&self) -> Result<(), ProxyError> {
		if self.name.trim().is_empty() {
			return Err(ProxyError::ConfigInvalid("frontend name is empty".into()));
		}
		if self.bind_host.trim().is_empty() {
			return Err(ProxyError::ConfigInvalid(format!(
				"frontend {}: bind_host is empty",
				self.name
			)));
		}
		if self.max_in_flight < 1 {
			return Err(ProxyError::ConfigInvalid(format!(
				"frontend {}: max_in_flight must be >= 1",
				self.name
			)));
		}
		if self.accept_rate_per_sec < 1 {
			return Err(ProxyError::ConfigInvalid(format!(
				"frontend {}: accept_rate_per_sec must be >= 1",
				self.name
			)));
		}
		if self.mode == FrontendMode::Tcp && self.default_backend.is_none() {
			return Err(ProxyError::ConfigInvalid(format!(
				"frontend {}: default_backend is mandatory for tcp mode",
				self.name
			)));
		}
		for route in &self.domain_routes {
			if route.host_pattern.trim().is_empty() {
				return Err(ProxyError::ConfigInvalid(format!(
					"frontend {}: domain route has an empty host_pattern",
					self.name
				)));
			}
		}
		Ok(())
	}

	pub fn bind_addr(&self) -> String {
		format!("{}:{}", self.bind_host, self.bind_port)
	}

	/// Whether `bind_host` is a wildcard address, for SAN computation in
	/// the CA (spec §3: "SANs include ... bind_host when not wildcard").
	pub fn bind_host_is_wildcard(&self) -> bool {
		matches!(
			self.bind_host.as_str(),
			"0.0.0.0" | "::" | "*" | "" | "[::]"
		)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSpec {
	pub name: String,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub upstream_tls: bool,
}

impl BackendSpec {
	pub fn validate(&self) -> Result<(), ProxyError> {
		if self.name.trim().is_empty() {
			return Err(ProxyError::ConfigInvalid("backend name is empty".into()));
		}
		if self.host.trim().is_empty() {
			return Err(ProxyError::ConfigInvalid(format!(
				"backend {}: host is empty",
				self.name
			)));
		}
		if self.port == 0 {
			return Err(ProxyError::ConfigInvalid(format!(
				"backend {}: port must be non-zero",
				self.name
			)));
		}
		Ok(())
	}
}

/// Resolved `(upstream_host, upstream_port, upstream_tls)` tuple, computed
/// once per HTTP request or per accepted TCP connection (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
	pub upstream_host: String,
	pub upstream_port: u16,
	pub upstream_tls: bool,
}

impl From<&BackendSpec> for RoutingDecision {
	fn from(b: &BackendSpec) -> Self {
		RoutingDecision {
			upstream_host: b.host.clone(),
			upstream_port: b.port,
			upstream_tls: b.upstream_tls,
		}
	}
}

/// True iff every field of `a` and `b` (and, by caller responsibility, the
/// transitively referenced backends) compares equal. Named to mirror
/// spec §4.8 `spec_changed` (this is its negation).
pub fn specs_equal(a: &FrontendSpec, b: &FrontendSpec) -> bool {
	a == b
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_spec() -> FrontendSpec {
		FrontendSpec {
			name: "t1".into(),
			mode: FrontendMode::Tcp,
			bind_host: "127.0.0.1".into(),
			bind_port: 9101,
			enabled: true,
			terminate_tls: false,
			default_backend: Some("b1".into()),
			domain_routes: vec![],
			max_in_flight: 10,
			accept_rate_per_sec: 10,
			idle_timeout_ms: default_idle_timeout_ms(),
			ip_filter: IpFilterSpec::default(),
		}
	}

	#[test]
	fn rejects_zero_max_in_flight() {
		let mut s = base_spec();
		s.max_in_flight = 0;
		assert!(s.validate().is_err());
	}

	#[test]
	fn rejects_tcp_without_default_backend() {
		let mut s = base_spec();
		s.default_backend = None;
		assert!(s.validate().is_err());
	}

	#[test]
	fn wildcard_detection() {
		let mut s = base_spec();
		s.bind_host = "0.0.0.0".into();
		assert!(s.bind_host_is_wildcard());
		s.bind_host = "proxy.example.com".into();
		assert!(!s.bind_host_is_wildcard());
	}

	#[test]
	fn spec_changed_detects_field_diffs() {
		let a = base_spec();
		let mut b = base_spec();
		assert!(specs_equal(&a, &b));
		b.bind_port = 9999;
		assert!(!specs_equal(&a, &b));
	}
}
