//! Admission control (spec §4.1, §4.2): IP filtering and the
//! concurrency/rate gate, composed into one per-frontend checkpoint that
//! the frontends call before doing any proxying work.

pub mod gate;
pub mod ip_filter;

use std::net::IpAddr;
use std::sync::Arc;

use gate::{Admission, Gate};
use ip_filter::IpFilter;

use crate::error::ProxyError;

/// Everything a frontend needs to decide whether to admit a newly accepted
/// connection or request, bundled so `FrontendRuntime` only has to hold
/// one handle.
pub struct AdmissionControl {
	ip_filter: Arc<IpFilter>,
	gate: Gate,
}

impl AdmissionControl {
	pub fn new(ip_filter: Arc<IpFilter>, max_in_flight: u32, accept_rate_per_sec: u32) -> Self {
		Self {
			ip_filter,
			gate: Gate::new(max_in_flight, accept_rate_per_sec),
		}
	}

	pub fn ip_filter(&self) -> &Arc<IpFilter> {
		&self.ip_filter
	}

	pub fn in_flight(&self) -> u32 {
		self.gate.in_flight()
	}

	/// Runs the full admission checkpoint: source IP first (cheapest,
	/// and the rejection the operator most wants logged distinctly), then
	/// the gate. Returns an RAII [`Admission`] that must be held for the
	/// lifetime of the flow.
	pub fn admit(&self, peer: IpAddr) -> Result<Admission<'_>, ProxyError> {
		if !self.ip_filter.allow(peer) {
			return Err(ProxyError::IpDenied);
		}
		self.gate.try_enter().map_err(Into::into)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn denied_ip_never_touches_the_gate() {
		let dir = tempfile::tempdir().unwrap();
		let filter = Arc::new(ip_filter::IpFilter::load(dir.path()).unwrap());
		let denied: IpAddr = "203.0.113.5".parse().unwrap();
		filter.add_to_denylist(denied).unwrap();
		let control = AdmissionControl::new(filter, 10, 10);
		assert!(matches!(control.admit(denied), Err(ProxyError::IpDenied)));
		assert_eq!(control.in_flight(), 0);
	}

	#[test]
	fn allowed_ip_passes_through_to_the_gate() {
		let dir = tempfile::tempdir().unwrap();
		let filter = Arc::new(ip_filter::IpFilter::load(dir.path()).unwrap());
		let control = AdmissionControl::new(filter, 1, 10);
		let peer: IpAddr = "203.0.113.6".parse().unwrap();
		let first = control.admit(peer).unwrap();
		assert_eq!(control.in_flight(), 1);
		assert!(matches!(
			control.admit(peer),
			Err(ProxyError::OverCapacity)
		));
		drop(first);
		assert!(control.admit(peer).is_ok());
	}
}
