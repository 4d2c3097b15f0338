//! Concurrency & rate gate (C2, spec §4.2). Each frontend owns one `Gate`
//! guarding two independent budgets: a hard cap on simultaneously in-flight
//! flows, and a sliding one-second window on admissions.
//!
//! The window is a deque of admission `Instant`s: track timestamps, purge
//! everything outside the window, compare the remaining count to the
//! limit. This is per-frontend and per-second with no block period —
//! admission control here gates *accept rate*, not repeated-offender
//! punishment, so there is no `blocked_until` state to track. `Instant` is
//! used rather than wall-clock time so a system clock step never stalls or
//! floods the gate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(1);

struct RateWindow {
	timestamps: VecDeque<Instant>,
	limit_per_sec: u32,
}

impl RateWindow {
	fn purge(&mut self, now: Instant) {
		while let Some(&front) = self.timestamps.front() {
			if now.duration_since(front) > WINDOW {
				self.timestamps.pop_front();
			} else {
				break;
			}
		}
	}

	fn try_admit(&mut self, now: Instant) -> bool {
		self.purge(now);
		if self.timestamps.len() as u32 >= self.limit_per_sec {
			return false;
		}
		self.timestamps.push_back(now);
		true
	}
}

/// Per-frontend admission gate: concurrency cap + 1s sliding-window rate
/// limit. Cheap to check on every accepted connection or request.
pub struct Gate {
	max_in_flight: u32,
	in_flight: AtomicU32,
	window: Mutex<RateWindow>,
}

/// RAII guard returned by a successful [`Gate::try_enter`]; releases the
/// in-flight slot on drop so a panicking or early-returning handler can
/// never leak capacity.
pub struct Admission<'a> {
	gate: &'a Gate,
}

impl Drop for Admission<'_> {
	fn drop(&mut self) {
		self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
	}
}

impl Gate {
	pub fn new(max_in_flight: u32, accept_rate_per_sec: u32) -> Self {
		Self {
			max_in_flight,
			in_flight: AtomicU32::new(0),
			window: Mutex::new(RateWindow {
				timestamps: VecDeque::new(),
				limit_per_sec: accept_rate_per_sec,
			}),
		}
	}

	pub fn in_flight(&self) -> u32 {
		self.in_flight.load(Ordering::Acquire)
	}

	/// Concurrency check first: a flow already over the in-flight cap is
	/// `OVER_CAPACITY` regardless of the rate window's state, so the
	/// cheaper counter read must gate the window check, not the reverse.
	pub fn try_enter(&self) -> Result<Admission<'_>, GateRejection> {
		let mut current = self.in_flight.load(Ordering::Acquire);
		loop {
			if current >= self.max_in_flight {
				return Err(GateRejection::OverCapacity);
			}
			match self.in_flight.compare_exchange_weak(
				current,
				current + 1,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => break,
				Err(observed) => current = observed,
			}
		}

		if !self.window.lock().try_admit(Instant::now()) {
			self.in_flight.fetch_sub(1, Ordering::AcqRel);
			return Err(GateRejection::RateLimited);
		}

		Ok(Admission { gate: self })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
	RateLimited,
	OverCapacity,
}

impl From<GateRejection> for crate::error::ProxyError {
	fn from(r: GateRejection) -> Self {
		match r {
			GateRejection::RateLimited => crate::error::ProxyError::RateLimited,
			GateRejection::OverCapacity => crate::error::ProxyError::OverCapacity,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn admits_up_to_rate_then_rejects() {
		let gate = Gate::new(100, 3);
		assert!(gate.try_enter().is_ok());
		assert!(gate.try_enter().is_ok());
		assert!(gate.try_enter().is_ok());
		assert_eq!(gate.try_enter().unwrap_err(), GateRejection::RateLimited);
	}

	#[test]
	fn concurrency_cap_is_independent_of_rate() {
		let gate = Gate::new(1, 100);
		let first = gate.try_enter().unwrap();
		assert_eq!(gate.try_enter().unwrap_err(), GateRejection::OverCapacity);
		drop(first);
		assert!(gate.try_enter().is_ok());
	}

	#[test]
	fn over_capacity_takes_priority_over_rate_limited() {
		// max_in_flight=1, accept_rate_per_sec=1: the rate window still has
		// room for the second admission in isolation, but the concurrency
		// cap is already exhausted by the first, so the rejection must be
		// OVER_CAPACITY, never RATE_LIMITED.
		let gate = Gate::new(1, 1);
		let _first = gate.try_enter().unwrap();
		assert_eq!(gate.try_enter().unwrap_err(), GateRejection::OverCapacity);
	}

	#[test]
	fn dropping_admission_frees_the_slot() {
		let gate = Gate::new(1, 100);
		{
			let _admission = gate.try_enter().unwrap();
			assert_eq!(gate.in_flight(), 1);
		}
		assert_eq!(gate.in_flight(), 0);
	}
}
