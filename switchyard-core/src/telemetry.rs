//! Structured key=value logging on stderr, installed once at process start.
//!
//! Every log record carries the fields spec'd for the proxy's process
//! output: `ts`, `level`, `event`, and whatever `frontend`/`peer`/`error`
//! fields the call site attaches via `tracing`'s structured fields. We rely
//! on `tracing_subscriber`'s default formatter for the `ts`/`level`
//! wrapping rather than hand-rolling a formatter, and let `EnvFilter` read
//! `RUST_LOG` (falling back to the level passed in).
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Installs the global `tracing` subscriber. Call once, at process start.
/// `default_level` is used when `RUST_LOG` is unset.
pub fn init(default_level: &str) {
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.with_span_events(FmtSpan::NONE)
		.with_writer(std::io::stderr)
		.try_init();
}
