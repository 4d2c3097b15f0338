//! Foundation utilities shared by the proxy runtime: graceful draining,
//! process signal handling, structured logging setup and build metadata.
//!
//! Kept deliberately small and free of anything proxy-specific so it can be
//! unit tested in isolation, mirroring the split between a slim core crate
//! and the larger runtime crate that depends on it.

pub mod drain;
pub mod prelude;
pub mod signal;
pub mod telemetry;
pub mod version;
