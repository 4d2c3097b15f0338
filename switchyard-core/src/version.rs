use std::fmt::{Display, Formatter};
use std::{env, fmt};

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub rust_version: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION").to_string(),
			rust_version: rustc_version_runtime(),
		}
	}
}

fn rustc_version_runtime() -> String {
	option_env!("SWITCHYARD_RUSTC_VERSION")
		.unwrap_or("unknown")
		.to_string()
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"switchyard {} (rustc {})",
			self.version, self.rust_version
		)
	}
}
