//! IP Filter (C1, spec §4.1). Per-frontend allow/deny sets with durable,
//! atomically-rewritten persistence under `<data_dir>/{blacklist,whitelist}.json`.
//!
//! A non-empty allowlist makes it the sole admission rule; otherwise the
//! denylist is consulted and `blocked_by_ip` is bumped only on an actual
//! denylist hit, not on a "not allowlisted" rejection, which is counted
//! separately.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Serialize, Deserialize, Default)]
struct BlacklistDoc {
	ips: Vec<IpAddr>,
	blocked_count: HashMap<IpAddr, u64>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct WhitelistDoc {
	ips: Vec<IpAddr>,
}

struct State {
	allowlist: HashSet<IpAddr>,
	denylist: HashSet<IpAddr>,
	blocked_by_ip: HashMap<IpAddr, u64>,
}

/// One IP Filter instance per frontend, all sharing a data directory.
pub struct IpFilter {
	data_dir: PathBuf,
	blacklist_path: PathBuf,
	whitelist_path: PathBuf,
	state: RwLock<State>,
}

impl IpFilter {
	/// Loads persisted sets from `data_dir`, if present. Entries are never
	/// silently dropped: a malformed on-disk file is a hard error, since an
	/// operator's existing deny rules must not silently stop applying.
	pub fn load(data_dir: impl AsRef<Path>) -> Result<Self, ProxyError> {
		let data_dir = data_dir.as_ref().to_path_buf();
		std::fs::create_dir_all(&data_dir)?;
		let blacklist_path = data_dir.join("blacklist.json");
		let whitelist_path = data_dir.join("whitelist.json");

		let (denylist, blocked_by_ip) = match std::fs::read(&blacklist_path) {
			Ok(bytes) => {
				let doc: BlacklistDoc = serde_json::from_slice(&bytes)
					.map_err(|e| ProxyError::ConfigInvalid(format!("blacklist.json: {e}")))?;
				(doc.ips.into_iter().collect(), doc.blocked_count)
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashSet::new(), HashMap::new()),
			Err(e) => return Err(e.into()),
		};
		let allowlist = match std::fs::read(&whitelist_path) {
			Ok(bytes) => {
				let doc: WhitelistDoc = serde_json::from_slice(&bytes)
					.map_err(|e| ProxyError::ConfigInvalid(format!("whitelist.json: {e}")))?;
				doc.ips.into_iter().collect()
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
			Err(e) => return Err(e.into()),
		};

		Ok(Self {
			data_dir,
			blacklist_path,
			whitelist_path,
			state: RwLock::new(State {
				allowlist,
				denylist,
				blocked_by_ip,
			}),
		})
	}

	/// Seeds in-memory sets without touching disk (used when a frontend's
	/// allow/deny lists come from `ConfigStore::list_ip_filters` rather
	/// than the on-disk files directly).
	pub fn seed(&self, allowlist: impl IntoIterator<Item = IpAddr>, denylist: impl IntoIterator<Item = IpAddr>) {
		let mut st = self.state.write();
		st.allowlist.extend(allowlist);
		st.denylist.extend(denylist);
	}

	/// Admission predicate (spec §4.1). Bumps `blocked_by_ip` exactly once
	/// per denylist-caused rejection.
	pub fn allow(&self, addr: IpAddr) -> bool {
		let mut st = self.state.write();
		if !st.allowlist.is_empty() {
			return st.allowlist.contains(&addr);
		}
		if st.denylist.contains(&addr) {
			*st.blocked_by_ip.entry(addr).or_insert(0) += 1;
			return false;
		}
		true
	}

	pub fn blocked_count(&self, addr: IpAddr) -> u64 {
		self.state.read().blocked_by_ip.get(&addr).copied().unwrap_or(0)
	}

	pub fn add_to_denylist(&self, addr: IpAddr) -> Result<(), ProxyError> {
		{
			let mut st = self.state.write();
			st.denylist.insert(addr);
		}
		self.persist_denylist()
	}

	pub fn remove_from_denylist(&self, addr: IpAddr) -> Result<(), ProxyError> {
		{
			let mut st = self.state.write();
			st.denylist.remove(&addr);
			st.blocked_by_ip.remove(&addr);
		}
		self.persist_denylist()
	}

	pub fn add_to_allowlist(&self, addr: IpAddr) -> Result<(), ProxyError> {
		{
			let mut st = self.state.write();
			st.allowlist.insert(addr);
		}
		self.persist_allowlist()
	}

	pub fn remove_from_allowlist(&self, addr: IpAddr) -> Result<(), ProxyError> {
		{
			let mut st = self.state.write();
			st.allowlist.remove(&addr);
		}
		self.persist_allowlist()
	}

	fn persist_denylist(&self) -> Result<(), ProxyError> {
		let st = self.state.read();
		let doc = BlacklistDoc {
			ips: st.denylist.iter().copied().collect(),
			blocked_count: st.blocked_by_ip.clone(),
		};
		drop(st);
		atomic_write_json(&self.data_dir, &self.blacklist_path, &doc)
	}

	fn persist_allowlist(&self) -> Result<(), ProxyError> {
		let st = self.state.read();
		let doc = WhitelistDoc {
			ips: st.allowlist.iter().copied().collect(),
		};
		drop(st);
		atomic_write_json(&self.data_dir, &self.whitelist_path, &doc)
	}
}

/// Write-then-rename so readers never observe a partially-written file.
fn atomic_write_json<T: Serialize>(
	dir: &Path,
	dest: &Path,
	value: &T,
) -> Result<(), ProxyError> {
	let tmp = dir.join(format!(
		".{}.tmp",
		dest.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")
	));
	let bytes = serde_json::to_vec_pretty(value)
		.map_err(|e| ProxyError::Internal(format!("serialize {}: {e}", dest.display())))?;
	std::fs::write(&tmp, bytes)?;
	std::fs::rename(&tmp, dest)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[test]
	fn empty_allowlist_falls_through_to_denylist() {
		let dir = tempfile::tempdir().unwrap();
		let filter = IpFilter::load(dir.path()).unwrap();
		filter.add_to_denylist(ip("198.51.100.7")).unwrap();
		assert!(!filter.allow(ip("198.51.100.7")));
		assert!(filter.allow(ip("198.51.100.8")));
		assert_eq!(filter.blocked_count(ip("198.51.100.7")), 1);
	}

	#[test]
	fn nonempty_allowlist_is_exclusive() {
		let dir = tempfile::tempdir().unwrap();
		let filter = IpFilter::load(dir.path()).unwrap();
		filter.add_to_allowlist(ip("10.0.0.1")).unwrap();
		assert!(filter.allow(ip("10.0.0.1")));
		assert!(!filter.allow(ip("10.0.0.2")));
	}

	#[test]
	fn denylist_persists_and_reloads() {
		let dir = tempfile::tempdir().unwrap();
		{
			let filter = IpFilter::load(dir.path()).unwrap();
			filter.add_to_denylist(ip("198.51.100.7")).unwrap();
		}
		let reloaded = IpFilter::load(dir.path()).unwrap();
		assert!(!reloaded.allow(ip("198.51.100.7")));
	}

	#[test]
	fn removal_reopens_access_and_rewrites_file() {
		let dir = tempfile::tempdir().unwrap();
		let filter = IpFilter::load(dir.path()).unwrap();
		filter.add_to_denylist(ip("198.51.100.7")).unwrap();
		filter.remove_from_denylist(ip("198.51.100.7")).unwrap();
		assert!(filter.allow(ip("198.51.100.7")));
		assert_eq!(filter.blocked_count(ip("198.51.100.7")), 0);
	}
}
