//! On-demand TLS Certificate Authority (C3, spec §4.3). Mints a root CA on
//! first start and a per-hostname leaf certificate the first time a
//! hostname is seen, reusing the leaf while it still has 30 days of
//! validity left.
//!
//! RSA-2048 keys throughout: a 10-year self-signed root with
//! `BasicConstraints(CA=true)` and
//! `KeyUsage(digitalSignature, keyCertSign, cRLSign)`, and 1-year leaves
//! with `KeyUsage(digitalSignature, keyEncipherment)` +
//! `ExtendedKeyUsage(serverAuth)`. Certificate construction uses `rcgen`'s
//! `CertificateParams` + `Issuer` builders.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
	Ia5String, Issuer, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::RsaPrivateKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::error::ProxyError;

const RSA_KEY_BITS: usize = 2048;
const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
const LEAF_REUSE_THRESHOLD: StdDuration = StdDuration::from_secs(30 * 24 * 3600);

/// Server-side TLS material ready to hand to a `rustls::ServerConfig`
/// builder: a one-element chain (the leaf; the CA is not shipped, since
/// it's meant to be imported out of band) and its private key.
pub type ServerTlsMaterial = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

pub struct CertificateAuthority {
	data_dir: PathBuf,
	issuer: Issuer<'static, KeyPair>,
	cache: Mutex<()>,
}

impl CertificateAuthority {
	/// Loads the root CA from `data_dir` if both `ca.crt` and `ca.key`
	/// exist, generates a fresh one if neither does, and fails loudly if
	/// exactly one of the two is present (spec §4.3: "fail loudly if one
	/// file exists without the other").
	pub fn load_or_create(data_dir: impl AsRef<Path>) -> Result<Self, ProxyError> {
		let data_dir = data_dir.as_ref().to_path_buf();
		fs::create_dir_all(&data_dir)?;
		let ca_cert_path = data_dir.join("ca.crt");
		let ca_key_path = data_dir.join("ca.key");

		let issuer = match (ca_cert_path.exists(), ca_key_path.exists()) {
			(true, true) => {
				let cert_pem = fs::read_to_string(&ca_cert_path)?;
				let key_pem = fs::read_to_string(&ca_key_path)?;
				let key_pair = KeyPair::from_pem(&key_pem)
					.map_err(|e| ProxyError::Internal(format!("ca.key: {e}")))?;
				Issuer::from_ca_cert_pem(&cert_pem, key_pair)
					.map_err(|e| ProxyError::Internal(format!("ca.crt: {e}")))?
			},
			(false, false) => generate_root(&ca_cert_path, &ca_key_path)?,
			(true, false) => {
				return Err(ProxyError::ConfigInvalid(
					"ca.crt exists without ca.key".into(),
				));
			},
			(false, true) => {
				return Err(ProxyError::ConfigInvalid(
					"ca.key exists without ca.crt".into(),
				));
			},
		};

		Ok(Self {
			data_dir,
			issuer,
			cache: Mutex::new(()),
		})
	}

	/// Filesystem-safe stem for a hostname: `*` -> `wildcard`, `.` -> `_`.
	fn safe_stem(hostname: &str) -> String {
		hostname.replace('*', "wildcard").replace('.', "_")
	}

	/// Returns leaf TLS material for `hostname`, minting and persisting a
	/// new leaf certificate if none exists yet or the cached one has less
	/// than 30 days of validity remaining.
	///
	/// The lock is held across the whole call so two concurrent first
	/// requests for the same never-seen hostname can't race to write two
	/// different leaf certificates to the same path.
	pub fn get_server_tls_material(
		&self,
		hostname: &str,
		ip_sans: &[IpAddr],
	) -> Result<ServerTlsMaterial, ProxyError> {
		let _guard = self.cache.lock();
		let stem = Self::safe_stem(hostname);
		let cert_path = self.data_dir.join(format!("{stem}.crt"));
		let key_path = self.data_dir.join(format!("{stem}.key"));

		if let Some(material) = try_reuse(&cert_path, &key_path)? {
			return Ok(material);
		}
		self.issue_leaf(hostname, ip_sans, &cert_path, &key_path)
	}

	fn issue_leaf(
		&self,
		hostname: &str,
		ip_sans: &[IpAddr],
		cert_path: &Path,
		key_path: &Path,
	) -> Result<ServerTlsMaterial, ProxyError> {
		let leaf_rsa = generate_rsa_keypair()?;
		let key_pem = leaf_rsa
			.to_pkcs8_pem(LineEnding::LF)
			.map_err(|e| ProxyError::Internal(format!("encode leaf key: {e}")))?
			.to_string();
		let leaf_key = KeyPair::from_pem(&key_pem)
			.map_err(|e| ProxyError::Internal(format!("leaf key: {e}")))?;

		let mut params = if hostname.parse::<IpAddr>().is_ok() {
			CertificateParams::new(Vec::<String>::new())
				.map_err(|e| ProxyError::Internal(format!("cert params: {e}")))?
		} else {
			CertificateParams::new(vec![hostname.to_string()])
				.map_err(|e| ProxyError::Internal(format!("cert params: {e}")))?
		};
		if let Ok(ip) = hostname.parse::<IpAddr>() {
			params.subject_alt_names.push(SanType::IpAddress(ip));
		}
		if hostname == "localhost" {
			params.subject_alt_names.push(dns_san("localhost.localdomain")?);
		}
		for ip in ip_sans {
			params.subject_alt_names.push(SanType::IpAddress(*ip));
		}

		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, hostname);
		params.distinguished_name = dn;
		params.is_ca = IsCa::NoCa;
		params.key_usages = vec![
			KeyUsagePurpose::DigitalSignature,
			KeyUsagePurpose::KeyEncipherment,
		];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		let not_before = OffsetDateTime::now_utc();
		params.not_before = not_before;
		params.not_after = not_before + TimeDuration::days(LEAF_VALIDITY_DAYS);

		let cert = params
			.signed_by(&leaf_key, &self.issuer)
			.map_err(|e| ProxyError::Internal(format!("sign leaf cert: {e}")))?;

		atomic_write(cert_path, cert.pem().as_bytes())?;
		atomic_write(key_path, key_pem.as_bytes())?;

		parse_server_material(cert.pem().as_bytes(), key_pem.as_bytes())
	}
}

fn dns_san(name: &str) -> Result<SanType, ProxyError> {
	let ia5 = Ia5String::try_from(name)
		.map_err(|e| ProxyError::Internal(format!("invalid DNS SAN {name}: {e}")))?;
	Ok(SanType::DnsName(ia5))
}

fn generate_root(cert_path: &Path, key_path: &Path) -> Result<Issuer<'static, KeyPair>, ProxyError> {
	let root_rsa = generate_rsa_keypair()?;
	let key_pem = root_rsa
		.to_pkcs8_pem(LineEnding::LF)
		.map_err(|e| ProxyError::Internal(format!("encode CA key: {e}")))?
		.to_string();
	let key_pair = KeyPair::from_pem(&key_pem)
		.map_err(|e| ProxyError::Internal(format!("CA key: {e}")))?;

	let mut params = CertificateParams::default();
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![
		KeyUsagePurpose::DigitalSignature,
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::CrlSign,
	];
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, "Switchyard Root CA");
	params.distinguished_name = dn;
	let not_before = OffsetDateTime::now_utc();
	params.not_before = not_before;
	params.not_after = not_before + TimeDuration::days(ROOT_VALIDITY_DAYS);

	let cert = params
		.self_signed(&key_pair)
		.map_err(|e| ProxyError::Internal(format!("self-sign CA cert: {e}")))?;

	atomic_write(cert_path, cert.pem().as_bytes())?;
	atomic_write(key_path, key_pem.as_bytes())?;

	Issuer::from_ca_cert_pem(&cert.pem(), key_pair)
		.map_err(|e| ProxyError::Internal(format!("freshly generated CA cert: {e}")))
}

fn generate_rsa_keypair() -> Result<RsaPrivateKey, ProxyError> {
	RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
		.map_err(|e| ProxyError::Internal(format!("generate RSA-{RSA_KEY_BITS} key: {e}")))
}

/// Reuses the on-disk leaf at `cert_path`/`key_path` iff both exist, the
/// certificate is currently valid, and at least 30 days remain.
fn try_reuse(cert_path: &Path, key_path: &Path) -> Result<Option<ServerTlsMaterial>, ProxyError> {
	if !cert_path.exists() || !key_path.exists() {
		return Ok(None);
	}
	let cert_pem = fs::read(cert_path)?;
	let (_, pem) = x509_parser::pem::parse_x509_pem(&cert_pem)
		.map_err(|e| ProxyError::Internal(format!("{}: {e}", cert_path.display())))?;
	let cert = pem
		.parse_x509()
		.map_err(|e| ProxyError::Internal(format!("{}: {e}", cert_path.display())))?;

	let validity = cert.validity();
	let not_before = UNIX_EPOCH
		+ StdDuration::from_secs(validity.not_before.timestamp().try_into().unwrap_or_default());
	let not_after = UNIX_EPOCH
		+ StdDuration::from_secs(validity.not_after.timestamp().try_into().unwrap_or_default());
	let now = SystemTime::now();
	if now < not_before || now > not_after {
		return Ok(None);
	}
	let Ok(remaining) = not_after.duration_since(now) else {
		return Ok(None);
	};
	if remaining < LEAF_REUSE_THRESHOLD {
		return Ok(None);
	}

	let key_pem = fs::read(key_path)?;
	parse_server_material(&cert_pem, &key_pem).map(Some)
}

fn parse_server_material(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerTlsMaterial, ProxyError> {
	let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &*cert_pem)
		.collect::<Result<_, _>>()
		.map_err(|e| ProxyError::Internal(format!("parse leaf cert PEM: {e}")))?;
	let key = rustls_pemfile::private_key(&mut &*key_pem)
		.map_err(|e| ProxyError::Internal(format!("parse leaf key PEM: {e}")))?
		.ok_or_else(|| ProxyError::Internal("no private key found in leaf key PEM".into()))?;
	Ok((chain, key))
}

/// Write-then-rename so a concurrent reader never observes a truncated
/// cert or key file.
fn atomic_write(dest: &Path, contents: &[u8]) -> Result<(), ProxyError> {
	let dir = dest.parent().ok_or_else(|| {
		ProxyError::Internal(format!("{} has no parent directory", dest.display()))
	})?;
	let tmp = dir.join(format!(
		".{}.tmp",
		dest.file_name().and_then(|n| n.to_str()).unwrap_or("tmp")
	));
	fs::write(&tmp, contents)?;
	fs::rename(&tmp, dest)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_root_on_first_use_and_reloads_on_second() {
		let dir = tempfile::tempdir().unwrap();
		{
			let _ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
		}
		assert!(dir.path().join("ca.crt").exists());
		assert!(dir.path().join("ca.key").exists());
		let _ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
	}

	#[test]
	fn rejects_mismatched_ca_files() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("ca.crt"), b"not a real cert").unwrap();
		assert!(CertificateAuthority::load_or_create(dir.path()).is_err());
	}

	#[test]
	fn issues_and_reuses_leaf_for_hostname() {
		let dir = tempfile::tempdir().unwrap();
		let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
		let (chain1, _key1) = ca
			.get_server_tls_material("proxy.example.com", &[])
			.unwrap();
		assert_eq!(chain1.len(), 1);
		assert!(dir.path().join("proxy_example_com.crt").exists());

		let (chain2, _key2) = ca
			.get_server_tls_material("proxy.example.com", &[])
			.unwrap();
		assert_eq!(chain1, chain2, "second call should reuse the cached leaf");
	}

	#[test]
	fn wildcard_and_dot_hostnames_are_made_filesystem_safe() {
		assert_eq!(
			CertificateAuthority::safe_stem("*.example.com"),
			"wildcard_example_com"
		);
	}

	#[test]
	fn localhost_gets_the_localdomain_alias() {
		let dir = tempfile::tempdir().unwrap();
		let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
		let (chain, _key) = ca.get_server_tls_material("localhost", &[]).unwrap();
		let (_, cert) = x509_parser::parse_x509_certificate(chain[0].as_ref()).unwrap();
		let names: Vec<&str> = cert
			.subject_alternative_name()
			.unwrap()
			.unwrap()
			.value
			.general_names
			.iter()
			.filter_map(|n| match n {
				x509_parser::extensions::GeneralName::DNSName(s) => Some(*s),
				_ => None,
			})
			.collect();
		assert!(names.contains(&"localhost"));
		assert!(names.contains(&"localhost.localdomain"));
	}
}
