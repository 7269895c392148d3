//! The interception CA: mints per-domain leaf certificates on demand and
//! caches them. Generation costs milliseconds; the LRU+TTL cache keeps it off
//! the request path for hot domains.

use std::num::NonZeroUsize;

use egress_core::prelude::*;
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::tls::TlsError;

const CA_VALIDITY_DAYS: i64 = 10 * 365;
const LEAF_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct CaConfig {
	pub ca_cert_path: Option<std::path::PathBuf>,
	pub ca_key_path: Option<std::path::PathBuf>,
	/// Generate an in-memory CA when no paths are configured.
	pub auto_generate_ca: bool,
	pub cache_max_entries: usize,
	#[serde(with = "crate::serde_dur")]
	pub cache_ttl: Duration,
	/// Domains minted eagerly at startup.
	pub prewarm_domains: Vec<String>,
}

impl Default for CaConfig {
	fn default() -> Self {
		CaConfig {
			ca_cert_path: None,
			ca_key_path: None,
			auto_generate_ca: true,
			cache_max_entries: 1000,
			cache_ttl: Duration::from_secs(24 * 3600),
			prewarm_domains: Vec::new(),
		}
	}
}

/// A minted leaf, ready to serve: PEM for distribution/debugging plus a
/// prebuilt rustls config so the handshake path does no parsing.
pub struct MintedCert {
	pub domain: Strng,
	pub cert_pem: String,
	pub key_pem: String,
	pub server_config: Arc<ServerConfig>,
	pub not_after: OffsetDateTime,
	inserted: Instant,
}

struct CaSigner {
	cert: rcgen::Certificate,
	key: KeyPair,
	cert_pem: String,
}

/// Certificate mint. One per process; shared across MITM connections.
pub struct CertAuthority {
	signer: CaSigner,
	cache: Mutex<LruCache<Strng, Arc<MintedCert>>>,
	ttl: Duration,
	minted_total: std::sync::atomic::AtomicU64,
}

impl Debug for CertAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertAuthority")
			.field("cached", &self.cache.lock().len())
			.finish()
	}
}

impl CertAuthority {
	pub fn new(cfg: &CaConfig) -> Result<CertAuthority, TlsError> {
		let signer = match (&cfg.ca_cert_path, &cfg.ca_key_path) {
			(Some(cert_path), Some(key_path)) => {
				let cert_pem = std::fs::read_to_string(cert_path)
					.with_context(|| format!("reading CA cert {}", cert_path.display()))
					.map_err(TlsError::Anyhow)?;
				let key_pem = std::fs::read_to_string(key_path)
					.with_context(|| format!("reading CA key {}", key_path.display()))
					.map_err(TlsError::Anyhow)?;
				let key = KeyPair::from_pem(&key_pem)?;
				let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
				let cert = params.self_signed(&key)?;
				CaSigner {
					cert,
					key,
					cert_pem,
				}
			},
			(None, None) if cfg.auto_generate_ca => Self::generate_ca()?,
			_ => {
				return Err(TlsError::Anyhow(anyhow::anyhow!(
					"CA cert and key paths must both be set, or autoGenerateCa enabled"
				)));
			},
		};
		let max = NonZeroUsize::new(cfg.cache_max_entries.max(1)).expect("max(1) is non-zero");
		Ok(CertAuthority {
			signer,
			cache: Mutex::new(LruCache::new(max)),
			ttl: cfg.cache_ttl,
			minted_total: std::sync::atomic::AtomicU64::new(0),
		})
	}

	fn generate_ca() -> Result<CaSigner, TlsError> {
		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		let mut params = CertificateParams::new(Vec::<String>::new())?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, "egressgateway interception CA");
		dn.push(DnType::OrganizationName, "egressgateway");
		params.distinguished_name = dn;
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![
			KeyUsagePurpose::KeyCertSign,
			KeyUsagePurpose::CrlSign,
			KeyUsagePurpose::DigitalSignature,
		];
		params.key_identifier_method = rcgen::KeyIdMethod::Sha256;
		let now = OffsetDateTime::now_utc();
		params.not_before = now - time::Duration::days(1);
		params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);
		let cert = params.self_signed(&key)?;
		let cert_pem = cert.pem();
		info!("generated in-memory interception CA");
		Ok(CaSigner {
			cert,
			key,
			cert_pem,
		})
	}

	/// The CA certificate in PEM form, for distribution to clients that must
	/// trust intercepted connections.
	pub fn ca_pem(&self) -> &str {
		&self.signer.cert_pem
	}

	pub fn minted_total(&self) -> u64 {
		self.minted_total.load(std::sync::atomic::Ordering::Relaxed)
	}

	/// Returns a certificate for `domain`, from cache when fresh. Expired or
	/// evicted entries are re-minted; a cached entry is never returned past
	/// its TTL or its own notAfter.
	pub fn mint(&self, domain: &str) -> Result<Arc<MintedCert>, TlsError> {
		let domain = strng::new(domain.to_ascii_lowercase());
		let now = OffsetDateTime::now_utc();
		{
			let mut cache = self.cache.lock();
			if let Some(hit) = cache.get(&domain) {
				let fresh = hit.inserted.elapsed() < self.ttl && hit.not_after > now;
				if fresh {
					return Ok(hit.clone());
				}
				cache.pop(&domain);
			}
		}
		let minted = Arc::new(self.generate_leaf(&domain)?);
		self
			.minted_total
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		self.cache.lock().put(domain, minted.clone());
		Ok(minted)
	}

	/// Mints ahead of traffic for configured domains.
	pub fn prewarm(&self, domains: &[String]) {
		for d in domains {
			if let Err(e) = self.mint(d) {
				warn!(domain = %d, "prewarm mint failed: {e}");
			}
		}
	}

	fn generate_leaf(&self, domain: &Strng) -> Result<MintedCert, TlsError> {
		let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
		// SAN: DNS for names, IP for literals (CertificateParams::new sorts it).
		let mut params = CertificateParams::new(vec![domain.to_string()])?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, domain.as_str());
		params.distinguished_name = dn;
		let mut serial = [0u8; 16];
		rand::rng().fill_bytes(&mut serial);
		params.serial_number = Some(SerialNumber::from_slice(&serial));
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.use_authority_key_identifier_extension = true;
		let now = OffsetDateTime::now_utc();
		params.not_before = now - time::Duration::days(1);
		let not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
		params.not_after = not_after;
		let cert = params.signed_by(&key, &self.signer.cert, &self.signer.key)?;

		let chain: Vec<CertificateDer<'static>> =
			vec![cert.der().clone(), self.signer.cert.der().clone()];
		let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
		let mut server_config = ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(chain, key_der)?;
		server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

		debug!(domain = %domain, "minted leaf certificate");
		Ok(MintedCert {
			domain: domain.clone(),
			cert_pem: cert.pem(),
			key_pem: key.serialize_pem(),
			server_config: Arc::new(server_config),
			not_after,
			inserted: Instant::now(),
		})
	}
}
