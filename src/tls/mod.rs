pub mod acme;
pub mod challenges;
pub mod provider;
pub mod renewal;
pub mod selfsigned;
pub mod store;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

pub use crate::tls::acme::AcmeError;

/// Certificates are renewed once they get within this window of expiry.
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(thiserror::Error, Debug)]
pub enum CertError {
	#[error("certificate chain is empty")]
	EmptyChain,
	#[error("invalid certificate: {0}")]
	InvalidCertificate(String),
	#[error("tls error: {0}")]
	Tls(#[from] rustls::Error),
	#[error("key generation failed: {0}")]
	KeyGeneration(String),
	#[error("certificate generation failed: {0}")]
	Generation(#[from] rcgen::Error),
	#[error("pkcs#12 archive error: {0}")]
	Pkcs12(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Acme(#[from] AcmeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertOrigin {
	SelfSigned,
	Acme,
	/// Restored from the on-disk PKCS#12 cache.
	Loaded,
}

/// A host's certificate with its private key and a pre-built rustls server
/// config, so the handshake path does no parsing.
pub struct CertificateRecord {
	pub host: String,
	pub chain: Vec<CertificateDer<'static>>,
	pub key: PrivateKeyDer<'static>,
	pub issued_at: SystemTime,
	pub not_after: SystemTime,
	pub origin: CertOrigin,
	pub server_config: Arc<ServerConfig>,
}

impl CertificateRecord {
	pub fn new(
		host: &str,
		chain: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
		origin: CertOrigin,
	) -> Result<CertificateRecord, CertError> {
		let leaf = chain.first().ok_or(CertError::EmptyChain)?;
		let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
			.map_err(|e| CertError::InvalidCertificate(e.to_string()))?;
		let issued_at = asn1_time(parsed.validity().not_before.timestamp());
		let not_after = asn1_time(parsed.validity().not_after.timestamp());
		let server_config = build_server_config(&chain, &key)?;
		Ok(CertificateRecord {
			host: host.to_string(),
			chain,
			key,
			issued_at,
			not_after,
			origin,
			server_config,
		})
	}

	pub fn is_expired(&self) -> bool {
		SystemTime::now() >= self.not_after
	}

	/// Fresh while `now < not_after - 30 days`.
	pub fn needs_renewal(&self) -> bool {
		SystemTime::now() + RENEWAL_WINDOW >= self.not_after
	}
}

impl std::fmt::Debug for CertificateRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertificateRecord")
			.field("host", &self.host)
			.field("origin", &self.origin)
			.field("not_after", &self.not_after)
			.finish()
	}
}

fn asn1_time(ts: i64) -> SystemTime {
	if ts >= 0 {
		UNIX_EPOCH + Duration::from_secs(ts as u64)
	} else {
		UNIX_EPOCH - Duration::from_secs(ts.unsigned_abs())
	}
}

/// The process standardises on the ring provider; selecting it explicitly
/// keeps builders unambiguous even when another provider is linked in.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

fn build_server_config(
	chain: &[CertificateDer<'static>],
	key: &PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, CertError> {
	let mut cfg = ServerConfig::builder_with_provider(crypto_provider())
		.with_safe_default_protocol_versions()?
		.with_no_client_auth()
		.with_single_cert(chain.to_vec(), key.clone_key())?;
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(Arc::new(cfg))
}

/// First DNS SAN of the leaf, used to recover the host for records restored
/// from disk.
pub fn leaf_dns_name(chain: &[CertificateDer<'static>]) -> Option<String> {
	let leaf = chain.first()?;
	let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).ok()?;
	let san = parsed.subject_alternative_name().ok().flatten()?;
	san
		.value
		.general_names
		.iter()
		.find_map(|name| match name {
			x509_parser::extensions::GeneralName::DNSName(dns) => Some(dns.to_string()),
			_ => None,
		})
}
