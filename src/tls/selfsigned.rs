use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use tracing::info;

use crate::tls::provider::CertificateProvider;
use crate::tls::store::CertificateStore;
use crate::tls::{CertError, CertOrigin, CertificateRecord};

const VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const KEY_BITS: usize = 2048;

/// Issues self-signed certificates on demand; the development-mode provider.
pub struct SelfSignedProvider {
	store: CertificateStore,
}

impl SelfSignedProvider {
	pub fn new(store: CertificateStore) -> Self {
		SelfSignedProvider { store }
	}
}

#[async_trait]
impl CertificateProvider for SelfSignedProvider {
	async fn acquire(&self, host: &str) -> Result<std::sync::Arc<CertificateRecord>, CertError> {
		let host_owned = host.to_string();
		// RSA key generation is CPU-heavy; keep it off the runtime workers.
		let (chain, key) = tokio::task::spawn_blocking(move || generate(&host_owned))
			.await
			.map_err(|e| CertError::KeyGeneration(e.to_string()))??;
		let record = CertificateRecord::new(host, chain, key, CertOrigin::SelfSigned)?;
		info!(
			host,
			not_after = ?record.not_after,
			component = "selfsigned",
			"issued self-signed certificate"
		);
		self.store.store(record).await
	}

	async fn needs_renewal(&self, host: &str) -> bool {
		self
			.store
			.peek(host)
			.map(|r| r.needs_renewal())
			.unwrap_or(false)
	}

	async fn renew(&self, host: &str) -> Result<std::sync::Arc<CertificateRecord>, CertError> {
		self.acquire(host).await
	}
}

fn generate(host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertError> {
	let rsa_key = RsaPrivateKey::new(&mut rand_core::OsRng, KEY_BITS)
		.map_err(|e| CertError::KeyGeneration(e.to_string()))?;
	let pkcs8 = rsa_key
		.to_pkcs8_der()
		.map_err(|e| CertError::KeyGeneration(e.to_string()))?;
	let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
		&PrivatePkcs8KeyDer::from(pkcs8.as_bytes()),
		&rcgen::PKCS_RSA_SHA256,
	)?;

	let mut params = CertificateParams::new(vec![host.to_string()])?;
	params.distinguished_name.push(DnType::CommonName, host);
	let now = OffsetDateTime::now_utc();
	params.not_before = now;
	params.not_after = now + VALIDITY;
	params.is_ca = IsCa::ExplicitNoCa;
	params.key_usages = vec![
		KeyUsagePurpose::DigitalSignature,
		KeyUsagePurpose::KeyEncipherment,
	];
	params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
	let cert = params.self_signed(&key_pair)?;

	let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec()));
	Ok((vec![cert.der().clone()], key))
}
