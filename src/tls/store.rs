use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use p12_keystore::{Certificate as P12Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::tls::{CertError, CertOrigin, CertificateRecord, leaf_dns_name};

/// Maps a host name to a PKCS#12 file name. Deterministic, and collision-free
/// for legal DNS hostnames since those only contain characters the map keeps.
pub fn sanitize_host(host: &str) -> String {
	host
		.to_ascii_lowercase()
		.chars()
		.map(|c| match c {
			'a'..='z' | '0'..='9' | '.' | '-' => c,
			_ => '_',
		})
		.collect()
}

/// Thread-safe certificate cache: lock-free readers over a copy-on-write map,
/// one writer at a time for updates and disk I/O.
#[derive(Clone)]
pub struct CertificateStore {
	inner: Arc<Inner>,
}

struct Inner {
	records: ArcSwap<HashMap<String, Arc<CertificateRecord>>>,
	/// Serializes `store` and `load_all`, including their disk writes.
	write: Mutex<()>,
	storage_path: Option<PathBuf>,
}

impl CertificateStore {
	pub fn new(storage_path: Option<PathBuf>) -> Self {
		CertificateStore {
			inner: Arc::new(Inner {
				records: ArcSwap::from_pointee(HashMap::new()),
				write: Mutex::new(()),
				storage_path,
			}),
		}
	}

	/// Returns the record for `host`, or `None` when absent **or expired**;
	/// expired records must never be served.
	pub fn get(&self, host: &str) -> Option<Arc<CertificateRecord>> {
		self
			.inner
			.records
			.load()
			.get(host)
			.filter(|r| !r.is_expired())
			.cloned()
	}

	/// Like `get` but including expired records; used by the renewal loop.
	pub fn peek(&self, host: &str) -> Option<Arc<CertificateRecord>> {
		self.inner.records.load().get(host).cloned()
	}

	pub fn hosts(&self) -> Vec<String> {
		self.inner.records.load().keys().cloned().collect()
	}

	/// Replace the record for its host and persist it to disk.
	pub async fn store(&self, record: CertificateRecord) -> Result<Arc<CertificateRecord>, CertError> {
		let record = Arc::new(record);
		let _guard = self.inner.write.lock().await;
		if let Some(dir) = &self.inner.storage_path {
			let path = dir.join(format!("{}.pfx", sanitize_host(&record.host)));
			persist(&path, &record)?;
			info!(
				host = %record.host,
				origin = ?record.origin,
				path = %path.display(),
				component = "certstore",
				"certificate persisted"
			);
		}
		let mut map = self.inner.records.load().as_ref().clone();
		map.insert(record.host.clone(), record.clone());
		self.inner.records.store(Arc::new(map));
		Ok(record)
	}

	/// Populate the in-memory map from the storage directory. Expired records
	/// are loaded but marked; `get` will not serve them. Unreadable files are
	/// skipped with a warning.
	pub async fn load_all(&self) -> Result<usize, CertError> {
		let Some(dir) = self.inner.storage_path.clone() else {
			return Ok(0);
		};
		let _guard = self.inner.write.lock().await;
		fs::create_dir_all(&dir)?;
		let mut map = self.inner.records.load().as_ref().clone();
		let mut loaded = 0;
		for entry in fs::read_dir(&dir)? {
			let path = entry?.path();
			if path.extension().and_then(|e| e.to_str()) != Some("pfx") {
				continue;
			}
			match load_record(&path) {
				Ok(record) => {
					if record.is_expired() {
						warn!(
							host = %record.host,
							component = "certstore",
							"stored certificate is expired; it will be replaced on next use"
						);
					}
					map.insert(record.host.clone(), Arc::new(record));
					loaded += 1;
				},
				Err(e) => {
					warn!(
						path = %path.display(),
						component = "certstore",
						"skipping unreadable certificate archive: {e}"
					);
				},
			}
		}
		self.inner.records.store(Arc::new(map));
		Ok(loaded)
	}
}

fn persist(path: &Path, record: &CertificateRecord) -> Result<(), CertError> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	let chain = record
		.chain
		.iter()
		.map(|der| P12Certificate::from_der(der.as_ref()))
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| CertError::Pkcs12(e.to_string()))?;
	let key_chain = PrivateKeyChain::new(
		record.key.secret_der().to_vec(),
		rand::random::<[u8; 20]>().to_vec(),
		chain,
	);
	let mut keystore = KeyStore::new();
	keystore.add_entry(&record.host, KeyStoreEntry::PrivateKeyChain(key_chain));
	let data = keystore
		.writer("")
		.write()
		.map_err(|e| CertError::Pkcs12(e.to_string()))?;
	fs::write(path, data)?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
	}
	Ok(())
}

fn load_record(path: &Path) -> Result<CertificateRecord, CertError> {
	let data = fs::read(path)?;
	let keystore =
		KeyStore::from_pkcs12(&data, "").map_err(|e| CertError::Pkcs12(e.to_string()))?;
	for (alias, entry) in keystore.entries() {
		let KeyStoreEntry::PrivateKeyChain(key_chain) = entry else {
			continue;
		};
		let chain: Vec<CertificateDer<'static>> = key_chain
			.chain()
			.iter()
			.map(|c| CertificateDer::from(c.as_der().to_vec()))
			.collect();
		let key = PrivateKeyDer::try_from(key_chain.key().to_vec())
			.map_err(|e| CertError::Pkcs12(format!("unreadable private key: {e}")))?;
		// Prefer the archive alias; fall back to the certificate itself.
		let host = if alias.is_empty() {
			leaf_dns_name(&chain).ok_or(CertError::EmptyChain)?
		} else {
			alias.clone()
		};
		return CertificateRecord::new(&host, chain, key, CertOrigin::Loaded);
	}
	Err(CertError::Pkcs12("archive holds no private key".to_string()))
}
