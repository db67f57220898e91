use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::tls::store::CertificateStore;
use crate::tls::{CertError, CertificateRecord};

/// Uniform certificate issuance capability. Implementations store what they
/// issue, so a successful call leaves the store updated and a failed call
/// leaves it untouched.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
	async fn acquire(&self, host: &str) -> Result<Arc<CertificateRecord>, CertError>;
	async fn needs_renewal(&self, host: &str) -> bool;
	async fn renew(&self, host: &str) -> Result<Arc<CertificateRecord>, CertError>;
}

/// Store lookup plus single-flight issuance: at most one in-flight acquire
/// per host across the process; concurrent callers share the winner's result.
/// Different hosts proceed in parallel.
#[derive(Clone)]
pub struct CertificateManager {
	store: CertificateStore,
	provider: Arc<dyn CertificateProvider>,
	inflight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CertificateManager {
	pub fn new(store: CertificateStore, provider: Arc<dyn CertificateProvider>) -> Self {
		CertificateManager {
			store,
			provider,
			inflight: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	pub fn store(&self) -> &CertificateStore {
		&self.store
	}

	pub fn provider(&self) -> Arc<dyn CertificateProvider> {
		self.provider.clone()
	}

	/// Serve from the store, or acquire on miss. Expired records read as
	/// absent and trigger a fresh acquisition.
	pub async fn certificate_for(&self, host: &str) -> Result<Arc<CertificateRecord>, CertError> {
		if let Some(record) = self.store.get(host) {
			return Ok(record);
		}
		let lock = self
			.inflight
			.lock()
			.entry(host.to_string())
			.or_default()
			.clone();
		let _guard = lock.lock().await;
		// Lost the race: the winner already populated the store.
		if let Some(record) = self.store.get(host) {
			debug!(host, component = "certs", "sharing in-flight issuance result");
			return Ok(record);
		}
		let result = self.provider.acquire(host).await;
		self.inflight.lock().remove(host);
		result
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;
	use crate::tls::testutil;
	use crate::tls::CertOrigin;

	struct CountingProvider {
		store: CertificateStore,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl CertificateProvider for CountingProvider {
		async fn acquire(&self, host: &str) -> Result<Arc<CertificateRecord>, CertError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			// Simulate slow issuance so concurrent callers pile up.
			tokio::time::sleep(Duration::from_millis(50)).await;
			let (chain, key) = testutil::fresh_cert(host);
			let record = CertificateRecord::new(host, chain, key, CertOrigin::SelfSigned)?;
			self.store.store(record).await
		}

		async fn needs_renewal(&self, host: &str) -> bool {
			self.store.peek(host).map(|r| r.needs_renewal()).unwrap_or(false)
		}

		async fn renew(&self, host: &str) -> Result<Arc<CertificateRecord>, CertError> {
			self.acquire(host).await
		}
	}

	fn manager() -> (CertificateManager, Arc<CountingProvider>) {
		let store = CertificateStore::new(None);
		let provider = Arc::new(CountingProvider {
			store: store.clone(),
			calls: AtomicUsize::new(0),
		});
		(CertificateManager::new(store, provider.clone()), provider)
	}

	#[tokio::test]
	async fn concurrent_callers_share_one_issuance() {
		let (manager, provider) = manager();
		let mut tasks = Vec::new();
		for _ in 0..8 {
			let m = manager.clone();
			tasks.push(tokio::spawn(async move { m.certificate_for("app.test").await }));
		}
		for task in tasks {
			assert!(task.await.unwrap().is_ok());
		}
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn distinct_hosts_issue_independently() {
		let (manager, provider) = manager();
		let a = manager.certificate_for("a.test");
		let b = manager.certificate_for("b.test");
		let (a, b) = tokio::join!(a, b);
		assert!(a.is_ok() && b.is_ok());
		assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn cached_certificate_skips_the_provider() {
		let (manager, provider) = manager();
		manager.certificate_for("app.test").await.unwrap();
		manager.certificate_for("app.test").await.unwrap();
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn expired_record_triggers_fresh_acquisition() {
		let (manager, provider) = manager();
		let (chain, key) = testutil::expired_cert("app.test");
		let record = CertificateRecord::new("app.test", chain, key, CertOrigin::Loaded).unwrap();
		manager.store().store(record).await.unwrap();

		let record = manager.certificate_for("app.test").await.unwrap();
		assert!(!record.is_expired());
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
	}
}
