use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tls::provider::CertificateProvider;
use crate::tls::store::CertificateStore;

const FIRST_RUN_DELAY: Duration = Duration::from_secs(60);
const INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Background task renewing certificates nearing expiry. A failed renewal is
/// logged and skipped; callers keep serving the aging certificate until its
/// true expiry.
pub async fn run(
	store: CertificateStore,
	provider: Arc<dyn CertificateProvider>,
	shutdown: CancellationToken,
) {
	tokio::select! {
		_ = tokio::time::sleep(FIRST_RUN_DELAY) => {},
		_ = shutdown.cancelled() => return,
	}
	loop {
		let renewed = renew_due(&store, provider.as_ref()).await;
		debug!(renewed, component = "renewal", "renewal pass complete");
		tokio::select! {
			_ = tokio::time::sleep(INTERVAL) => {},
			_ = shutdown.cancelled() => {
				info!(component = "renewal", "shutting down");
				return;
			},
		}
	}
}

/// One pass over every host the store knows; returns how many certificates
/// were renewed.
pub async fn renew_due(store: &CertificateStore, provider: &dyn CertificateProvider) -> usize {
	let mut renewed = 0;
	for host in store.hosts() {
		if !provider.needs_renewal(&host).await {
			continue;
		}
		match provider.renew(&host).await {
			Ok(record) => {
				info!(
					host = %host,
					not_after = ?record.not_after,
					component = "renewal",
					"certificate renewed"
				);
				renewed += 1;
			},
			Err(e) => {
				warn!(
					host = %host,
					component = "renewal",
					"renewal failed, keeping current certificate: {e}"
				);
			},
		}
	}
	renewed
}
