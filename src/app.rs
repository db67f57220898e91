use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{CertProviderKind, Config};
use crate::docker::observer::Observer;
use crate::docker::{ContainerSource, DockerSource};
use crate::proxy::{Gateway, ProxyInputs};
use crate::store::RouteTable;
use crate::tls::acme::AcmeProvider;
use crate::tls::challenges::ChallengeStore;
use crate::tls::provider::{CertificateManager, CertificateProvider};
use crate::tls::selfsigned::SelfSignedProvider;
use crate::tls::store::CertificateStore;
use crate::tls::renewal;
use crate::{auth, signal};

/// Startup order matters: configuration problems (provider selection, OIDC
/// discovery) are fatal before any socket opens, and both listeners are bound
/// before the observer and renewal loop start so no traffic is lost during
/// readiness.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
	let cfg = Arc::new(cfg);

	let routes = RouteTable::new();
	let challenges = ChallengeStore::new();

	let cert_store = CertificateStore::new(cfg.https_enabled.then(|| cfg.cert_storage_path.clone()));
	if cfg.https_enabled {
		let loaded = cert_store
			.load_all()
			.await
			.context("loading certificate storage")?;
		info!(loaded, "certificate storage scanned");
	}

	let provider: Arc<dyn CertificateProvider> = match cfg.cert_provider {
		CertProviderKind::SelfSigned => Arc::new(SelfSignedProvider::new(cert_store.clone())),
		CertProviderKind::LetsEncrypt => {
			let settings = cfg
				.acme
				.clone()
				.context("LetsEncrypt provider selected but ACME settings are missing")?;
			Arc::new(AcmeProvider::new(
				settings,
				cfg.cert_storage_path.clone(),
				cert_store.clone(),
				challenges.clone(),
			)?)
		},
	};
	let certs = CertificateManager::new(cert_store.clone(), provider.clone());

	// OIDC validation is fatal at startup; a half-authenticated proxy must
	// not serve traffic.
	let oidc = match &cfg.oidc {
		Some(settings) => {
			let authenticator =
				auth::OidcAuthenticator::discover(settings.clone(), cfg.public_origin.clone())
					.await
					.context("OIDC provider validation failed")?;
			Some(Arc::new(authenticator))
		},
		None => None,
	};

	let http_listener = TcpListener::bind((cfg.bind_address, cfg.http_port))
		.await
		.with_context(|| format!("binding http listener on port {}", cfg.http_port))?;
	let https_listener = if cfg.https_enabled {
		Some(
			TcpListener::bind((cfg.bind_address, cfg.https_port))
				.await
				.with_context(|| format!("binding https listener on port {}", cfg.https_port))?,
		)
	} else {
		None
	};

	let shutdown_token = CancellationToken::new();
	let tasks = TaskTracker::new();

	let pi = ProxyInputs::new(
		cfg.clone(),
		routes.clone(),
		certs,
		challenges.clone(),
		oidc,
	);
	let gateway = Gateway::new(pi, shutdown_token.clone());
	tasks.spawn(gateway.run(http_listener, https_listener));

	// Listeners are up; start watching containers and renewing certificates.
	match DockerSource::connect() {
		Ok(source) => {
			let source: Arc<dyn ContainerSource> = Arc::new(source);
			tasks.spawn(Observer::new(source, routes.clone()).run(shutdown_token.clone()));
		},
		Err(e) => {
			// The engine may come up later; routes stay empty until restart.
			warn!("container engine unavailable, no routes will be discovered: {e}");
		},
	}
	if cfg.https_enabled {
		tasks.spawn(renewal::run(
			cert_store,
			provider,
			shutdown_token.clone(),
		));
	}

	info!(
		http_port = cfg.http_port,
		https_port = cfg.https_port,
		https = cfg.https_enabled,
		oidc = cfg.oidc.is_some(),
		"{} is ready",
		crate::SERVICE_NAME
	);

	signal::wait_for_shutdown().await;
	shutdown_token.cancel();
	tasks.close();
	tasks.wait().await;
	info!("shutdown complete");
	Ok(())
}
