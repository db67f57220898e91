use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Request;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use instant_acme::{
	Account, AccountCredentials, AuthorizationStatus, BodyWrapper, BytesResponse, ChallengeType,
	HttpClient, Identifier, NewAccount, NewOrder, Order, OrderStatus, RetryPolicy,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::AcmeSettings;
use crate::tls::challenges::ChallengeStore;
use crate::tls::provider::CertificateProvider;
use crate::tls::store::CertificateStore;
use crate::tls::{CertError, CertOrigin, CertificateRecord};

/// Challenge validation polls every 2s with up to 30 attempts; bound the
/// whole wait accordingly.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const ACCOUNT_FILE: &str = "acme-account.json";

#[derive(thiserror::Error, Debug)]
pub enum AcmeError {
	#[error("the ACME terms of service must be accepted before certificates can be issued")]
	TosNotAccepted,
	#[error("acme protocol error: {0}")]
	Protocol(#[from] instant_acme::Error),
	#[error("no HTTP-01 challenge offered for {0}")]
	NoHttp01Challenge(String),
	#[error("authorization for {host} is in unexpected state {status:?}")]
	BadAuthorization {
		host: String,
		status: AuthorizationStatus,
	},
	#[error("order for {host} ended in state {status:?}")]
	OrderFailed { host: String, status: OrderStatus },
	#[error("timed out waiting for challenge validation for {0}")]
	ValidationTimeout(String),
	#[error("issued certificate chain is empty")]
	EmptyChain,
	#[error("issued private key is unreadable")]
	BadKey,
	#[error("account credentials error: {0}")]
	Credentials(#[from] serde_json::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Obtains certificates from an ACME directory via HTTP-01 challenges,
/// answered by the request pipeline out of the shared challenge store.
pub struct AcmeProvider {
	settings: AcmeSettings,
	store: CertificateStore,
	challenges: ChallengeStore,
	account: OnceCell<Account>,
	credentials_path: PathBuf,
}

impl std::fmt::Debug for AcmeProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AcmeProvider").finish_non_exhaustive()
	}
}

impl AcmeProvider {
	pub fn new(
		settings: AcmeSettings,
		storage_path: PathBuf,
		store: CertificateStore,
		challenges: ChallengeStore,
	) -> Result<Self, AcmeError> {
		if !settings.accept_tos {
			return Err(AcmeError::TosNotAccepted);
		}
		info!(
			directory = %settings.directory,
			email = %settings.email,
			component = "acme",
			"ACME provider configured"
		);
		Ok(AcmeProvider {
			credentials_path: storage_path.join(ACCOUNT_FILE),
			settings,
			store,
			challenges,
			account: OnceCell::new(),
		})
	}

	/// Create or load the ACME account on first use; credentials persist next
	/// to the certificate archives.
	async fn account(&self) -> Result<&Account, AcmeError> {
		self
			.account
			.get_or_try_init(|| async {
				let builder = if self.settings.skip_tls_verify {
					warn!(
						component = "acme",
						"TLS verification towards the ACME directory is DISABLED; test use only"
					);
					Account::builder_with_http(Box::new(InsecureHttpClient::new()))
				} else {
					Account::builder()?
				};
				if self.credentials_path.exists() {
					let raw = std::fs::read(&self.credentials_path)?;
					let credentials: AccountCredentials = serde_json::from_slice(&raw)?;
					debug!(component = "acme", "reusing stored ACME account");
					Ok::<_, AcmeError>(builder.from_credentials(credentials).await?)
				} else {
					let contact = format!("mailto:{}", self.settings.email);
					let (account, credentials) = builder
						.create(
							&NewAccount {
								contact: &[contact.as_str()],
								terms_of_service_agreed: true,
								only_return_existing: false,
							},
							self.settings.directory.clone(),
							None,
						)
						.await?;
					if let Some(parent) = self.credentials_path.parent() {
						std::fs::create_dir_all(parent)?;
					}
					std::fs::write(&self.credentials_path, serde_json::to_vec(&credentials)?)?;
					info!(component = "acme", "created ACME account");
					Ok(account)
				}
			})
			.await
	}

	async fn order_certificate(
		&self,
		host: &str,
	) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), AcmeError> {
		if self.settings.skip_tls_verify {
			warn!(
				host,
				component = "acme",
				"ordering with ACME transport verification disabled"
			);
		}
		let account = self.account().await?;
		let identifiers = [Identifier::Dns(host.to_string())];
		let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;
		debug!(host, url = order.url(), component = "acme", "order created");

		let mut tokens = Vec::new();
		let result = self.drive_order(&mut order, host, &mut tokens).await;
		// The token's lifetime is strictly bounded by this order.
		for token in tokens {
			self.challenges.remove(&token);
		}
		result
	}

	async fn drive_order(
		&self,
		order: &mut Order,
		host: &str,
		tokens: &mut Vec<String>,
	) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), AcmeError> {
		{
			let mut authorizations = order.authorizations();
			while let Some(authorization) = authorizations.next().await {
				let mut authorization = authorization?;
				match authorization.status {
					AuthorizationStatus::Valid => continue,
					AuthorizationStatus::Pending => {},
					status => {
						return Err(AcmeError::BadAuthorization {
							host: host.to_string(),
							status,
						});
					},
				}
				let mut challenge = authorization
					.challenge(ChallengeType::Http01)
					.ok_or_else(|| AcmeError::NoHttp01Challenge(host.to_string()))?;
				let token = challenge.token.clone();
				self
					.challenges
					.add(token.clone(), challenge.key_authorization().as_str().to_string());
				tokens.push(token);
				challenge.set_ready().await?;
				debug!(host, component = "acme", "challenge submitted for validation");
			}
		}

		let status = tokio::time::timeout(VALIDATION_TIMEOUT, order.poll_ready(&RetryPolicy::default()))
			.await
			.map_err(|_| AcmeError::ValidationTimeout(host.to_string()))??;
		if status != OrderStatus::Ready && status != OrderStatus::Valid {
			return Err(AcmeError::OrderFailed {
				host: host.to_string(),
				status,
			});
		}

		// Finalization generates a fresh EC P-256 key and submits the CSR.
		let key_pem = order.finalize().await?;
		let cert_pem = tokio::time::timeout(
			DOWNLOAD_TIMEOUT,
			order.poll_certificate(&RetryPolicy::default()),
		)
		.await
		.map_err(|_| AcmeError::ValidationTimeout(host.to_string()))??;

		let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
			.collect::<Result<Vec<_>, _>>()
			.map_err(|_| AcmeError::EmptyChain)?;
		if chain.is_empty() {
			return Err(AcmeError::EmptyChain);
		}
		let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
			.map_err(|_| AcmeError::BadKey)?
			.ok_or(AcmeError::BadKey)?;
		Ok((chain, key))
	}
}

#[async_trait]
impl CertificateProvider for AcmeProvider {
	async fn acquire(&self, host: &str) -> Result<Arc<CertificateRecord>, CertError> {
		let (chain, key) = self.order_certificate(host).await?;
		let record = CertificateRecord::new(host, chain, key, CertOrigin::Acme)?;
		info!(
			host,
			not_after = ?record.not_after,
			component = "acme",
			"certificate issued"
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

	async fn renew(&self, host: &str) -> Result<Arc<CertificateRecord>, CertError> {
		self.acquire(host).await
	}
}

/// ACME transport that accepts any directory certificate. Only reachable via
/// the explicit test-only configuration flag.
struct InsecureHttpClient(HyperClient<hyper_rustls::HttpsConnector<HttpConnector>, BodyWrapper<Bytes>>);

impl InsecureHttpClient {
	fn new() -> Self {
		let tls = rustls::ClientConfig::builder_with_provider(crate::tls::crypto_provider())
			.with_safe_default_protocol_versions()
			.expect("ring provider supports the default protocol versions")
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
			.with_no_client_auth();
		InsecureHttpClient(
			HyperClient::builder(TokioExecutor::new()).build(
				hyper_rustls::HttpsConnectorBuilder::new()
					.with_tls_config(tls)
					.https_or_http()
					.enable_http1()
					.enable_http2()
					.build(),
			),
		)
	}
}

impl HttpClient for InsecureHttpClient {
	fn request(
		&self,
		req: Request<BodyWrapper<Bytes>>,
	) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
		HttpClient::request(&self.0, req)
	}
}

mod insecure {
	use rustls::DigitallySignedStruct;
	use rustls::SignatureScheme;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
			]
		}
	}
}
