use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

pub const DEFAULT_CALLBACK_PATH: &str = "/signin-oidc";
pub const DEFAULT_ROLE_CLAIM: &str = "roles";
pub const DEFAULT_SCOPES: &str = "openid profile email";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertProviderKind {
	SelfSigned,
	LetsEncrypt,
}

impl FromStr for CertProviderKind {
	type Err = anyhow::Error;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"selfsigned" | "self-signed" => Ok(CertProviderKind::SelfSigned),
			"letsencrypt" | "lets-encrypt" | "acme" => Ok(CertProviderKind::LetsEncrypt),
			other => anyhow::bail!("unknown certificate provider {other:?} (expected SelfSigned or LetsEncrypt)"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct AcmeSettings {
	pub email: String,
	pub accept_tos: bool,
	/// Resolved directory URL (production, staging, or explicit override).
	pub directory: String,
	pub skip_tls_verify: bool,
}

#[derive(Debug, Clone)]
pub struct OidcSettings {
	pub authority: String,
	pub client_id: String,
	pub client_secret: SecretString,
	pub scopes: String,
	pub callback_path: String,
	pub role_claim: String,
	pub require_https_metadata: bool,
	pub save_tokens: bool,
	/// Process-scoped cookie encryption key; generated per process when unset,
	/// which invalidates sessions across restarts.
	pub session_key: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Config {
	pub bind_address: IpAddr,
	pub http_port: u16,
	pub https_port: u16,
	pub https_enabled: bool,
	pub redirect_http_to_https: bool,
	/// External origin used to build the OIDC redirect URI; derived from the
	/// request when unset.
	pub public_origin: Option<String>,
	pub cert_storage_path: PathBuf,
	pub cert_provider: CertProviderKind,
	pub acme: Option<AcmeSettings>,
	pub oidc: Option<OidcSettings>,
	/// How long in-flight connections get to finish after shutdown starts.
	pub drain_timeout: Duration,
}

/// File-level configuration; every field optional, environment wins.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
	bind_address: Option<IpAddr>,
	http_port: Option<u16>,
	https_port: Option<u16>,
	https_enabled: Option<bool>,
	redirect_http_to_https: Option<bool>,
	public_origin: Option<String>,
	cert_storage_path: Option<PathBuf>,
	cert_provider: Option<String>,
	acme: Option<RawAcme>,
	oidc: Option<RawOidc>,
	drain_timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawAcme {
	email: Option<String>,
	accept_tos: Option<bool>,
	staging: Option<bool>,
	directory: Option<String>,
	skip_tls_verify: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawOidc {
	enabled: Option<bool>,
	authority: Option<String>,
	client_id: Option<String>,
	client_secret: Option<String>,
	callback_path: Option<String>,
	role_claim: Option<String>,
	scopes: Option<String>,
	require_https_metadata: Option<bool>,
	save_tokens: Option<bool>,
	session_key: Option<String>,
}

pub fn parse_config(contents: Option<&str>) -> anyhow::Result<Config> {
	let raw: RawConfig = match contents {
		Some(c) => serde_yaml::from_str(c).context("invalid config file")?,
		None => RawConfig::default(),
	};
	let raw_acme = raw.acme.unwrap_or_default();
	let raw_oidc = raw.oidc.unwrap_or_default();

	let https_enabled = env_override("HARBORGATE_HTTPS_ENABLED")?
		.or(raw.https_enabled)
		.unwrap_or(true);
	let cert_provider = match env_override::<String>("HARBORGATE_CERT_PROVIDER")?
		.or(raw.cert_provider)
	{
		Some(name) => name.parse::<CertProviderKind>()?,
		None => CertProviderKind::SelfSigned,
	};

	let acme = if https_enabled && cert_provider == CertProviderKind::LetsEncrypt {
		let email = env_override("HARBORGATE_ACME_EMAIL")?
			.or(raw_acme.email)
			.context("ACME email is required when the LetsEncrypt provider is selected")?;
		let accept_tos = env_override("HARBORGATE_ACME_ACCEPT_TOS")?
			.or(raw_acme.accept_tos)
			.unwrap_or(false);
		if !accept_tos {
			anyhow::bail!(
				"the LetsEncrypt provider requires accepting the CA terms of service (HARBORGATE_ACME_ACCEPT_TOS=true)"
			);
		}
		let staging = env_override("HARBORGATE_ACME_STAGING")?
			.or(raw_acme.staging)
			.unwrap_or(false);
		let directory = env_override("HARBORGATE_ACME_DIRECTORY")?
			.or(raw_acme.directory)
			.unwrap_or_else(|| {
				if staging {
					LETS_ENCRYPT_STAGING.to_string()
				} else {
					LETS_ENCRYPT_PRODUCTION.to_string()
				}
			});
		let skip_tls_verify = env_override("HARBORGATE_ACME_SKIP_TLS_VERIFY")?
			.or(raw_acme.skip_tls_verify)
			.unwrap_or(false);
		Some(AcmeSettings {
			email,
			accept_tos,
			directory,
			skip_tls_verify,
		})
	} else {
		None
	};

	let oidc_enabled = env_override("HARBORGATE_OIDC_ENABLED")?
		.or(raw_oidc.enabled)
		.unwrap_or(false);
	let oidc = if oidc_enabled {
		let authority: String = env_override("HARBORGATE_OIDC_AUTHORITY")?
			.or(raw_oidc.authority)
			.context("OIDC authority is required when OIDC is enabled")?;
		let client_id = env_override("HARBORGATE_OIDC_CLIENT_ID")?
			.or(raw_oidc.client_id)
			.context("OIDC client id is required when OIDC is enabled")?;
		let client_secret: String = env_override("HARBORGATE_OIDC_CLIENT_SECRET")?
			.or(raw_oidc.client_secret)
			.context("OIDC client secret is required when OIDC is enabled")?;
		let session_key = env_override::<String>("HARBORGATE_OIDC_SESSION_KEY")?
			.or(raw_oidc.session_key)
			.map(|encoded| decode_session_key(&encoded))
			.transpose()?;
		Some(OidcSettings {
			authority: authority.trim_end_matches('/').to_string(),
			client_id,
			client_secret: SecretString::new(client_secret.into()),
			scopes: env_override("HARBORGATE_OIDC_SCOPES")?
				.or(raw_oidc.scopes)
				.unwrap_or_else(|| DEFAULT_SCOPES.to_string()),
			callback_path: env_override("HARBORGATE_OIDC_CALLBACK_PATH")?
				.or(raw_oidc.callback_path)
				.unwrap_or_else(|| DEFAULT_CALLBACK_PATH.to_string()),
			role_claim: env_override("HARBORGATE_OIDC_ROLE_CLAIM")?
				.or(raw_oidc.role_claim)
				.unwrap_or_else(|| DEFAULT_ROLE_CLAIM.to_string()),
			require_https_metadata: env_override("HARBORGATE_OIDC_REQUIRE_HTTPS_METADATA")?
				.or(raw_oidc.require_https_metadata)
				.unwrap_or(true),
			save_tokens: env_override("HARBORGATE_OIDC_SAVE_TOKENS")?
				.or(raw_oidc.save_tokens)
				.unwrap_or(false),
			session_key,
		})
	} else {
		None
	};

	Ok(Config {
		bind_address: env_override("HARBORGATE_BIND_ADDRESS")?
			.or(raw.bind_address)
			.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0])),
		http_port: env_override("HARBORGATE_HTTP_PORT")?
			.or(raw.http_port)
			.unwrap_or(80),
		https_port: env_override("HARBORGATE_HTTPS_PORT")?
			.or(raw.https_port)
			.unwrap_or(443),
		https_enabled,
		redirect_http_to_https: env_override("HARBORGATE_REDIRECT_HTTP_TO_HTTPS")?
			.or(raw.redirect_http_to_https)
			.unwrap_or(https_enabled),
		public_origin: env_override::<String>("HARBORGATE_PUBLIC_ORIGIN")?
			.or(raw.public_origin)
			.map(|o| o.trim_end_matches('/').to_string()),
		cert_storage_path: env_override("HARBORGATE_CERT_STORAGE_PATH")?
			.or(raw.cert_storage_path)
			.unwrap_or_else(|| PathBuf::from("./certs")),
		cert_provider,
		acme,
		oidc,
		drain_timeout: Duration::from_secs(
			env_override("HARBORGATE_DRAIN_TIMEOUT_SECONDS")?
				.or(raw.drain_timeout_seconds)
				.unwrap_or(5),
		),
	})
}

fn decode_session_key(encoded: &str) -> anyhow::Result<Vec<u8>> {
	let key = base64::engine::general_purpose::STANDARD
		.decode(encoded.trim())
		.context("session key must be base64")?;
	if key.len() < 32 {
		anyhow::bail!(
			"session key must decode to at least 32 bytes, got {}",
			key.len()
		);
	}
	if key.len() < 64 {
		warn!(component = "config", "session key shorter than 64 bytes; deriving cookie keys from it");
	}
	Ok(key)
}

/// Reads one `HARBORGATE_*` variable. Unset and empty both count as "not
/// configured", so a blank export cannot shadow a file value by accident.
fn env_override<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
	T::Err: fmt::Display,
{
	let Ok(raw) = std::env::var(name) else {
		return Ok(None);
	};
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Ok(None);
	}
	match trimmed.parse() {
		Ok(value) => Ok(Some(value)),
		Err(e) => Err(anyhow::anyhow!("cannot parse {name}={trimmed:?}: {e}")),
	}
}
