use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use http::header::{HeaderMap, LOCATION, SET_COOKIE};
use http::{StatusCode, Uri};
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use rand::Rng;
use rand::distr::Alphanumeric;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::session::{LoginState, Session, SessionLayer, unix_now};
use crate::config::OidcSettings;
use crate::proxy::{Response, full_body};

/// Discovery and JWKS fetch must complete within this deadline or startup
/// aborts.
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(30);

/// Session lifetime when the ID token carries no usable expiry.
const FALLBACK_SESSION_TTL: u64 = 8 * 60 * 60;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
	#[error("oidc discovery failed: {0}")]
	Discovery(String),
	#[error("oidc discovery timed out after {DISCOVERY_DEADLINE:?}")]
	DiscoveryTimeout,
	#[error("authority {0} is not https; set requireHttpsMetadata=false to allow this")]
	InsecureAuthority(String),
	#[error("http error: {0}")]
	Http(#[from] reqwest::Error),
	#[error("jwks error: {0}")]
	Jwks(String),
	#[error("invalid callback: {0}")]
	Callback(String),
	#[error("token exchange failed with status {0}")]
	TokenExchange(reqwest::StatusCode),
	#[error("the token is invalid or malformed: {0:?}")]
	InvalidToken(jsonwebtoken::errors::Error),
	#[error("the token header is malformed: {0:?}")]
	InvalidTokenHeader(jsonwebtoken::errors::Error),
	#[error("the token header does not specify a `kid`")]
	MissingKeyId,
	#[error("token uses the unknown key {0:?}")]
	UnknownKeyId(String),
	#[error("nonce mismatch in ID token")]
	NonceMismatch,
	#[error("cookie error: {0}")]
	Cookie(String),
	#[error("invalid url: {0}")]
	Url(#[from] url::ParseError),
}

/// The provider metadata the core depends on; every field must be present
/// and non-empty.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
	#[serde(default)]
	pub issuer: String,
	#[serde(default)]
	pub authorization_endpoint: String,
	#[serde(default)]
	pub token_endpoint: String,
	#[serde(default)]
	pub userinfo_endpoint: String,
	#[serde(default)]
	pub jwks_uri: String,
}

impl DiscoveryDocument {
	fn validate(&self) -> Result<(), AuthError> {
		for (field, value) in [
			("issuer", &self.issuer),
			("authorization_endpoint", &self.authorization_endpoint),
			("token_endpoint", &self.token_endpoint),
			("userinfo_endpoint", &self.userinfo_endpoint),
			("jwks_uri", &self.jwks_uri),
		] {
			if value.trim().is_empty() {
				return Err(AuthError::Discovery(format!(
					"metadata document is missing `{field}`"
				)));
			}
		}
		Ok(())
	}
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	#[serde(default)]
	access_token: Option<String>,
	#[serde(default)]
	id_token: Option<String>,
}

struct Jwk {
	decoding: DecodingKey,
	validation: Validation,
}

/// OIDC authorization-code authenticator: validates the provider at startup,
/// redirects unauthenticated callers, exchanges callback codes, and carries
/// the resulting identity in an encrypted cookie.
pub struct OidcAuthenticator {
	cfg: OidcSettings,
	/// Configured external origin for the redirect URI; derived from the
	/// request when unset.
	public_origin: Option<String>,
	discovery: DiscoveryDocument,
	keys: HashMap<String, Jwk>,
	sessions: SessionLayer,
	http: reqwest::Client,
}

impl std::fmt::Debug for OidcAuthenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OidcAuthenticator").finish_non_exhaustive()
	}
}

impl OidcAuthenticator {
	/// Fatal on any validation failure; the process must not start half
	/// authenticated.
	pub async fn discover(
		cfg: OidcSettings,
		public_origin: Option<String>,
	) -> Result<OidcAuthenticator, AuthError> {
		let authority = Url::parse(&cfg.authority)
			.map_err(|e| AuthError::Discovery(format!("invalid authority url: {e}")))?;
		if authority.scheme() != "https" {
			if cfg.require_https_metadata {
				return Err(AuthError::InsecureAuthority(cfg.authority.clone()));
			}
			warn!(
				authority = %cfg.authority,
				component = "oidc",
				"authority is not https; metadata and tokens travel unprotected"
			);
		}

		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(15))
			.redirect(reqwest::redirect::Policy::none())
			.build()?;

		let metadata_url = format!(
			"{}/.well-known/openid-configuration",
			cfg.authority.trim_end_matches('/')
		);
		let (discovery, keys) = tokio::time::timeout(DISCOVERY_DEADLINE, async {
			let discovery: DiscoveryDocument = http
				.get(&metadata_url)
				.send()
				.await?
				.error_for_status()
				.map_err(|e| AuthError::Discovery(format!("metadata fetch failed: {e}")))?
				.json()
				.await
				.map_err(|e| AuthError::Discovery(format!("metadata is not valid JSON: {e}")))?;
			discovery.validate()?;
			let jwks: JwkSet = http
				.get(&discovery.jwks_uri)
				.send()
				.await?
				.error_for_status()
				.map_err(|e| AuthError::Jwks(format!("jwks fetch failed: {e}")))?
				.json()
				.await
				.map_err(|e| AuthError::Jwks(format!("jwks is not valid JSON: {e}")))?;
			let keys = build_keys(jwks, &discovery.issuer, &cfg.client_id)?;
			Ok::<_, AuthError>((discovery, keys))
		})
		.await
		.map_err(|_| AuthError::DiscoveryTimeout)??;

		info!(
			issuer = %discovery.issuer,
			keys = keys.len(),
			component = "oidc",
			"OIDC provider validated"
		);
		Ok(OidcAuthenticator {
			sessions: SessionLayer::new(cfg.session_key.as_deref()),
			cfg,
			public_origin,
			discovery,
			keys,
			http,
		})
	}

	pub fn callback_path(&self) -> &str {
		&self.cfg.callback_path
	}

	/// Current session from the request cookies; `None` means the caller must
	/// be challenged.
	pub fn authenticate(&self, headers: &HeaderMap) -> Option<Session> {
		self.sessions.open_session(headers)
	}

	/// Redirect the client to the authorization endpoint, remembering where
	/// it wanted to go in an encrypted state cookie.
	pub fn challenge_redirect(
		&self,
		return_path: &str,
		authority: &str,
		tls: bool,
	) -> Result<Response, AuthError> {
		let redirect_uri = self.redirect_uri(authority, tls);
		let state: String = random_token();
		let nonce: String = random_token();

		let mut url = Url::parse(&self.discovery.authorization_endpoint)?;
		url
			.query_pairs_mut()
			.append_pair("response_type", "code")
			.append_pair("client_id", &self.cfg.client_id)
			.append_pair("scope", &self.cfg.scopes)
			.append_pair("redirect_uri", &redirect_uri)
			.append_pair("state", &state)
			.append_pair("nonce", &nonce);

		let login = LoginState {
			state,
			nonce,
			return_path: return_path.to_string(),
			redirect_uri,
			created_at: unix_now(),
		};
		let cookie = self.sessions.seal_state(&login, tls)?;
		Ok(
			::http::Response::builder()
				.status(StatusCode::FOUND)
				.header(LOCATION, url.as_str())
				.header(SET_COOKIE, cookie)
				.body(crate::proxy::empty_body())
				.expect("static response must build"),
		)
	}

	/// Authorization-code callback. Tampering (bad state, bad code) is a 400;
	/// success establishes the session cookie and returns to the original URL.
	pub async fn handle_callback(&self, headers: &HeaderMap, uri: &Uri, tls: bool) -> Response {
		match self.callback_inner(headers, uri, tls).await {
			Ok(resp) => resp,
			Err(e) => {
				warn!(component = "oidc", "callback rejected: {e}");
				::http::Response::builder()
					.status(StatusCode::BAD_REQUEST)
					.header(hyper::header::CONTENT_TYPE, "application/json")
					.body(full_body(
						serde_json::json!({
							"error": "BadRequest",
							"message": "The sign-in response could not be validated.",
						})
						.to_string(),
					))
					.expect("static response must build")
			},
		}
	}

	async fn callback_inner(
		&self,
		headers: &HeaderMap,
		uri: &Uri,
		tls: bool,
	) -> Result<Response, AuthError> {
		let query: HashMap<String, String> =
			url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
				.into_owned()
				.collect();
		if let Some(err) = query.get("error") {
			return Err(AuthError::Callback(format!(
				"provider returned error {err:?}"
			)));
		}
		let code = query
			.get("code")
			.ok_or_else(|| AuthError::Callback("missing code".to_string()))?;
		let state = query
			.get("state")
			.ok_or_else(|| AuthError::Callback("missing state".to_string()))?;
		let login = self
			.sessions
			.open_state(headers)
			.ok_or_else(|| AuthError::Callback("missing or unreadable state cookie".to_string()))?;
		if &login.state != state {
			return Err(AuthError::Callback("state mismatch".to_string()));
		}

		let tokens = self.exchange_code(code, &login.redirect_uri).await?;
		let id_token = tokens
			.id_token
			.as_deref()
			.ok_or_else(|| AuthError::Callback("token response carried no id_token".to_string()))?;
		let claims = self.validate_id_token(id_token, &login.nonce)?;

		let subject = claims
			.get("sub")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();
		let mut name = display_name(&claims).unwrap_or_else(|| subject.clone());
		let mut roles = roles_from_claims(&claims, &self.cfg.role_claim);
		if roles.is_empty() {
			// Some providers only publish roles through the userinfo endpoint.
			if let Some(access_token) = tokens.access_token.as_deref() {
				if let Some(userinfo) = self.fetch_userinfo(access_token).await {
					roles = roles_from_claims(&userinfo, &self.cfg.role_claim);
					if let Some(better) = display_name(&userinfo) {
						name = better;
					}
				}
			}
		}

		let expires_at = claims
			.get("exp")
			.and_then(Value::as_u64)
			.unwrap_or_else(|| unix_now() + FALLBACK_SESSION_TTL);
		let session = Session {
			subject: subject.clone(),
			name,
			roles,
			issued_at: unix_now(),
			expires_at,
			access_token: self.cfg.save_tokens.then(|| tokens.access_token).flatten(),
			id_token: self
				.cfg
				.save_tokens
				.then(|| tokens.id_token.clone())
				.flatten(),
		};
		info!(
			subject = %subject,
			roles = ?session.roles,
			component = "oidc",
			"sign-in completed"
		);

		let session_cookie = self.sessions.seal_session(&session, tls)?;
		Ok(
			::http::Response::builder()
				.status(StatusCode::FOUND)
				.header(LOCATION, sanitize_return_path(&login.return_path))
				.header(SET_COOKIE, session_cookie)
				.header(SET_COOKIE, self.sessions.clear_state())
				.body(crate::proxy::empty_body())
				.expect("static response must build"),
		)
	}

	async fn exchange_code(
		&self,
		code: &str,
		redirect_uri: &str,
	) -> Result<TokenResponse, AuthError> {
		let resp = self
			.http
			.post(&self.discovery.token_endpoint)
			.form(&[
				("grant_type", "authorization_code"),
				("code", code),
				("redirect_uri", redirect_uri),
				("client_id", &self.cfg.client_id),
				("client_secret", self.cfg.client_secret.expose_secret()),
			])
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(AuthError::TokenExchange(resp.status()));
		}
		Ok(resp.json().await?)
	}

	fn validate_id_token(&self, token: &str, nonce: &str) -> Result<Map<String, Value>, AuthError> {
		let header = decode_header(token).map_err(|error| {
			debug!(?error, component = "oidc", "received token with invalid header");
			AuthError::InvalidTokenHeader(error)
		})?;
		let kid = header.kid.as_ref().ok_or(AuthError::MissingKeyId)?;
		let key = self
			.keys
			.get(kid)
			.ok_or_else(|| AuthError::UnknownKeyId(kid.to_owned()))?;
		let decoded = decode::<Map<String, Value>>(token, &key.decoding, &key.validation)
			.map_err(|error| {
				debug!(?error, component = "oidc", "token failed validation");
				AuthError::InvalidToken(error)
			})?;
		match decoded.claims.get("nonce").and_then(Value::as_str) {
			Some(got) if got == nonce => {},
			_ => return Err(AuthError::NonceMismatch),
		}
		Ok(decoded.claims)
	}

	async fn fetch_userinfo(&self, access_token: &str) -> Option<Map<String, Value>> {
		match self
			.http
			.get(&self.discovery.userinfo_endpoint)
			.bearer_auth(access_token)
			.send()
			.await
			.and_then(|r| r.error_for_status())
		{
			Ok(resp) => resp.json().await.ok(),
			Err(e) => {
				warn!(component = "oidc", "userinfo fetch failed: {e}");
				None
			},
		}
	}

	#[cfg(test)]
	pub(crate) fn issue_session_cookie(
		&self,
		session: &Session,
		secure: bool,
	) -> http::header::HeaderValue {
		self
			.sessions
			.seal_session(session, secure)
			.expect("test session must seal")
	}

	fn redirect_uri(&self, authority: &str, tls: bool) -> String {
		match &self.public_origin {
			Some(origin) => format!("{origin}{}", self.cfg.callback_path),
			None => {
				let scheme = if tls { "https" } else { "http" };
				format!("{scheme}://{authority}{}", self.cfg.callback_path)
			},
		}
	}
}

/// Any-of role matching, case-insensitive: an empty requirement means
/// "authenticated only".
pub fn is_authorized(user_roles: &[String], required: &[String]) -> bool {
	required.is_empty()
		|| required
			.iter()
			.any(|r| user_roles.iter().any(|u| u.eq_ignore_ascii_case(r)))
}

fn display_name(claims: &Map<String, Value>) -> Option<String> {
	claims
		.get("name")
		.or_else(|| claims.get("preferred_username"))
		.and_then(Value::as_str)
		.map(str::to_string)
}

/// The configured role claim wins; the standard claims are fallbacks. Values
/// may be an array of strings or a single string.
fn roles_from_claims(claims: &Map<String, Value>, role_claim: &str) -> Vec<String> {
	for key in [role_claim, "roles", "role"] {
		let Some(value) = claims.get(key) else { continue };
		let roles: Vec<String> = match value {
			Value::Array(items) => items
				.iter()
				.filter_map(Value::as_str)
				.map(str::to_string)
				.collect(),
			Value::String(s) if !s.is_empty() => vec![s.clone()],
			_ => vec![],
		};
		if !roles.is_empty() {
			return roles;
		}
	}
	vec![]
}

/// Open-redirect guard: only relative paths come back out of the state
/// cookie.
fn sanitize_return_path(path: &str) -> String {
	if path.starts_with('/') && !path.starts_with("//") {
		path.to_string()
	} else {
		"/".to_string()
	}
}

fn random_token() -> String {
	rand::rng()
		.sample_iter(&Alphanumeric)
		.take(32)
		.map(char::from)
		.collect()
}

fn build_keys(
	jwks: JwkSet,
	issuer: &str,
	client_id: &str,
) -> Result<HashMap<String, Jwk>, AuthError> {
	let to_supported_alg = |key_algorithm: Option<KeyAlgorithm>| match key_algorithm {
		Some(key_alg) => jsonwebtoken::Algorithm::from_str(key_alg.to_string().as_str()).ok(),
		_ => None,
	};
	let mut keys = HashMap::new();
	for jwk in jwks.keys {
		let Some(key_alg) = to_supported_alg(jwk.common.key_algorithm) else {
			warn!(
				component = "oidc",
				"JWK key algorithm {:?} is not supported; tokens signed by that key will not be accepted",
				jwk.common.key_algorithm
			);
			continue;
		};
		let kid = jwk
			.common
			.key_id
			.ok_or_else(|| AuthError::Jwks("key is missing the `kid` attribute".to_string()))?;
		let decoding = match &jwk.algorithm {
			AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
				.map_err(|e| AuthError::Jwks(format!("could not build decoding key for {kid:?}: {e}")))?,
			AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
				.map_err(|e| AuthError::Jwks(format!("could not build decoding key for {kid:?}: {e}")))?,
			other => {
				return Err(AuthError::Jwks(format!(
					"key {kid:?} uses unsupported algorithm {other:?}"
				)));
			},
		};
		let mut validation = Validation::new(key_alg);
		validation.set_audience(&[client_id]);
		validation.set_issuer(&[issuer]);
		keys.insert(kid, Jwk { decoding, validation });
	}
	Ok(keys)
}

#[cfg(test)]
#[path = "oidc_test.rs"]
mod tests;
