use std::time::{SystemTime, UNIX_EPOCH};

use cookie::time::Duration as CookieDuration;
use cookie::{Cookie, CookieJar, Key, SameSite};
use http::header::{COOKIE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::AuthError;

pub const SESSION_COOKIE: &str = "HarborGate.Auth";
pub const STATE_COOKIE: &str = "HarborGate.State";

/// Sign-in round trips must complete within this window.
const STATE_MAX_AGE: CookieDuration = CookieDuration::minutes(10);

pub fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

/// An authenticated user, materialised entirely inside the encrypted cookie.
/// The server keeps no session table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
	pub subject: String,
	pub name: String,
	pub roles: Vec<String>,
	pub issued_at: u64,
	pub expires_at: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub access_token: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id_token: Option<String>,
}

impl Session {
	pub fn is_expired(&self) -> bool {
		unix_now() >= self.expires_at
	}
}

/// State carried across the authorization-code round trip, tying the callback
/// to the original request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginState {
	pub state: String,
	pub nonce: String,
	pub return_path: String,
	pub redirect_uri: String,
	pub created_at: u64,
}

/// Encrypts and authenticates cookie payloads with a process-scoped key.
pub struct SessionLayer {
	key: Key,
}

impl SessionLayer {
	/// A configured key survives restarts; without one a fresh key is
	/// generated and existing sessions become invalid.
	pub fn new(configured: Option<&[u8]>) -> SessionLayer {
		let key = match configured {
			Some(bytes) => Key::derive_from(bytes),
			None => {
				debug!(
					component = "session",
					"no session key configured; sessions will not survive a restart"
				);
				Key::generate()
			},
		};
		SessionLayer { key }
	}

	pub fn seal_session(&self, session: &Session, secure: bool) -> Result<HeaderValue, AuthError> {
		let remaining = session.expires_at.saturating_sub(unix_now());
		self.seal(
			SESSION_COOKIE,
			serde_json::to_string(session).map_err(|e| AuthError::Cookie(e.to_string()))?,
			secure,
			CookieDuration::seconds(remaining as i64),
		)
	}

	pub fn open_session(&self, headers: &HeaderMap) -> Option<Session> {
		let payload = self.open(headers, SESSION_COOKIE)?;
		let session: Session = serde_json::from_str(&payload)
			.map_err(|e| {
				warn!(component = "session", "session cookie holds invalid payload: {e}");
			})
			.ok()?;
		if session.is_expired() {
			debug!(component = "session", subject = %session.subject, "session expired");
			return None;
		}
		Some(session)
	}

	pub fn seal_state(&self, state: &LoginState, secure: bool) -> Result<HeaderValue, AuthError> {
		self.seal(
			STATE_COOKIE,
			serde_json::to_string(state).map_err(|e| AuthError::Cookie(e.to_string()))?,
			secure,
			STATE_MAX_AGE,
		)
	}

	pub fn open_state(&self, headers: &HeaderMap) -> Option<LoginState> {
		let payload = self.open(headers, STATE_COOKIE)?;
		serde_json::from_str(&payload).ok()
	}

	/// Expired replacement for the state cookie, sent with the callback
	/// response once the round trip completes.
	pub fn clear_state(&self) -> HeaderValue {
		let mut cookie = Cookie::new(STATE_COOKIE, "");
		cookie.set_path("/");
		cookie.set_http_only(true);
		cookie.set_max_age(CookieDuration::ZERO);
		HeaderValue::from_str(&cookie.encoded().to_string())
			.expect("static cookie attributes are valid header characters")
	}

	fn seal(
		&self,
		name: &'static str,
		payload: String,
		secure: bool,
		max_age: CookieDuration,
	) -> Result<HeaderValue, AuthError> {
		let mut cookie = Cookie::new(name, payload);
		cookie.set_http_only(true);
		cookie.set_same_site(SameSite::Lax);
		cookie.set_path("/");
		cookie.set_secure(secure);
		cookie.set_max_age(max_age);

		let mut jar = CookieJar::new();
		jar.private_mut(&self.key).add(cookie);
		let sealed = jar
			.get(name)
			.ok_or_else(|| AuthError::Cookie("failed to seal cookie".to_string()))?;
		HeaderValue::from_str(&sealed.encoded().to_string())
			.map_err(|e| AuthError::Cookie(e.to_string()))
	}

	fn open(&self, headers: &HeaderMap, name: &str) -> Option<String> {
		let mut jar = CookieJar::new();
		for header in headers.get_all(COOKIE) {
			let Ok(value) = header.to_str() else { continue };
			for piece in value.split(';') {
				if let Ok(cookie) = Cookie::parse_encoded(piece.trim().to_owned()) {
					jar.add_original(cookie);
				}
			}
		}
		let cookie = jar.private(&self.key).get(name)?;
		Some(cookie.value().to_string())
	}
}
