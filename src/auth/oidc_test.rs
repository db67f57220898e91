use assert_matches::assert_matches;
use http::header::{COOKIE, HeaderValue, LOCATION, SET_COOKIE};
use secrecy::SecretString;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;

fn settings(authority: &str) -> OidcSettings {
	OidcSettings {
		authority: authority.trim_end_matches('/').to_string(),
		client_id: "harborgate".to_string(),
		client_secret: SecretString::new("hunter2".into()),
		scopes: crate::config::DEFAULT_SCOPES.to_string(),
		callback_path: crate::config::DEFAULT_CALLBACK_PATH.to_string(),
		role_claim: crate::config::DEFAULT_ROLE_CLAIM.to_string(),
		require_https_metadata: false,
		save_tokens: false,
		session_key: Some(vec![9u8; 64]),
	}
}

async fn mock_provider(server: &MockServer) {
	let base = server.uri();
	Mock::given(method("GET"))
		.and(path("/.well-known/openid-configuration"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"issuer": base,
			"authorization_endpoint": format!("{base}/authorize"),
			"token_endpoint": format!("{base}/token"),
			"userinfo_endpoint": format!("{base}/userinfo"),
			"jwks_uri": format!("{base}/jwks"),
		})))
		.mount(server)
		.await;
	Mock::given(method("GET"))
		.and(path("/jwks"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "keys": [] })))
		.mount(server)
		.await;
}

#[tokio::test]
async fn discovery_succeeds_against_valid_provider() {
	let server = MockServer::start().await;
	mock_provider(&server).await;
	let auth = OidcAuthenticator::discover(settings(&server.uri()), None)
		.await
		.expect("discovery should succeed");
	assert_eq!(auth.callback_path(), "/signin-oidc");
}

#[tokio::test]
async fn discovery_rejects_missing_endpoints() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/.well-known/openid-configuration"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"issuer": server.uri(),
			"authorization_endpoint": format!("{}/authorize", server.uri()),
			// token_endpoint and friends missing
		})))
		.mount(&server)
		.await;
	let err = OidcAuthenticator::discover(settings(&server.uri()), None)
		.await
		.unwrap_err();
	assert!(matches!(err, AuthError::Discovery(_)), "got {err:?}");
	assert!(err.to_string().contains("token_endpoint"));
}

#[tokio::test]
async fn discovery_rejects_unreachable_provider() {
	// Nothing listens on this port.
	let err = OidcAuthenticator::discover(settings("http://127.0.0.1:9"), None)
		.await
		.unwrap_err();
	assert!(matches!(err, AuthError::Http(_) | AuthError::Discovery(_)));
}

#[tokio::test]
async fn http_authority_requires_explicit_opt_out() {
	let server = MockServer::start().await;
	mock_provider(&server).await;
	let mut cfg = settings(&server.uri());
	cfg.require_https_metadata = true;
	let err = OidcAuthenticator::discover(cfg, None).await.unwrap_err();
	assert_matches!(err, AuthError::InsecureAuthority(_));
}

#[tokio::test]
async fn challenge_redirect_points_at_authorization_endpoint() {
	let server = MockServer::start().await;
	mock_provider(&server).await;
	let auth = OidcAuthenticator::discover(settings(&server.uri()), None)
		.await
		.unwrap();

	let resp = auth
		.challenge_redirect("/admin?tab=2", "app.auth.test", true)
		.unwrap();
	assert_eq!(resp.status(), StatusCode::FOUND);
	let location = resp.headers().get(LOCATION).unwrap().to_str().unwrap();
	let url = Url::parse(location).unwrap();
	assert!(location.starts_with(&format!("{}/authorize", server.uri())));
	let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
	assert_eq!(pairs["response_type"], "code");
	assert_eq!(pairs["client_id"], "harborgate");
	assert_eq!(pairs["scope"], "openid profile email");
	assert_eq!(pairs["redirect_uri"], "https://app.auth.test/signin-oidc");
	assert!(!pairs["state"].is_empty());
	assert!(resp.headers().get(SET_COOKIE).is_some());
}

#[tokio::test]
async fn configured_public_origin_wins() {
	let server = MockServer::start().await;
	mock_provider(&server).await;
	let auth = OidcAuthenticator::discover(
		settings(&server.uri()),
		Some("https://gate.example.com".to_string()),
	)
	.await
	.unwrap();
	let resp = auth
		.challenge_redirect("/", "internal-name:8443", true)
		.unwrap();
	let location = resp.headers().get(LOCATION).unwrap().to_str().unwrap();
	assert!(location.contains(
		&url::form_urlencoded::byte_serialize("https://gate.example.com/signin-oidc".as_bytes())
			.collect::<String>()
	));
}

#[tokio::test]
async fn callback_with_mismatched_state_is_rejected() {
	let server = MockServer::start().await;
	mock_provider(&server).await;
	let auth = OidcAuthenticator::discover(settings(&server.uri()), None)
		.await
		.unwrap();

	// A real challenge issues the state cookie; replay it with a forged state
	// parameter.
	let challenge = auth.challenge_redirect("/", "app.auth.test", false).unwrap();
	let cookie_pair = challenge
		.headers()
		.get(SET_COOKIE)
		.unwrap()
		.to_str()
		.unwrap()
		.split(';')
		.next()
		.unwrap()
		.to_string();
	let mut headers = HeaderMap::new();
	headers.insert(COOKIE, HeaderValue::from_str(&cookie_pair).unwrap());

	let uri: Uri = "/signin-oidc?code=abc&state=forged".parse().unwrap();
	let resp = auth.handle_callback(&headers, &uri, false).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_without_state_cookie_is_rejected() {
	let server = MockServer::start().await;
	mock_provider(&server).await;
	let auth = OidcAuthenticator::discover(settings(&server.uri()), None)
		.await
		.unwrap();
	let uri: Uri = "/signin-oidc?code=abc&state=xyz".parse().unwrap();
	let resp = auth.handle_callback(&HeaderMap::new(), &uri, false).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_with_provider_error_is_rejected() {
	let server = MockServer::start().await;
	mock_provider(&server).await;
	let auth = OidcAuthenticator::discover(settings(&server.uri()), None)
		.await
		.unwrap();
	let uri: Uri = "/signin-oidc?error=access_denied".parse().unwrap();
	let resp = auth.handle_callback(&HeaderMap::new(), &uri, false).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[test]
fn rbac_any_of_case_insensitive() {
	let user = vec!["User".to_string(), "Ops".to_string()];
	assert!(is_authorized(&user, &[]));
	assert!(is_authorized(&user, &["ops".to_string()]));
	assert!(is_authorized(&user, &["admin".to_string(), "OPS".to_string()]));
	assert!(!is_authorized(&user, &["admin".to_string()]));
	assert!(!is_authorized(&[], &["admin".to_string()]));
	assert!(is_authorized(&[], &[]));
}

#[test]
fn roles_claim_extraction() {
	let claims: Map<String, Value> = serde_json::from_value(serde_json::json!({
		"roles": ["admin", "user"],
	}))
	.unwrap();
	assert_eq!(roles_from_claims(&claims, "roles"), vec!["admin", "user"]);

	// Configured claim wins over standard ones.
	let claims: Map<String, Value> = serde_json::from_value(serde_json::json!({
		"groups": ["g1"],
		"roles": ["ignored"],
	}))
	.unwrap();
	assert_eq!(roles_from_claims(&claims, "groups"), vec!["g1"]);

	// Fallback to the standard claim when the configured one is absent.
	let claims: Map<String, Value> = serde_json::from_value(serde_json::json!({
		"role": "admin",
	}))
	.unwrap();
	assert_eq!(roles_from_claims(&claims, "groups"), vec!["admin"]);

	// Non-string entries are dropped.
	let claims: Map<String, Value> = serde_json::from_value(serde_json::json!({
		"roles": [1, 2],
	}))
	.unwrap();
	assert!(roles_from_claims(&claims, "roles").is_empty());
}

#[test]
fn return_path_guard() {
	assert_eq!(sanitize_return_path("/dashboard"), "/dashboard");
	assert_eq!(sanitize_return_path("/a?b=c"), "/a?b=c");
	assert_eq!(sanitize_return_path("https://evil.test"), "/");
	assert_eq!(sanitize_return_path("//evil.test"), "/");
	assert_eq!(sanitize_return_path(""), "/");
}
