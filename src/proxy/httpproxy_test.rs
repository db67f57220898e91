use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use http::Method;
use http_body_util::{BodyExt, Full};
use secrecy::SecretString;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::auth::session::{Session, unix_now};
use crate::auth::OidcAuthenticator;
use crate::config::{CertProviderKind, Config, OidcSettings};
use crate::proxy::ProxyInputs;
use crate::store::{BackendEndpoint, Route, RouteTable};
use crate::tls::challenges::ChallengeStore;
use crate::tls::provider::CertificateManager;
use crate::tls::selfsigned::SelfSignedProvider;
use crate::tls::store::CertificateStore;

fn test_config(redirect: bool) -> Config {
	Config {
		bind_address: IpAddr::from([127, 0, 0, 1]),
		http_port: 80,
		https_port: 443,
		https_enabled: true,
		redirect_http_to_https: redirect,
		public_origin: None,
		cert_storage_path: PathBuf::from("/nonexistent"),
		cert_provider: CertProviderKind::SelfSigned,
		acme: None,
		oidc: None,
		drain_timeout: Duration::from_secs(1),
	}
}

fn proxy_with(cfg: Config, auth: Option<Arc<OidcAuthenticator>>) -> (HttpProxy, RouteTable, ChallengeStore) {
	let routes = RouteTable::new();
	let challenges = ChallengeStore::new();
	let store = CertificateStore::new(None);
	let certs = CertificateManager::new(store.clone(), Arc::new(SelfSignedProvider::new(store)));
	let inputs = ProxyInputs::new(
		Arc::new(cfg),
		routes.clone(),
		certs,
		challenges.clone(),
		auth,
	);
	(HttpProxy::new(inputs), routes, challenges)
}

fn plain_conn() -> ConnectionInfo {
	ConnectionInfo {
		peer: "192.0.2.7:55000".parse().unwrap(),
		tls: false,
	}
}

fn tls_conn() -> ConnectionInfo {
	ConnectionInfo {
		peer: "192.0.2.7:55000".parse().unwrap(),
		tls: true,
	}
}

fn request(method: Method, uri: &str, host: &str) -> http::Request<Full<bytes::Bytes>> {
	http::Request::builder()
		.method(method)
		.uri(uri)
		.header(http::header::HOST, host)
		.body(Full::new(bytes::Bytes::new()))
		.unwrap()
}

async fn body_text(resp: Response) -> String {
	let collected = resp.into_body().collect().await.unwrap();
	String::from_utf8(collected.to_bytes().to_vec()).unwrap()
}

fn route_to(routes: &RouteTable, host: &str, port: u16, auth_required: bool, roles: &[&str]) {
	routes.upsert(Route {
		container_id: format!("{host}-container"),
		container_name: host.to_string(),
		host: host.to_string(),
		backend: BackendEndpoint {
			address: IpAddr::from([127, 0, 0, 1]),
			port,
		},
		tls: true,
		auth_required,
		required_roles: roles.iter().map(|r| r.to_string()).collect(),
	});
}

#[tokio::test]
async fn health_endpoint_reports_status() {
	let (proxy, _routes, _) = proxy_with(test_config(true), None);
	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/_health", "whatever.test"))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers().get(header::CONTENT_TYPE).unwrap(),
		"application/json"
	);
	let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
	assert_eq!(body["service"], "harborgate");
	assert_eq!(body["status"], "running");
	assert_eq!(body["https"], true);
	assert_eq!(body["oidc"], false);
	assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn acme_responder_hit_and_miss() {
	let (proxy, _routes, challenges) = proxy_with(test_config(true), None);
	challenges.add("tok-1".to_string(), "tok-1.keyauth".to_string());

	let resp = proxy
		.handle(
			&plain_conn(),
			request(Method::GET, "/.well-known/acme-challenge/tok-1", "app.test"),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
	assert_eq!(body_text(resp).await, "tok-1.keyauth");

	let resp = proxy
		.handle(
			&plain_conn(),
			request(Method::GET, "/.well-known/acme-challenge/other", "app.test"),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plaintext_requests_redirect_to_https() {
	let (proxy, _routes, _) = proxy_with(test_config(true), None);
	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/app?q=1", "app.test:80"))
		.await;
	assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
	assert_eq!(
		resp.headers().get(header::LOCATION).unwrap(),
		"https://app.test/app?q=1"
	);
}

#[tokio::test]
async fn redirect_carries_non_default_https_port() {
	let mut cfg = test_config(true);
	cfg.https_port = 8443;
	let (proxy, _routes, _) = proxy_with(cfg, None);
	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/", "app.test"))
		.await;
	assert_eq!(
		resp.headers().get(header::LOCATION).unwrap(),
		"https://app.test:8443/"
	);
}

#[tokio::test]
async fn acme_and_health_paths_are_never_redirected() {
	let (proxy, _routes, challenges) = proxy_with(test_config(true), None);
	challenges.add("tok".to_string(), "tok.auth".to_string());

	let resp = proxy
		.handle(
			&plain_conn(),
			request(Method::GET, "/.well-known/acme-challenge/tok", "app.test"),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/_health", "app.test"))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn no_redirect_when_disabled_or_already_tls() {
	let (proxy, _routes, _) = proxy_with(test_config(false), None);
	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/", "unknown.test"))
		.await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);

	let (proxy, _routes, _) = proxy_with(test_config(true), None);
	let resp = proxy
		.handle(&tls_conn(), request(Method::GET, "/", "unknown.test"))
		.await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_host_is_404() {
	let (proxy, routes, _) = proxy_with(test_config(false), None);
	route_to(&routes, "app1.test.local", 1, false, &[]);
	let resp = proxy
		.handle(
			&plain_conn(),
			request(Method::GET, "/", "unknown.test.local"),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_host_header_is_400() {
	let (proxy, _routes, _) = proxy_with(test_config(false), None);
	let req = http::Request::builder()
		.uri("/")
		.body(Full::new(bytes::Bytes::new()))
		.unwrap();
	let resp = proxy.handle(&plain_conn(), req).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn proxies_to_backend_with_forwarded_headers() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/"))
		.and(header("x-forwarded-host", "app1.test.local"))
		.and(header("x-forwarded-proto", "http"))
		.and(header("x-forwarded-for", "192.0.2.7"))
		.respond_with(ResponseTemplate::new(200).set_body_string("Hostname: backend-a"))
		.mount(&backend)
		.await;

	let (proxy, routes, _) = proxy_with(test_config(false), None);
	route_to(&routes, "app1.test.local", backend.address().port(), false, &[]);

	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/", "app1.test.local"))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(body_text(resp).await.contains("Hostname:"));
}

#[tokio::test]
async fn host_port_is_stripped_for_route_lookup() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&backend)
		.await;
	let (proxy, routes, _) = proxy_with(test_config(false), None);
	route_to(&routes, "app2.test.local", backend.address().port(), false, &[]);

	let resp = proxy
		.handle(
			&plain_conn(),
			request(Method::GET, "/", "App2.Test.Local:8080"),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unreachable_backend_is_502() {
	let (proxy, routes, _) = proxy_with(test_config(false), None);
	// Port 1 is never listening.
	route_to(&routes, "dead.test.local", 1, false, &[]);
	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/", "dead.test.local"))
		.await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

async fn oidc_authenticator() -> Arc<OidcAuthenticator> {
	let server = MockServer::start().await;
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
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/jwks"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "keys": [] })))
		.mount(&server)
		.await;
	let cfg = OidcSettings {
		authority: server.uri(),
		client_id: "harborgate".to_string(),
		client_secret: SecretString::new("hunter2".into()),
		scopes: crate::config::DEFAULT_SCOPES.to_string(),
		callback_path: crate::config::DEFAULT_CALLBACK_PATH.to_string(),
		role_claim: crate::config::DEFAULT_ROLE_CLAIM.to_string(),
		require_https_metadata: false,
		save_tokens: false,
		session_key: Some(vec![3u8; 64]),
	};
	let auth = OidcAuthenticator::discover(cfg, None).await.unwrap();
	// Keep the mock server alive for the test's lifetime.
	std::mem::forget(server);
	Arc::new(auth)
}

fn session_with_roles(roles: &[&str]) -> Session {
	Session {
		subject: "user-1".to_string(),
		name: "Test User".to_string(),
		roles: roles.iter().map(|r| r.to_string()).collect(),
		issued_at: unix_now(),
		expires_at: unix_now() + 3600,
		access_token: None,
		id_token: None,
	}
}

#[tokio::test]
async fn public_route_needs_no_session() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&backend)
		.await;
	let auth = oidc_authenticator().await;
	let (proxy, routes, _) = proxy_with(test_config(false), Some(auth));
	route_to(&routes, "public.auth.test", backend.address().port(), false, &[]);

	let resp = proxy
		.handle(&plain_conn(), request(Method::GET, "/", "public.auth.test"))
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_route_challenges_anonymous_callers() {
	let auth = oidc_authenticator().await;
	let (proxy, routes, _) = proxy_with(test_config(false), Some(auth));
	route_to(&routes, "protected.auth.test", 1, true, &[]);

	let resp = proxy
		.handle(
			&plain_conn(),
			request(Method::GET, "/secret", "protected.auth.test"),
		)
		.await;
	assert_eq!(resp.status(), StatusCode::FOUND);
	let location = resp
		.headers()
		.get(header::LOCATION)
		.unwrap()
		.to_str()
		.unwrap();
	assert!(location.contains("/authorize"));
	assert!(location.contains("response_type=code"));
}

#[tokio::test]
async fn wrong_role_is_403_with_json_body() {
	let auth = oidc_authenticator().await;
	let cookie = auth.issue_session_cookie(&session_with_roles(&["user"]), false);
	let (proxy, routes, _) = proxy_with(test_config(false), Some(auth));
	route_to(&routes, "admin.auth.test", 1, true, &["admin"]);

	let mut req = request(Method::GET, "/", "admin.auth.test");
	let pair = cookie.to_str().unwrap().split(';').next().unwrap().to_string();
	req.headers_mut().insert(
		http::header::COOKIE,
		HeaderValue::from_str(&pair).unwrap(),
	);
	let resp = proxy.handle(&plain_conn(), req).await;
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
	assert_eq!(body["error"], "Forbidden");
}

#[tokio::test]
async fn matching_role_is_proxied() {
	let backend = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&backend)
		.await;
	let auth = oidc_authenticator().await;
	let cookie = auth.issue_session_cookie(&session_with_roles(&["Admin"]), false);
	let (proxy, routes, _) = proxy_with(test_config(false), Some(auth));
	route_to(&routes, "admin.auth.test", backend.address().port(), true, &["admin"]);

	let mut req = request(Method::GET, "/", "admin.auth.test");
	let pair = cookie.to_str().unwrap().split(';').next().unwrap().to_string();
	req.headers_mut().insert(
		http::header::COOKIE,
		HeaderValue::from_str(&pair).unwrap(),
	);
	let resp = proxy.handle(&plain_conn(), req).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[test]
fn per_hop_headers_are_stripped() {
	let mut req = http::Request::builder()
		.uri("/")
		.header(header::CONNECTION, "keep-alive")
		.header("keep-alive", "timeout=5")
		.header("proxy-connection", "keep-alive")
		.header(header::TE, "trailers")
		.header(header::TRANSFER_ENCODING, "chunked")
		.body(crate::proxy::empty_body())
		.unwrap();
	let upgrade = prepare_hop_headers(&mut req);
	assert!(upgrade.is_none());
	for name in ["connection", "keep-alive", "proxy-connection", "transfer-encoding"] {
		assert!(!req.headers().contains_key(name), "{name} should be stripped");
	}
	// Trailer support is put back for the backend.
	assert_eq!(req.headers().get(header::TE).unwrap(), "trailers");
}

#[test]
fn websocket_upgrade_headers_are_preserved() {
	let mut req = http::Request::builder()
		.uri("/ws")
		.header(header::CONNECTION, "Upgrade")
		.header(header::UPGRADE, "websocket")
		.body(crate::proxy::empty_body())
		.unwrap();
	// Without hyper's OnUpgrade extension there is no upgrade to drive, but
	// the headers must still be forwarded verbatim.
	let upgrade = prepare_hop_headers(&mut req);
	assert!(upgrade.is_none());
	assert_eq!(req.headers().get(header::UPGRADE).unwrap(), "websocket");
	assert!(
		req
			.headers()
			.get(header::CONNECTION)
			.unwrap()
			.to_str()
			.unwrap()
			.eq_ignore_ascii_case("upgrade")
	);
}

#[test]
fn upgrade_requires_connection_token() {
	// An Upgrade header alone does not opt in; the Connection header has to
	// carry the token, possibly among others.
	let mut headers = HeaderMap::new();
	headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
	assert!(requested_upgrade(&headers).is_none());

	headers.insert(
		header::CONNECTION,
		HeaderValue::from_static("keep-alive, Upgrade"),
	);
	assert_eq!(requested_upgrade(&headers).unwrap(), "websocket");
}

#[test]
fn forwarded_for_appends_to_existing_chain() {
	let mut headers = HeaderMap::new();
	headers.insert(
		HeaderName::from_static("x-forwarded-for"),
		HeaderValue::from_static("198.51.100.9"),
	);
	append_forwarded_headers(&mut headers, &tls_conn(), "app.test");
	assert_eq!(
		headers.get("x-forwarded-for").unwrap(),
		"198.51.100.9, 192.0.2.7"
	);
	assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
	assert_eq!(headers.get("x-forwarded-host").unwrap(), "app.test");
}
