use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::auth::is_authorized;
use crate::proxy::{Body, BoxError, ProxyError, Response, empty_body, full_body, incoming_body};
use crate::store::Route;
use crate::{SERVICE_NAME, VERSION};

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
pub const HEALTH_PATH: &str = "/_health";

/// Conservative per-hop deadline; covers connect plus response headers.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(100);

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub peer: SocketAddr,
	pub tls: bool,
}

/// Ordered request pipeline: HTTPS redirect, ACME responder, health,
/// conditional authentication, then the host-based reverse proxy.
#[derive(Clone)]
pub struct HttpProxy {
	pub(super) inputs: Arc<super::ProxyInputs>,
}

impl HttpProxy {
	pub fn new(inputs: Arc<super::ProxyInputs>) -> Self {
		HttpProxy { inputs }
	}

	pub async fn handle<B>(&self, conn: &ConnectionInfo, req: http::Request<B>) -> Response
	where
		B: http_body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<BoxError>,
	{
		let req = req.map(|b| Body::new(b.map_err(Into::into)));
		match self.handle_internal(conn, req).await {
			Ok(resp) => resp,
			Err(e) => {
				debug!(peer = %conn.peer, component = "proxy", "request failed: {e}");
				e.into_response()
			},
		}
	}

	async fn handle_internal(
		&self,
		conn: &ConnectionInfo,
		req: http::Request<Body>,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		let path = req.uri().path().to_string();

		// The ACME responder answers on every listener, ahead of redirects,
		// auth, and routing.
		if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
			return Ok(self.acme_response(token));
		}
		if path == HEALTH_PATH {
			return Ok(self.health_response(req.method()));
		}

		let (host, authority) = request_host(&req)?;

		if !conn.tls && cfg.https_enabled && cfg.redirect_http_to_https {
			return Ok(self.redirect_to_https(&req, &host));
		}

		if let Some(auth) = &self.inputs.auth {
			if path == auth.callback_path() {
				return Ok(auth.handle_callback(req.headers(), req.uri(), conn.tls).await);
			}
		}

		let route = self.inputs.routes.snapshot().by_host.get(&host).cloned();

		if let (Some(auth), Some(route)) = (&self.inputs.auth, route.as_ref()) {
			if route.auth_required {
				match auth.authenticate(req.headers()) {
					Some(session) => {
						if !is_authorized(&session.roles, &route.required_roles) {
							debug!(
								host = %host,
								subject = %session.subject,
								component = "proxy",
								"role requirement not met"
							);
							return Ok(forbidden_response());
						}
					},
					None => {
						let return_path = req
							.uri()
							.path_and_query()
							.map(|pq| pq.as_str())
							.unwrap_or("/");
						return auth
							.challenge_redirect(return_path, &authority, conn.tls)
							.map_err(|e| ProxyError::Processing(e.into()));
					},
				}
			}
		}

		let route = route.ok_or(ProxyError::RouteNotFound)?;
		self.proxy_upstream(conn, &route, &host, req).await
	}

	fn acme_response(&self, token: &str) -> Response {
		match self.inputs.challenges.get(token) {
			Some(key_authorization) => {
				debug!(token, component = "proxy", "answering ACME challenge");
				::http::Response::builder()
					.status(StatusCode::OK)
					.header(header::CONTENT_TYPE, "text/plain")
					.body(full_body(key_authorization))
					.expect("static response must build")
			},
			None => ::http::Response::builder()
				.status(StatusCode::NOT_FOUND)
				.body(empty_body())
				.expect("static response must build"),
		}
	}

	fn health_response(&self, method: &http::Method) -> Response {
		if method != http::Method::GET {
			return ::http::Response::builder()
				.status(StatusCode::METHOD_NOT_ALLOWED)
				.body(empty_body())
				.expect("static response must build");
		}
		let body = serde_json::json!({
			"service": SERVICE_NAME,
			"status": "running",
			"version": VERSION,
			"https": self.inputs.cfg.https_enabled,
			"oidc": self.inputs.auth.is_some(),
		});
		::http::Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/json")
			.body(full_body(body.to_string()))
			.expect("static response must build")
	}

	fn redirect_to_https(&self, req: &http::Request<Body>, host: &str) -> Response {
		let https_port = self.inputs.cfg.https_port;
		let port = if https_port == 443 {
			String::new()
		} else {
			format!(":{https_port}")
		};
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str())
			.unwrap_or("/");
		let location = format!("https://{host}{port}{path_and_query}");
		::http::Response::builder()
			.status(StatusCode::MOVED_PERMANENTLY)
			.header(header::LOCATION, location)
			.body(empty_body())
			.expect("static response must build")
	}

	async fn proxy_upstream(
		&self,
		conn: &ConnectionInfo,
		route: &Arc<Route>,
		host: &str,
		mut req: http::Request<Body>,
	) -> Result<Response, ProxyError> {
		let mut pending_upgrade = prepare_hop_headers(&mut req);
		append_forwarded_headers(req.headers_mut(), conn, host);

		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());
		let upstream_uri = Uri::try_from(format!(
			"http://{}:{}{}",
			route.backend.address, route.backend.port, path_and_query
		))
		.map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
		*req.uri_mut() = upstream_uri;
		// The client derives the Host header from the upstream authority.
		req.headers_mut().remove(header::HOST);

		debug!(
			host = %host,
			backend = %route.backend,
			container = crate::docker::short_id(&route.container_id),
			component = "proxy",
			"forwarding request"
		);
		let call = self.inputs.upstream.request(req);
		let resp = match tokio::time::timeout(UPSTREAM_TIMEOUT, call).await {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				warn!(
					host = %host,
					backend = %route.backend,
					container = crate::docker::short_id(&route.container_id),
					component = "proxy",
					"upstream call failed: {e}"
				);
				return Err(ProxyError::UpstreamCallFailed(e));
			},
			Err(_) => {
				warn!(
					host = %host,
					backend = %route.backend,
					container = crate::docker::short_id(&route.container_id),
					component = "proxy",
					"upstream timed out"
				);
				return Err(ProxyError::UpstreamTimeout);
			},
		};

		let resp = resp.map(incoming_body);
		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			return handle_upgrade(&mut pending_upgrade, resp).await;
		}
		Ok(resp)
	}
}

fn forbidden_response() -> Response {
	::http::Response::builder()
		.status(StatusCode::FORBIDDEN)
		.header(header::CONTENT_TYPE, "application/json")
		.body(full_body(
			serde_json::json!({
				"error": "Forbidden",
				"message": "You do not have the required roles to access this resource.",
			})
			.to_string(),
		))
		.expect("static response must build")
}

/// Host for routing (lowercased, port stripped) plus the authority exactly as
/// the client sent it.
fn request_host(req: &http::Request<Body>) -> Result<(String, String), ProxyError> {
	let authority = req
		.uri()
		.authority()
		.map(|a| a.to_string())
		.or_else(|| {
			req
				.headers()
				.get(header::HOST)
				.and_then(|h| h.to_str().ok())
				.map(str::to_string)
		})
		.ok_or_else(|| ProxyError::InvalidRequest("no authority or host".to_string()))?;
	let parsed = authority
		.parse::<http::uri::Authority>()
		.map_err(|_| ProxyError::InvalidRequest(format!("invalid host {authority:?}")))?;
	Ok((parsed.host().to_ascii_lowercase(), authority))
}

fn append_forwarded_headers(headers: &mut HeaderMap, conn: &ConnectionInfo, host: &str) {
	let peer = conn.peer.ip().to_string();
	let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {peer}"),
		None => peer,
	};
	if let Ok(value) = HeaderValue::try_from(forwarded_for) {
		headers.insert(X_FORWARDED_FOR.clone(), value);
	}
	headers.insert(
		X_FORWARDED_PROTO.clone(),
		HeaderValue::from_static(if conn.tls { "https" } else { "http" }),
	);
	if let Ok(value) = HeaderValue::try_from(host) {
		headers.insert(X_FORWARDED_HOST.clone(), value);
	}
}

/// Headers scoped to a single hop (RFC 7230 §6.1, plus the legacy names
/// proxies are expected to eat). None of these may reach the backend.
const PER_HOP_HEADERS: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-connection",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

/// A client-side upgrade parked until the backend answers 101.
struct PendingUpgrade {
	protocol: HeaderValue,
	client: OnUpgrade,
}

/// Strips per-hop headers from the request. Trailer support and a requested
/// protocol upgrade survive the strip: both also matter to the backend.
fn prepare_hop_headers(req: &mut http::Request<Body>) -> Option<PendingUpgrade> {
	let wants_trailers = req
		.headers()
		.get(header::TE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.to_ascii_lowercase().contains("trailers"));
	let protocol = requested_upgrade(req.headers());

	for name in PER_HOP_HEADERS {
		req.headers_mut().remove(*name);
	}
	if wants_trailers {
		req
			.headers_mut()
			.insert(header::TE, HeaderValue::from_static("trailers"));
	}

	let protocol = protocol?;
	req
		.headers_mut()
		.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
	req.headers_mut().insert(header::UPGRADE, protocol.clone());
	let client = req.extensions_mut().remove::<OnUpgrade>()?;
	Some(PendingUpgrade { protocol, client })
}

/// The protocol an Upgrade header asks for, honoured only when the
/// Connection header lists the `upgrade` token.
fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
	let upgrade_listed = headers
		.get(header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| {
			v.split(',')
				.any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
		});
	if !upgrade_listed {
		return None;
	}
	headers.get(header::UPGRADE).cloned()
}

/// The backend answered 101: forward the upgrade verbatim and splice both
/// connections until either side closes. Frames are not parsed.
async fn handle_upgrade(
	pending: &mut Option<PendingUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(PendingUpgrade { protocol, client }) = std::mem::take(pending) else {
		return Err(ProxyError::UpgradeFailed(None, None));
	};
	let backend_protocol = requested_upgrade(resp.headers());
	if backend_protocol.as_ref() != Some(&protocol) {
		return Err(ProxyError::UpgradeFailed(
			Some(protocol),
			backend_protocol,
		));
	}
	let backend_upgraded = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or_else(|| ProxyError::Processing(anyhow::anyhow!("backend sent no upgrade")))?
		.await
		.map_err(|e| ProxyError::Processing(anyhow::anyhow!("backend upgrade failed: {e:?}")))?;
	tokio::task::spawn(async move {
		let client_upgraded = match client.await {
			Ok(u) => u,
			Err(e) => {
				warn!(component = "proxy", "client upgrade failed: {e}");
				return;
			},
		};
		match tokio::io::copy_bidirectional(
			&mut TokioIo::new(client_upgraded),
			&mut TokioIo::new(backend_upgraded),
		)
		.await
		{
			Ok((up, down)) => {
				debug!(
					bytes_up = up,
					bytes_down = down,
					component = "proxy",
					"upgraded connection closed"
				);
			},
			Err(e) => debug!(component = "proxy", "upgraded connection error: {e}"),
		}
	});
	Ok(resp)
}

#[cfg(test)]
#[path = "httpproxy_test.rs"]
mod tests;
