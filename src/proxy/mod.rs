mod gateway;
pub mod httpproxy;

use bytes::Bytes;
pub use gateway::{Gateway, ProxyInputs};
use http::{HeaderValue, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
// Unsync because hyper's Incoming is !Sync.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;
pub type Response = http::Response<Body>;

pub fn empty_body() -> Body {
	Empty::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn full_body(bytes: impl Into<Bytes>) -> Body {
	Full::new(bytes.into())
		.map_err(|never| match never {})
		.boxed_unsync()
}

pub fn incoming_body(body: Incoming) -> Body {
	body.map_err(|e| Box::new(e) as BoxError).boxed_unsync()
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no route for host")]
	RouteNotFound,
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(hyper_util::client::legacy::Error),
	#[error("upstream timeout")]
	UpstreamTimeout,
	#[error("request upgrade failed, backend tried {1:?} but {0:?} was requested")]
	UpgradeFailed(Option<HeaderValue>, Option<HeaderValue>),
	#[error("processing failed: {0}")]
	Processing(anyhow::Error),
}

impl ProxyError {
	pub fn into_response(self) -> Response {
		let code = match self {
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
			ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::UpstreamCallFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpgradeFailed(_, _) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::Processing(_) => StatusCode::BAD_GATEWAY,
		};
		let msg = self.to_string();
		::http::Response::builder()
			.status(code)
			.header(hyper::header::CONTENT_TYPE, "text/plain")
			.body(full_body(msg))
			.expect("static response must build")
	}
}
