use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::Config;
use crate::auth::OidcAuthenticator;
use crate::proxy::Body;
use crate::proxy::httpproxy::{ConnectionInfo, HttpProxy};
use crate::store::RouteTable;
use crate::tls::challenges::ChallengeStore;
use crate::tls::provider::CertificateManager;

/// Everything the request path needs, passed explicitly instead of through
/// process-wide registries.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub routes: RouteTable,
	pub certs: CertificateManager,
	pub challenges: ChallengeStore,
	pub auth: Option<Arc<OidcAuthenticator>>,
	pub upstream: Client<HttpConnector, Body>,
}

impl ProxyInputs {
	pub fn new(
		cfg: Arc<Config>,
		routes: RouteTable,
		certs: CertificateManager,
		challenges: ChallengeStore,
		auth: Option<Arc<OidcAuthenticator>>,
	) -> Arc<ProxyInputs> {
		let mut connector = HttpConnector::new();
		connector.set_nodelay(true);
		let upstream = Client::builder(TokioExecutor::new())
			.pool_idle_timeout(Duration::from_secs(90))
			.build(connector);
		Arc::new(ProxyInputs {
			cfg,
			routes,
			certs,
			challenges,
			auth,
			upstream,
		})
	}
}

/// Owns the plaintext and TLS listeners. Both sockets are bound by the caller
/// before the observer and renewal loop start, so no traffic is lost during
/// readiness.
pub struct Gateway {
	pi: Arc<ProxyInputs>,
	shutdown: CancellationToken,
	tracker: TaskTracker,
}

impl Gateway {
	pub fn new(pi: Arc<ProxyInputs>, shutdown: CancellationToken) -> Gateway {
		Gateway {
			pi,
			shutdown,
			tracker: TaskTracker::new(),
		}
	}

	pub async fn run(self, http_listener: TcpListener, https_listener: Option<TcpListener>) {
		let mut js = JoinSet::new();
		js.spawn(Self::accept_loop(
			self.pi.clone(),
			http_listener,
			false,
			self.shutdown.clone(),
			self.tracker.clone(),
		));
		if let Some(listener) = https_listener {
			js.spawn(Self::accept_loop(
				self.pi.clone(),
				listener,
				true,
				self.shutdown.clone(),
				self.tracker.clone(),
			));
		}
		while js.join_next().await.is_some() {}

		// Accept loops are done; give in-flight connections a bounded drain.
		self.tracker.close();
		let drain = self.pi.cfg.drain_timeout;
		if tokio::time::timeout(drain, self.tracker.wait()).await.is_err() {
			warn!(
				component = "gateway",
				"connections still open after {drain:?} drain; exiting anyway"
			);
		} else {
			info!(component = "gateway", "all connections drained");
		}
	}

	async fn accept_loop(
		pi: Arc<ProxyInputs>,
		listener: TcpListener,
		tls: bool,
		shutdown: CancellationToken,
		tracker: TaskTracker,
	) {
		let addr = listener
			.local_addr()
			.map(|a| a.to_string())
			.unwrap_or_default();
		info!(addr = %addr, tls, component = "gateway", "listening");
		loop {
			tokio::select! {
				res = listener.accept() => match res {
					Ok((stream, peer)) => {
						let pi = pi.clone();
						let shutdown = shutdown.clone();
						tracker.spawn(async move {
							if tls {
								Self::serve_tls(pi, stream, peer, shutdown).await;
							} else {
								Self::serve_plain(pi, stream, peer, shutdown).await;
							}
						});
					},
					Err(e) => {
						warn!(component = "gateway", "accept failed: {e}");
						tokio::time::sleep(Duration::from_millis(10)).await;
					},
				},
				_ = shutdown.cancelled() => {
					info!(addr = %addr, component = "gateway", "stopped accepting connections");
					return;
				},
			}
		}
	}

	async fn serve_plain(
		pi: Arc<ProxyInputs>,
		stream: TcpStream,
		peer: SocketAddr,
		shutdown: CancellationToken,
	) {
		let conn = ConnectionInfo { peer, tls: false };
		Self::serve_http(pi, TokioIo::new(stream), conn, shutdown).await;
	}

	/// TLS termination: read the ClientHello, pick the certificate for the
	/// SNI name (acquiring one on demand; the handshake waits), then resume.
	/// No SNI or no certificate aborts the handshake.
	async fn serve_tls(
		pi: Arc<ProxyInputs>,
		stream: TcpStream,
		peer: SocketAddr,
		shutdown: CancellationToken,
	) {
		let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
		let start = match acceptor.await {
			Ok(start) => start,
			Err(e) => {
				debug!(peer = %peer, component = "gateway", "TLS accept failed: {e}");
				return;
			},
		};
		let Some(server_name) = start
			.client_hello()
			.server_name()
			.map(|s| s.to_ascii_lowercase())
		else {
			debug!(peer = %peer, component = "gateway", "no SNI in ClientHello; closing");
			return;
		};
		if let Some(route) = pi.routes.snapshot().by_host.get(&server_name) {
			if !route.tls {
				debug!(
					host = %server_name,
					component = "gateway",
					"route opted out of TLS termination; closing"
				);
				return;
			}
		}
		let record = match pi.certs.certificate_for(&server_name).await {
			Ok(record) => record,
			Err(e) => {
				warn!(
					host = %server_name,
					component = "gateway",
					"no certificate for handshake: {e}"
				);
				return;
			},
		};
		let tls_stream = match start.into_stream(record.server_config.clone()).await {
			Ok(stream) => stream,
			Err(e) => {
				debug!(
					host = %server_name,
					peer = %peer,
					component = "gateway",
					"handshake failed: {e}"
				);
				return;
			},
		};
		let conn = ConnectionInfo { peer, tls: true };
		Self::serve_http(pi, TokioIo::new(tls_stream), conn, shutdown).await;
	}

	async fn serve_http<I>(
		pi: Arc<ProxyInputs>,
		io: TokioIo<I>,
		conn: ConnectionInfo,
		shutdown: CancellationToken,
	) where
		I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
	{
		let proxy = HttpProxy::new(pi);
		let peer = conn.peer;
		let server = auto_server();
		let serve = server.serve_connection_with_upgrades(
			io,
			service_fn(move |req| {
				let proxy = proxy.clone();
				let conn = conn.clone();
				async move { Ok::<_, Infallible>(proxy.handle(&conn, req).await) }
			}),
		);
		tokio::pin!(serve);
		tokio::select! {
			res = serve.as_mut() => {
				if let Err(e) = res {
					debug!(peer = %peer, component = "gateway", "connection error: {e}");
				}
			},
			_ = shutdown.cancelled() => {
				// GOAWAY for HTTP/2, `Connection: close` for HTTP/1; then let
				// in-flight requests finish.
				serve.as_mut().graceful_shutdown();
				if let Err(e) = serve.await {
					debug!(peer = %peer, component = "gateway", "connection error during drain: {e}");
				}
			},
		}
	}
}

pub fn auto_server() -> auto::Builder<TokioExecutor> {
	let mut b = auto::Builder::new(TokioExecutor::new());
	b.http2().timer(TokioTimer::new());
	b
}
