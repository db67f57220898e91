use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::docker::short_id;

/// Where a route's traffic goes. One per live route; always a plain HTTP
/// endpoint reachable as an IP literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
	pub address: IpAddr,
	pub port: u16,
}

impl fmt::Display for BackendEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "http://{}:{}", self.address, self.port)
	}
}

/// A live binding from a host name to a backend, derived from one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
	pub container_id: String,
	pub container_name: String,
	pub host: String,
	pub backend: BackendEndpoint,
	pub tls: bool,
	pub auth_required: bool,
	pub required_roles: Vec<String>,
}

/// Immutable view of the route table. Readers always observe a complete
/// snapshot; writers publish a new one atomically.
#[derive(Debug, Default)]
pub struct RouteTableSnapshot {
	pub by_host: HashMap<String, Arc<Route>>,
	pub epoch: u64,
}

/// Hot-swappable host -> backend map. A single writer (the container
/// observer) serializes mutations behind a mutex and publishes copy-on-write
/// snapshots; the request path loads them lock-free.
#[derive(Clone)]
pub struct RouteTable {
	inner: Arc<Inner>,
}

struct Inner {
	snapshot: ArcSwap<RouteTableSnapshot>,
	write: Mutex<WriterState>,
	epoch_tx: watch::Sender<u64>,
}

#[derive(Default)]
struct WriterState {
	/// Which host each container currently owns; lets upsert/remove find the
	/// previous binding without scanning the snapshot.
	host_by_id: HashMap<String, String>,
}

impl Default for RouteTable {
	fn default() -> Self {
		Self::new()
	}
}

impl RouteTable {
	pub fn new() -> Self {
		let (epoch_tx, _) = watch::channel(0);
		RouteTable {
			inner: Arc::new(Inner {
				snapshot: ArcSwap::from_pointee(RouteTableSnapshot::default()),
				write: Mutex::new(WriterState::default()),
				epoch_tx,
			}),
		}
	}

	/// Lock-free; safe to call from the hot request path.
	pub fn snapshot(&self) -> Arc<RouteTableSnapshot> {
		self.inner.snapshot.load_full()
	}

	/// Observe route-table changes as a monotonically increasing epoch.
	pub fn subscribe(&self) -> watch::Receiver<u64> {
		self.inner.epoch_tx.subscribe()
	}

	/// Insert or replace the route owned by `route.container_id`. When
	/// another container currently owns the same host it is displaced: last
	/// writer wins, matching container lifecycle ordering.
	pub fn upsert(&self, route: Route) {
		let mut state = self.inner.write.lock();
		let mut by_host = self.inner.snapshot.load().by_host.clone();

		// The container may have moved to a new host since last inspection.
		if let Some(prev_host) = state.host_by_id.get(&route.container_id) {
			if prev_host != &route.host {
				by_host.remove(prev_host);
			}
		}

		if let Some(existing) = by_host.get(&route.host) {
			if existing.container_id != route.container_id {
				warn!(
					host = %route.host,
					displaced = short_id(&existing.container_id),
					container = short_id(&route.container_id),
					component = "routes",
					"host already routed; newer container displaces the earlier one"
				);
				state.host_by_id.remove(&existing.container_id);
			}
		}

		info!(
			container = short_id(&route.container_id),
			host = %route.host,
			backend = %route.backend,
			component = "routes",
			"route published"
		);
		state
			.host_by_id
			.insert(route.container_id.clone(), route.host.clone());
		by_host.insert(route.host.clone(), Arc::new(route));
		self.publish(&mut state, by_host);
	}

	/// Remove the route owned by `container_id`, if any.
	pub fn remove(&self, container_id: &str) {
		let mut state = self.inner.write.lock();
		let Some(host) = state.host_by_id.remove(container_id) else {
			debug!(
				container = short_id(container_id),
				component = "routes",
				"remove for unknown container"
			);
			return;
		};
		let mut by_host = self.inner.snapshot.load().by_host.clone();
		// Only drop the host entry if this container still owns it; it may
		// have been displaced in the meantime.
		if by_host
			.get(&host)
			.is_some_and(|r| r.container_id == container_id)
		{
			by_host.remove(&host);
			info!(
				container = short_id(container_id),
				host = %host,
				component = "routes",
				"route removed"
			);
		}
		self.publish(&mut state, by_host);
	}

	fn publish(&self, _state: &mut WriterState, by_host: HashMap<String, Arc<Route>>) {
		let epoch = self.inner.snapshot.load().epoch + 1;
		self
			.inner
			.snapshot
			.store(Arc::new(RouteTableSnapshot { by_host, epoch }));
		self.inner.epoch_tx.send_replace(epoch);
	}
}
