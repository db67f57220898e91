use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::docker::{ContainerAction, ContainerDescriptor, ContainerEvent, ContainerSource, short_id};
use crate::labels::{self, RouteIntent};
use crate::store::{BackendEndpoint, Route, RouteTable};

/// Containers often publish their ports a moment after `start` fires; wait
/// this long before inspecting.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Drives the initial container scan and the lifecycle event loop,
/// translating engine events into route-table mutations. Single logical
/// task: all mutations to the route table are serialized here.
pub struct Observer {
	source: Arc<dyn ContainerSource>,
	routes: RouteTable,
}

impl Observer {
	pub fn new(source: Arc<dyn ContainerSource>, routes: RouteTable) -> Self {
		Observer { source, routes }
	}

	pub async fn run(self, shutdown: CancellationToken) {
		self.scan().await;

		let mut backoff = RECONNECT_BACKOFF_INITIAL;
		loop {
			let mut events = self.source.events();
			let mut received_any = false;
			loop {
				let event = tokio::select! {
					ev = events.next() => ev,
					_ = shutdown.cancelled() => {
						info!(component = "observer", "shutting down");
						return;
					}
				};
				match event {
					Some(Ok(ev)) => {
						received_any = true;
						backoff = RECONNECT_BACKOFF_INITIAL;
						self.handle_event(ev).await;
					},
					Some(Err(e)) => {
						warn!(component = "observer", "event stream error: {e}");
						break;
					},
					None => {
						warn!(component = "observer", "event stream ended");
						break;
					},
				}
			}
			if !received_any {
				backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
			}
			warn!(
				component = "observer",
				"reconnecting to event stream in {backoff:?}"
			);
			tokio::select! {
				_ = tokio::time::sleep(backoff) => {},
				_ = shutdown.cancelled() => return,
			}
			// Events may have been missed while disconnected.
			self.scan().await;
		}
	}

	/// Initial (and post-reconnect) sweep over running containers.
	async fn scan(&self) {
		match self.source.list().await {
			Ok(descriptors) => {
				info!(
					count = descriptors.len(),
					component = "observer",
					"scanning running containers"
				);
				for desc in descriptors {
					self.apply_descriptor(&desc);
				}
			},
			Err(e) => {
				warn!(component = "observer", "container scan failed: {e}");
			},
		}
	}

	async fn handle_event(&self, ev: ContainerEvent) {
		match ev.action {
			ContainerAction::Start => {
				tokio::time::sleep(SETTLE_DELAY).await;
				match self.source.inspect(&ev.id).await {
					Ok(Some(desc)) => self.apply_descriptor(&desc),
					Ok(None) => {
						debug!(
							container = short_id(&ev.id),
							component = "observer",
							"container disappeared before inspection"
						);
						self.routes.remove(&ev.id);
					},
					Err(e) => {
						warn!(
							container = short_id(&ev.id),
							component = "observer",
							"inspect failed, skipping: {e}"
						);
					},
				}
			},
			ContainerAction::Die | ContainerAction::Stop | ContainerAction::Destroy => {
				self.routes.remove(&ev.id);
			},
		}
	}

	fn apply_descriptor(&self, desc: &ContainerDescriptor) {
		let intent = labels::parse_labels(&desc.id, &desc.labels);
		if !intent.enable {
			debug!(
				container = short_id(&desc.id),
				component = "observer",
				"container not enabled for routing"
			);
			return;
		}
		match build_route(desc, &intent, self.source.runs_in_container()) {
			Some(route) => self.routes.upsert(route),
			None => {
				// build_route already logged why; a stale route for this
				// container must not survive a failed re-inspection.
				self.routes.remove(&desc.id);
			},
		}
	}
}

/// Derives the backend endpoint for a container, or `None` (logged) when the
/// container cannot be routed.
pub(crate) fn build_route(
	desc: &ContainerDescriptor,
	intent: &RouteIntent,
	in_container: bool,
) -> Option<Route> {
	let Some(host) = intent.host.clone() else {
		warn!(
			container = short_id(&desc.id),
			component = "observer",
			"container enabled but has no host label; skipping"
		);
		return None;
	};

	let target_port = match intent.port {
		Some(p) => p,
		None => {
			if desc.exposed_ports.len() > 1 {
				warn!(
					container = short_id(&desc.id),
					host = %host,
					ports = ?desc.exposed_ports,
					component = "observer",
					"multiple exposed ports without an explicit port label; using the lowest"
				);
			}
			match desc.exposed_ports.first() {
				Some(p) => *p,
				None => {
					warn!(
						container = short_id(&desc.id),
						host = %host,
						component = "observer",
						"no target port discoverable; skipping"
					);
					return None;
				},
			}
		},
	};

	let backend = if in_container {
		// Talk to the container directly over its first attached network.
		let Some(attachment) = desc.networks.first() else {
			warn!(
				container = short_id(&desc.id),
				host = %host,
				component = "observer",
				"container has no network attachment with an IP; skipping"
			);
			return None;
		};
		BackendEndpoint {
			address: attachment.ip,
			port: target_port,
		}
	} else {
		// From the host we can only reach published ports.
		let Some(host_port) = desc.host_port_bindings.get(&target_port) else {
			warn!(
				container = short_id(&desc.id),
				host = %host,
				port = target_port,
				component = "observer",
				"target port has no host binding; skipping"
			);
			return None;
		};
		BackendEndpoint {
			address: IpAddr::from([127, 0, 0, 1]),
			port: *host_port,
		}
	};

	Some(Route {
		container_id: desc.id.clone(),
		container_name: desc.name.clone(),
		host,
		backend,
		tls: intent.tls,
		auth_required: intent.auth_required,
		required_roles: intent.required_roles.clone(),
	})
}

#[cfg(test)]
#[path = "observer_test.rs"]
mod tests;
