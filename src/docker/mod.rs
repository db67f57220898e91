pub mod observer;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::system::EventsOptions;
use futures_util::{Stream, StreamExt};
use itertools::Itertools;
use tracing::{debug, info};

/// Truncated container id used in log lines.
pub fn short_id(id: &str) -> &str {
	id.get(..12).unwrap_or(id)
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
	#[error("container engine error: {0}")]
	Engine(#[from] bollard::errors::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
	Start,
	Die,
	Stop,
	Destroy,
}

#[derive(Debug, Clone)]
pub struct ContainerEvent {
	pub id: String,
	pub action: ContainerAction,
}

#[derive(Debug, Clone)]
pub struct NetworkAttachment {
	pub network: String,
	pub ip: IpAddr,
}

/// Everything the observer needs to know about one running container.
#[derive(Debug, Clone, Default)]
pub struct ContainerDescriptor {
	pub id: String,
	pub name: String,
	pub labels: HashMap<String, String>,
	/// Numeric container-side ports, ascending. The map the engine reports is
	/// unordered; sorting pins the "first exposed port" rule.
	pub exposed_ports: Vec<u16>,
	/// Container port -> published host port.
	pub host_port_bindings: BTreeMap<u16, u16>,
	pub networks: Vec<NetworkAttachment>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ContainerEvent, SourceError>> + Send>>;

/// Capability contract over the container engine: snapshot + event stream.
#[async_trait]
pub trait ContainerSource: Send + Sync {
	/// Snapshot of currently running containers.
	async fn list(&self) -> Result<Vec<ContainerDescriptor>, SourceError>;
	/// `Ok(None)` when the container no longer exists.
	async fn inspect(&self, id: &str) -> Result<Option<ContainerDescriptor>, SourceError>;
	/// Fresh lifecycle event stream; callers re-invoke after a stream breaks.
	fn events(&self) -> EventStream;
	/// Whether the proxy itself runs inside a container, which changes how
	/// backend endpoints are derived.
	fn runs_in_container(&self) -> bool;
}

/// `ContainerSource` backed by the local Docker daemon.
pub struct DockerSource {
	docker: Docker,
	in_container: bool,
}

impl DockerSource {
	pub fn connect() -> Result<Self, SourceError> {
		let docker = Docker::connect_with_local_defaults()?;
		let in_container = Path::new("/.dockerenv").exists();
		info!(
			in_container,
			component = "docker",
			"connected to container engine"
		);
		Ok(DockerSource {
			docker,
			in_container,
		})
	}
}

#[async_trait]
impl ContainerSource for DockerSource {
	async fn list(&self) -> Result<Vec<ContainerDescriptor>, SourceError> {
		let summaries = self
			.docker
			.list_containers(Some(ListContainersOptions::<String> {
				all: false,
				..Default::default()
			}))
			.await?;
		let mut out = Vec::with_capacity(summaries.len());
		for summary in summaries {
			let Some(id) = summary.id else { continue };
			// The list payload lacks network details; inspect each candidate.
			if let Some(desc) = self.inspect(&id).await? {
				out.push(desc);
			}
		}
		Ok(out)
	}

	async fn inspect(&self, id: &str) -> Result<Option<ContainerDescriptor>, SourceError> {
		match self
			.docker
			.inspect_container(id, None::<InspectContainerOptions>)
			.await
		{
			Ok(resp) => Ok(Some(descriptor_from_inspect(resp))),
			Err(bollard::errors::Error::DockerResponseServerError {
				status_code: 404, ..
			}) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	fn events(&self) -> EventStream {
		let filters: HashMap<String, Vec<String>> =
			HashMap::from([("type".to_string(), vec!["container".to_string()])]);
		let stream = self.docker.events(Some(EventsOptions::<String> {
			filters,
			..Default::default()
		}));
		Box::pin(stream.filter_map(|item| async move {
			match item {
				Ok(msg) => parse_event(msg).map(Ok),
				Err(e) => Some(Err(e.into())),
			}
		}))
	}

	fn runs_in_container(&self) -> bool {
		self.in_container
	}
}

fn parse_event(msg: EventMessage) -> Option<ContainerEvent> {
	let id = msg.actor.and_then(|a| a.id)?;
	let action = match msg.action.as_deref() {
		Some("start") => ContainerAction::Start,
		Some("die") => ContainerAction::Die,
		Some("stop") => ContainerAction::Stop,
		Some("destroy") => ContainerAction::Destroy,
		other => {
			debug!(
				container = short_id(&id),
				action = ?other,
				component = "docker",
				"ignoring container event"
			);
			return None;
		},
	};
	Some(ContainerEvent { id, action })
}

fn descriptor_from_inspect(resp: ContainerInspectResponse) -> ContainerDescriptor {
	let id = resp.id.unwrap_or_default();
	let name = resp
		.name
		.map(|n| n.trim_start_matches('/').to_string())
		.unwrap_or_default();
	let config = resp.config.unwrap_or_default();
	let labels = config.labels.unwrap_or_default();

	let exposed_ports: Vec<u16> = config
		.exposed_ports
		.unwrap_or_default()
		.keys()
		.filter_map(|spec| parse_port_spec(spec))
		.sorted_unstable()
		.dedup()
		.collect();

	let network_settings = resp.network_settings.unwrap_or_default();

	let mut host_port_bindings = BTreeMap::new();
	for (spec, bindings) in network_settings.ports.unwrap_or_default() {
		let Some(container_port) = parse_port_spec(&spec) else {
			continue;
		};
		let Some(bindings) = bindings else { continue };
		if let Some(host_port) = bindings
			.iter()
			.filter_map(|b| b.host_port.as_deref())
			.find_map(|p| p.parse::<u16>().ok())
		{
			host_port_bindings.insert(container_port, host_port);
		}
	}

	let mut networks: Vec<NetworkAttachment> = network_settings
		.networks
		.unwrap_or_default()
		.into_iter()
		.filter_map(|(network, endpoint)| {
			let ip = endpoint.ip_address?.parse::<IpAddr>().ok()?;
			Some(NetworkAttachment { network, ip })
		})
		.collect();
	// Attachment order out of the engine is a map; pin it by name so "first
	// attached network" is deterministic.
	networks.sort_by(|a, b| a.network.cmp(&b.network));

	ContainerDescriptor {
		id,
		name,
		labels,
		exposed_ports,
		host_port_bindings,
		networks,
	}
}

/// Parses engine port specs of the form `80/tcp`. Non-TCP ports are not
/// proxyable and are skipped.
fn parse_port_spec(spec: &str) -> Option<u16> {
	let (port, proto) = match spec.split_once('/') {
		Some((port, proto)) => (port, proto),
		None => (spec, "tcp"),
	};
	if !proto.eq_ignore_ascii_case("tcp") {
		return None;
	}
	port.parse::<u16>().ok().filter(|p| *p > 0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn port_spec_parsing() {
		assert_eq!(parse_port_spec("80/tcp"), Some(80));
		assert_eq!(parse_port_spec("8080"), Some(8080));
		assert_eq!(parse_port_spec("53/udp"), None);
		assert_eq!(parse_port_spec("0/tcp"), None);
		assert_eq!(parse_port_spec("http/tcp"), None);
	}

	#[test]
	fn short_id_truncates() {
		assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
		assert_eq!(short_id("abc"), "abc");
	}
}
