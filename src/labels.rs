use std::collections::HashMap;

use tracing::warn;

use crate::docker::short_id;

/// Reserved label prefix; the only configuration surface a container exposes.
pub const LABEL_PREFIX: &str = "harborgate";

pub const LABEL_ENABLE: &str = "harborgate.enable";
pub const LABEL_HOST: &str = "harborgate.host";
pub const LABEL_PORT: &str = "harborgate.port";
pub const LABEL_TLS: &str = "harborgate.tls";
pub const LABEL_AUTH_ENABLE: &str = "harborgate.auth.enable";
pub const LABEL_AUTH_ROLES: &str = "harborgate.auth.roles";

/// Routing intent derived from a container's labels. Ephemeral; rebuilt on
/// every inspection. Parsing never fails: malformed fields degrade to their
/// defaults and are logged against the owning container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteIntent {
	pub enable: bool,
	pub host: Option<String>,
	pub port: Option<u16>,
	pub tls: bool,
	pub auth_required: bool,
	pub required_roles: Vec<String>,
}

pub fn parse_labels(container_id: &str, labels: &HashMap<String, String>) -> RouteIntent {
	let enable = labels
		.get(LABEL_ENABLE)
		.map(|v| parse_bool(container_id, LABEL_ENABLE, v, false))
		.unwrap_or(false);

	let host = labels.get(LABEL_HOST).and_then(|v| {
		let trimmed = v.trim().to_ascii_lowercase();
		if trimmed.is_empty() {
			warn!(
				container = short_id(container_id),
				component = "labels",
				"label {LABEL_HOST} is empty; container will be ignored"
			);
			None
		} else {
			Some(trimmed)
		}
	});

	let port = labels.get(LABEL_PORT).and_then(|v| {
		match v.trim().parse::<u16>() {
			Ok(p) if p > 0 => Some(p),
			_ => {
				warn!(
					container = short_id(container_id),
					component = "labels",
					value = %v,
					"label {LABEL_PORT} is not a valid port; falling back to exposed ports"
				);
				None
			},
		}
	});

	let tls = labels
		.get(LABEL_TLS)
		.map(|v| parse_bool(container_id, LABEL_TLS, v, true))
		.unwrap_or(true);

	let auth_required = labels
		.get(LABEL_AUTH_ENABLE)
		.map(|v| parse_bool(container_id, LABEL_AUTH_ENABLE, v, false))
		.unwrap_or(false);

	let required_roles = labels
		.get(LABEL_AUTH_ROLES)
		.map(|v| {
			v.split(',')
				.map(str::trim)
				.filter(|r| !r.is_empty())
				.map(str::to_string)
				.collect()
		})
		.unwrap_or_default();

	RouteIntent {
		enable,
		host,
		port,
		tls,
		auth_required,
		required_roles,
	}
}

fn parse_bool(container_id: &str, key: &str, value: &str, default: bool) -> bool {
	match value.trim().to_ascii_lowercase().as_str() {
		"true" | "1" | "yes" => true,
		"false" | "0" | "no" => false,
		_ => {
			warn!(
				container = short_id(container_id),
				component = "labels",
				value,
				"label {key} is not a boolean; using default {default}"
			);
			default
		},
	}
}
