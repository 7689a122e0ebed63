use std::collections::HashMap;

use bollard::Docker;
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::query_parameters::{
	EventsOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
};
use discovery_core::prelude::*;
use futures::StreamExt;
use itertools::Itertools;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Error, RuntimeAdapter, WorkloadEvent};
use crate::config::DockerConfig;
use crate::types::workload::short_id;
use crate::types::{EventType, Runtime, Workload, WorkloadType};

/// Docker adapter: talks to the daemon over its UNIX socket and translates
/// container lifecycle and network events.
pub struct DockerAdapter {
	config: DockerConfig,
	client: Option<Docker>,
	token: CancellationToken,
}

impl DockerAdapter {
	pub fn new(config: DockerConfig) -> Self {
		DockerAdapter {
			config,
			client: None,
			token: CancellationToken::new(),
		}
	}

	fn client(&self) -> Result<&Docker, Error> {
		self.client
			.as_ref()
			.ok_or(Error::NotConnected(Runtime::Docker))
	}

	/// Inspect a container and normalize it. `Ok(None)` when it is gone or
	/// not labeled for discovery.
	async fn fetch_workload(&self, id: &str) -> Result<Option<Workload>, Error> {
		match self
			.client()?
			.inspect_container(id, None::<InspectContainerOptions>)
			.await
		{
			Ok(inspect) => Ok(container_to_workload(&self.config, inspect)),
			Err(bollard::errors::Error::DockerResponseServerError {
				status_code: 404, ..
			}) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn handle_event(
		&self,
		event: EventMessage,
		events: &mpsc::Sender<WorkloadEvent>,
	) -> Result<(), Error> {
		let action = event.action.as_deref().unwrap_or_default();
		let actor = event.actor.unwrap_or_default();
		let attributes = actor.attributes.unwrap_or_default();

		match action {
			"start" => {
				let Some(id) = actor.id else {
					return Ok(());
				};
				if let Some(workload) = self.fetch_workload(&id).await? {
					let _ = events
						.send(WorkloadEvent::new(EventType::Added, workload))
						.await;
				}
			},
			"stop" | "die" | "kill" => {
				let Some(id) = actor.id else {
					return Ok(());
				};
				let name = attributes
					.get("name")
					.map(strng::new)
					.unwrap_or_else(|| short_id(&id));
				let tombstone = Workload::tombstone(Runtime::Docker, strng::new(&id), name);
				let _ = events
					.send(WorkloadEvent::new(EventType::Deleted, tombstone))
					.await;
			},
			"connect" | "disconnect" => {
				// Network-scoped events carry the container id as an actor
				// attribute rather than the actor id (which is the network).
				let Some(id) = attributes.get("container").cloned().or(actor.id) else {
					return Ok(());
				};
				if let Some(workload) = self.fetch_workload(&id).await? {
					let _ = events
						.send(WorkloadEvent::new(EventType::NetworkChanged, workload))
						.await;
				}
			},
			_ => {},
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl RuntimeAdapter for DockerAdapter {
	fn runtime(&self) -> Runtime {
		Runtime::Docker
	}

	async fn connect(&mut self) -> Result<(), Error> {
		let client = Docker::connect_with_unix(
			self.config.socket_path(),
			120,
			bollard::API_DEFAULT_VERSION,
		)?;
		client.ping().await?;
		info!(socket = self.config.socket_path(), "connected to docker");
		self.client = Some(client);
		Ok(())
	}

	async fn list_workloads(&self) -> Result<Vec<Workload>, Error> {
		let filters = HashMap::from([(
			"label".to_string(),
			vec![self.config.label_selector()],
		)]);
		let options = ListContainersOptionsBuilder::new().filters(&filters).build();
		let containers = self.client()?.list_containers(Some(options)).await?;

		let mut workloads = Vec::with_capacity(containers.len());
		for summary in containers {
			let Some(id) = summary.id else {
				continue;
			};
			match self.fetch_workload(&id).await {
				Ok(Some(workload)) => workloads.push(workload),
				Ok(None) => {},
				Err(e) => warn!(%id, "failed to inspect container: {e}"),
			}
		}
		Ok(workloads)
	}

	async fn watch_events(&self, events: mpsc::Sender<WorkloadEvent>) -> Result<(), Error> {
		// Container events carry lifecycle actions; network events carry
		// connect/disconnect for containers joining or leaving networks.
		let filters = HashMap::from([(
			"type".to_string(),
			vec!["container".to_string(), "network".to_string()],
		)]);
		let options = EventsOptionsBuilder::new().filters(&filters).build();
		let mut stream = self.client()?.events(Some(options));

		loop {
			tokio::select! {
				_ = self.token.cancelled() => return Ok(()),
				message = stream.next() => {
					match message {
						Some(Ok(event)) => {
							if let Err(e) = self.handle_event(event, &events).await {
								warn!("failed to process docker event: {e}");
							}
						},
						Some(Err(e)) => return Err(e.into()),
						None => return Ok(()),
					}
				},
			}
		}
	}

	fn close(&self) {
		self.token.cancel();
	}
}

/// Normalize an inspected container. Returns `None` when the discovery
/// label is absent.
fn container_to_workload(
	config: &DockerConfig,
	inspect: ContainerInspectResponse,
) -> Option<Workload> {
	let id = inspect.id?;
	let container_config = inspect.config.unwrap_or_default();
	let labels = container_config.labels.unwrap_or_default();
	if labels.get(&config.label_key) != Some(&config.label_value) {
		return None;
	}

	// Docker reports names with a leading slash.
	let name = inspect
		.name
		.as_deref()
		.map(|n| n.trim_start_matches('/'))
		.filter(|n| !n.is_empty())
		.map(strng::new)
		.unwrap_or_else(|| short_id(&id));

	let networks: Vec<Strng> = inspect
		.network_settings
		.and_then(|settings| settings.networks)
		.map(|networks| networks.into_keys().sorted().map(strng::new).collect())
		.unwrap_or_default();

	// ExposedPorts keys look like "8080/tcp".
	let ports: Vec<u16> = container_config
		.exposed_ports
		.map(|exposed| {
			exposed
				.iter()
				.filter_map(|key| key.split('/').next()?.parse().ok())
				.sorted()
				.dedup()
				.collect()
		})
		.unwrap_or_default();

	// Containers are reachable as {name}.{network} inside each network.
	let addresses = networks
		.iter()
		.map(|network| strng::format!("{name}.{network}"))
		.collect();

	Some(Workload {
		hostname: short_id(&id),
		id: strng::new(id),
		name,
		runtime: Runtime::Docker,
		workload_type: WorkloadType::Container,
		addresses,
		isolation_groups: networks,
		ports,
		labels,
		..Default::default()
	})
}

#[cfg(test)]
mod tests {
	use bollard::models::{ContainerConfig, EndpointSettings, NetworkSettings};

	use super::*;

	fn config() -> DockerConfig {
		DockerConfig {
			socket: "unix:///var/run/docker.sock".to_string(),
			label_key: "discover".to_string(),
			label_value: "true".to_string(),
		}
	}

	fn inspect_response(labels: HashMap<String, String>) -> ContainerInspectResponse {
		ContainerInspectResponse {
			id: Some("0123456789abcdef0123456789abcdef".to_string()),
			name: Some("/web".to_string()),
			config: Some(ContainerConfig {
				labels: Some(labels),
				exposed_ports: Some(vec!["8080/tcp".to_string(), "9090/udp".to_string()]),
				..Default::default()
			}),
			network_settings: Some(NetworkSettings {
				networks: Some(HashMap::from([
					("net1".to_string(), EndpointSettings::default()),
					("net2".to_string(), EndpointSettings::default()),
				])),
				..Default::default()
			}),
			..Default::default()
		}
	}

	fn discover_labels() -> HashMap<String, String> {
		HashMap::from([("discover".to_string(), "true".to_string())])
	}

	#[test]
	fn converts_labeled_container() {
		let w = container_to_workload(&config(), inspect_response(discover_labels())).unwrap();
		assert_eq!(w.id, "0123456789abcdef0123456789abcdef");
		assert_eq!(w.name, "web");
		assert_eq!(w.hostname, "0123456789ab");
		assert_eq!(w.runtime, Runtime::Docker);
		assert_eq!(w.workload_type, WorkloadType::Container);
		assert_eq!(
			w.isolation_groups,
			vec![strng::new("net1"), strng::new("net2")]
		);
		assert_eq!(
			w.addresses,
			vec![strng::new("web.net1"), strng::new("web.net2")]
		);
		assert_eq!(w.ports, vec![8080, 9090]);
	}

	#[test]
	fn group_suffix_of_every_address_is_a_joined_network() {
		let w = container_to_workload(&config(), inspect_response(discover_labels())).unwrap();
		for addr in &w.addresses {
			let (_, group) = addr.rsplit_once('.').unwrap();
			assert!(w.isolation_groups.iter().any(|g| g == group));
		}
	}

	#[test]
	fn unlabeled_container_is_skipped() {
		assert!(container_to_workload(&config(), inspect_response(HashMap::new())).is_none());
		let wrong = HashMap::from([("discover".to_string(), "false".to_string())]);
		assert!(container_to_workload(&config(), inspect_response(wrong)).is_none());
	}

	#[test]
	fn falls_back_to_short_id_name() {
		let mut inspect = inspect_response(discover_labels());
		inspect.name = None;
		let w = container_to_workload(&config(), inspect).unwrap();
		assert_eq!(w.name, "0123456789ab");
	}
}
