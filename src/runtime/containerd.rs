use std::collections::BTreeSet;

use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::events_client::EventsClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
	Container, GetRequest, ListContainersRequest, SubscribeRequest,
};
use containerd_client::types::v1::Status;
use containerd_client::with_namespace;
use discovery_core::prelude::*;
use itertools::Itertools;
use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::transport::Channel;

use super::cni::{self, CniState};
use super::{Error, RuntimeAdapter, WorkloadEvent};
use crate::config::ContainerdConfig;
use crate::types::workload::short_id;
use crate::types::{EventType, Runtime, Workload, WorkloadType};

const NAME_LABEL: &str = "nerdctl/name";
const PORTS_LABEL_PREFIX: &str = "nerdctl/ports/";
const CNI_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// containerd adapter: container and task state over gRPC, network state
/// reconstructed from CNI result files on disk.
pub struct ContainerdAdapter {
	config: ContainerdConfig,
	cni: CniState,
	channel: Option<Channel>,
	token: CancellationToken,
}

impl ContainerdAdapter {
	pub fn new(config: ContainerdConfig) -> Self {
		let cni = CniState::new(config.cni_state_dir.clone(), config.namespace.clone());
		ContainerdAdapter {
			config,
			cni,
			channel: None,
			token: CancellationToken::new(),
		}
	}

	fn channel(&self) -> Result<Channel, Error> {
		self.channel
			.clone()
			.ok_or(Error::NotConnected(Runtime::Containerd))
	}

	fn list_request(&self) -> Request<ListContainersRequest> {
		let req = ListContainersRequest::default();
		with_namespace!(req, self.config.namespace)
	}

	async fn list_containers(&self) -> Result<Vec<Container>, Error> {
		let mut containers = ContainersClient::new(self.channel()?);
		let resp = containers.list(self.list_request()).await?.into_inner();
		Ok(resp.containers)
	}

	/// Whether the container currently has a RUNNING task. Containers with
	/// no task at all have never been started (or already exited).
	async fn is_running(&self, id: &str) -> Result<bool, Error> {
		let mut tasks = TasksClient::new(self.channel()?);
		let req = GetRequest {
			container_id: id.to_string(),
			exec_id: String::new(),
		};
		match tasks.get(with_namespace!(req, self.config.namespace)).await {
			Ok(resp) => Ok(resp
				.into_inner()
				.process
				.is_some_and(|p| p.status == Status::Running as i32)),
			Err(status) if status.code() == tonic::Code::NotFound => Ok(false),
			Err(status) => Err(status.into()),
		}
	}

	/// Resolve a container by full id, id prefix, or nerdctl name.
	async fn resolve_container(&self, identity: &str) -> Result<Option<Container>, Error> {
		let containers = self.list_containers().await?;
		Ok(containers.into_iter().find(|c| {
			c.id == identity
				|| c.id.starts_with(identity)
				|| c.labels.get(NAME_LABEL).map(String::as_str) == Some(identity)
		}))
	}

	fn is_discoverable(&self, container: &Container) -> bool {
		container.labels.get(&self.config.label_key) == Some(&self.config.label_value)
	}

	async fn container_to_workload(&self, container: &Container) -> Workload {
		let state = self.cni.networks_for(&container.id).await;
		let name = container
			.labels
			.get(NAME_LABEL)
			.map(strng::new)
			.unwrap_or_else(|| short_id(&container.id));

		// nerdctl records published ports as label keys like
		// "nerdctl/ports/tcp/80".
		let ports: Vec<u16> = container
			.labels
			.keys()
			.filter_map(|key| {
				key.strip_prefix(PORTS_LABEL_PREFIX)?
					.split('/')
					.nth(1)?
					.parse()
					.ok()
			})
			.sorted()
			.dedup()
			.collect();

		let mut addresses: Vec<Strng> = state
			.networks
			.iter()
			.map(|network| strng::format!("{name}.{network}"))
			.collect();
		if addresses.is_empty() {
			// No named network attachments; fall back to the bare IPs.
			addresses = state.ips.clone();
		}

		Workload {
			id: strng::new(&container.id),
			name,
			hostname: short_id(&container.id),
			runtime: Runtime::Containerd,
			workload_type: WorkloadType::Container,
			addresses,
			isolation_groups: state.networks,
			ports,
			labels: container.labels.clone(),
			..Default::default()
		}
	}

	async fn handle_envelope(
		&self,
		topic: &str,
		payload: &[u8],
		events: &mpsc::Sender<WorkloadEvent>,
	) -> Result<(), Error> {
		match topic {
			"/tasks/start" => {
				let Ok(start) = containerd_client::events::TaskStart::decode(payload) else {
					return Ok(());
				};
				if let Some(container) = self.resolve_container(&start.container_id).await? {
					if self.is_discoverable(&container) {
						let workload = self.container_to_workload(&container).await;
						let _ = events
							.send(WorkloadEvent::new(EventType::Added, workload))
							.await;
					}
				}
			},
			"/tasks/exit" | "/tasks/delete" | "/containers/delete" => {
				let id = match topic {
					"/tasks/exit" => containerd_client::events::TaskExit::decode(payload)
						.map(|e| e.container_id)
						.ok(),
					"/tasks/delete" => containerd_client::events::TaskDelete::decode(payload)
						.map(|e| e.container_id)
						.ok(),
					_ => containerd_client::events::ContainerDelete::decode(payload)
						.map(|e| e.id)
						.ok(),
				};
				let Some(id) = id.filter(|id| !id.is_empty()) else {
					return Ok(());
				};
				let tombstone =
					Workload::tombstone(Runtime::Containerd, strng::new(&id), short_id(&id));
				let _ = events
					.send(WorkloadEvent::new(EventType::Deleted, tombstone))
					.await;
			},
			_ => {},
		}
		Ok(())
	}

	/// Watch the CNI state directory by polling its file list; a created or
	/// removed result file means a network attach or detach.
	async fn poll_cni(&self, events: &mpsc::Sender<WorkloadEvent>) {
		let mut previous: Option<BTreeSet<String>> = None;
		loop {
			tokio::time::sleep(CNI_POLL_INTERVAL).await;
			let Ok(current) = self.cni.list_files().await else {
				continue;
			};
			if let Some(previous) = &previous {
				let changed = previous.symmetric_difference(&current);
				for filename in changed {
					let Some(id) = cni::extract_container_id(filename) else {
						continue;
					};
					match self.resolve_container(id).await {
						Ok(Some(container)) if self.is_discoverable(&container) => {
							let workload = self.container_to_workload(&container).await;
							let _ = events
								.send(WorkloadEvent::new(EventType::NetworkChanged, workload))
								.await;
						},
						// Gone or unlabeled: deletion is reported by the
						// task event stream, nothing to do here.
						Ok(_) => {},
						Err(e) => warn!("failed to resolve container for CNI change: {e}"),
					}
				}
			}
			previous = Some(current);
		}
	}

	async fn run_event_stream(
		&self,
		events: &mpsc::Sender<WorkloadEvent>,
	) -> Result<(), Error> {
		let mut client = EventsClient::new(self.channel()?);
		let req = SubscribeRequest::default();
		let resp = client
			.subscribe(with_namespace!(req, self.config.namespace))
			.await?;
		let mut stream = resp.into_inner();

		while let Some(envelope) = stream.message().await? {
			let Some(event) = envelope.event else {
				continue;
			};
			if let Err(e) = self
				.handle_envelope(&envelope.topic, &event.value, events)
				.await
			{
				warn!(topic = %envelope.topic, "failed to process containerd event: {e}");
			}
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl RuntimeAdapter for ContainerdAdapter {
	fn runtime(&self) -> Runtime {
		Runtime::Containerd
	}

	async fn connect(&mut self) -> Result<(), Error> {
		let channel = containerd_client::connect(&self.config.socket).await?;
		// Exercise a namespaced list so a bad socket or namespace fails here.
		let mut containers = ContainersClient::new(channel.clone());
		let req = ListContainersRequest::default();
		containers
			.list(with_namespace!(req, self.config.namespace))
			.await?;
		info!(
			socket = %self.config.socket,
			namespace = %self.config.namespace,
			"connected to containerd"
		);
		self.channel = Some(channel);
		Ok(())
	}

	async fn list_workloads(&self) -> Result<Vec<Workload>, Error> {
		let mut workloads = Vec::new();
		for container in self.list_containers().await? {
			if !self.is_discoverable(&container) {
				continue;
			}
			match self.is_running(&container.id).await {
				Ok(true) => workloads.push(self.container_to_workload(&container).await),
				Ok(false) => {},
				Err(e) => warn!(id = %container.id, "failed to query task status: {e}"),
			}
		}
		Ok(workloads)
	}

	async fn watch_events(&self, events: mpsc::Sender<WorkloadEvent>) -> Result<(), Error> {
		tokio::select! {
			_ = self.token.cancelled() => Ok(()),
			result = self.run_event_stream(&events) => result,
			_ = self.poll_cni(&events) => Ok(()),
		}
	}

	fn close(&self) {
		self.token.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn adapter(dir: std::path::PathBuf) -> ContainerdAdapter {
		ContainerdAdapter::new(ContainerdConfig {
			socket: "/run/containerd/containerd.sock".to_string(),
			namespace: "default".to_string(),
			cni_state_dir: dir,
			label_key: "discover".to_string(),
			label_value: "true".to_string(),
		})
	}

	fn container(id: &str, labels: &[(&str, &str)]) -> Container {
		Container {
			id: id.to_string(),
			labels: labels
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect(),
			..Default::default()
		}
	}

	const CONTAINER_ID: &str = "abc123def4567890abc123def4567890abc123def4567890abc123def4567890";

	#[tokio::test]
	async fn converts_container_with_cni_networks() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(
			dir.path().join(format!("net-a-default-{CONTAINER_ID}-eth0")),
			r#"{"ips":[{"address":"10.4.0.5/24"}]}"#,
		)
		.await
		.unwrap();

		let adapter = adapter(dir.path().to_path_buf());
		let c = container(
			CONTAINER_ID,
			&[
				("discover", "true"),
				("nerdctl/name", "web"),
				("nerdctl/ports/tcp/80", "0.0.0.0:8080"),
				("nerdctl/ports/tcp/443", "0.0.0.0:8443"),
			],
		);
		assert!(adapter.is_discoverable(&c));

		let w = adapter.container_to_workload(&c).await;
		assert_eq!(w.id, CONTAINER_ID);
		assert_eq!(w.name, "web");
		assert_eq!(w.hostname, &CONTAINER_ID[..12]);
		assert_eq!(w.runtime, Runtime::Containerd);
		assert_eq!(w.isolation_groups, vec![strng::new("net-a")]);
		assert_eq!(w.addresses, vec![strng::new("web.net-a")]);
		assert_eq!(w.ports, vec![80, 443]);
	}

	#[tokio::test]
	async fn falls_back_to_bare_ips_without_named_networks() {
		let dir = tempfile::tempdir().unwrap();
		let adapter = adapter(dir.path().to_path_buf());
		let c = container(CONTAINER_ID, &[("discover", "true")]);

		let w = adapter.container_to_workload(&c).await;
		assert_eq!(w.name, &CONTAINER_ID[..12]);
		assert!(w.addresses.is_empty());
		assert!(w.isolation_groups.is_empty());
	}

	#[tokio::test]
	async fn unlabeled_container_is_not_discoverable() {
		let dir = tempfile::tempdir().unwrap();
		let adapter = adapter(dir.path().to_path_buf());
		assert!(!adapter.is_discoverable(&container(CONTAINER_ID, &[])));
		assert!(!adapter.is_discoverable(&container(CONTAINER_ID, &[("discover", "no")])));
	}
}
