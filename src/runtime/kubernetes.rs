use std::collections::BTreeMap;
use std::collections::HashMap;

use discovery_core::prelude::*;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::Client;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::config::{Config as KubeConfig, KubeConfigOptions, Kubeconfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Error, RuntimeAdapter, WorkloadEvent};
use crate::config::KubernetesConfig;
use crate::types::{EventType, Runtime, Workload, WorkloadType};

const POLICY_ANNOTATION: &str = "network_policies";
/// Bounded watch lifetime; expired watches are reopened with the same
/// resume token.
const WATCH_TIMEOUT_SECS: u32 = 290;
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// HTTP 410 Gone: the resume token fell out of the server's history.
const GONE: u16 = 410;

/// Kubernetes adapter: Pods (and optionally Services) by label selector,
/// one watch per resource kind.
pub struct KubernetesAdapter {
	config: KubernetesConfig,
	client: Option<Client>,
	token: CancellationToken,
}

impl KubernetesAdapter {
	pub fn new(config: KubernetesConfig) -> Self {
		KubernetesAdapter {
			config,
			client: None,
			token: CancellationToken::new(),
		}
	}

	fn client(&self) -> Result<Client, Error> {
		self.client
			.clone()
			.ok_or(Error::NotConnected(Runtime::Kubernetes))
	}

	fn pods(&self) -> Result<Api<Pod>, Error> {
		let client = self.client()?;
		Ok(match &self.config.namespace {
			Some(ns) => Api::namespaced(client, ns),
			None => Api::all(client),
		})
	}

	fn services(&self) -> Result<Api<Service>, Error> {
		let client = self.client()?;
		Ok(match &self.config.namespace {
			Some(ns) => Api::namespaced(client, ns),
			None => Api::all(client),
		})
	}

	async fn pod_to_workload(&self, pod: &Pod) -> Option<Workload> {
		let id = pod.metadata.uid.as_deref()?;
		let name = pod.metadata.name.as_deref()?;
		let namespace = pod.metadata.namespace.as_deref()?;
		let spec = pod.spec.as_ref();
		let status = pod.status.as_ref();
		let labels = pod.metadata.labels.clone().unwrap_or_default();

		let mut addresses: Vec<Strng> = Vec::new();
		let mut ports: Vec<u16> = Vec::new();
		if let Some(pod_ip) = status.and_then(|s| s.pod_ip.as_deref()) {
			for container in spec.map(|s| s.containers.as_slice()).unwrap_or_default() {
				for port in container.ports.iter().flatten() {
					addresses.push(strng::format!("{pod_ip}:{}", port.container_port));
					if let Ok(p) = u16::try_from(port.container_port) {
						ports.push(p);
					}
				}
			}
			if addresses.is_empty() {
				// No declared ports; the pod IP alone is still an endpoint.
				addresses.push(strng::new(pod_ip));
			}
		}

		let mut annotations: HashMap<String, String> = pod
			.metadata
			.annotations
			.clone()
			.unwrap_or_default()
			.into_iter()
			.collect();
		annotations.insert(
			POLICY_ANNOTATION.to_string(),
			self.policy_summary(namespace, &labels).await,
		);

		Some(Workload {
			id: strng::new(id),
			name: strng::new(name),
			hostname: spec
				.and_then(|s| s.hostname.as_deref())
				.map(strng::new)
				.unwrap_or_else(|| strng::new(name)),
			runtime: Runtime::Kubernetes,
			workload_type: WorkloadType::Pod,
			node: spec.and_then(|s| s.node_name.as_deref()).map(strng::new),
			namespace: Some(strng::new(namespace)),
			addresses,
			isolation_groups: vec![strng::new(namespace)],
			ports,
			labels: labels.into_iter().collect(),
			annotations,
			..Default::default()
		})
	}

	fn service_to_workload(&self, service: &Service) -> Option<Workload> {
		let id = service.metadata.uid.as_deref()?;
		let name = service.metadata.name.as_deref()?;
		let namespace = service.metadata.namespace.as_deref()?;
		let spec = service.spec.as_ref();

		// Headless services report cluster_ip "None".
		let cluster_ip = spec
			.and_then(|s| s.cluster_ip.as_deref())
			.filter(|ip| !ip.is_empty() && *ip != "None");

		let mut addresses: Vec<Strng> = Vec::new();
		let mut ports: Vec<u16> = Vec::new();
		for port in spec.and_then(|s| s.ports.as_deref()).unwrap_or_default() {
			if let Some(ip) = cluster_ip {
				addresses.push(strng::format!("{ip}:{}", port.port));
			}
			addresses.push(strng::format!(
				"{name}.{namespace}.svc.cluster.local:{}",
				port.port
			));
			if let Ok(p) = u16::try_from(port.port) {
				ports.push(p);
			}
		}

		Some(Workload {
			id: strng::new(id),
			name: strng::new(name),
			hostname: strng::new(name),
			runtime: Runtime::Kubernetes,
			workload_type: WorkloadType::Service,
			namespace: Some(strng::new(namespace)),
			addresses,
			isolation_groups: vec![strng::new(namespace)],
			ports,
			labels: service
				.metadata
				.labels
				.clone()
				.unwrap_or_default()
				.into_iter()
				.collect(),
			annotations: service
				.metadata
				.annotations
				.clone()
				.unwrap_or_default()
				.into_iter()
				.collect(),
			..Default::default()
		})
	}

	/// One-line description of the NetworkPolicies selecting a pod, stored
	/// as an informational annotation.
	async fn policy_summary(&self, namespace: &str, labels: &BTreeMap<String, String>) -> String {
		let Ok(client) = self.client() else {
			return "unknown".to_string();
		};
		let api: Api<NetworkPolicy> = Api::namespaced(client, namespace);
		match api.list(&ListParams::default()).await {
			Ok(policies) if policies.items.is_empty() => "none (default allow)".to_string(),
			Ok(policies) => {
				let affecting: Vec<&str> = policies
					.items
					.iter()
					.filter(|p| {
						selector_matches(p.spec.as_ref().map(|s| &s.pod_selector), labels)
					})
					.filter_map(|p| p.metadata.name.as_deref())
					.collect();
				if affecting.is_empty() {
					"not targeted by any policy".to_string()
				} else {
					format!("restricted by: {}", affecting.join(", "))
				}
			},
			Err(e) => format!("error: {e}"),
		}
	}

	async fn watch_pods(&self, events: &mpsc::Sender<WorkloadEvent>) -> Result<(), Error> {
		let api = self.pods()?;
		let selector = self.config.label_selector();
		let mut resume: Option<String> = None;

		while !self.token.is_cancelled() {
			let wp = WatchParams::default()
				.labels(&selector)
				.timeout(WATCH_TIMEOUT_SECS);
			let version = resume.clone().unwrap_or_else(|| "0".to_string());
			let mut stream = match api.watch(&wp, &version).await {
				Ok(stream) => stream.boxed(),
				Err(e) => {
					warn!("pod watch failed to open: {e}");
					tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
					continue;
				},
			};

			loop {
				let event = match stream.try_next().await {
					Ok(Some(event)) => event,
					// Server-side timeout; reopen with the same token.
					Ok(None) => break,
					Err(e) => {
						warn!("pod watch stream error: {e}");
						tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
						break;
					},
				};
				match event {
					WatchEvent::Added(pod) => {
						resume.clone_from(&pod.metadata.resource_version);
						if phase(&pod) == Some("Running") {
							if let Some(w) = self.pod_to_workload(&pod).await {
								let _ = events
									.send(WorkloadEvent::new(EventType::Added, w))
									.await;
							}
						}
					},
					WatchEvent::Modified(pod) => {
						resume.clone_from(&pod.metadata.resource_version);
						let kind = match phase(&pod) {
							Some("Running") => Some(EventType::Modified),
							// A finished pod no longer answers on its IP.
							Some("Succeeded") | Some("Failed") => Some(EventType::Deleted),
							_ => None,
						};
						if let Some(kind) = kind {
							if let Some(w) = self.pod_to_workload(&pod).await {
								let _ = events.send(WorkloadEvent::new(kind, w)).await;
							}
						}
					},
					WatchEvent::Deleted(pod) => {
						resume.clone_from(&pod.metadata.resource_version);
						if let Some(w) = self.pod_to_workload(&pod).await {
							let _ = events
								.send(WorkloadEvent::new(EventType::Deleted, w))
								.await;
						}
					},
					WatchEvent::Bookmark(bookmark) => {
						resume = Some(bookmark.metadata.resource_version);
					},
					WatchEvent::Error(err) if err.code == GONE => {
						info!("pod watch expired, restarting without resume token");
						resume = None;
						break;
					},
					WatchEvent::Error(err) => {
						warn!("pod watch error: {err}");
						tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
						break;
					},
				}
			}
		}
		Ok(())
	}

	async fn watch_services(&self, events: &mpsc::Sender<WorkloadEvent>) -> Result<(), Error> {
		let api = self.services()?;
		let selector = self.config.label_selector();
		let mut resume: Option<String> = None;

		while !self.token.is_cancelled() {
			let wp = WatchParams::default()
				.labels(&selector)
				.timeout(WATCH_TIMEOUT_SECS);
			let version = resume.clone().unwrap_or_else(|| "0".to_string());
			let mut stream = match api.watch(&wp, &version).await {
				Ok(stream) => stream.boxed(),
				Err(e) => {
					warn!("service watch failed to open: {e}");
					tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
					continue;
				},
			};

			loop {
				let event = match stream.try_next().await {
					Ok(Some(event)) => event,
					Ok(None) => break,
					Err(e) => {
						warn!("service watch stream error: {e}");
						tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
						break;
					},
				};
				let (kind, svc) = match event {
					WatchEvent::Added(svc) => (EventType::Added, svc),
					WatchEvent::Modified(svc) => (EventType::Modified, svc),
					WatchEvent::Deleted(svc) => (EventType::Deleted, svc),
					WatchEvent::Bookmark(bookmark) => {
						resume = Some(bookmark.metadata.resource_version);
						continue;
					},
					WatchEvent::Error(err) if err.code == GONE => {
						info!("service watch expired, restarting without resume token");
						resume = None;
						break;
					},
					WatchEvent::Error(err) => {
						warn!("service watch error: {err}");
						tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
						break;
					},
				};
				resume.clone_from(&svc.metadata.resource_version);
				if let Some(w) = self.service_to_workload(&svc) {
					let _ = events.send(WorkloadEvent::new(kind, w)).await;
				}
			}
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl RuntimeAdapter for KubernetesAdapter {
	fn runtime(&self) -> Runtime {
		Runtime::Kubernetes
	}

	async fn connect(&mut self) -> Result<(), Error> {
		let client = if self.config.in_cluster {
			Client::try_from(KubeConfig::incluster()?)?
		} else if let Some(path) = &self.config.kubeconfig {
			let kubeconfig = Kubeconfig::read_from(path)?;
			let config =
				KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
					.await?;
			Client::try_from(config)?
		} else {
			// Neither forced: in-cluster first, then the default kubeconfig.
			Client::try_default().await?
		};

		// Verify credentials before declaring the adapter healthy.
		let namespaces: Api<Namespace> = Api::all(client.clone());
		namespaces.list(&ListParams::default().limit(1)).await?;
		info!(
			namespace = self.config.namespace.as_deref().unwrap_or("<all>"),
			watch_services = self.config.watch_services,
			"connected to kubernetes"
		);
		self.client = Some(client);
		Ok(())
	}

	async fn list_workloads(&self) -> Result<Vec<Workload>, Error> {
		let lp = ListParams::default().labels(&self.config.label_selector());
		let mut workloads = Vec::new();

		for pod in self.pods()?.list(&lp).await? {
			// Only pods that are actually serving make the initial list.
			if phase(&pod) != Some("Running") {
				continue;
			}
			if let Some(w) = self.pod_to_workload(&pod).await {
				workloads.push(w);
			}
		}

		if self.config.watch_services {
			for service in self.services()?.list(&lp).await? {
				if let Some(w) = self.service_to_workload(&service) {
					workloads.push(w);
				}
			}
		}
		Ok(workloads)
	}

	async fn watch_events(&self, events: mpsc::Sender<WorkloadEvent>) -> Result<(), Error> {
		if self.config.watch_services {
			tokio::select! {
				_ = self.token.cancelled() => Ok(()),
				result = self.watch_pods(&events) => result,
				result = self.watch_services(&events) => result,
			}
		} else {
			tokio::select! {
				_ = self.token.cancelled() => Ok(()),
				result = self.watch_pods(&events) => result,
			}
		}
	}

	fn close(&self) {
		self.token.cancel();
	}
}

fn phase(pod: &Pod) -> Option<&str> {
	pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn selector_matches(
	selector: Option<&LabelSelector>,
	labels: &BTreeMap<String, String>,
) -> bool {
	// An absent or empty selector matches every pod in the namespace.
	match selector.and_then(|s| s.match_labels.as_ref()) {
		None => true,
		Some(want) => want.iter().all(|(k, v)| labels.get(k) == Some(v)),
	}
}

#[cfg(test)]
mod tests {
	use k8s_openapi::api::core::v1::{
		Container, ContainerPort, PodSpec, PodStatus, ServicePort, ServiceSpec,
	};
	use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

	use super::*;

	fn adapter() -> KubernetesAdapter {
		KubernetesAdapter::new(KubernetesConfig {
			kubeconfig: None,
			namespace: None,
			in_cluster: false,
			label_key: "discover".to_string(),
			label_value: "true".to_string(),
			watch_services: true,
		})
	}

	fn pod(uid: &str, name: &str, ns: &str, ports: &[i32]) -> Pod {
		Pod {
			metadata: ObjectMeta {
				uid: Some(uid.to_string()),
				name: Some(name.to_string()),
				namespace: Some(ns.to_string()),
				labels: Some(BTreeMap::from([(
					"discover".to_string(),
					"true".to_string(),
				)])),
				..Default::default()
			},
			spec: Some(PodSpec {
				node_name: Some("node-1".to_string()),
				containers: vec![Container {
					ports: Some(
						ports
							.iter()
							.map(|p| ContainerPort {
								container_port: *p,
								..Default::default()
							})
							.collect(),
					),
					..Default::default()
				}],
				..Default::default()
			}),
			status: Some(PodStatus {
				phase: Some("Running".to_string()),
				pod_ip: Some("10.244.1.5".to_string()),
				..Default::default()
			}),
			..Default::default()
		}
	}

	fn service(uid: &str, name: &str, ns: &str, cluster_ip: &str) -> Service {
		Service {
			metadata: ObjectMeta {
				uid: Some(uid.to_string()),
				name: Some(name.to_string()),
				namespace: Some(ns.to_string()),
				..Default::default()
			},
			spec: Some(ServiceSpec {
				cluster_ip: Some(cluster_ip.to_string()),
				ports: Some(vec![ServicePort {
					port: 80,
					..Default::default()
				}]),
				..Default::default()
			}),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn pod_conversion() {
		let w = adapter()
			.pod_to_workload(&pod("uid-1", "api", "team-a", &[8080, 9090]))
			.await
			.unwrap();
		assert_eq!(w.id, "uid-1");
		assert_eq!(w.runtime, Runtime::Kubernetes);
		assert_eq!(w.workload_type, WorkloadType::Pod);
		assert_eq!(w.node.as_deref(), Some("node-1"));
		assert_eq!(w.namespace.as_deref(), Some("team-a"));
		assert_eq!(w.isolation_groups, vec![strng::new("team-a")]);
		assert_eq!(
			w.addresses,
			vec![
				strng::new("10.244.1.5:8080"),
				strng::new("10.244.1.5:9090")
			]
		);
		assert_eq!(w.ports, vec![8080, 9090]);
		// Hostname falls back to the pod name when spec.hostname is unset.
		assert_eq!(w.hostname, "api");
		assert!(w.annotations.contains_key(POLICY_ANNOTATION));
	}

	#[tokio::test]
	async fn pod_without_ports_uses_bare_ip() {
		let w = adapter()
			.pod_to_workload(&pod("uid-1", "api", "team-a", &[]))
			.await
			.unwrap();
		assert_eq!(w.addresses, vec![strng::new("10.244.1.5")]);
		assert!(w.ports.is_empty());
	}

	#[tokio::test]
	async fn pod_without_uid_is_skipped() {
		let mut p = pod("uid-1", "api", "team-a", &[]);
		p.metadata.uid = None;
		assert!(adapter().pod_to_workload(&p).await.is_none());
	}

	#[test]
	fn service_conversion() {
		let w = adapter()
			.service_to_workload(&service("svc-1", "web", "team-a", "10.96.0.10"))
			.unwrap();
		assert_eq!(w.workload_type, WorkloadType::Service);
		assert_eq!(w.isolation_groups, vec![strng::new("team-a")]);
		assert_eq!(
			w.addresses,
			vec![
				strng::new("10.96.0.10:80"),
				strng::new("web.team-a.svc.cluster.local:80")
			]
		);
		assert_eq!(w.ports, vec![80]);
	}

	#[test]
	fn headless_service_has_dns_address_only() {
		let w = adapter()
			.service_to_workload(&service("svc-1", "web", "team-a", "None"))
			.unwrap();
		assert_eq!(
			w.addresses,
			vec![strng::new("web.team-a.svc.cluster.local:80")]
		);
	}

	#[test]
	fn selector_matching() {
		let labels = BTreeMap::from([("app".to_string(), "api".to_string())]);
		assert!(selector_matches(None, &labels));
		assert!(selector_matches(Some(&LabelSelector::default()), &labels));

		let matching = LabelSelector {
			match_labels: Some(BTreeMap::from([("app".to_string(), "api".to_string())])),
			..Default::default()
		};
		assert!(selector_matches(Some(&matching), &labels));

		let other = LabelSelector {
			match_labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
			..Default::default()
		};
		assert!(!selector_matches(Some(&other), &labels));
	}
}
