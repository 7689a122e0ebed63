use discovery_core::prelude::*;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::types::{EventType, Runtime, Workload};

pub mod cni;
pub mod containerd;
pub mod docker;
pub mod kubernetes;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("docker: {0}")]
	Docker(#[from] bollard::errors::Error),
	#[error("containerd transport: {0}")]
	ContainerdTransport(#[from] tonic::transport::Error),
	#[error("containerd: {0}")]
	Containerd(#[from] tonic::Status),
	#[error("kubernetes: {0}")]
	Kubernetes(#[from] kube::Error),
	#[error("kubeconfig: {0}")]
	Kubeconfig(#[from] kube::config::KubeconfigError),
	#[error("in-cluster config: {0}")]
	InCluster(#[from] kube::config::InClusterError),
	#[error("i/o: {0}")]
	Io(#[from] std::io::Error),
	#[error("{0} adapter is not connected")]
	NotConnected(Runtime),
}

/// One normalized event out of a runtime adapter.
#[derive(Debug, Clone)]
pub struct WorkloadEvent {
	pub kind: EventType,
	pub workload: Workload,
}

impl WorkloadEvent {
	pub fn new(kind: EventType, workload: Workload) -> Self {
		WorkloadEvent { kind, workload }
	}
}

/// Common capability set of every runtime adapter.
///
/// Adapters normalize runtime-specific state into [Workload] records and a
/// stream of [WorkloadEvent]s; runtime SDK types never cross this boundary.
#[async_trait::async_trait]
pub trait RuntimeAdapter: Send + Sync {
	fn runtime(&self) -> Runtime;

	/// Establish and verify the runtime connection. Failure here is fatal
	/// for the watcher.
	async fn connect(&mut self) -> Result<(), Error>;

	/// Current set of discoverable workloads.
	async fn list_workloads(&self) -> Result<Vec<Workload>, Error>;

	/// Stream events into `events` until [close](RuntimeAdapter::close) is
	/// called. Events for a single workload are delivered in runtime order.
	async fn watch_events(&self, events: mpsc::Sender<WorkloadEvent>) -> Result<(), Error>;

	/// Signal termination. Idempotent; the event loop observes it at the
	/// next stream boundary.
	fn close(&self);
}

/// Build the adapter selected by `RUNTIME`.
pub fn from_config(config: &Config) -> Box<dyn RuntimeAdapter> {
	match config.runtime {
		Runtime::Docker => Box::new(docker::DockerAdapter::new(config.docker.clone())),
		Runtime::Containerd => {
			Box::new(containerd::ContainerdAdapter::new(config.containerd.clone()))
		},
		Runtime::Kubernetes => {
			Box::new(kubernetes::KubernetesAdapter::new(config.kubernetes.clone()))
		},
	}
}
