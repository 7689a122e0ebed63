use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use discovery_core::prelude::*;

use crate::types::Runtime;

/// Full process configuration, read from the environment. Empty strings are
/// treated the same as unset variables.
#[derive(Debug, Clone)]
pub struct Config {
	/// Which runtime adapter the watcher drives.
	pub runtime: Runtime,
	/// Identity stamped into the `registrar` field of every record this
	/// watcher writes.
	pub registrar: Strng,
	pub etcd: EtcdConfig,
	pub docker: DockerConfig,
	pub containerd: ContainerdConfig,
	pub kubernetes: KubernetesConfig,
	pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct EtcdConfig {
	pub host: String,
	pub port: u16,
	pub prefix: String,
}

impl EtcdConfig {
	pub fn endpoint(&self) -> String {
		format!("http://{}:{}", self.host, self.port)
	}
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
	pub socket: String,
	pub label_key: String,
	pub label_value: String,
}

impl DockerConfig {
	/// Socket path with any `unix://` scheme stripped.
	pub fn socket_path(&self) -> &str {
		self.socket.strip_prefix("unix://").unwrap_or(&self.socket)
	}

	pub fn label_selector(&self) -> String {
		format!("{}={}", self.label_key, self.label_value)
	}
}

#[derive(Debug, Clone)]
pub struct ContainerdConfig {
	pub socket: String,
	pub namespace: String,
	pub cni_state_dir: PathBuf,
	pub label_key: String,
	pub label_value: String,
}

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
	pub kubeconfig: Option<String>,
	/// None watches all namespaces.
	pub namespace: Option<String>,
	pub in_cluster: bool,
	pub label_key: String,
	pub label_value: String,
	pub watch_services: bool,
}

impl KubernetesConfig {
	pub fn label_selector(&self) -> String {
		format!("{}={}", self.label_key, self.label_value)
	}
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub host: String,
	pub port: u16,
}

impl ServerConfig {
	pub fn bind_addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

impl Config {
	pub fn from_env() -> anyhow::Result<Config> {
		let runtime = parse_default("RUNTIME", Runtime::Docker)?;
		let registrar = parse::<String>("REGISTRAR")?
			.or(parse("HOSTNAME")?)
			.map(strng::new)
			.unwrap_or_else(|| strng::literal!("unknown"));

		Ok(Config {
			runtime,
			registrar,
			etcd: EtcdConfig {
				host: parse_default("ETCD_HOST", "localhost".to_string())?,
				port: parse_default("ETCD_PORT", 2379)?,
				prefix: parse_default("ETCD_PREFIX", "/discovery".to_string())?,
			},
			docker: DockerConfig {
				socket: parse_default("DOCKER_SOCKET", "unix:///var/run/docker.sock".to_string())?,
				label_key: parse_default("DOCKER_LABEL_KEY", "discover".to_string())?,
				label_value: parse_default("DOCKER_LABEL_VALUE", "true".to_string())?,
			},
			containerd: ContainerdConfig {
				socket: parse_default(
					"CONTAINERD_SOCKET",
					"/run/containerd/containerd.sock".to_string(),
				)?,
				namespace: parse_default("CONTAINERD_NAMESPACE", "default".to_string())?,
				cni_state_dir: parse_default(
					"CONTAINERD_CNI_STATE_DIR",
					PathBuf::from("/var/lib/cni/results"),
				)?,
				label_key: parse_default("CONTAINERD_LABEL_KEY", "discover".to_string())?,
				label_value: parse_default("CONTAINERD_LABEL_VALUE", "true".to_string())?,
			},
			kubernetes: KubernetesConfig {
				kubeconfig: parse("KUBECONFIG")?,
				namespace: parse("KUBERNETES_NAMESPACE")?,
				in_cluster: parse_default("KUBERNETES_IN_CLUSTER", false)?,
				label_key: parse_default("KUBERNETES_LABEL_KEY", "discover".to_string())?,
				label_value: parse_default("KUBERNETES_LABEL_VALUE", "true".to_string())?,
				watch_services: parse_default("KUBERNETES_WATCH_SERVICES", true)?,
			},
			server: ServerConfig {
				host: parse_default("SERVER_HOST", "0.0.0.0".to_string())?,
				port: parse_default("SERVER_PORT", 8080)?,
			},
		})
	}
}

fn parse<T: FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
	T::Err: std::fmt::Display,
{
	match env::var(key) {
		Ok(value) if !value.is_empty() => value
			.parse::<T>()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
		_ => Ok(None),
	}
}

fn parse_default<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
	T::Err: std::fmt::Display,
{
	Ok(parse(key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn docker_socket_scheme_is_stripped() {
		let cfg = DockerConfig {
			socket: "unix:///var/run/docker.sock".to_string(),
			label_key: "discover".to_string(),
			label_value: "true".to_string(),
		};
		assert_eq!(cfg.socket_path(), "/var/run/docker.sock");
		assert_eq!(cfg.label_selector(), "discover=true");

		let bare = DockerConfig {
			socket: "/var/run/docker.sock".to_string(),
			..cfg
		};
		assert_eq!(bare.socket_path(), "/var/run/docker.sock");
	}

	#[test]
	fn etcd_endpoint_format() {
		let cfg = EtcdConfig {
			host: "etcd.internal".to_string(),
			port: 2379,
			prefix: "/discovery".to_string(),
		};
		assert_eq!(cfg.endpoint(), "http://etcd.internal:2379");
	}
}
