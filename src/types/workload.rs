use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use discovery_core::prelude::*;
use serde::{Deserialize, Serialize};

/// Source runtime a workload was discovered from.
#[derive(Default, Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
	#[default]
	Docker,
	Containerd,
	Kubernetes,
}

impl fmt::Display for Runtime {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Runtime::Docker => "docker",
			Runtime::Containerd => "containerd",
			Runtime::Kubernetes => "kubernetes",
		})
	}
}

impl FromStr for Runtime {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"docker" => Ok(Runtime::Docker),
			"containerd" => Ok(Runtime::Containerd),
			"kubernetes" => Ok(Runtime::Kubernetes),
			other => Err(format!("unknown runtime {other:?}")),
		}
	}
}

#[derive(Default, Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
	/// Docker or containerd container.
	#[default]
	Container,
	/// Kubernetes Pod.
	Pod,
	/// Kubernetes Service, a virtual endpoint in front of pods.
	Service,
}

impl fmt::Display for WorkloadType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			WorkloadType::Container => "container",
			WorkloadType::Pod => "pod",
			WorkloadType::Service => "service",
		})
	}
}

impl FromStr for WorkloadType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"container" => Ok(WorkloadType::Container),
			"pod" => Ok(WorkloadType::Pod),
			"service" => Ok(WorkloadType::Service),
			other => Err(format!("unknown workload type {other:?}")),
		}
	}
}

/// Lifecycle events emitted by runtime adapters.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	Added,
	Modified,
	Deleted,
	NetworkChanged,
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			EventType::Added => "added",
			EventType::Modified => "modified",
			EventType::Deleted => "deleted",
			EventType::NetworkChanged => "network_changed",
		})
	}
}

/// Unified workload record across all runtimes.
///
/// This is the value stored in the KV store and returned by queries. Unset
/// and empty fields are omitted on the wire; collections are never null.
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Workload {
	/// Container id, pod UID, or service UID. Sole primary key.
	#[serde(default)]
	pub id: Strng,
	#[serde(default)]
	pub name: Strng,
	/// What `$HOSTNAME` resolves to inside the workload. Not unique.
	#[serde(default)]
	pub hostname: Strng,

	#[serde(default)]
	pub runtime: Runtime,
	#[serde(default)]
	pub workload_type: WorkloadType,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub node: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub namespace: Option<Strng>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub addresses: Vec<Strng>,
	/// Networks (container runtimes) or namespaces (cluster runtime) gating
	/// reachability.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub isolation_groups: Vec<Strng>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub ports: Vec<u16>,

	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub labels: HashMap<String, String>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub annotations: HashMap<String, String>,

	/// Out-of-band scraped data; opaque here.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Value>,

	/// Watcher instance that owns the KV record.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub registrar: Option<Strng>,
}

impl Workload {
	pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(self)
	}

	pub fn from_json(data: &[u8]) -> Result<Workload, serde_json::Error> {
		serde_json::from_slice(data)
	}

	/// A bare record carrying just enough identity to delete the real one.
	/// Runtimes report little more than the id when a workload dies.
	pub fn tombstone(runtime: Runtime, id: Strng, name: Strng) -> Workload {
		Workload {
			hostname: short_id(&id),
			id,
			name,
			runtime,
			workload_type: WorkloadType::Container,
			..Default::default()
		}
	}
}

/// 12-char id prefix, the conventional short form for container ids.
pub fn short_id(id: &str) -> Strng {
	if id.len() > 12 {
		strng::new(&id[..12])
	} else {
		strng::new(id)
	}
}

/// Result of a reachability query: the resolved caller plus a projected view
/// of every workload sharing at least one isolation group with it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ReachabilityResult {
	pub caller: Workload,
	pub reachable: Vec<Workload>,
	pub count: usize,
}

impl ReachabilityResult {
	pub fn new(caller: Workload, reachable: Vec<Workload>) -> Self {
		let count = reachable.len();
		ReachabilityResult {
			caller,
			reachable,
			count,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn full_workload() -> Workload {
		Workload {
			id: strng::new("0123456789abcdef"),
			name: strng::new("api"),
			hostname: strng::new("0123456789ab"),
			runtime: Runtime::Kubernetes,
			workload_type: WorkloadType::Pod,
			node: Some(strng::new("node-1")),
			namespace: Some(strng::new("team-a")),
			addresses: vec![strng::new("10.0.0.5:8080")],
			isolation_groups: vec![strng::new("team-a")],
			ports: vec![8080],
			labels: HashMap::from([("discover".to_string(), "true".to_string())]),
			annotations: HashMap::from([("network_policies".to_string(), "none".to_string())]),
			metadata: Some(serde_json::json!({"scraped": true})),
			registrar: Some(strng::new("watcher-1")),
		}
	}

	#[test]
	fn round_trip_full() {
		let w = full_workload();
		let encoded = w.to_json().unwrap();
		let decoded = Workload::from_json(&encoded).unwrap();
		assert_eq!(w, decoded);
	}

	#[test]
	fn round_trip_minimal() {
		let w = Workload {
			id: strng::new("c1"),
			name: strng::new("web"),
			hostname: strng::new("c1"),
			..Default::default()
		};
		let decoded = Workload::from_json(&w.to_json().unwrap()).unwrap();
		assert_eq!(w, decoded);
	}

	#[test]
	fn empty_fields_are_omitted_not_null() {
		let w = Workload {
			id: strng::new("c1"),
			..Default::default()
		};
		let value: serde_json::Value = serde_json::from_slice(&w.to_json().unwrap()).unwrap();
		let obj = value.as_object().unwrap();
		for absent in [
			"node",
			"namespace",
			"addresses",
			"isolation_groups",
			"ports",
			"labels",
			"annotations",
			"metadata",
			"registrar",
		] {
			assert!(!obj.contains_key(absent), "{absent} should be omitted");
		}
	}

	#[test]
	fn enums_use_wire_spelling() {
		let w = full_workload();
		let value: serde_json::Value = serde_json::from_slice(&w.to_json().unwrap()).unwrap();
		assert_eq!(value["runtime"], "kubernetes");
		assert_eq!(value["workload_type"], "pod");
		assert_eq!(
			serde_json::to_value(EventType::NetworkChanged).unwrap(),
			"network_changed"
		);
	}

	#[test]
	fn tombstone_uses_short_id_hostname() {
		let t = Workload::tombstone(
			Runtime::Docker,
			strng::new("0123456789abcdef0123"),
			strng::new("web"),
		);
		assert_eq!(t.hostname, "0123456789ab");
		assert!(t.addresses.is_empty());
	}
}
