use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use discovery_core::prelude::*;
use itertools::Itertools;
use serde::Serialize;

use crate::types::{Runtime, Workload};

mod reach;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("workload not found: {0}")]
	NotFound(Strng),
}

/// Store is the shared, replicated view of the KV store's workload records.
///
/// It is rebuilt on startup by a prefix scan and kept current by the KV
/// watch loop; queries never touch the KV store. All four lookup tables
/// live under one reader-writer lock so readers always observe a snapshot
/// consistent with a single point in the watch stream.
#[derive(Clone, Debug, Default)]
pub struct Store {
	inner: Arc<RwLock<WorkloadIndex>>,
}

#[derive(Debug, Default)]
struct WorkloadIndex {
	/// Primary table: id -> workload.
	by_id: HashMap<Strng, Arc<Workload>>,
	/// hostname -> id, last writer wins.
	by_hostname: HashMap<Strng, Strng>,
	/// Both "name" -> id and "namespace/name" -> id.
	by_name: HashMap<Strng, Strng>,
	/// isolation group -> member ids.
	by_group: HashMap<Strng, HashSet<Strng>>,
	/// Opaque scraped metadata, keyed by workload id. Kept out of `by_id` so
	/// a metadata record arriving before its workload is not lost.
	metadata: HashMap<Strng, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct Stats {
	pub workloads: usize,
	pub isolation_groups: usize,
	pub by_runtime: HashMap<String, usize>,
	pub by_type: HashMap<String, usize>,
}

impl Store {
	pub fn new() -> Store {
		Store::default()
	}

	// ---- writer side (KV watch loop only) ----

	pub fn update(&self, id: Strng, workload: Workload) {
		let mut index = self.inner.write().unwrap();
		index.update(id, workload);
	}

	pub fn remove(&self, id: &Strng) {
		let mut index = self.inner.write().unwrap();
		index.remove(id);
	}

	pub fn set_metadata(&self, id: Strng, metadata: serde_json::Value) {
		let mut index = self.inner.write().unwrap();
		index.metadata.insert(id, metadata);
	}

	pub fn remove_metadata(&self, id: &Strng) {
		let mut index = self.inner.write().unwrap();
		index.metadata.remove(id);
	}

	// ---- reader side ----

	pub fn get(&self, id: &str) -> Option<Workload> {
		let index = self.inner.read().unwrap();
		index.materialize(&strng::new(id))
	}

	pub fn get_by_hostname(&self, hostname: &str) -> Option<Workload> {
		let index = self.inner.read().unwrap();
		let id = index.by_hostname.get(hostname)?.clone();
		index.materialize(&id)
	}

	pub fn get_by_name(&self, name: &str, namespace: Option<&str>) -> Option<Workload> {
		let index = self.inner.read().unwrap();
		if let Some(ns) = namespace {
			if let Some(id) = index.by_name.get(&strng::format!("{ns}/{name}")) {
				return index.materialize(&id.clone());
			}
		}
		let id = index.by_name.get(name)?.clone();
		index.materialize(&id)
	}

	/// Resolve a caller-supplied identity: hostname, then name, then id,
	/// then id prefix. First hit wins.
	pub fn identify(&self, identity: &str) -> Option<Workload> {
		let index = self.inner.read().unwrap();
		index.identify(identity).and_then(|id| index.materialize(&id))
	}

	pub fn list_all(
		&self,
		runtime: Option<Runtime>,
		labels: Option<&HashMap<String, String>>,
	) -> Vec<Workload> {
		let index = self.inner.read().unwrap();
		index
			.by_id
			.values()
			.filter(|w| runtime.is_none_or(|r| w.runtime == r))
			.filter(|w| {
				labels.is_none_or(|want| {
					want.iter()
						.all(|(k, v)| w.labels.get(k).is_some_and(|have| have == v))
				})
			})
			.map(|w| index.attach_metadata(w.as_ref().clone()))
			.sorted_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)))
			.collect()
	}

	/// Ids currently indexed. Used by the watch loop to diff a fresh scan
	/// against the live index without ever clearing it.
	pub fn ids(&self) -> Vec<Strng> {
		let index = self.inner.read().unwrap();
		index.by_id.keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.read().unwrap().by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn stats(&self) -> Stats {
		let index = self.inner.read().unwrap();
		let mut by_runtime: HashMap<String, usize> = HashMap::new();
		let mut by_type: HashMap<String, usize> = HashMap::new();
		for w in index.by_id.values() {
			*by_runtime.entry(w.runtime.to_string()).or_default() += 1;
			*by_type.entry(w.workload_type.to_string()).or_default() += 1;
		}
		Stats {
			workloads: index.by_id.len(),
			isolation_groups: index.by_group.len(),
			by_runtime,
			by_type,
		}
	}
}

impl WorkloadIndex {
	fn update(&mut self, id: Strng, workload: Workload) {
		// Re-registering under the same id replaces every index entry; stale
		// hostname/name/group pointers must not survive the old record.
		self.remove(&id);

		if !workload.hostname.is_empty() {
			self.by_hostname.insert(workload.hostname.clone(), id.clone());
		}
		if !workload.name.is_empty() {
			if let Some(ns) = &workload.namespace {
				self.by_name
					.insert(strng::format!("{ns}/{}", workload.name), id.clone());
			}
			self.by_name.insert(workload.name.clone(), id.clone());
		}
		for group in &workload.isolation_groups {
			self.by_group.entry(group.clone()).or_default().insert(id.clone());
		}
		self.by_id.insert(id, Arc::new(workload));
	}

	fn remove(&mut self, id: &Strng) {
		let Some(workload) = self.by_id.get(id).cloned() else {
			return;
		};

		// Reverse entries are deleted only while they still point at this id;
		// a later writer may have claimed the same hostname or name.
		if self.by_hostname.get(&workload.hostname) == Some(id) {
			self.by_hostname.remove(&workload.hostname);
		}
		if let Some(ns) = &workload.namespace {
			let key = strng::format!("{ns}/{}", workload.name);
			if self.by_name.get(&key) == Some(id) {
				self.by_name.remove(&key);
			}
		}
		if self.by_name.get(&workload.name) == Some(id) {
			self.by_name.remove(&workload.name);
		}
		for group in &workload.isolation_groups {
			if let Some(members) = self.by_group.get_mut(group) {
				members.remove(id);
				if members.is_empty() {
					self.by_group.remove(group);
				}
			}
		}
		self.by_id.remove(id);
		self.metadata.remove(id);
	}

	fn identify(&self, identity: &str) -> Option<Strng> {
		if let Some(id) = self.by_hostname.get(identity) {
			return Some(id.clone());
		}
		if let Some(id) = self.by_name.get(identity) {
			return Some(id.clone());
		}
		if self.by_id.contains_key(identity) {
			return Some(strng::new(identity));
		}
		// Fall back to an id prefix scan, e.g. a short container id. Sorted
		// so a multi-match resolves the same way every time.
		self.by_id
			.keys()
			.sorted()
			.find(|id| id.starts_with(identity))
			.cloned()
	}

	fn materialize(&self, id: &Strng) -> Option<Workload> {
		let workload = self.by_id.get(id)?;
		Some(self.attach_metadata(workload.as_ref().clone()))
	}

	fn attach_metadata(&self, mut workload: Workload) -> Workload {
		if workload.metadata.is_none() {
			workload.metadata = self.metadata.get(&workload.id).cloned();
		}
		workload
	}
}
