use discovery_core::prelude::*;
use etcd_client::{
	Client, DeleteOptions, GetOptions, WatchOptions, WatchStream, Watcher,
};

use crate::config::EtcdConfig;
use crate::types::Workload;

pub mod sync;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("etcd: {0}")]
	Etcd(#[from] etcd_client::Error),
	#[error("invalid workload record at {key}: {source}")]
	Codec {
		key: String,
		#[source]
		source: serde_json::Error,
	},
	#[error("watch expired, store compacted at revision {0}")]
	Expired(i64),
	#[error("watch stream closed")]
	Closed,
}

/// Which record a key under the workloads prefix addresses.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KeyKind {
	/// The workload JSON itself; drives indexing.
	Data,
	/// Opaque scraped sibling; attaches to an indexed workload only.
	Metadata,
}

/// Key layout shared by the watcher (writer) and query server (reader):
///
/// ```text
/// {root}/workloads/{id}/data
/// {root}/workloads/{id}/metadata
/// ```
#[derive(Debug, Clone)]
pub struct KeySpace {
	workloads: String,
}

impl KeySpace {
	pub fn new(root: &str) -> KeySpace {
		let root = root.trim_end_matches('/');
		KeySpace {
			workloads: format!("{root}/workloads/"),
		}
	}

	/// The prefix scanned and watched by readers.
	pub fn workloads(&self) -> &str {
		&self.workloads
	}

	pub fn data(&self, id: &str) -> String {
		format!("{}{id}/data", self.workloads)
	}

	pub fn metadata(&self, id: &str) -> String {
		format!("{}{id}/metadata", self.workloads)
	}

	/// Prefix owning every record of one workload; deleted as a unit.
	pub fn workload_prefix(&self, id: &str) -> String {
		format!("{}{id}/", self.workloads)
	}

	/// Split a raw key into `(id, kind)`. Keys outside the layout (foreign
	/// prefixes, missing kind segment, unknown kinds) return `None`.
	pub fn parse(&self, key: &str) -> Option<(Strng, KeyKind)> {
		let rest = key.strip_prefix(self.workloads.as_str())?;
		let mut segments = rest.split('/');
		let id = segments.next().filter(|s| !s.is_empty())?;
		let kind = match segments.next()? {
			"data" => KeyKind::Data,
			"metadata" => KeyKind::Metadata,
			_ => return None,
		};
		Some((strng::new(id), kind))
	}
}

/// Thin adapter over the etcd client, scoped to the discovery key space.
#[derive(Clone)]
pub struct Kv {
	client: Client,
	keys: KeySpace,
}

impl Kv {
	pub async fn connect(config: &EtcdConfig) -> Result<Kv, Error> {
		let endpoint = config.endpoint();
		let mut client = Client::connect([endpoint.as_str()], None).await?;
		// Surface unreachable stores at startup instead of on first write.
		client.status().await?;
		info!(%endpoint, prefix = %config.prefix, "connected to etcd");
		Ok(Kv {
			client,
			keys: KeySpace::new(&config.prefix),
		})
	}

	pub fn keys(&self) -> &KeySpace {
		&self.keys
	}

	pub async fn put_workload(&self, workload: &Workload) -> Result<(), Error> {
		let key = self.keys.data(&workload.id);
		let value = workload.to_json().map_err(|source| Error::Codec {
			key: key.clone(),
			source,
		})?;
		self.client.clone().put(key, value, None).await?;
		Ok(())
	}

	pub async fn put_metadata(
		&self,
		id: &str,
		metadata: &serde_json::Value,
	) -> Result<(), Error> {
		let key = self.keys.metadata(id);
		let value = serde_json::to_vec(metadata).map_err(|source| Error::Codec {
			key: key.clone(),
			source,
		})?;
		self.client.clone().put(key, value, None).await?;
		Ok(())
	}

	/// Remove every record of the workload: data and any metadata sibling.
	pub async fn delete_workload(&self, id: &str) -> Result<(), Error> {
		self.client
			.clone()
			.delete(
				self.keys.workload_prefix(id),
				Some(DeleteOptions::new().with_prefix()),
			)
			.await?;
		Ok(())
	}

	/// Full prefix scan. Returns raw `(key, value)` pairs plus the store
	/// revision the scan observed, which a watch can resume from.
	pub async fn scan(&self) -> Result<(Vec<(String, Vec<u8>)>, i64), Error> {
		let resp = self
			.client
			.clone()
			.get(
				self.keys.workloads.as_str(),
				Some(GetOptions::new().with_prefix()),
			)
			.await?;
		let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
		let pairs = resp
			.kvs()
			.iter()
			.filter_map(|kv| {
				let key = kv.key_str().ok()?.to_string();
				Some((key, kv.value().to_vec()))
			})
			.collect();
		Ok((pairs, revision))
	}

	/// Open a prefix watch starting just after `revision`.
	pub async fn watch(&self, revision: i64) -> Result<(Watcher, WatchStream), Error> {
		let options = WatchOptions::new()
			.with_prefix()
			.with_start_revision(revision + 1);
		let (watcher, stream) = self
			.client
			.clone()
			.watch(self.keys.workloads.as_str(), Some(options))
			.await?;
		Ok((watcher, stream))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_layout() {
		let keys = KeySpace::new("/discovery");
		assert_eq!(keys.workloads(), "/discovery/workloads/");
		assert_eq!(keys.data("c1"), "/discovery/workloads/c1/data");
		assert_eq!(keys.metadata("c1"), "/discovery/workloads/c1/metadata");
		assert_eq!(keys.workload_prefix("c1"), "/discovery/workloads/c1/");
		// A trailing slash on the configured root collapses.
		assert_eq!(KeySpace::new("/discovery/").data("c1"), keys.data("c1"));
	}

	#[test]
	fn parse_data_and_metadata_keys() {
		let keys = KeySpace::new("/discovery");
		assert_eq!(
			keys.parse("/discovery/workloads/c1/data"),
			Some((strng::new("c1"), KeyKind::Data))
		);
		assert_eq!(
			keys.parse("/discovery/workloads/c1/metadata"),
			Some((strng::new("c1"), KeyKind::Metadata))
		);
	}

	#[test]
	fn parse_rejects_foreign_and_malformed_keys() {
		let keys = KeySpace::new("/discovery");
		assert_eq!(keys.parse("/other/workloads/c1/data"), None);
		assert_eq!(keys.parse("/discovery/workloads/c1"), None);
		assert_eq!(keys.parse("/discovery/workloads/c1/unknown"), None);
		assert_eq!(keys.parse("/discovery/workloads//data"), None);
	}
}
