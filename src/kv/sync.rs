use std::collections::HashMap;

use discovery_core::prelude::*;
use discovery_core::readiness::BlockReady;
use etcd_client::EventType as KvEventType;
use tokio_util::sync::CancellationToken;

use super::{Error, KeyKind, KeySpace, Kv};
use crate::store::Store;
use crate::types::Workload;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Everything one prefix scan observed, decoded.
#[derive(Debug, Default)]
pub struct Snapshot {
	pub workloads: HashMap<Strng, Workload>,
	pub metadata: HashMap<Strng, serde_json::Value>,
	pub revision: i64,
}

/// Keep the in-memory index synchronized with the KV store.
///
/// Each cycle scans the prefix, reconciles the index against the scan, and
/// then consumes the watch stream from the scan's revision. Any stream
/// failure or compaction drops the cursor and re-enters the rebuild after a
/// bounded exponential backoff. The index is reconciled by diffing, never
/// cleared, so readers always see either the old or the new state.
pub async fn run(store: Store, kv: Kv, token: CancellationToken, ready: BlockReady) {
	let mut ready = Some(ready);
	let mut backoff = INITIAL_BACKOFF;
	loop {
		if token.is_cancelled() {
			return;
		}
		match watch_cycle(&store, &kv, &token, &mut ready, &mut backoff).await {
			Ok(()) => {
				info!("watch loop stopping");
				return;
			},
			Err(e @ Error::Expired(_)) => {
				// Expected when etcd compacts past our cursor; the rebuild
				// resynchronizes from a fresh scan.
				info!("watch cursor expired: {e}");
			},
			Err(e) => {
				warn!("watch failed: {e}, rebuilding in {backoff:?}");
			},
		}
		tokio::select! {
			_ = token.cancelled() => return,
			_ = tokio::time::sleep(backoff) => {},
		}
		backoff = std::cmp::min(MAX_BACKOFF, backoff * 2);
	}
}

async fn watch_cycle(
	store: &Store,
	kv: &Kv,
	token: &CancellationToken,
	ready: &mut Option<BlockReady>,
	backoff: &mut Duration,
) -> Result<(), Error> {
	let (pairs, revision) = kv.scan().await?;
	let snapshot = decode_snapshot(kv.keys(), pairs, revision);
	apply_snapshot(store, snapshot);
	info!(
		workloads = store.len(),
		revision, "index rebuilt from prefix scan"
	);
	drop(ready.take());

	let (mut watcher, mut stream) = kv.watch(revision).await?;
	loop {
		tokio::select! {
			_ = token.cancelled() => {
				let _ = watcher.cancel().await;
				return Ok(());
			},
			message = stream.message() => {
				let Some(resp) = message? else {
					return Err(Error::Closed);
				};
				if resp.canceled() {
					let compacted = resp.compact_revision();
					return Err(if compacted > 0 {
						Error::Expired(compacted)
					} else {
						Error::Closed
					});
				}
				for event in resp.events() {
					apply_event(store, kv.keys(), event);
				}
				// A healthy stream resets the reconnect backoff.
				*backoff = INITIAL_BACKOFF;
			},
		}
	}
}

/// Decode a raw scan. A record that fails to decode is logged and skipped;
/// one bad value must not block the rest of the store.
pub fn decode_snapshot(
	keys: &KeySpace,
	pairs: Vec<(String, Vec<u8>)>,
	revision: i64,
) -> Snapshot {
	let mut snapshot = Snapshot {
		revision,
		..Default::default()
	};
	for (key, value) in pairs {
		let Some((id, kind)) = keys.parse(&key) else {
			continue;
		};
		match kind {
			KeyKind::Data => match Workload::from_json(&value) {
				Ok(workload) => {
					snapshot.workloads.insert(id, workload);
				},
				Err(e) => warn!(%key, "skipping undecodable workload: {e}"),
			},
			KeyKind::Metadata => match serde_json::from_slice(&value) {
				Ok(metadata) => {
					snapshot.metadata.insert(id, metadata);
				},
				Err(e) => warn!(%key, "skipping undecodable metadata: {e}"),
			},
		}
	}
	snapshot
}

/// Reconcile the live index with a snapshot by diffing: ids absent from the
/// snapshot are removed, everything else re-applied through `update`.
pub fn apply_snapshot(store: &Store, snapshot: Snapshot) {
	for id in store.ids() {
		if !snapshot.workloads.contains_key(&id) {
			store.remove(&id);
		}
	}
	for id in snapshot.workloads.keys() {
		if !snapshot.metadata.contains_key(id) {
			store.remove_metadata(id);
		}
	}
	for (id, metadata) in snapshot.metadata {
		store.set_metadata(id, metadata);
	}
	for (id, workload) in snapshot.workloads {
		store.update(id, workload);
	}
}

fn apply_event(store: &Store, keys: &KeySpace, event: &etcd_client::Event) {
	let Some(kv) = event.kv() else {
		return;
	};
	let Ok(key) = kv.key_str() else {
		warn!("ignoring watch event with non-utf8 key");
		return;
	};
	let Some((id, kind)) = keys.parse(key) else {
		return;
	};
	match (event.event_type(), kind) {
		(KvEventType::Put, KeyKind::Data) => match Workload::from_json(kv.value()) {
			Ok(workload) => {
				debug!(%id, name = %workload.name, "watch: update");
				store.update(id, workload);
			},
			Err(e) => warn!(%key, "skipping undecodable workload: {e}"),
		},
		(KvEventType::Delete, KeyKind::Data) => {
			debug!(%id, "watch: remove");
			store.remove(&id);
		},
		(KvEventType::Put, KeyKind::Metadata) => match serde_json::from_slice(kv.value()) {
			Ok(metadata) => store.set_metadata(id, metadata),
			Err(e) => warn!(%key, "skipping undecodable metadata: {e}"),
		},
		(KvEventType::Delete, KeyKind::Metadata) => store.remove_metadata(&id),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::Runtime;

	fn keys() -> KeySpace {
		KeySpace::new("/discovery")
	}

	fn workload(id: &str, name: &str, groups: &[&str]) -> Workload {
		Workload {
			id: strng::new(id),
			name: strng::new(name),
			hostname: strng::format!("{id}host"),
			runtime: Runtime::Docker,
			isolation_groups: groups.iter().map(strng::new).collect(),
			..Default::default()
		}
	}

	fn pair(keys: &KeySpace, w: &Workload) -> (String, Vec<u8>) {
		(keys.data(&w.id), w.to_json().unwrap())
	}

	#[test]
	fn decode_skips_malformed_records() {
		let keys = keys();
		let good = workload("c1", "api", &["net1"]);
		let pairs = vec![
			pair(&keys, &good),
			(keys.data("c2"), b"{not json".to_vec()),
			(keys.metadata("c1"), b"{\"scrape\":\"ok\"}".to_vec()),
			("/discovery/other/key".to_string(), b"{}".to_vec()),
		];
		let snapshot = decode_snapshot(&keys, pairs, 7);
		assert_eq!(snapshot.revision, 7);
		assert_eq!(snapshot.workloads.len(), 1);
		assert_eq!(snapshot.workloads[&strng::new("c1")].name, "api");
		assert_eq!(snapshot.metadata.len(), 1);
	}

	/// Resync after cursor expiry: the index converges to the scan without
	/// ever being cleared; survivors stay queryable throughout.
	#[test]
	fn apply_snapshot_converges_by_diffing() {
		let store = Store::new();
		for w in [
			workload("w1", "api", &["netA"]),
			workload("w2", "db", &["netA"]),
			workload("w3", "cache", &["netB"]),
		] {
			store.update(w.id.clone(), w);
		}

		// w2's key was deleted while the watch was down; w1 changed groups.
		let keys = keys();
		let pairs = vec![
			pair(&keys, &workload("w1", "api", &["netB"])),
			pair(&keys, &workload("w3", "cache", &["netB"])),
		];
		apply_snapshot(&store, decode_snapshot(&keys, pairs, 42));

		assert_eq!(store.len(), 2);
		assert!(store.get("w2").is_none());
		assert_eq!(
			store.get("w1").unwrap().isolation_groups,
			vec![strng::new("netB")]
		);
		// w1 and w3 now share netB.
		let result = store.find_reachable("w1host").unwrap();
		assert_eq!(result.count, 1);
		assert_eq!(result.reachable[0].id, "w3");
	}

	#[test]
	fn apply_snapshot_carries_metadata() {
		let store = Store::new();
		let keys = keys();
		let pairs = vec![
			pair(&keys, &workload("w1", "api", &["netA"])),
			(keys.metadata("w1"), b"{\"scrape\":\"ok\"}".to_vec()),
		];
		apply_snapshot(&store, decode_snapshot(&keys, pairs, 1));
		assert_eq!(store.get("w1").unwrap().metadata.unwrap()["scrape"], "ok");
	}
}
