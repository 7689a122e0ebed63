use std::collections::BTreeSet;
use std::path::PathBuf;

use discovery_core::prelude::*;
use serde::Deserialize;

/// Network state reconstructed for one container from CNI result files.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ContainerNetworks {
	pub networks: Vec<Strng>,
	pub ips: Vec<Strng>,
}

/// Reads CNI plugin results from disk.
///
/// containerd does not expose network attachments over its API; CNI plugins
/// leave one result file per attachment, named
/// `{network}-{namespace}-{container_id}-{interface}`. Both network and
/// namespace may themselves contain `-`, so parsing anchors on the
/// container id instead of counting separators.
#[derive(Debug, Clone)]
pub struct CniState {
	dir: PathBuf,
	namespace: String,
}

impl CniState {
	pub fn new(dir: PathBuf, namespace: String) -> Self {
		CniState { dir, namespace }
	}

	/// Collect the networks and IPs recorded for a container. Unreadable or
	/// malformed result files are skipped; they must not hide the rest.
	pub async fn networks_for(&self, container_id: &str) -> ContainerNetworks {
		let mut networks = BTreeSet::new();
		let mut ips = BTreeSet::new();

		for filename in self.list_files().await.unwrap_or_default() {
			let Some(network) = parse_network_name(&filename, container_id, &self.namespace)
			else {
				continue;
			};
			let path = self.dir.join(&filename);
			let result: CniResult = match tokio::fs::read(&path).await {
				Ok(data) => match serde_json::from_slice(&data) {
					Ok(result) => result,
					Err(e) => {
						warn!(file = %path.display(), "skipping malformed CNI result: {e}");
						continue;
					},
				},
				Err(e) => {
					warn!(file = %path.display(), "skipping unreadable CNI result: {e}");
					continue;
				},
			};
			networks.insert(strng::new(network));
			for ip in result.ips {
				// Addresses carry a /mask suffix.
				if let Some(addr) = ip.address.split('/').next() {
					if !addr.is_empty() {
						ips.insert(strng::new(addr));
					}
				}
			}
		}

		ContainerNetworks {
			networks: networks.into_iter().collect(),
			ips: ips.into_iter().collect(),
		}
	}

	/// Current result file names, for change detection.
	pub async fn list_files(&self) -> std::io::Result<BTreeSet<String>> {
		let mut names = BTreeSet::new();
		let mut entries = tokio::fs::read_dir(&self.dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
				if let Ok(name) = entry.file_name().into_string() {
					names.insert(name);
				}
			}
		}
		Ok(names)
	}
}

#[derive(Debug, Deserialize)]
struct CniResult {
	#[serde(default)]
	ips: Vec<CniIp>,
}

#[derive(Debug, Deserialize)]
struct CniIp {
	#[serde(default)]
	address: String,
}

/// Extract the network name from a CNI result file name, given the
/// container it is expected to belong to.
///
/// The parse anchors on the first occurrence of the container id's 12-char
/// prefix: everything before it, minus the joining `-`, is
/// `{network}-{namespace}`, and the configured namespace suffix is then
/// stripped.
pub fn parse_network_name<'a>(
	filename: &'a str,
	container_id: &str,
	namespace: &str,
) -> Option<&'a str> {
	let anchor = if container_id.len() > 12 {
		&container_id[..12]
	} else {
		container_id
	};
	if anchor.is_empty() {
		return None;
	}
	let position = filename.find(anchor)?;
	if position == 0 {
		return None;
	}
	let head = filename[..position].trim_end_matches('-');
	let network = head
		.strip_suffix(&format!("-{namespace}"))
		.unwrap_or(head);
	if network.is_empty() {
		None
	} else {
		Some(network)
	}
}

/// Find the 64-char hex container id embedded in a result file name.
pub fn extract_container_id(filename: &str) -> Option<&str> {
	filename
		.split('-')
		.find(|segment| segment.len() == 64 && segment.bytes().all(|b| b.is_ascii_hexdigit()))
}
