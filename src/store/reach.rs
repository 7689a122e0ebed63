use std::collections::HashSet;
use std::net::IpAddr;

use discovery_core::prelude::*;
use itertools::Itertools;

use super::{Error, Store};
use crate::types::{ReachabilityResult, Workload};

impl Store {
	/// Compute which workloads the given identity can reach.
	///
	/// Reachability is membership in at least one shared isolation group.
	/// Each result is a projected copy: `isolation_groups` is narrowed to
	/// the shared groups and `addresses` to those usable through them, so a
	/// caller never sees endpoints it has no path to.
	pub fn find_reachable(&self, identity: &str) -> Result<ReachabilityResult, Error> {
		let index = self.inner.read().unwrap();

		let caller_id = index
			.identify(identity)
			.ok_or_else(|| Error::NotFound(strng::new(identity)))?;
		let caller = index
			.materialize(&caller_id)
			.ok_or_else(|| Error::NotFound(strng::new(identity)))?;

		let caller_groups: HashSet<&Strng> = caller.isolation_groups.iter().collect();
		if caller_groups.is_empty() {
			return Ok(ReachabilityResult::new(caller, vec![]));
		}

		let mut candidates: HashSet<&Strng> = HashSet::new();
		for group in &caller_groups {
			if let Some(members) = index.by_group.get(*group) {
				candidates.extend(members.iter());
			}
		}
		candidates.remove(&caller.id);

		let mut reachable: Vec<Workload> = candidates
			.into_iter()
			.filter_map(|id| index.by_id.get(id))
			.map(|target| {
				let shared: Vec<Strng> = target
					.isolation_groups
					.iter()
					.filter(|g| caller_groups.contains(g))
					.cloned()
					.sorted()
					.collect();
				let shared_set: HashSet<&Strng> = shared.iter().collect();
				// Non-empty by construction: the candidate came out of by_group.
				debug_assert!(!shared.is_empty());

				let mut projected = index.attach_metadata(target.as_ref().clone());
				projected.addresses.retain(|a| address_usable(a, &shared_set));
				projected.isolation_groups = shared;
				projected
			})
			.collect();

		reachable.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
		Ok(ReachabilityResult::new(caller, reachable))
	}

	/// Group-membership check between two indexed workloads, without the
	/// projection. Reports the shared groups when reachable.
	pub fn can_reach(&self, from_id: &str, to_id: &str) -> Result<Vec<Strng>, Error> {
		let index = self.inner.read().unwrap();
		let from = index
			.by_id
			.get(from_id)
			.ok_or_else(|| Error::NotFound(strng::new(from_id)))?;
		let to = index
			.by_id
			.get(to_id)
			.ok_or_else(|| Error::NotFound(strng::new(to_id)))?;
		let from_groups: HashSet<&Strng> = from.isolation_groups.iter().collect();
		Ok(to
			.isolation_groups
			.iter()
			.filter(|g| from_groups.contains(g))
			.cloned()
			.sorted()
			.collect())
	}
}

/// Whether an address may be shown to a caller sharing `shared` groups.
///
/// Only the `{name}.{group}` shape is gated: its suffix must name a shared
/// group. `{ip}:{port}`, `{dns}:{port}` and bare `{ip}` forms carry no group
/// claim, so the caller has no basis to reject them.
fn address_usable(addr: &str, shared: &HashSet<&Strng>) -> bool {
	match group_suffix(addr) {
		Some(group) => shared.iter().any(|g| g.as_str() == group),
		None => true,
	}
}

fn group_suffix(addr: &str) -> Option<&str> {
	if addr.contains(':') {
		// host:port shapes, including DNS names with dots.
		return None;
	}
	if addr.parse::<IpAddr>().is_ok() {
		return None;
	}
	addr.rsplit_once('.').map(|(_, suffix)| suffix)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn shared(groups: &[&str]) -> Vec<Strng> {
		groups.iter().map(strng::new).collect()
	}

	#[test]
	fn suffixed_addresses_are_gated() {
		let groups = shared(&["net1"]);
		let set: HashSet<&Strng> = groups.iter().collect();
		assert!(address_usable("web.net1", &set));
		assert!(!address_usable("web.net2", &set));
	}

	#[test]
	fn opaque_shapes_pass_through() {
		let groups = shared(&["team-a"]);
		let set: HashSet<&Strng> = groups.iter().collect();
		assert!(address_usable("10.244.1.5:8080", &set));
		assert!(address_usable("api.team-b.svc.cluster.local:80", &set));
		assert!(address_usable("10.244.1.5", &set));
		assert!(address_usable("plainhost", &set));
	}
}
