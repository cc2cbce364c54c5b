//! Kubernetes API resource discovery and caching.
//!
//! This module handles discovering API resources from the cluster's
//! discovery API, caching the results for lookups by apiVersion and kind,
//! and remembering which version of each kind the server prefers.

use std::collections::HashMap;

use kube::{
	core::{GroupVersion, GroupVersionKind},
	discovery::{
		oneshot::{pinned_group, pinned_kind},
		ApiCapabilities, ApiGroup, ApiResource, Scope,
	},
	Client, Discovery,
};
use thiserror::Error;
use tracing::instrument;

use super::{store::DiscoveredResource, ResourceScope};

/// Errors that can occur during API resource discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),

	#[error("failed to discover resource {api_version}/{kind}")]
	ResourceDiscovery {
		api_version: String,
		kind: String,
		#[source]
		source: kube::Error,
	},
}

/// Extract a GroupVersionKind from a Kubernetes manifest.
pub fn gvk_from_manifest(manifest: &serde_json::Value) -> Option<GroupVersionKind> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	if api_version.is_empty() || kind.is_empty() {
		return None;
	}
	Some(gvk_from_api_version(api_version, kind))
}

/// Create a GroupVersionKind from an apiVersion string and kind.
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
	let (group, version) = match api_version.split_once('/') {
		Some((g, v)) => (g, v),
		None => ("", api_version),
	};
	GroupVersionKind::gvk(group, version, kind)
}

fn discovered(api_resource: ApiResource, caps: &ApiCapabilities) -> DiscoveredResource {
	let scope = match caps.scope {
		Scope::Namespaced => ResourceScope::Namespaced,
		Scope::Cluster => ResourceScope::ClusterWide,
	};
	DiscoveredResource {
		api_resource,
		scope,
		verbs: caps.operations.clone(),
	}
}

/// Cached API resource discovery results.
///
/// This cache is built by querying the cluster's discovery API once,
/// then provides O(1) lookups for resources by apiVersion and kind.
#[derive(Clone, Default)]
pub struct ApiResourceCache {
	resources: HashMap<GroupVersionKind, DiscoveredResource>,
	preferred: Vec<DiscoveredResource>,
}

impl ApiResourceCache {
	/// Build the cache by querying the cluster's discovery API.
	///
	/// Uses the Aggregated Discovery API (K8s 1.26+) which requires only 2 API calls,
	/// falling back to per-group discovery for older clusters.
	#[instrument(skip_all)]
	pub async fn build(client: &Client) -> Result<Self, DiscoveryError> {
		match Discovery::new(client.clone()).run_aggregated().await {
			Ok(discovery) => {
				tracing::debug!("using aggregated discovery");
				let mut cache = Self::default();
				for group in discovery.groups() {
					cache.add_group(group, true);
				}
				Ok(cache)
			}
			Err(e) => {
				tracing::debug!(error = %e, "aggregated discovery not available, using per-group discovery");
				Self::build_per_group(client).await
			}
		}
	}

	/// Query every group version on its own. A group that fails, like an
	/// aggregated API whose backend is down, is left out; only the core
	/// group and the group list itself are required.
	async fn build_per_group(client: &Client) -> Result<Self, DiscoveryError> {
		let mut cache = Self::default();

		let core = pinned_group(client, &GroupVersion::gv("", "v1"))
			.await
			.map_err(DiscoveryError::FullDiscovery)?;
		cache.add_group(&core, true);

		let groups = client
			.list_api_groups()
			.await
			.map_err(DiscoveryError::FullDiscovery)?;
		for group in groups.groups {
			let preferred = group
				.preferred_version
				.as_ref()
				.or(group.versions.first())
				.map(|v| v.version.clone());
			for version in &group.versions {
				let gv = GroupVersion::gv(&group.name, &version.version);
				match pinned_group(client, &gv).await {
					Ok(found) => {
						cache.add_group(&found, preferred.as_ref() == Some(&version.version));
					}
					Err(e) => {
						tracing::warn!(
							group_version = %version.group_version,
							error = %e,
							"skipping API group that failed discovery"
						);
					}
				}
			}
		}

		Ok(cache)
	}

	/// Add every version of `group`; with `preferred`, its recommended
	/// resources also become prune targets.
	fn add_group(&mut self, group: &ApiGroup, preferred: bool) {
		// Iterate all versions, not just recommended, so we can handle
		// manifests using older API versions (e.g., v1alpha1 vs v1beta1)
		for ver in group.versions() {
			for (ar, caps) in group.versioned_resources(ver) {
				let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
				self.resources.insert(gvk, discovered(ar, &caps));
			}
		}
		if preferred {
			for (ar, caps) in group.recommended_resources() {
				self.preferred.push(discovered(ar, &caps));
			}
		}
	}

	/// Look up a resource by its GroupVersionKind.
	pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<&DiscoveredResource> {
		self.resources.get(gvk)
	}

	/// Every kind at the version the server prefers.
	pub fn preferred(&self) -> &[DiscoveredResource] {
		&self.preferred
	}
}

/// Resolve a single kind directly against the server, bypassing the cache.
#[instrument(skip(client), fields(api_version = %gvk.api_version(), kind = %gvk.kind))]
pub async fn resolve_pinned(
	client: &Client,
	gvk: &GroupVersionKind,
) -> Result<DiscoveredResource, DiscoveryError> {
	let (ar, caps) =
		pinned_kind(client, gvk)
			.await
			.map_err(|source| DiscoveryError::ResourceDiscovery {
				api_version: gvk.api_version(),
				kind: gvk.kind.clone(),
				source,
			})?;
	Ok(discovered(ar, &caps))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_gvk_from_manifest() {
		let manifest = serde_json::json!({
			"apiVersion": "rbac.authorization.k8s.io/v1",
			"kind": "ClusterRoleBinding",
			"metadata": {
				"name": "crb"
			}
		});

		let gvk = gvk_from_manifest(&manifest).unwrap();
		assert_eq!(gvk.group, "rbac.authorization.k8s.io");
		assert_eq!(gvk.version, "v1");
		assert_eq!(gvk.kind, "ClusterRoleBinding");
	}

	#[test]
	fn test_gvk_from_manifest_core_api() {
		let manifest = serde_json::json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
		});

		let gvk = gvk_from_manifest(&manifest).unwrap();
		assert_eq!(gvk.group, "");
		assert_eq!(gvk.api_version(), "v1");
	}

	#[test]
	fn test_gvk_from_manifest_missing_fields() {
		assert!(gvk_from_manifest(&serde_json::json!({"kind": "Deployment"})).is_none());
		assert!(gvk_from_manifest(&serde_json::json!({"apiVersion": "", "kind": "Pod"})).is_none());
	}
}
