//! Mock Kubernetes API discovery types.

use std::collections::HashMap;

/// Discovery mode for the mock server.
#[derive(Clone, Copy, Default)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

/// Pre-configured discovery responses.
#[derive(Clone)]
pub struct MockDiscovery {
	pub core_resources: Vec<MockApiResource>,
	/// Keyed by group version, e.g. `apps/v1`.
	pub group_resources: HashMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("secrets", "Secret"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::namespaced("serviceaccounts", "ServiceAccount"),
				MockApiResource::namespaced("endpoints", "Endpoints"),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: HashMap::from([
				(
					"apps/v1".to_string(),
					vec![
						MockApiResource::namespaced("deployments", "Deployment"),
						MockApiResource::namespaced("daemonsets", "DaemonSet"),
					],
				),
				(
					"rbac.authorization.k8s.io/v1".to_string(),
					vec![
						MockApiResource::cluster_scoped("clusterroles", "ClusterRole"),
						MockApiResource::cluster_scoped("clusterrolebindings", "ClusterRoleBinding"),
						MockApiResource::namespaced("roles", "Role"),
						MockApiResource::namespaced("rolebindings", "RoleBinding"),
					],
				),
				(
					"apiextensions.k8s.io/v1".to_string(),
					vec![MockApiResource::cluster_scoped(
						"customresourcedefinitions",
						"CustomResourceDefinition",
					)],
				),
				(
					"coordination.k8s.io/v1".to_string(),
					vec![MockApiResource::namespaced("leases", "Lease")],
				),
				(
					"discovery.k8s.io/v1".to_string(),
					vec![MockApiResource::namespaced("endpointslices", "EndpointSlice")],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Resources served under a group version (`v1` for the core group).
	pub fn resources(&self, group_version: &str) -> Option<&[MockApiResource]> {
		if group_version == "v1" {
			Some(&self.core_resources)
		} else {
			self.group_resources.get(group_version).map(Vec::as_slice)
		}
	}

	/// Look up a resource by its plural name.
	pub fn by_plural(&self, group_version: &str, plural: &str) -> Option<&MockApiResource> {
		self.resources(group_version)?
			.iter()
			.find(|r| r.name == plural)
	}

	/// Look up a resource by kind.
	pub fn by_kind(&self, group_version: &str, kind: &str) -> Option<&MockApiResource> {
		self.resources(group_version)?
			.iter()
			.find(|r| r.kind == kind)
	}
}

/// A mock API resource definition.
#[derive(Clone)]
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

fn all_verbs() -> Vec<String> {
	["create", "delete", "get", "list", "patch", "update", "watch"]
		.into_iter()
		.map(String::from)
		.collect()
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: true,
			verbs: all_verbs(),
		}
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: false,
			verbs: all_verbs(),
		}
	}
}
