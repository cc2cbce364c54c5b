//! The resource store contract consumed by the apply/prune algorithm.

use async_trait::async_trait;
use kube::{
	api::DynamicObject,
	core::GroupVersionKind,
	discovery::{verbs, ApiResource},
};
use thiserror::Error;

use super::{discovery::DiscoveryError, ResourceScope, DEFAULT_NAMESPACE};

/// Errors returned by a [`ResourceStore`].
///
/// API failures are classified by status code so callers can apply the
/// not-found, forbidden and conflict policies without inspecting raw responses.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("not found")]
	NotFound,

	#[error("resource is gone")]
	Gone,

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("no resource mapping for {api_version}/{kind}")]
	UnknownKind { api_version: String, kind: String },

	#[error("API discovery failed")]
	Discovery(#[source] Box<DiscoveryError>),

	#[error("API error {code}: {message}")]
	Api { code: u16, message: String },

	#[error(transparent)]
	Kube(Box<kube::Error>),

	#[error("converting object")]
	Serialization(#[source] serde_json::Error),
}

impl StoreError {
	/// Deleting something that is already absent counts as success.
	pub fn is_not_found_or_gone(&self) -> bool {
		matches!(self, Self::NotFound | Self::Gone)
	}

	pub fn is_forbidden(&self) -> bool {
		matches!(self, Self::Forbidden(_))
	}
}

impl From<kube::Error> for StoreError {
	fn from(err: kube::Error) -> Self {
		match err {
			kube::Error::Api(ref resp) => match resp.code {
				404 => Self::NotFound,
				410 => Self::Gone,
				403 => Self::Forbidden(resp.message.clone()),
				409 => Self::Conflict(resp.message.clone()),
				code => Self::Api {
					code,
					message: resp.message.clone(),
				},
			},
			other => Self::Kube(Box::new(other)),
		}
	}
}

/// A resource type the store knows how to address.
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
	/// The kube ApiResource for making API calls.
	pub api_resource: ApiResource,
	/// Whether this resource is namespaced or cluster-wide.
	pub scope: ResourceScope,
	/// Verbs advertised by discovery.
	pub verbs: Vec<String>,
}

impl DiscoveredResource {
	pub fn gvk(&self) -> GroupVersionKind {
		GroupVersionKind::gvk(
			&self.api_resource.group,
			&self.api_resource.version,
			&self.api_resource.kind,
		)
	}

	pub fn supports(&self, verb: &str) -> bool {
		self.verbs.iter().any(|v| v == verb)
	}

	/// Kinds the pruner may list and delete.
	pub fn is_prunable(&self) -> bool {
		self.supports(verbs::LIST) && self.supports(verbs::DELETE)
	}

	/// Namespace to address an object of this type with.
	///
	/// Cluster-wide kinds ignore whatever namespace the manifest carries,
	/// namespaced kinds fall back to [`DEFAULT_NAMESPACE`].
	pub fn effective_namespace(&self, requested: Option<&str>) -> Option<String> {
		match self.scope {
			ResourceScope::ClusterWide => None,
			ResourceScope::Namespaced => Some(
				requested
					.filter(|ns| !ns.is_empty())
					.unwrap_or(DEFAULT_NAMESPACE)
					.to_string(),
			),
		}
	}
}

/// Typed + dynamic CRUD over kind/namespace/name addressed documents, plus
/// discovery.
///
/// `namespace` is ignored for cluster-wide resources. For namespaced
/// resources `None` means "all namespaces" in [`ResourceStore::list`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
	/// Resolve a kind to an addressable resource type.
	///
	/// Fails with [`StoreError::UnknownKind`] if the kind is unknown even after
	/// re-checking the server.
	async fn resolve(&self, gvk: &GroupVersionKind) -> Result<DiscoveredResource, StoreError>;

	/// All known kinds at their preferred version.
	async fn discover_kinds(&self) -> Result<Vec<DiscoveredResource>, StoreError>;

	async fn get(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
	) -> Result<DynamicObject, StoreError>;

	async fn create(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		object: &DynamicObject,
	) -> Result<DynamicObject, StoreError>;

	/// Full overwrite of an existing object.
	async fn update(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		object: &DynamicObject,
	) -> Result<DynamicObject, StoreError>;

	/// Apply a JSON merge patch (RFC 7386).
	async fn patch(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
		patch: &serde_json::Value,
	) -> Result<DynamicObject, StoreError>;

	/// Delete with foreground cascading.
	async fn delete(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
	) -> Result<(), StoreError>;

	async fn list(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		label_selector: &str,
	) -> Result<Vec<DynamicObject>, StoreError>;

	/// Wait (best effort) until a freshly applied CRD is established.
	async fn wait_established(&self, _crd_name: &str) {}

	/// Forget cached discovery data.
	fn invalidate_discovery(&self) {}
}

/// Convert a manifest into a [`DynamicObject`].
pub fn to_object(manifest: &serde_json::Value) -> Result<DynamicObject, StoreError> {
	serde_json::from_value(manifest.clone()).map_err(StoreError::Serialization)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config_maps() -> DiscoveredResource {
		DiscoveredResource {
			api_resource: ApiResource::from_gvk_with_plural(
				&GroupVersionKind::gvk("", "v1", "ConfigMap"),
				"configmaps",
			),
			scope: ResourceScope::Namespaced,
			verbs: vec!["list".into(), "delete".into()],
		}
	}

	#[test]
	fn test_effective_namespace_defaults_for_namespaced() {
		let cm = config_maps();
		assert_eq!(cm.effective_namespace(None).as_deref(), Some("default"));
		assert_eq!(cm.effective_namespace(Some("")).as_deref(), Some("default"));
		assert_eq!(cm.effective_namespace(Some("ns")).as_deref(), Some("ns"));
	}

	#[test]
	fn test_effective_namespace_ignored_for_cluster_wide() {
		let crb = DiscoveredResource {
			scope: ResourceScope::ClusterWide,
			..config_maps()
		};
		assert_eq!(crb.effective_namespace(Some("ns")), None);
	}

	#[test]
	fn test_prunable_requires_list_and_delete() {
		let mut cm = config_maps();
		assert!(cm.is_prunable());
		cm.verbs.retain(|v| v != "delete");
		assert!(!cm.is_prunable());
	}
}
