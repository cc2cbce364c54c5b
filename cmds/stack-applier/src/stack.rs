//! Convergence of one stack onto the cluster.
//!
//! [`Stack::apply`] creates, overwrites or merge-patches every desired
//! resource, and optionally prunes live resources that carry the stack's
//! ownership label but are no longer desired.

use std::{
	collections::{BTreeSet, HashMap},
	fmt,
	path::Path,
	sync::Arc,
};

use kube::{api::DynamicObject, core::GroupVersionKind};
use thiserror::Error;
use tokio::{
	sync::{OnceCell, Semaphore},
	task::{JoinError, JoinSet},
};
use tracing::instrument;

use crate::{
	k8s::{
		discovery::gvk_from_manifest,
		store::{to_object, DiscoveredResource, ResourceStore, StoreError},
		ResourceScope, DEFAULT_NAMESPACE,
	},
	labels::{self, ResourceId},
	manifest::{self, ManifestError},
	merge_patch,
};

/// Upper bound on concurrent per-kind listings while pruning.
const PRUNE_CONCURRENCY: usize = 8;

/// Kinds that inherit labels from their owners without owner references.
const NEVER_PRUNED: &[(&str, &str)] = &[
	("v1", "Endpoints"),
	("discovery.k8s.io/v1", "EndpointSlice"),
];

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_KIND: &str = "CustomResourceDefinition";

/// Where in a pass an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Apply,
	Prune,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Apply => "apply",
			Self::Prune => "prune",
		})
	}
}

#[derive(Debug, Error)]
pub enum StackError {
	#[error("stack {stack}: reading manifests failed")]
	Read {
		stack: String,
		#[source]
		source: ManifestError,
	},

	#[error("stack {stack}: resource #{index} has no apiVersion, kind or name")]
	InvalidResource { stack: String, index: usize },

	#[error("stack {stack}: {phase} {resource} failed")]
	Resource {
		stack: String,
		phase: Phase,
		resource: ResourceId,
		#[source]
		source: StoreError,
	},

	#[error("stack {stack}: listing kinds for prune failed")]
	Discovery {
		stack: String,
		#[source]
		source: StoreError,
	},

	#[error("stack {stack}: {phase} task failed")]
	Task {
		stack: String,
		phase: Phase,
		#[source]
		source: JoinError,
	},
}

/// Result of a successful pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
	/// Every resource the pass applied.
	pub kept: BTreeSet<ResourceId>,
	/// Resources deleted by pruning, in deletion order.
	pub pruned: Vec<ResourceId>,
}

/// A prune candidate.
struct Candidate {
	resource: DiscoveredResource,
	namespace: Option<String>,
	id: ResourceId,
}

/// A named bundle of desired resources.
#[derive(Debug, Clone)]
pub struct Stack {
	name: String,
	resources: Vec<serde_json::Value>,
}

impl Stack {
	pub fn new(name: impl Into<String>, resources: Vec<serde_json::Value>) -> Self {
		Self {
			name: name.into(),
			resources,
		}
	}

	/// A stack without resources. Applying it with pruning deletes everything
	/// the stack owns.
	pub fn empty(name: impl Into<String>) -> Self {
		Self::new(name, Vec::new())
	}

	/// Read the desired resources from a stack directory.
	pub fn from_dir(name: impl Into<String>, dir: &Path) -> Result<Self, StackError> {
		let name = name.into();
		match manifest::read_stack_dir(dir) {
			Ok(resources) => Ok(Self::new(name, resources)),
			Err(source) => Err(StackError::Read {
				stack: name,
				source,
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn resources(&self) -> &[serde_json::Value] {
		&self.resources
	}

	/// Cluster-wide resources come first, otherwise file order. Kinds the
	/// store cannot resolve yet, such as those of a CRD in the same stack,
	/// are placed by whether the manifest names a namespace.
	async fn ordered(&self, store: &dyn ResourceStore) -> Vec<(usize, &serde_json::Value)> {
		let mut scopes: HashMap<GroupVersionKind, Option<ResourceScope>> = HashMap::new();
		let mut ordered = Vec::with_capacity(self.resources.len());
		let mut namespaced = Vec::new();

		for (index, manifest) in self.resources.iter().enumerate() {
			let scope = match gvk_from_manifest(manifest) {
				Some(gvk) => match scopes.get(&gvk).copied() {
					Some(scope) => scope,
					None => {
						let scope = store.resolve(&gvk).await.ok().map(|r| r.scope);
						scopes.insert(gvk, scope);
						scope
					}
				},
				None => None,
			};
			let cluster_wide = match scope {
				Some(scope) => scope == ResourceScope::ClusterWide,
				None => manifest_namespace(manifest).is_none(),
			};
			if cluster_wide {
				ordered.push((index, manifest));
			} else {
				namespaced.push((index, manifest));
			}
		}

		ordered.extend(namespaced);
		ordered
	}

	/// Namespaces the desired resources live in.
	fn referenced_namespaces(&self) -> Vec<String> {
		let mut namespaces: BTreeSet<String> = self
			.resources
			.iter()
			.filter_map(|r| manifest_namespace(r).map(str::to_string))
			.collect();
		namespaces.insert(DEFAULT_NAMESPACE.to_string());
		namespaces.into_iter().collect()
	}

	/// Converge every desired resource, then optionally prune.
	///
	/// The first failing resource aborts the pass. Pruning only runs when
	/// every resource was applied.
	#[instrument(skip_all, fields(stack = %self.name, prune = prune))]
	pub async fn apply(
		&self,
		store: &Arc<dyn ResourceStore>,
		prune: bool,
	) -> Result<ApplyOutcome, StackError> {
		let mut outcome = ApplyOutcome::default();

		for (index, manifest) in self.ordered(store.as_ref()).await {
			let id = self.apply_one(store.as_ref(), index, manifest).await?;
			outcome.kept.insert(id);
		}

		if prune {
			outcome.pruned = self.prune(store, &outcome.kept).await?;
		}

		tracing::info!(
			applied = outcome.kept.len(),
			pruned = outcome.pruned.len(),
			"stack applied"
		);
		Ok(outcome)
	}

	async fn apply_one(
		&self,
		store: &dyn ResourceStore,
		index: usize,
		manifest: &serde_json::Value,
	) -> Result<ResourceId, StackError> {
		let invalid = || StackError::InvalidResource {
			stack: self.name.clone(),
			index,
		};
		let gvk = gvk_from_manifest(manifest).ok_or_else(invalid)?;
		let name = manifest
			.pointer("/metadata/name")
			.and_then(|n| n.as_str())
			.filter(|n| !n.is_empty())
			.ok_or_else(invalid)?;

		let resource = store.resolve(&gvk).await.map_err(|source| {
			self.resource_error(
				Phase::Apply,
				ResourceId::new(&gvk.kind, manifest_namespace(manifest), name),
				source,
			)
		})?;
		let namespace = resource.effective_namespace(manifest_namespace(manifest));
		let id = ResourceId::new(&gvk.kind, namespace.as_deref(), name);
		let fail = |source| self.resource_error(Phase::Apply, id.clone(), source);

		let labeled = labels::label(manifest, &self.name);
		let last_applied = labels::last_applied(&labeled);

		match store.get(&resource, namespace.as_deref(), name).await {
			Err(StoreError::NotFound) => {
				let mut doc = labeled;
				labels::set_last_applied(&mut doc, last_applied);
				let object = to_object(&doc).map_err(fail)?;
				store
					.create(&resource, namespace.as_deref(), &object)
					.await
					.map_err(fail)?;
				tracing::info!(resource = %id, "created");
			}
			Err(e) => return Err(fail(e)),
			Ok(live) => match labels::last_applied_of(&live) {
				None => {
					let mut doc = labeled;
					labels::set_last_applied(&mut doc, last_applied);
					let mut object = to_object(&doc).map_err(fail)?;
					object.metadata.resource_version = live.metadata.resource_version.clone();
					store
						.update(&resource, namespace.as_deref(), &object)
						.await
						.map_err(fail)?;
					tracing::info!(resource = %id, "replaced unmanaged object");
				}
				Some(base) => {
					let mut patch = merge_patch::create(&base, &labeled);
					if merge_patch::is_empty(&patch) {
						tracing::debug!(resource = %id, "unchanged");
					} else {
						labels::set_last_applied(&mut patch, last_applied);
						store
							.patch(&resource, namespace.as_deref(), name, &patch)
							.await
							.map_err(fail)?;
						tracing::info!(resource = %id, "patched");
					}
				}
			},
		}

		if is_crd(&gvk) {
			store.wait_established(name).await;
			store.invalidate_discovery();
		}

		Ok(id)
	}

	/// Delete live resources owned by this stack that are not in `kept`.
	#[instrument(skip_all, fields(stack = %self.name))]
	pub async fn prune(
		&self,
		store: &Arc<dyn ResourceStore>,
		kept: &BTreeSet<ResourceId>,
	) -> Result<Vec<ResourceId>, StackError> {
		let kinds = store
			.discover_kinds()
			.await
			.map_err(|source| StackError::Discovery {
				stack: self.name.clone(),
				source,
			})?;

		let scan = Arc::new(Scan {
			store: Arc::clone(store),
			stack: self.name.clone(),
			selector: labels::selector(&self.name),
			kept: kept.clone(),
			namespaces: OnceCell::new(),
			fallback_namespaces: self.referenced_namespaces(),
		});
		let semaphore = Arc::new(Semaphore::new(PRUNE_CONCURRENCY));
		let mut join_set = JoinSet::new();

		for resource in kinds {
			if !resource.is_prunable() || never_pruned(&resource) {
				continue;
			}
			let scan = Arc::clone(&scan);
			let semaphore = Arc::clone(&semaphore);
			join_set.spawn(async move {
				let Ok(_permit) = semaphore.acquire().await else {
					return Vec::new();
				};
				scan.candidates(resource).await
			});
		}

		let mut candidates = Vec::new();
		while let Some(result) = join_set.join_next().await {
			let found = result.map_err(|source| StackError::Task {
				stack: self.name.clone(),
				phase: Phase::Prune,
				source,
			})?;
			candidates.extend(found);
		}

		// Dependents before their prerequisites.
		candidates.sort_by_key(|c| c.resource.scope == ResourceScope::ClusterWide);

		let mut pruned = Vec::with_capacity(candidates.len());
		for candidate in candidates {
			match store
				.delete(
					&candidate.resource,
					candidate.namespace.as_deref(),
					&candidate.id.name,
				)
				.await
			{
				Ok(()) => tracing::info!(resource = %candidate.id, "pruned"),
				Err(e) if e.is_not_found_or_gone() => {
					tracing::debug!(resource = %candidate.id, "already deleted");
				}
				Err(source) => return Err(self.resource_error(Phase::Prune, candidate.id, source)),
			}
			pruned.push(candidate.id);
		}

		Ok(pruned)
	}

	fn resource_error(&self, phase: Phase, resource: ResourceId, source: StoreError) -> StackError {
		StackError::Resource {
			stack: self.name.clone(),
			phase,
			resource,
			source,
		}
	}
}

/// Shared, read-only state of one prune scan.
struct Scan {
	store: Arc<dyn ResourceStore>,
	stack: String,
	selector: String,
	kept: BTreeSet<ResourceId>,
	/// Resolved at most once, on the first forbidden cluster-wide listing.
	namespaces: OnceCell<Vec<String>>,
	fallback_namespaces: Vec<String>,
}

impl Scan {
	#[instrument(skip_all, fields(stack = %self.stack, kind = %resource.api_resource.kind))]
	async fn candidates(&self, resource: DiscoveredResource) -> Vec<Candidate> {
		let listed = match self.store.list(&resource, None, &self.selector).await {
			Ok(items) => items,
			Err(e) if e.is_forbidden() && resource.scope == ResourceScope::Namespaced => {
				tracing::debug!("cluster-wide list forbidden, listing per namespace");
				self.list_per_namespace(&resource).await
			}
			Err(e) => {
				tracing::warn!(error = %e, "skipping kind during prune");
				return Vec::new();
			}
		};

		listed
			.into_iter()
			.filter_map(|object| self.candidate(&resource, object))
			.collect()
	}

	async fn list_per_namespace(&self, resource: &DiscoveredResource) -> Vec<DynamicObject> {
		let namespaces = self
			.namespaces
			.get_or_init(|| self.observable_namespaces())
			.await;

		let mut items = Vec::new();
		for namespace in namespaces {
			match self
				.store
				.list(resource, Some(namespace), &self.selector)
				.await
			{
				Ok(found) => items.extend(found),
				Err(e) => tracing::debug!(namespace = %namespace, error = %e, "skipping namespace"),
			}
		}
		items
	}

	/// Every namespace we may list, or the ones the stack references if
	/// namespaces cannot be listed.
	async fn observable_namespaces(&self) -> Vec<String> {
		match self.list_namespaces().await {
			Ok(namespaces) => namespaces,
			Err(e) => {
				tracing::debug!(error = %e, "cannot list namespaces, using referenced ones");
				self.fallback_namespaces.clone()
			}
		}
	}

	async fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
		let namespaces = self
			.store
			.resolve(&GroupVersionKind::gvk("", "v1", "Namespace"))
			.await?;
		let items = self.store.list(&namespaces, None, "").await?;
		Ok(items.into_iter().filter_map(|ns| ns.metadata.name).collect())
	}

	fn candidate(&self, resource: &DiscoveredResource, object: DynamicObject) -> Option<Candidate> {
		if labels::stack_of(&object) != Some(self.stack.as_str()) {
			return None;
		}
		if object
			.metadata
			.owner_references
			.as_ref()
			.is_some_and(|refs| !refs.is_empty())
		{
			return None;
		}

		let name = object.metadata.name?;
		let namespace = resource.effective_namespace(object.metadata.namespace.as_deref());
		let id = ResourceId::new(&resource.api_resource.kind, namespace.as_deref(), name);
		if self.kept.contains(&id) {
			return None;
		}

		Some(Candidate {
			resource: resource.clone(),
			namespace,
			id,
		})
	}
}

fn manifest_namespace(manifest: &serde_json::Value) -> Option<&str> {
	manifest
		.pointer("/metadata/namespace")
		.and_then(|n| n.as_str())
		.filter(|n| !n.is_empty())
}

fn never_pruned(resource: &DiscoveredResource) -> bool {
	let api_version = resource.api_resource.api_version.as_str();
	let kind = resource.api_resource.kind.as_str();
	NEVER_PRUNED.contains(&(api_version, kind))
}

fn is_crd(gvk: &GroupVersionKind) -> bool {
	gvk.group == CRD_GROUP && gvk.kind == CRD_KIND
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use kube::discovery::verbs;
	use serde_json::json;

	use super::*;
	use crate::k8s::memory::MemoryStore;

	fn config_map(name: &str, namespace: &str, data: serde_json::Value) -> serde_json::Value {
		json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {"name": name, "namespace": namespace},
			"data": data,
		})
	}

	fn owned(mut manifest: serde_json::Value, stack: &str) -> serde_json::Value {
		manifest["metadata"]["labels"][labels::STACK_LABEL] = json!(stack);
		manifest
	}

	fn stores() -> (Arc<MemoryStore>, Arc<dyn ResourceStore>) {
		let memory = Arc::new(MemoryStore::new());
		let store: Arc<dyn ResourceStore> = memory.clone();
		(memory, store)
	}

	#[tokio::test]
	async fn test_apply_creates_labeled_resources() {
		let (memory, store) = stores();
		let stack = Stack::new("demo", vec![config_map("cm", "ns", json!({"k": "v"}))]);

		let outcome = stack.apply(&store, true).await.unwrap();
		assert_eq!(
			outcome.kept,
			BTreeSet::from([ResourceId::new("ConfigMap", Some("ns"), "cm")])
		);

		let live = memory.object("ConfigMap", Some("ns"), "cm").unwrap();
		assert_eq!(live["metadata"]["labels"][labels::STACK_LABEL], "demo");
		assert!(live["metadata"]["annotations"][labels::CHECKSUM_ANNOTATION].is_string());
		assert!(live["metadata"]["annotations"][labels::LAST_APPLIED_ANNOTATION].is_string());
	}

	#[tokio::test]
	async fn test_cluster_scoped_applied_before_namespaced() {
		let (memory, store) = stores();
		let stack = Stack::new(
			"demo",
			vec![
				config_map("cm", "ns", json!({})),
				json!({
					"apiVersion": "rbac.authorization.k8s.io/v1",
					"kind": "ClusterRoleBinding",
					"metadata": {"name": "crb"},
				}),
			],
		);

		stack.apply(&store, false).await.unwrap();

		let created: Vec<_> = memory
			.mutations()
			.into_iter()
			.map(|c| c.kind)
			.collect();
		assert_eq!(created, vec!["ClusterRoleBinding", "ConfigMap"]);
	}

	#[tokio::test]
	async fn test_order_follows_resolved_scope() {
		let (memory, store) = stores();
		let stack = Stack::new(
			"demo",
			vec![
				json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}}),
				json!({
					"apiVersion": "rbac.authorization.k8s.io/v1",
					"kind": "ClusterRoleBinding",
					"metadata": {"name": "crb", "namespace": "ignored"},
				}),
				json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "apps"}}),
			],
		);

		stack.apply(&store, false).await.unwrap();

		let created: Vec<_> = memory
			.mutations()
			.into_iter()
			.map(|c| c.kind)
			.collect();
		assert_eq!(created, vec!["ClusterRoleBinding", "Namespace", "ConfigMap"]);
	}

	#[tokio::test]
	async fn test_second_apply_is_a_no_op() {
		let (memory, store) = stores();
		let stack = Stack::new("demo", vec![config_map("cm", "ns", json!({"k": "v"}))]);

		stack.apply(&store, true).await.unwrap();
		let before = memory.object("ConfigMap", Some("ns"), "cm").unwrap();
		memory.clear_calls();

		stack.apply(&store, true).await.unwrap();
		assert!(memory.mutations().is_empty());
		assert_eq!(memory.object("ConfigMap", Some("ns"), "cm").unwrap(), before);
	}

	#[tokio::test]
	async fn test_changed_resource_is_patched() {
		let (memory, store) = stores();
		Stack::new("demo", vec![config_map("cm", "ns", json!({"a": "1", "b": "2"}))])
			.apply(&store, false)
			.await
			.unwrap();
		memory.clear_calls();

		Stack::new("demo", vec![config_map("cm", "ns", json!({"a": "changed"}))])
			.apply(&store, false)
			.await
			.unwrap();

		let verbs: Vec<_> = memory.mutations().into_iter().map(|c| c.verb).collect();
		assert_eq!(verbs, vec![verbs::PATCH]);
		let live = memory.object("ConfigMap", Some("ns"), "cm").unwrap();
		assert_eq!(live["data"], json!({"a": "changed"}));
	}

	#[tokio::test]
	async fn test_patch_replaces_arrays() {
		let (memory, store) = stores();
		let service = |ports: serde_json::Value| {
			json!({
				"apiVersion": "v1",
				"kind": "Service",
				"metadata": {"name": "svc", "namespace": "ns"},
				"spec": {"ports": ports},
			})
		};
		Stack::new("demo", vec![service(json!([{"port": 80}, {"port": 443}]))])
			.apply(&store, false)
			.await
			.unwrap();

		Stack::new("demo", vec![service(json!([{"port": 8080}]))])
			.apply(&store, false)
			.await
			.unwrap();

		let live = memory.object("Service", Some("ns"), "svc").unwrap();
		assert_eq!(live["spec"]["ports"], json!([{"port": 8080}]));
	}

	#[tokio::test]
	async fn test_unmanaged_object_is_overwritten() {
		let (memory, store) = stores();
		memory.insert(config_map("cm", "ns", json!({"manual": "edit"})));

		Stack::new("demo", vec![config_map("cm", "ns", json!({"k": "v"}))])
			.apply(&store, false)
			.await
			.unwrap();

		let verbs: Vec<_> = memory.mutations().into_iter().map(|c| c.verb).collect();
		assert_eq!(verbs, vec![verbs::UPDATE]);
		let live = memory.object("ConfigMap", Some("ns"), "cm").unwrap();
		assert_eq!(live["data"], json!({"k": "v"}));
	}

	#[tokio::test]
	async fn test_namespaced_without_namespace_goes_to_default() {
		let (memory, store) = stores();
		let manifest = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}});

		let outcome = Stack::new("demo", vec![manifest]).apply(&store, false).await.unwrap();
		assert!(outcome
			.kept
			.contains(&ResourceId::new("ConfigMap", Some("default"), "cm")));
		assert!(memory.object("ConfigMap", Some("default"), "cm").is_some());
	}

	#[tokio::test]
	async fn test_unknown_kind_aborts_pass() {
		let (memory, store) = stores();
		let stack = Stack::new(
			"demo",
			vec![
				json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}),
				config_map("cm", "ns", json!({})),
			],
		);

		let err = stack.apply(&store, true).await.unwrap_err();
		assert_matches!(
			err,
			StackError::Resource { phase: Phase::Apply, source: StoreError::UnknownKind { .. }, .. }
		);
		assert!(memory.mutations().is_empty());
	}

	#[tokio::test]
	async fn test_prune_deletes_only_unwanted_owned_resources() {
		let (memory, store) = stores();
		memory.insert(owned(config_map("stale", "ns", json!({})), "demo"));
		memory.insert(owned(config_map("other-stack", "ns", json!({})), "other"));
		memory.insert(config_map("unlabeled", "ns", json!({})));
		let mut with_owner = owned(config_map("child", "ns", json!({})), "demo");
		with_owner["metadata"]["ownerReferences"] = json!([{
			"apiVersion": "apps/v1",
			"kind": "ReplicaSet",
			"name": "rs",
			"uid": "1234",
		}]);
		memory.insert(with_owner);
		memory.insert(owned(
			json!({"apiVersion": "v1", "kind": "Endpoints", "metadata": {"name": "ep", "namespace": "ns"}}),
			"demo",
		));

		let outcome = Stack::new("demo", vec![config_map("keep", "ns", json!({}))])
			.apply(&store, true)
			.await
			.unwrap();

		assert_eq!(
			outcome.pruned,
			vec![ResourceId::new("ConfigMap", Some("ns"), "stale")]
		);
		let mut remaining = memory.names("ConfigMap");
		remaining.sort();
		assert_eq!(
			remaining,
			vec!["ns/child", "ns/keep", "ns/other-stack", "ns/unlabeled"]
		);
		assert_eq!(memory.names("Endpoints"), vec!["ns/ep"]);
	}

	#[tokio::test]
	async fn test_prune_deletes_namespaced_before_cluster_scoped() {
		let (memory, store) = stores();
		memory.insert(owned(
			json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": {"name": "cr"}}),
			"demo",
		));
		memory.insert(owned(config_map("cm", "ns", json!({})), "demo"));

		let outcome = Stack::empty("demo").apply(&store, true).await.unwrap();
		assert_eq!(
			outcome.pruned,
			vec![
				ResourceId::new("ConfigMap", Some("ns"), "cm"),
				ResourceId::new("ClusterRole", None, "cr"),
			]
		);
	}

	#[tokio::test]
	async fn test_prune_falls_back_to_namespace_listing() {
		let (memory, store) = stores();
		memory.insert(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "elsewhere"}}));
		memory.insert(owned(config_map("stale", "elsewhere", json!({})), "demo"));
		memory.forbid_cluster_wide_lists(true);

		let outcome = Stack::empty("demo").apply(&store, true).await.unwrap();
		assert_eq!(
			outcome.pruned,
			vec![ResourceId::new("ConfigMap", Some("elsewhere"), "stale")]
		);
	}

	#[tokio::test]
	async fn test_prune_falls_back_to_referenced_namespaces() {
		let (memory, store) = stores();
		memory.insert(owned(config_map("stale", "ns", json!({})), "demo"));
		memory.insert(owned(config_map("unseen", "hidden", json!({})), "demo"));
		memory.forbid_cluster_wide_lists(true);
		memory.forbid_namespace_list(true);

		let outcome = Stack::new("demo", vec![config_map("keep", "ns", json!({}))])
			.apply(&store, true)
			.await
			.unwrap();

		assert_eq!(
			outcome.pruned,
			vec![ResourceId::new("ConfigMap", Some("ns"), "stale")]
		);
		assert!(memory.object("ConfigMap", Some("hidden"), "unseen").is_some());
	}

	#[tokio::test]
	async fn test_discovery_failure_keeps_applied_resources() {
		let (memory, store) = stores();
		memory.fail_discovery(true);

		let err = Stack::new("demo", vec![config_map("cm", "ns", json!({}))])
			.apply(&store, true)
			.await
			.unwrap_err();

		assert_matches!(err, StackError::Discovery { .. });
		assert!(memory.object("ConfigMap", Some("ns"), "cm").is_some());
	}

	#[tokio::test]
	async fn test_store_error_aborts_pass() {
		let (memory, store) = stores();
		memory.fail_next(verbs::CREATE, 1);
		let stack = Stack::new(
			"demo",
			vec![config_map("a", "ns", json!({})), config_map("b", "ns", json!({}))],
		);

		let err = stack.apply(&store, true).await.unwrap_err();
		assert_matches!(
			err,
			StackError::Resource { phase: Phase::Apply, source: StoreError::Conflict(_), ref resource, .. }
				if resource.name == "a"
		);
		assert!(memory.object("ConfigMap", Some("ns"), "b").is_none());
	}

	#[tokio::test]
	async fn test_failed_scan_fails_prune() {
		let (memory, store) = stores();
		memory.insert(owned(config_map("old", "ns", json!({})), "demo"));
		memory.break_kind("Secret");

		let err = Stack::new("demo", vec![config_map("cm", "ns", json!({}))])
			.apply(&store, true)
			.await
			.unwrap_err();
		assert_matches!(err, StackError::Task { phase: Phase::Prune, .. });
		assert!(memory.object("ConfigMap", Some("ns"), "old").is_some());
	}
}
