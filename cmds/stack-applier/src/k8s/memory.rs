//! In-process [`ResourceStore`].
//!
//! Keeps live objects in a map and records every call made against it, so
//! tests can assert on what reached the "cluster" and in which order.
//! Failures (forbidden listings, conflicts, discovery errors) can be injected.
//!
//! Not a faithful API server: no admission, no defaulting, no garbage
//! collection of dependents.

use std::{
	collections::{BTreeMap, HashMap},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Mutex, MutexGuard, PoisonError,
	},
};

use async_trait::async_trait;
use kube::{
	api::DynamicObject,
	core::GroupVersionKind,
	discovery::{verbs, ApiResource},
};

use super::{
	discovery::gvk_from_manifest,
	store::{to_object, DiscoveredResource, ResourceStore, StoreError},
	ResourceScope,
};
use crate::merge_patch;

/// (group, kind, namespace, name); the version is irrelevant for identity.
type ObjectKey = (String, String, String, String);

/// A single recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
	pub verb: &'static str,
	pub kind: String,
	pub namespace: Option<String>,
	pub name: String,
}

/// In-memory resource store.
pub struct MemoryStore {
	kinds: Mutex<Vec<DiscoveredResource>>,
	objects: Mutex<BTreeMap<ObjectKey, serde_json::Value>>,
	calls: Mutex<Vec<StoreCall>>,
	failures: Mutex<HashMap<&'static str, usize>>,
	resource_version: AtomicU64,
	forbid_cluster_wide_lists: AtomicBool,
	forbid_namespace_list: AtomicBool,
	fail_discovery: AtomicBool,
	broken_kinds: Mutex<Vec<String>>,
}

impl Default for MemoryStore {
	fn default() -> Self {
		let store = Self::empty();
		store.register_kind("", "v1", "ConfigMap", "configmaps", ResourceScope::Namespaced);
		store.register_kind("", "v1", "Secret", "secrets", ResourceScope::Namespaced);
		store.register_kind("", "v1", "Service", "services", ResourceScope::Namespaced);
		store.register_kind("", "v1", "Pod", "pods", ResourceScope::Namespaced);
		store.register_kind("", "v1", "Endpoints", "endpoints", ResourceScope::Namespaced);
		store.register_kind("", "v1", "Namespace", "namespaces", ResourceScope::ClusterWide);
		store.register_kind("apps", "v1", "Deployment", "deployments", ResourceScope::Namespaced);
		store.register_kind(
			"rbac.authorization.k8s.io",
			"v1",
			"ClusterRole",
			"clusterroles",
			ResourceScope::ClusterWide,
		);
		store.register_kind(
			"rbac.authorization.k8s.io",
			"v1",
			"ClusterRoleBinding",
			"clusterrolebindings",
			ResourceScope::ClusterWide,
		);
		store.register_kind(
			"apiextensions.k8s.io",
			"v1",
			"CustomResourceDefinition",
			"customresourcedefinitions",
			ResourceScope::ClusterWide,
		);
		store
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
	/// A store with the common built-in kinds registered.
	pub fn new() -> Self {
		Self::default()
	}

	/// A store that knows no kinds at all.
	pub fn empty() -> Self {
		Self {
			kinds: Mutex::new(Vec::new()),
			objects: Mutex::new(BTreeMap::new()),
			calls: Mutex::new(Vec::new()),
			failures: Mutex::new(HashMap::new()),
			resource_version: AtomicU64::new(1),
			forbid_cluster_wide_lists: AtomicBool::new(false),
			forbid_namespace_list: AtomicBool::new(false),
			fail_discovery: AtomicBool::new(false),
			broken_kinds: Mutex::new(Vec::new()),
		}
	}

	pub fn register_kind(
		&self,
		group: &str,
		version: &str,
		kind: &str,
		plural: &str,
		scope: ResourceScope,
	) {
		let gvk = GroupVersionKind::gvk(group, version, kind);
		let verbs = [
			verbs::CREATE,
			verbs::DELETE,
			verbs::GET,
			verbs::LIST,
			verbs::PATCH,
			verbs::UPDATE,
			verbs::WATCH,
		];
		lock(&self.kinds).push(DiscoveredResource {
			api_resource: ApiResource::from_gvk_with_plural(&gvk, plural),
			scope,
			verbs: verbs.iter().map(|v| (*v).to_string()).collect(),
		});
	}

	/// Seed a live object, bypassing call recording.
	///
	/// Panics if the manifest's kind is not registered.
	pub fn insert(&self, mut manifest: serde_json::Value) {
		let gvk = gvk_from_manifest(&manifest).expect("manifest has apiVersion and kind");
		let resource = self.find_kind(&gvk).expect("kind is registered");
		let namespace = resource.effective_namespace(
			manifest
				.pointer("/metadata/namespace")
				.and_then(|v| v.as_str()),
		);
		if let Some(ns) = &namespace {
			manifest["metadata"]["namespace"] = serde_json::Value::String(ns.clone());
		}
		let name = manifest
			.pointer("/metadata/name")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();
		let key = Self::key(&resource, namespace.as_deref(), &name);
		lock(&self.objects).insert(key, manifest);
	}

	/// Current state of a live object.
	pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<serde_json::Value> {
		lock(&self.objects)
			.iter()
			.find(|((_, k, ns, n), _)| {
				k == kind && n == name && ns.as_str() == namespace.unwrap_or_default()
			})
			.map(|(_, v)| v.clone())
	}

	/// Names of all live objects of a kind, as `namespace/name` (or `name`).
	pub fn names(&self, kind: &str) -> Vec<String> {
		lock(&self.objects)
			.keys()
			.filter(|(_, k, _, _)| k == kind)
			.map(|(_, _, ns, name)| {
				if ns.is_empty() {
					name.clone()
				} else {
					format!("{ns}/{name}")
				}
			})
			.collect()
	}

	/// Every call made so far, in order.
	pub fn calls(&self) -> Vec<StoreCall> {
		lock(&self.calls).clone()
	}

	/// Calls that change cluster state.
	pub fn mutations(&self) -> Vec<StoreCall> {
		self.calls()
			.into_iter()
			.filter(|c| {
				matches!(
					c.verb,
					verbs::CREATE | verbs::UPDATE | verbs::PATCH | verbs::DELETE
				)
			})
			.collect()
	}

	pub fn clear_calls(&self) {
		lock(&self.calls).clear();
	}

	/// Deny listing namespaced kinds across all namespaces.
	pub fn forbid_cluster_wide_lists(&self, forbid: bool) {
		self.forbid_cluster_wide_lists
			.store(forbid, Ordering::SeqCst);
	}

	/// Deny listing namespaces.
	pub fn forbid_namespace_list(&self, forbid: bool) {
		self.forbid_namespace_list.store(forbid, Ordering::SeqCst);
	}

	pub fn fail_discovery(&self, fail: bool) {
		self.fail_discovery.store(fail, Ordering::SeqCst);
	}

	/// Make the next `times` calls of `verb` fail with a conflict.
	pub fn fail_next(&self, verb: &'static str, times: usize) {
		lock(&self.failures).insert(verb, times);
	}

	/// Make every call touching `kind` panic, as a buggy store would.
	pub fn break_kind(&self, kind: &str) {
		lock(&self.broken_kinds).push(kind.to_string());
	}

	fn record(
		&self,
		verb: &'static str,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
	) -> Result<(), StoreError> {
		lock(&self.calls).push(StoreCall {
			verb,
			kind: resource.api_resource.kind.clone(),
			namespace: namespace.map(str::to_string),
			name: name.to_string(),
		});
		if lock(&self.broken_kinds).contains(&resource.api_resource.kind) {
			panic!("{verb} {} is broken", resource.api_resource.kind);
		}

		let mut failures = lock(&self.failures);
		if let Some(remaining) = failures.get_mut(verb) {
			if *remaining > 0 {
				*remaining -= 1;
				return Err(StoreError::Conflict(format!("injected {verb} failure")));
			}
		}
		Ok(())
	}

	fn find_kind(&self, gvk: &GroupVersionKind) -> Option<DiscoveredResource> {
		lock(&self.kinds)
			.iter()
			.find(|r| r.gvk() == *gvk)
			.cloned()
	}

	fn key(resource: &DiscoveredResource, namespace: Option<&str>, name: &str) -> ObjectKey {
		(
			resource.api_resource.group.clone(),
			resource.api_resource.kind.clone(),
			namespace.unwrap_or_default().to_string(),
			name.to_string(),
		)
	}

	fn next_version(&self) -> String {
		self.resource_version
			.fetch_add(1, Ordering::SeqCst)
			.to_string()
	}

	fn store_object(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		object: &DynamicObject,
		must_exist: bool,
	) -> Result<DynamicObject, StoreError> {
		let name = object.metadata.name.clone().unwrap_or_default();
		let key = Self::key(resource, namespace, &name);

		let mut object = object.clone();
		object.metadata.namespace = namespace.map(str::to_string);
		object.metadata.resource_version = Some(self.next_version());
		let value = serde_json::to_value(&object).map_err(StoreError::Serialization)?;

		let mut objects = lock(&self.objects);
		match (objects.contains_key(&key), must_exist) {
			(false, true) => return Err(StoreError::NotFound),
			(true, false) => {
				return Err(StoreError::Conflict(format!("{name} already exists")));
			}
			_ => {}
		}
		objects.insert(key, value);
		Ok(object)
	}
}

/// Equality-based label selector matching (`a=b,c=d`).
fn matches_selector(labels: Option<&serde_json::Value>, selector: &str) -> bool {
	selector
		.split(',')
		.filter(|term| !term.is_empty())
		.all(|term| {
			let (key, value) = term.split_once('=').unwrap_or((term, ""));
			labels
				.and_then(|l| l.get(key))
				.and_then(|v| v.as_str())
				== Some(value)
		})
}

#[async_trait]
impl ResourceStore for MemoryStore {
	async fn resolve(&self, gvk: &GroupVersionKind) -> Result<DiscoveredResource, StoreError> {
		self.find_kind(gvk).ok_or_else(|| StoreError::UnknownKind {
			api_version: gvk.api_version(),
			kind: gvk.kind.clone(),
		})
	}

	async fn discover_kinds(&self) -> Result<Vec<DiscoveredResource>, StoreError> {
		if self.fail_discovery.load(Ordering::SeqCst) {
			return Err(StoreError::Api {
				code: 503,
				message: "discovery unavailable".to_string(),
			});
		}
		Ok(lock(&self.kinds).clone())
	}

	async fn get(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
	) -> Result<DynamicObject, StoreError> {
		let namespace = resource.effective_namespace(namespace);
		self.record(verbs::GET, resource, namespace.as_deref(), name)?;
		let key = Self::key(resource, namespace.as_deref(), name);
		let value = lock(&self.objects)
			.get(&key)
			.cloned()
			.ok_or(StoreError::NotFound)?;
		to_object(&value)
	}

	async fn create(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		object: &DynamicObject,
	) -> Result<DynamicObject, StoreError> {
		let namespace = resource.effective_namespace(namespace);
		let name = object.metadata.name.clone().unwrap_or_default();
		self.record(verbs::CREATE, resource, namespace.as_deref(), &name)?;
		self.store_object(resource, namespace.as_deref(), object, false)
	}

	async fn update(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		object: &DynamicObject,
	) -> Result<DynamicObject, StoreError> {
		let namespace = resource.effective_namespace(namespace);
		let name = object.metadata.name.clone().unwrap_or_default();
		self.record(verbs::UPDATE, resource, namespace.as_deref(), &name)?;
		self.store_object(resource, namespace.as_deref(), object, true)
	}

	async fn patch(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
		patch: &serde_json::Value,
	) -> Result<DynamicObject, StoreError> {
		let namespace = resource.effective_namespace(namespace);
		self.record(verbs::PATCH, resource, namespace.as_deref(), name)?;
		let key = Self::key(resource, namespace.as_deref(), name);

		let mut objects = lock(&self.objects);
		let current = objects.get(&key).cloned().ok_or(StoreError::NotFound)?;
		let mut patched = merge_patch::apply(current, patch);
		patched["metadata"]["resourceVersion"] = serde_json::Value::String(self.next_version());
		objects.insert(key, patched.clone());
		to_object(&patched)
	}

	async fn delete(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
	) -> Result<(), StoreError> {
		let namespace = resource.effective_namespace(namespace);
		self.record(verbs::DELETE, resource, namespace.as_deref(), name)?;
		let key = Self::key(resource, namespace.as_deref(), name);
		lock(&self.objects)
			.remove(&key)
			.map(|_| ())
			.ok_or(StoreError::NotFound)
	}

	async fn list(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		label_selector: &str,
	) -> Result<Vec<DynamicObject>, StoreError> {
		self.record(verbs::LIST, resource, namespace, "")?;

		let namespaced = resource.scope == ResourceScope::Namespaced;
		if namespaced
			&& namespace.is_none()
			&& self.forbid_cluster_wide_lists.load(Ordering::SeqCst)
		{
			return Err(StoreError::Forbidden(format!(
				"cannot list {} at the cluster scope",
				resource.api_resource.plural
			)));
		}
		if resource.api_resource.kind == "Namespace"
			&& self.forbid_namespace_list.load(Ordering::SeqCst)
		{
			return Err(StoreError::Forbidden("cannot list namespaces".to_string()));
		}

		lock(&self.objects)
			.iter()
			.filter(|((group, kind, ns, _), _)| {
				*group == resource.api_resource.group
					&& *kind == resource.api_resource.kind
					&& (!namespaced || namespace.is_none_or(|want| want == ns))
			})
			.filter(|(_, v)| matches_selector(v.pointer("/metadata/labels"), label_selector))
			.map(|(_, v)| to_object(v))
			.collect()
	}
}
