//! [`ResourceStore`] backed by a live API server.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
	api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
	core::GroupVersionKind,
	runtime::wait::{await_condition, conditions},
	Client,
};
use tracing::instrument;

use super::{
	discovery::{resolve_pinned, ApiResourceCache},
	store::{DiscoveredResource, ResourceStore, StoreError},
};

/// How long to wait for a CRD to become established before moving on.
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Resource store talking to Kubernetes through kube-rs dynamic APIs.
#[derive(Clone)]
pub struct KubeStore {
	client: Client,
	cache: Arc<ArcSwapOption<ApiResourceCache>>,
}

impl KubeStore {
	pub fn new(client: Client) -> Self {
		Self {
			client,
			cache: Arc::new(ArcSwapOption::const_empty()),
		}
	}

	pub fn client(&self) -> &Client {
		&self.client
	}

	async fn cache(&self) -> Result<Arc<ApiResourceCache>, StoreError> {
		if let Some(cache) = self.cache.load_full() {
			return Ok(cache);
		}
		let cache = Arc::new(
			ApiResourceCache::build(&self.client)
				.await
				.map_err(|e| StoreError::Discovery(Box::new(e)))?,
		);
		self.cache.store(Some(Arc::clone(&cache)));
		Ok(cache)
	}

	/// Create a dynamic API for the given resource.
	fn dynamic_api(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
	) -> Api<DynamicObject> {
		match resource.effective_namespace(namespace) {
			Some(ns) => Api::namespaced_with(self.client.clone(), &ns, &resource.api_resource),
			None => Api::all_with(self.client.clone(), &resource.api_resource),
		}
	}
}

#[async_trait]
impl ResourceStore for KubeStore {
	#[instrument(skip(self), fields(api_version = %gvk.api_version(), kind = %gvk.kind))]
	async fn resolve(&self, gvk: &GroupVersionKind) -> Result<DiscoveredResource, StoreError> {
		if let Some(found) = self.cache().await?.lookup(gvk) {
			return Ok(found.clone());
		}

		// The kind may belong to a CRD applied after the cache was built.
		// Ask the server once before giving up.
		self.invalidate_discovery();
		resolve_pinned(&self.client, gvk).await.map_err(|e| {
			tracing::debug!(error = %e, "kind not found on server");
			StoreError::UnknownKind {
				api_version: gvk.api_version(),
				kind: gvk.kind.clone(),
			}
		})
	}

	#[instrument(skip(self))]
	async fn discover_kinds(&self) -> Result<Vec<DiscoveredResource>, StoreError> {
		// Pruning needs the full, current picture of the server.
		self.invalidate_discovery();
		Ok(self.cache().await?.preferred().to_vec())
	}

	async fn get(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
	) -> Result<DynamicObject, StoreError> {
		Ok(self.dynamic_api(resource, namespace).get(name).await?)
	}

	async fn create(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		object: &DynamicObject,
	) -> Result<DynamicObject, StoreError> {
		Ok(self
			.dynamic_api(resource, namespace)
			.create(&PostParams::default(), object)
			.await?)
	}

	async fn update(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		object: &DynamicObject,
	) -> Result<DynamicObject, StoreError> {
		let name = object.metadata.name.as_deref().unwrap_or_default();
		Ok(self
			.dynamic_api(resource, namespace)
			.replace(name, &PostParams::default(), object)
			.await?)
	}

	async fn patch(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
		patch: &serde_json::Value,
	) -> Result<DynamicObject, StoreError> {
		Ok(self
			.dynamic_api(resource, namespace)
			.patch(name, &PatchParams::default(), &Patch::Merge(patch))
			.await?)
	}

	async fn delete(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		name: &str,
	) -> Result<(), StoreError> {
		self.dynamic_api(resource, namespace)
			.delete(name, &DeleteParams::foreground())
			.await?;
		Ok(())
	}

	async fn list(
		&self,
		resource: &DiscoveredResource,
		namespace: Option<&str>,
		label_selector: &str,
	) -> Result<Vec<DynamicObject>, StoreError> {
		let api = match namespace {
			Some(_) => self.dynamic_api(resource, namespace),
			None => Api::all_with(self.client.clone(), &resource.api_resource),
		};
		let list = api
			.list(&ListParams::default().labels(label_selector))
			.await?;
		Ok(list.items)
	}

	#[instrument(skip(self))]
	async fn wait_established(&self, crd_name: &str) {
		let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
		let established = await_condition(api, crd_name, conditions::is_crd_established());
		match tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, established).await {
			Ok(Ok(_)) => tracing::debug!("CRD established"),
			Ok(Err(e)) => tracing::debug!(error = %e, "waiting for CRD failed"),
			Err(_) => tracing::debug!("timed out waiting for CRD"),
		}
	}

	fn invalidate_discovery(&self) {
		self.cache.store(None);
	}
}
