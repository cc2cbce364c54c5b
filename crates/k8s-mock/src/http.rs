//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. Objects are kept in memory and support get, list (with label
//! selectors), create, replace, JSON merge patch and delete.

use std::{
	collections::BTreeMap,
	sync::{Arc, RwLock},
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	discovery::{DiscoveryMode, MockApiResource, MockDiscovery},
	helpers::{matches_selector, merge_patch},
};

/// Address of a stored object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectKey {
	/// `v1` for the core group, `group/version` otherwise.
	pub group_version: String,
	pub plural: String,
	pub namespace: Option<String>,
	pub name: String,
}

#[derive(Default)]
struct State {
	objects: BTreeMap<ObjectKey, Value>,
	resource_version: u64,
}

impl State {
	/// Stamp a fresh resourceVersion onto an object.
	fn stamp(&mut self, object: &mut Value) {
		self.resource_version += 1;
		object["metadata"]["resourceVersion"] = json!(self.resource_version.to_string());
	}
}

/// Type alias for the shared mutable object store.
type SharedState = Arc<RwLock<State>>;

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	#[builder(default)]
	discovery: MockDiscovery,
	/// Resources to serve as raw manifests. The server derives API paths from
	/// apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
	/// Answer 403 to listing namespaced kinds across all namespaces, like an
	/// API server with namespace-scoped RBAC.
	#[builder(default)]
	forbid_cluster_wide_lists: bool,
	/// Group versions (`group/version`) that are announced in the group list
	/// but answer 503 to discovery, like an aggregated API whose backend is
	/// down.
	#[builder(default)]
	unavailable_groups: Vec<String>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	discovery: Arc<MockDiscovery>,
	state: SharedState,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		let discovery = Arc::new(self.discovery);

		debug!(uri = %server.uri(), "Started mock K8s server");

		let state: SharedState = Arc::default();
		let running = RunningHttpMockK8sServer {
			server,
			discovery: Arc::clone(&discovery),
			state: Arc::clone(&state),
		};

		running.insert(json!({
			"apiVersion": "v1",
			"kind": "Namespace",
			"metadata": {
				"name": "default"
			}
		}));
		for manifest in self.resources {
			running.insert(manifest);
		}

		mount_version(&running.server).await;
		mount_discovery(
			&running.server,
			&discovery,
			self.discovery_mode,
			&self.unavailable_groups,
		)
		.await;
		mount_resources(
			&running.server,
			discovery,
			state,
			self.forbid_cluster_wide_lists,
		)
		.await;

		running
	}
}

/// Derive the storage key for a manifest using discovery data.
fn key_for_manifest(manifest: &Value, discovery: &MockDiscovery) -> Option<ObjectKey> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?;
	let namespace = manifest
		.pointer("/metadata/namespace")
		.and_then(Value::as_str);

	let resource = discovery.by_kind(api_version, kind)?;
	Some(ObjectKey {
		group_version: api_version.to_string(),
		plural: resource.name.clone(),
		namespace: resource
			.namespaced
			.then(|| namespace.unwrap_or("default").to_string()),
		name: name.to_string(),
	})
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Store an object directly, bypassing the HTTP API.
	///
	/// Panics if the manifest's kind is not part of the discovery data.
	pub fn insert(&self, mut manifest: Value) {
		let key = key_for_manifest(&manifest, &self.discovery)
			.unwrap_or_else(|| panic!("unknown kind for manifest {manifest}"));
		if let Some(namespace) = &key.namespace {
			manifest["metadata"]["namespace"] = json!(namespace);
		}
		trace!(?key, "Registered resource");
		let mut state = self.state.write().unwrap();
		state.stamp(&mut manifest);
		state.objects.insert(key, manifest);
	}

	/// A stored object.
	pub fn object(
		&self,
		group_version: &str,
		plural: &str,
		namespace: Option<&str>,
		name: &str,
	) -> Option<Value> {
		let key = ObjectKey {
			group_version: group_version.to_string(),
			plural: plural.to_string(),
			namespace: namespace.map(str::to_string),
			name: name.to_string(),
		};
		self.state.read().unwrap().objects.get(&key).cloned()
	}

	/// Names of stored objects of one resource type, as `namespace/name` or
	/// `name`, sorted.
	pub fn names(&self, group_version: &str, plural: &str) -> Vec<String> {
		self.state
			.read()
			.unwrap()
			.objects
			.keys()
			.filter(|k| k.group_version == group_version && k.plural == plural)
			.map(|k| match &k.namespace {
				Some(ns) => format!("{ns}/{}", k.name),
				None => k.name.clone(),
			})
			.collect()
	}

	/// Number of write requests (POST, PUT, PATCH, DELETE) received so far.
	pub async fn mutation_count(&self) -> usize {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.iter()
			.filter(|r| matches!(r.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE"))
			.count()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-08-13T00:00:00Z",
			"goVersion": "go1.22.5",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

fn aggregated_resource(r: &MockApiResource, group: &str, version: &str) -> Value {
	json!({
		"resource": r.name,
		"responseKind": {
			"group": group,
			"version": version,
			"kind": r.kind
		},
		"scope": if r.namespaced { "Namespaced" } else { "Cluster" },
		"verbs": r.verbs,
	})
}

fn legacy_resource(r: &MockApiResource) -> Value {
	json!({
		"name": r.name,
		"singularName": "",
		"namespaced": r.namespaced,
		"kind": r.kind,
		"verbs": r.verbs,
	})
}

async fn mount_discovery(
	server: &MockServer,
	discovery: &MockDiscovery,
	mode: DiscoveryMode,
	unavailable_groups: &[String],
) {
	let core_aggregated_resources: Vec<_> = discovery
		.core_resources
		.iter()
		.map(|r| aggregated_resource(r, "", "v1"))
		.collect();

	let aggregated_core_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": [{
			"metadata": {
				"name": ""
			},
			"versions": [{
				"version": "v1",
				"resources": core_aggregated_resources,
				"freshness": "Current"
			}]
		}]
	});

	let aggregated_groups: Vec<_> = discovery
		.group_resources
		.iter()
		.map(|(gv, rs)| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			let resources: Vec<_> = rs
				.iter()
				.map(|r| aggregated_resource(r, group, version))
				.collect();

			json!({
				"metadata": {
					"name": group
				},
				"versions": [{
					"version": version,
					"resources": resources,
					"freshness": "Current"
				}]
			})
		})
		.collect();

	let aggregated_apis_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": aggregated_groups
	});

	// The Content-Type must announce the aggregated format or clients will
	// not parse it as such.
	const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
		"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

	for (endpoint, body) in [("/api", aggregated_core_body), ("/apis", aggregated_apis_body)] {
		let response = match mode {
			// set_body_json would overwrite the Content-Type
			DiscoveryMode::Aggregated => ResponseTemplate::new(200).set_body_raw(
				serde_json::to_vec(&body).expect("serializing discovery JSON should never fail"),
				AGGREGATED_DISCOVERY_CONTENT_TYPE,
			),
			DiscoveryMode::Legacy => ResponseTemplate::new(406),
		};
		Mock::given(method("GET"))
			.and(path(endpoint))
			.and(header_regex("accept", "apidiscovery"))
			.respond_with(response)
			.mount(server)
			.await;
	}

	// Legacy discovery endpoints
	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<_> = discovery
		.group_resources
		.keys()
		.chain(unavailable_groups)
		.map(|gv| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	let core_resources: Vec<_> = discovery.core_resources.iter().map(legacy_resource).collect();
	Mock::given(method("GET"))
		.and(path("/api/v1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIResourceList",
			"apiVersion": "v1",
			"groupVersion": "v1",
			"resources": core_resources
		})))
		.mount(server)
		.await;

	for (gv, rs) in &discovery.group_resources {
		let resources: Vec<_> = rs.iter().map(legacy_resource).collect();
		Mock::given(method("GET"))
			.and(path(format!("/apis/{}", gv)))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIResourceList",
				"apiVersion": "v1",
				"groupVersion": gv,
				"resources": resources
			})))
			.mount(server)
			.await;
	}

	for gv in unavailable_groups {
		Mock::given(method("GET"))
			.and(path(format!("/apis/{gv}")))
			.respond_with(ResponseTemplate::new(503).set_body_json(json!({
				"kind": "Status",
				"apiVersion": "v1",
				"status": "Failure",
				"message": "the server is currently unable to handle the request",
				"reason": "ServiceUnavailable",
				"code": 503
			})))
			.mount(server)
			.await;
	}
}

/// A parsed resource URL.
#[derive(Debug, PartialEq, Eq)]
struct ResourcePath {
	group_version: String,
	plural: String,
	namespace: Option<String>,
	name: Option<String>,
}

impl ResourcePath {
	/// Parse a Kubernetes API path.
	///
	/// Examples:
	/// - `/api/v1/namespaces/default/configmaps/my-config`
	/// - `/apis/apps/v1/deployments` (list across namespaces)
	/// - `/api/v1/namespaces/my-ns` (the namespace object itself)
	fn parse(url_path: &str) -> Option<Self> {
		let segments: Vec<&str> = url_path.trim_matches('/').split('/').collect();
		let (group_version, rest) = match segments.as_slice() {
			["api", version, rest @ ..] => ((*version).to_string(), rest),
			["apis", group, version, rest @ ..] => (format!("{group}/{version}"), rest),
			_ => return None,
		};
		let (namespace, plural, name) = match rest {
			[plural] => (None, *plural, None),
			[plural, name] => (None, *plural, Some(*name)),
			["namespaces", namespace, plural] => (Some(*namespace), *plural, None),
			["namespaces", namespace, plural, name] => (Some(*namespace), *plural, Some(*name)),
			_ => return None,
		};
		Some(Self {
			group_version,
			plural: plural.to_string(),
			namespace: namespace.map(str::to_string),
			name: name.map(str::to_string),
		})
	}

	fn key(&self, resource: &MockApiResource, name: &str) -> ObjectKey {
		ObjectKey {
			group_version: self.group_version.clone(),
			plural: self.plural.clone(),
			namespace: if resource.namespaced {
				self.namespace.clone()
			} else {
				None
			},
			name: name.to_string(),
		}
	}
}

fn status(code: u16, reason: &str, message: impl Into<String>) -> ResponseTemplate {
	ResponseTemplate::new(code).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message.into(),
		"reason": reason,
		"code": code
	}))
}

fn not_found(key: &ObjectKey) -> ResponseTemplate {
	status(
		404,
		"NotFound",
		format!("{} \"{}\" not found", key.plural, key.name),
	)
}

struct Handler {
	discovery: Arc<MockDiscovery>,
	state: SharedState,
	forbid_cluster_wide_lists: bool,
}

impl Handler {
	fn handle(&self, req: &Request) -> ResponseTemplate {
		let Some(target) = ResourcePath::parse(req.url.path()) else {
			return status(404, "NotFound", "unknown path");
		};
		let Some(resource) = self
			.discovery
			.by_plural(&target.group_version, &target.plural)
		else {
			return status(404, "NotFound", "unknown resource type");
		};

		match (req.method.as_str(), target.name.as_deref()) {
			("GET", Some(name)) => self.get(&target.key(resource, name)),
			("GET", None) => self.list(req, &target, resource),
			("POST", None) => self.create(req, &target, resource),
			("PUT", Some(name)) => self.replace(req, &target.key(resource, name)),
			("PATCH", Some(name)) => self.patch(req, &target.key(resource, name)),
			("DELETE", Some(name)) => self.delete(&target.key(resource, name)),
			_ => status(405, "MethodNotAllowed", "method not allowed"),
		}
	}

	fn get(&self, key: &ObjectKey) -> ResponseTemplate {
		match self.state.read().unwrap().objects.get(key) {
			Some(object) => ResponseTemplate::new(200).set_body_json(object),
			None => not_found(key),
		}
	}

	fn list(
		&self,
		req: &Request,
		target: &ResourcePath,
		resource: &MockApiResource,
	) -> ResponseTemplate {
		if resource.namespaced && target.namespace.is_none() && self.forbid_cluster_wide_lists {
			return status(
				403,
				"Forbidden",
				format!("cannot list resource \"{}\" at the cluster scope", target.plural),
			);
		}
		let selector = req
			.url
			.query_pairs()
			.find(|(k, _)| k == "labelSelector")
			.map(|(_, v)| v.into_owned())
			.unwrap_or_default();

		let state = self.state.read().unwrap();
		let items: Vec<_> = state
			.objects
			.iter()
			.filter(|(k, _)| k.group_version == target.group_version && k.plural == target.plural)
			.filter(|(k, _)| target.namespace.is_none() || k.namespace == target.namespace)
			.filter(|(_, v)| matches_selector(v, &selector))
			.map(|(_, v)| v.clone())
			.collect();

		ResponseTemplate::new(200).set_body_json(json!({
			"kind": format!("{}List", resource.kind),
			"apiVersion": target.group_version,
			"metadata": {"resourceVersion": state.resource_version.to_string()},
			"items": items
		}))
	}

	fn create(
		&self,
		req: &Request,
		target: &ResourcePath,
		resource: &MockApiResource,
	) -> ResponseTemplate {
		let Ok(mut body) = serde_json::from_slice::<Value>(&req.body) else {
			return status(400, "BadRequest", "invalid JSON body");
		};
		let Some(name) = body.pointer("/metadata/name").and_then(Value::as_str) else {
			return status(422, "Invalid", "metadata.name is required");
		};
		let key = target.key(resource, name);
		if let Some(namespace) = &key.namespace {
			body["metadata"]["namespace"] = json!(namespace);
		}

		let mut state = self.state.write().unwrap();
		if state.objects.contains_key(&key) {
			return status(
				409,
				"AlreadyExists",
				format!("{} \"{}\" already exists", key.plural, key.name),
			);
		}
		if req.url.query().unwrap_or("").contains("dryRun") {
			return ResponseTemplate::new(201).set_body_json(body);
		}
		state.stamp(&mut body);
		state.objects.insert(key, body.clone());
		ResponseTemplate::new(201).set_body_json(body)
	}

	fn replace(&self, req: &Request, key: &ObjectKey) -> ResponseTemplate {
		let Ok(mut body) = serde_json::from_slice::<Value>(&req.body) else {
			return status(400, "BadRequest", "invalid JSON body");
		};
		let mut state = self.state.write().unwrap();
		let Some(existing) = state.objects.get(key) else {
			return not_found(key);
		};
		let expected = body.pointer("/metadata/resourceVersion").and_then(Value::as_str);
		let current = existing
			.pointer("/metadata/resourceVersion")
			.and_then(Value::as_str);
		if expected.is_some() && expected != current {
			return status(
				409,
				"Conflict",
				format!(
					"the object {} \"{}\" has been modified; please apply your changes to the latest version and try again",
					key.plural, key.name
				),
			);
		}
		if let Some(namespace) = &key.namespace {
			body["metadata"]["namespace"] = json!(namespace);
		}
		state.stamp(&mut body);
		state.objects.insert(key.clone(), body.clone());
		ResponseTemplate::new(200).set_body_json(body)
	}

	fn patch(&self, req: &Request, key: &ObjectKey) -> ResponseTemplate {
		let Ok(patch) = serde_json::from_slice::<Value>(&req.body) else {
			return status(400, "BadRequest", "invalid JSON body");
		};
		let mut state = self.state.write().unwrap();
		let Some(existing) = state.objects.get(key) else {
			return not_found(key);
		};
		let mut merged = merge_patch(existing.clone(), patch);
		merged["metadata"]["name"] = json!(key.name);
		if let Some(namespace) = &key.namespace {
			merged["metadata"]["namespace"] = json!(namespace);
		}
		state.stamp(&mut merged);
		state.objects.insert(key.clone(), merged.clone());
		ResponseTemplate::new(200).set_body_json(merged)
	}

	fn delete(&self, key: &ObjectKey) -> ResponseTemplate {
		match self.state.write().unwrap().objects.remove(key) {
			Some(object) => ResponseTemplate::new(200).set_body_json(object),
			None => not_found(key),
		}
	}
}

async fn mount_resources(
	server: &MockServer,
	discovery: Arc<MockDiscovery>,
	state: SharedState,
	forbid_cluster_wide_lists: bool,
) {
	let handler = Handler {
		discovery,
		state,
		forbid_cluster_wide_lists,
	};

	// Mounted after discovery, so the discovery mocks win for their paths.
	Mock::given(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| handler.handle(req))
		.mount(server)
		.await;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_resource_path() {
		assert_eq!(
			ResourcePath::parse("/api/v1/namespaces/default/configmaps/my-config"),
			Some(ResourcePath {
				group_version: "v1".into(),
				plural: "configmaps".into(),
				namespace: Some("default".into()),
				name: Some("my-config".into()),
			})
		);
		assert_eq!(
			ResourcePath::parse("/apis/apps/v1/deployments"),
			Some(ResourcePath {
				group_version: "apps/v1".into(),
				plural: "deployments".into(),
				namespace: None,
				name: None,
			})
		);
		assert_eq!(
			ResourcePath::parse("/api/v1/namespaces/my-ns"),
			Some(ResourcePath {
				group_version: "v1".into(),
				plural: "namespaces".into(),
				namespace: None,
				name: Some("my-ns".into()),
			})
		);
		assert_eq!(ResourcePath::parse("/apis/apps/v1"), None);
		assert_eq!(
			ResourcePath::parse("/api/v1/namespaces/default/pods/p/status"),
			None
		);
	}
}
