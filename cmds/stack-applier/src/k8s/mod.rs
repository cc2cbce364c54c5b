//! Kubernetes access for the stack applier.
//!
//! The apply/prune algorithm only talks to the cluster through the
//! [`store::ResourceStore`] trait. [`kube_store::KubeStore`] implements it on
//! top of kube-rs dynamic objects, [`memory::MemoryStore`] keeps everything
//! in process.

pub mod client;
pub mod discovery;
pub mod kube_store;
pub mod memory;
pub mod store;

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, ClusterRole).
	ClusterWide,
}

/// Namespace used for namespaced resources that don't specify one.
pub const DEFAULT_NAMESPACE: &str = "default";
