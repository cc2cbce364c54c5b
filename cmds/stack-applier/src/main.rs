use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use stack_applier::{
	config::{ManagerConfig, Overrides},
	k8s::{client::ClusterConnection, kube_store::KubeStore, store::ResourceStore},
	leaderelection::{LeaderElector, LeasePool, LocalLeader},
	manager::Manager,
	telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "stack-applier")]
#[command(about = "Converge manifest stacks on disk onto a Kubernetes cluster", long_about = None)]
#[command(version)]
struct Cli {
	/// Configuration file (YAML)
	#[arg(long)]
	config: Option<PathBuf>,

	/// Directory containing one subdirectory per stack
	#[arg(long)]
	manifests_dir: Option<PathBuf>,

	/// Stack directory to leave alone (repeatable)
	#[arg(long = "ignore-stack", value_name = "NAME")]
	ignored_stacks: Vec<String>,

	/// Always act as leader instead of competing for a Lease
	#[arg(long)]
	no_leader_election: bool,

	/// kubeconfig context to use instead of the inferred configuration
	#[arg(long)]
	kube_context: Option<String>,

	/// Log level (overrides RUST_LOG)
	#[arg(long)]
	log_level: Option<Level>,
}

impl Cli {
	fn load_config(&self) -> Result<ManagerConfig> {
		let mut config = match &self.config {
			Some(path) => ManagerConfig::load_from_file(path)?,
			None => ManagerConfig::default(),
		};
		config.apply_overrides(&Overrides {
			manifests_dir: self.manifests_dir.clone(),
			ignored_stacks: self.ignored_stacks.clone(),
			no_leader_election: self.no_leader_election,
		});
		Ok(config)
	}
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(e) => {
				tracing::warn!(error = %e, "cannot listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		() = terminate => {}
	}
	tracing::info!("shutting down");
	cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let _telemetry = telemetry::init(cli.log_level)?;
	let config = cli.load_config()?;

	let connection = ClusterConnection::connect(cli.kube_context.as_deref())
		.await
		.context("connecting to the cluster")?;
	let client = connection.client().clone();
	let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));

	let cancel = CancellationToken::new();
	tokio::spawn(shutdown_signal(cancel.clone()));

	let (leader, election): (Arc<dyn LeaderElector>, _) = if config.leader_election.enabled {
		let pool = Arc::new(
			LeasePool::new(client, config.leader_election.lease_config())
				.context("configuring leader election")?,
		);
		let election = tokio::spawn({
			let pool = Arc::clone(&pool);
			let cancel = cancel.clone();
			async move { pool.run(cancel).await }
		});
		(pool, Some(election))
	} else {
		tracing::info!("leader election disabled");
		(Arc::new(LocalLeader::leading()), None)
	};

	let manager = Manager::builder()
		.config(config)
		.store(store)
		.leader(leader)
		.build();
	let result = manager.run(cancel.clone()).await;

	// Give up the lease even if the manager failed.
	cancel.cancel();
	if let Some(election) = election {
		election.await.context("leader election task")?;
	}
	result
}
