//! Configuration file support.
//!
//! All keys are optional; a missing file section falls back to defaults.
//! Command-line flags are applied on top with [`ManagerConfig::apply_overrides`].

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::leaderelection::LeaseConfig;

pub const DEFAULT_MANIFESTS_DIR: &str = "/var/lib/stack-applier/manifests";

/// Shortest period between sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file: {}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file: {}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("invalid config file {}: {field} {reason}", path.display())]
	Invalid {
		path: PathBuf,
		field: &'static str,
		reason: &'static str,
	},
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
	/// Directory holding one subdirectory per stack.
	pub manifests_dir: PathBuf,

	/// Stack directories that are managed elsewhere.
	pub ignored_stacks: Vec<String>,

	/// Quiet period before a burst of file changes triggers an apply.
	pub debounce_millis: u64,

	pub retry: RetryConfig,

	/// Period of the unconditional re-apply of every stack.
	pub sweep_interval_secs: u64,

	pub leader_election: LeaderElectionConfig,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			manifests_dir: PathBuf::from(DEFAULT_MANIFESTS_DIR),
			ignored_stacks: Vec::new(),
			debounce_millis: 1000,
			retry: RetryConfig::default(),
			sweep_interval_secs: 600,
			leader_election: LeaderElectionConfig::default(),
		}
	}
}

/// Bounded retry of a failed apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
	pub attempts: u32,
	pub initial_backoff_millis: u64,
	pub max_backoff_millis: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			attempts: 10,
			initial_backoff_millis: 100,
			max_backoff_millis: 10_000,
		}
	}
}

impl RetryConfig {
	/// Delay after the given failed attempt (0-based), doubling up to the cap.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
		let millis = self
			.initial_backoff_millis
			.saturating_mul(factor)
			.min(self.max_backoff_millis);
		Duration::from_millis(millis)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionConfig {
	/// When disabled this replica always leads.
	pub enabled: bool,
	pub namespace: String,
	pub lease_name: String,
	/// Defaults to the hostname.
	pub identity: Option<String>,
	pub lease_duration_secs: u64,
	pub renew_deadline_secs: u64,
	pub retry_period_secs: u64,
}

impl Default for LeaderElectionConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			namespace: "kube-system".to_string(),
			lease_name: "stack-applier".to_string(),
			identity: None,
			lease_duration_secs: 60,
			renew_deadline_secs: 15,
			retry_period_secs: 5,
		}
	}
}

impl LeaderElectionConfig {
	pub fn lease_config(&self) -> LeaseConfig {
		LeaseConfig {
			namespace: self.namespace.clone(),
			name: self.lease_name.clone(),
			identity: self.identity.clone().unwrap_or_else(hostname),
			lease_duration: Duration::from_secs(self.lease_duration_secs),
			renew_deadline: Duration::from_secs(self.renew_deadline_secs),
			retry_period: Duration::from_secs(self.retry_period_secs),
		}
	}
}

/// Best-effort hostname of this machine.
fn hostname() -> String {
	std::env::var("HOSTNAME")
		.ok()
		.or_else(|| fs::read_to_string("/etc/hostname").ok())
		.map(|h| h.trim().to_string())
		.filter(|h| !h.is_empty())
		.unwrap_or_else(|| format!("stack-applier-{}", std::process::id()))
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub manifests_dir: Option<PathBuf>,
	pub ignored_stacks: Vec<String>,
	pub no_leader_election: bool,
}

impl ManagerConfig {
	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::parse(&content, path)
	}

	fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
		// An empty file is a valid, all-defaults config.
		if content.trim().is_empty() {
			return Ok(Self::default());
		}
		let config: Self = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})?;
		config.validate(path)?;
		Ok(config)
	}

	fn validate(&self, path: &Path) -> Result<(), ConfigError> {
		let invalid = |field: &'static str, reason: &'static str| ConfigError::Invalid {
			path: path.to_path_buf(),
			field,
			reason,
		};
		if self.sweep_interval_secs == 0 {
			return Err(invalid("sweepIntervalSecs", "must be at least 1"));
		}
		if self.retry.attempts == 0 {
			return Err(invalid("retry.attempts", "must be at least 1"));
		}
		if self.retry.max_backoff_millis < self.retry.initial_backoff_millis {
			return Err(invalid(
				"retry.maxBackoffMillis",
				"must not be below retry.initialBackoffMillis",
			));
		}
		Ok(())
	}

	/// Apply command-line values over file values.
	pub fn apply_overrides(&mut self, overrides: &Overrides) {
		if let Some(dir) = &overrides.manifests_dir {
			self.manifests_dir = dir.clone();
		}
		for stack in &overrides.ignored_stacks {
			if !self.ignored_stacks.contains(stack) {
				self.ignored_stacks.push(stack.clone());
			}
		}
		if overrides.no_leader_election {
			self.leader_election.enabled = false;
		}
	}

	pub fn debounce(&self) -> Duration {
		Duration::from_millis(self.debounce_millis)
	}

	/// Never shorter than one second, whatever was configured.
	pub fn sweep_interval(&self) -> Duration {
		Duration::from_secs(self.sweep_interval_secs).max(MIN_SWEEP_INTERVAL)
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;
	use rstest::rstest;
	use tempfile::NamedTempFile;

	use super::*;

	#[test]
	fn test_defaults() {
		let config = ManagerConfig::default();
		assert_eq!(config.manifests_dir, PathBuf::from(DEFAULT_MANIFESTS_DIR));
		assert_eq!(config.debounce(), Duration::from_secs(1));
		assert_eq!(config.sweep_interval(), Duration::from_secs(600));
		assert!(config.leader_election.enabled);
		assert_eq!(config.retry.attempts, 10);
	}

	#[test]
	fn test_partial_file_keeps_defaults() {
		let content = indoc! {"
			manifestsDir: /srv/stacks
			ignoredStacks: [bootstraprbac]
			retry:
			  attempts: 3
			leaderElection:
			  enabled: false
		"};

		let config = ManagerConfig::parse(content, Path::new("config.yaml")).unwrap();
		assert_eq!(config.manifests_dir, PathBuf::from("/srv/stacks"));
		assert_eq!(config.ignored_stacks, vec!["bootstraprbac"]);
		assert_eq!(config.retry.attempts, 3);
		assert_eq!(config.retry.initial_backoff_millis, 100);
		assert!(!config.leader_election.enabled);
		assert_eq!(config.leader_election.namespace, "kube-system");
	}

	#[test]
	fn test_load_from_file() {
		let file = NamedTempFile::new().unwrap();
		fs::write(file.path(), "debounceMillis: 250\n").unwrap();

		let config = ManagerConfig::load_from_file(file.path()).unwrap();
		assert_eq!(config.debounce(), Duration::from_millis(250));
	}

	#[test]
	fn test_load_missing_file() {
		let result = ManagerConfig::load_from_file(Path::new("/nonexistent/config.yaml"));
		assert_matches!(result, Err(ConfigError::Read { .. }));
	}

	#[test]
	fn test_unknown_type_is_parse_error() {
		let result = ManagerConfig::parse("retry: nope\n", Path::new("config.yaml"));
		assert_matches!(result, Err(ConfigError::Parse { .. }));
	}

	#[test]
	fn test_overrides() {
		let mut config = ManagerConfig {
			ignored_stacks: vec!["a".into()],
			..Default::default()
		};
		config.apply_overrides(&Overrides {
			manifests_dir: Some("/tmp/m".into()),
			ignored_stacks: vec!["a".into(), "b".into()],
			no_leader_election: true,
		});

		assert_eq!(config.manifests_dir, PathBuf::from("/tmp/m"));
		assert_eq!(config.ignored_stacks, vec!["a", "b"]);
		assert!(!config.leader_election.enabled);
	}

	#[rstest]
	#[case::no_sweep("sweepIntervalSecs: 0\n", "sweepIntervalSecs")]
	#[case::no_attempts("retry:\n  attempts: 0\n", "retry.attempts")]
	#[case::inverted_backoff(
		"retry:\n  initialBackoffMillis: 500\n  maxBackoffMillis: 100\n",
		"retry.maxBackoffMillis"
	)]
	fn test_invalid_values_are_rejected(#[case] content: &str, #[case] expected: &str) {
		let result = ManagerConfig::parse(content, Path::new("config.yaml"));
		assert_matches!(result, Err(ConfigError::Invalid { field, .. }) if field == expected);
	}

	#[test]
	fn test_sweep_interval_has_a_floor() {
		let config = ManagerConfig {
			sweep_interval_secs: 0,
			..Default::default()
		};
		assert_eq!(config.sweep_interval(), Duration::from_secs(1));
	}

	#[rstest]
	#[case(0, 100)]
	#[case(1, 200)]
	#[case(3, 800)]
	#[case(7, 10_000)]
	#[case(80, 10_000)]
	fn test_backoff(#[case] attempt: u32, #[case] millis: u64) {
		assert_eq!(
			RetryConfig::default().backoff(attempt),
			Duration::from_millis(millis)
		);
	}
}
