//! Reading stacks from disk.
//!
//! A stack is a directory under the manifests root. Its desired resources are
//! the YAML documents of the `*.yaml`/`*.yml` files directly inside it.
//! Symlinked directories and files are followed; dangling links are skipped.

use std::{
	fs, io,
	path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum ManifestError {
	#[error("reading directory {}", path.display())]
	ReadDir {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("reading {}", path.display())]
	ReadFile {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("parsing {}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},
}

/// Whether `path` names a manifest file.
pub fn is_manifest_file(path: &Path) -> bool {
	matches!(
		path.extension().and_then(|e| e.to_str()),
		Some("yaml" | "yml")
	)
}

/// Entries of `dir` whose (followed) target satisfies `keep`, sorted by path.
fn entries_where(
	dir: &Path,
	keep: impl Fn(&fs::Metadata) -> bool,
) -> Result<Vec<PathBuf>, ManifestError> {
	let read_dir = fs::read_dir(dir).map_err(|source| ManifestError::ReadDir {
		path: dir.to_path_buf(),
		source,
	})?;

	let mut paths = Vec::new();
	for entry in read_dir {
		let entry = entry.map_err(|source| ManifestError::ReadDir {
			path: dir.to_path_buf(),
			source,
		})?;
		let path = entry.path();
		match fs::metadata(&path) {
			Ok(meta) if keep(&meta) => paths.push(path),
			Ok(_) => {}
			Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping unresolvable entry"),
		}
	}
	paths.sort();
	Ok(paths)
}

/// Stack directories directly under `root`, as (name, path) pairs.
///
/// Hidden directories are not stacks.
pub fn find_stack_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>, ManifestError> {
	Ok(entries_where(root, fs::Metadata::is_dir)?
		.into_iter()
		.filter_map(|path| {
			let name = path.file_name()?.to_str()?.to_string();
			(!name.starts_with('.')).then_some((name, path))
		})
		.collect())
}

/// Manifest files directly inside a stack directory.
pub fn find_manifest_files(dir: &Path) -> Result<Vec<PathBuf>, ManifestError> {
	Ok(entries_where(dir, fs::Metadata::is_file)?
		.into_iter()
		.filter(|path| is_manifest_file(path))
		.collect())
}

/// Parse a multi-document YAML stream into resource documents.
///
/// Empty documents and documents without `apiVersion`/`kind` are dropped.
/// `*List` documents are flattened into their items.
pub fn parse_documents(content: &str, path: &Path) -> Result<Vec<serde_json::Value>, ManifestError> {
	let mut out = Vec::new();
	for document in serde_yaml::Deserializer::from_str(content) {
		let value = serde_json::Value::deserialize(document).map_err(|source| ManifestError::Parse {
			path: path.to_path_buf(),
			source,
		})?;
		collect_resources(value, &mut out);
	}
	Ok(out)
}

fn collect_resources(value: serde_json::Value, out: &mut Vec<serde_json::Value>) {
	let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
	let has_api_version = value
		.get("apiVersion")
		.and_then(|v| v.as_str())
		.is_some_and(|v| !v.is_empty());

	if kind.ends_with("List") {
		if let Some(serde_json::Value::Array(items)) = value.get("items") {
			for item in items.clone() {
				collect_resources(item, out);
			}
			return;
		}
	}
	if kind.is_empty() || !has_api_version {
		return;
	}
	out.push(value);
}

/// All desired resources of a stack directory, in file order.
#[instrument(fields(dir = %dir.display()))]
pub fn read_stack_dir(dir: &Path) -> Result<Vec<serde_json::Value>, ManifestError> {
	let mut resources = Vec::new();
	for path in find_manifest_files(dir)? {
		let content = match fs::read_to_string(&path) {
			Ok(content) => content,
			// Removed between listing and reading.
			Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
			Err(source) => return Err(ManifestError::ReadFile { path, source }),
		};
		resources.extend(parse_documents(&content, &path)?);
	}
	tracing::trace!(count = resources.len(), "read stack manifests");
	Ok(resources)
}
