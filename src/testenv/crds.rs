//! Loading CustomResourceDefinitions from manifest directories.

use std::path::{Path, PathBuf};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const CRD_KIND: &str = "CustomResourceDefinition";
const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Read every CRD found in the manifest files directly under `paths`.
///
/// Files are visited in name order. A missing directory is skipped with a
/// warning unless `error_if_missing` is set. Documents of any other kind are
/// ignored.
pub fn load_crds(paths: &[PathBuf], error_if_missing: bool) -> Result<Vec<CustomResourceDefinition>> {
    let mut crds = Vec::new();
    for dir in paths {
        if !dir.is_dir() {
            if error_if_missing {
                return Err(Error::config(format!(
                    "CRD directory {} does not exist",
                    dir.display()
                )));
            }
            warn!(dir = %dir.display(), "CRD directory not found, skipping");
            continue;
        }
        for file in manifest_files(dir)? {
            let contents = std::fs::read_to_string(&file)?;
            let found = parse_crd_documents(&contents).map_err(|e| {
                Error::config(format!("failed to parse {}: {e}", file.display()))
            })?;
            debug!(file = %file.display(), count = found.len(), "loaded CRDs");
            crds.extend(found);
        }
    }
    Ok(crds)
}

fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_manifest = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext));
        if path.is_file() && is_manifest {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse the CRDs out of a (possibly multi-document) YAML or JSON stream.
pub fn parse_crd_documents(contents: &str) -> Result<Vec<CustomResourceDefinition>> {
    let mut crds = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(|k| k.as_str()) != Some(CRD_KIND) {
            continue;
        }
        crds.push(serde_yaml::from_value(value)?);
    }
    Ok(crds)
}

/// Append `extra` to `base`, dropping CRDs whose name is already present.
pub fn merge_crds(
    mut base: Vec<CustomResourceDefinition>,
    extra: impl IntoIterator<Item = CustomResourceDefinition>,
) -> Vec<CustomResourceDefinition> {
    for crd in extra {
        if base.iter().any(|c| c.metadata.name == crd.metadata.name) {
            debug!(name = ?crd.metadata.name, "duplicate CRD ignored");
            continue;
        }
        base.push(crd);
    }
    base
}
