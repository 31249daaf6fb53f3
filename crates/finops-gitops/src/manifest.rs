//! Locate and patch Kubernetes workload manifests.

use std::path::{Path, PathBuf};

use finops_core::{ResourceSet, WorkloadRef};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::error::ApplyError;

/// Resource keys written into container requests and limits.
const PATCHED_RESOURCES: [&str; 2] = ["cpu", "memory"];

/// File names tried, in order, for a workload called `name`.
pub fn candidate_file_names(name: &str) -> [String; 5] {
    [
        format!("{name}.yaml"),
        format!("{name}.yml"),
        format!("deployment-{name}.yaml"),
        format!("{name}-deployment.yaml"),
        format!("{name}-deployment.yml"),
    ]
}

/// First candidate manifest for `workload` that exists in `dir`.
pub fn find_manifest(dir: &Path, workload: &WorkloadRef) -> Result<PathBuf, ApplyError> {
    for file_name in candidate_file_names(&workload.name) {
        let path = dir.join(&file_name);
        debug!(path = %path.display(), "checking manifest path");
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(ApplyError::ManifestNotFound {
        workload: workload.to_string(),
        dir: dir.to_path_buf(),
    })
}

/// The changes an approved recommendation makes to a manifest.
#[derive(Debug, Clone)]
pub struct ManifestPatch<'a> {
    /// Preferred container name (the workload's short name).
    pub container: &'a str,
    pub resources: &'a ResourceSet,
    pub replicas: Option<u32>,
}

/// Rewrite the manifest at `path`. Returns `true` if the file changed.
///
/// The file is only written when the whole patch succeeds.
pub fn patch_file(path: &Path, patch: &ManifestPatch<'_>) -> Result<bool, ApplyError> {
    let original = std::fs::read_to_string(path)?;
    let patched = patch_document(&original, patch).map_err(|reason| match reason {
        PatchError::Ambiguous => ApplyError::AmbiguousContainer {
            container: patch.container.to_string(),
            path: path.to_path_buf(),
        },
        PatchError::Invalid(reason) => ApplyError::InvalidManifest {
            path: path.to_path_buf(),
            reason,
        },
    })?;

    if patched == original {
        debug!(path = %path.display(), "manifest already at target");
        return Ok(false);
    }
    std::fs::write(path, &patched)?;
    info!(
        path = %path.display(),
        replicas = ?patch.replicas,
        resources = ?patch.resources,
        "manifest patched"
    );
    Ok(true)
}

#[derive(Debug, PartialEq, Eq)]
pub enum PatchError {
    Ambiguous,
    Invalid(String),
}

/// Apply `patch` to a YAML document and re-serialize it.
///
/// Key order and unrelated fields are kept. The output has no
/// document-start marker.
pub fn patch_document(yaml: &str, patch: &ManifestPatch<'_>) -> Result<String, PatchError> {
    let mut root: Value =
        serde_yaml::from_str(yaml).map_err(|e| PatchError::Invalid(e.to_string()))?;
    let root_map = root
        .as_mapping_mut()
        .ok_or_else(|| PatchError::Invalid("document is not a mapping".to_string()))?;
    let spec = child_mapping(root_map, "spec")?;

    if let Some(replicas) = patch.replicas {
        spec.insert(Value::from("replicas"), Value::from(replicas));
    }

    let updates: Vec<(&str, &String)> = PATCHED_RESOURCES
        .iter()
        .filter_map(|key| patch.resources.get(*key).map(|v| (*key, v)))
        .collect();

    if !updates.is_empty() {
        let pod_spec = child_mapping(child_mapping(spec, "template")?, "spec")?;
        let containers = pod_spec
            .get_mut("containers")
            .and_then(Value::as_sequence_mut)
            .ok_or_else(|| PatchError::Invalid("no containers list".to_string()))?;

        let index = select_container(containers, patch.container)?;
        let container = containers[index]
            .as_mapping_mut()
            .ok_or_else(|| PatchError::Invalid("container is not a mapping".to_string()))?;
        let resources = child_mapping(container, "resources")?;
        for section in ["requests", "limits"] {
            let section = child_mapping(resources, section)?;
            for (key, value) in &updates {
                section.insert(Value::from(*key), Value::from(value.as_str()));
            }
        }
    }

    serde_yaml::to_string(&root).map_err(|e| PatchError::Invalid(e.to_string()))
}

/// Container named `name`, else the only container.
fn select_container(containers: &[Value], name: &str) -> Result<usize, PatchError> {
    let by_name = containers
        .iter()
        .position(|c| c.get("name").and_then(Value::as_str) == Some(name));
    match by_name {
        Some(index) => Ok(index),
        None if containers.len() == 1 => Ok(0),
        None if containers.is_empty() => {
            Err(PatchError::Invalid("containers list is empty".to_string()))
        }
        None => Err(PatchError::Ambiguous),
    }
}

/// `parent[key]` as a mapping, created if absent or null.
fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping, PatchError> {
    match parent.get(key) {
        None | Some(Value::Null) => {
            parent.insert(Value::from(key), Value::Mapping(Mapping::new()));
        }
        Some(Value::Mapping(_)) => {}
        Some(_) => return Err(PatchError::Invalid(format!("`{key}` is not a mapping"))),
    }
    parent
        .get_mut(key)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| PatchError::Invalid(format!("`{key}` is not a mapping")))
}
