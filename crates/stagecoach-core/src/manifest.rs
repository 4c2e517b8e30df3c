//! Cluster package manifest: the archives the install stage copies to every host.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cluster package manifest {path} not found; generate the configuration first")]
    Missing { path: PathBuf },
    #[error("failed to read cluster package manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse cluster package manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("package {0} has an empty filename")]
    EmptyFilename(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub filename: String,
}

/// Package name to archive mapping, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterPackages {
    packages: IndexMap<String, PackageEntry>,
}

impl ClusterPackages {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.is_file() {
            return Err(ManifestError::Missing {
                path: path.to_path_buf(),
            });
        }
        let contents = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ManifestError> {
        let manifest: ClusterPackages = serde_json::from_str(contents)?;
        if let Some((name, _)) = manifest
            .packages
            .iter()
            .find(|(_, entry)| entry.filename.trim().is_empty())
        {
            return Err(ManifestError::EmptyFilename(name.clone()));
        }
        Ok(manifest)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PackageEntry)> {
        self.packages
            .iter()
            .map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_manifest_order() {
        let manifest = ClusterPackages::from_json_str(
            r#"{
                "dcos-config--setup_abc": {"filename": "packages/dcos-config/dcos-config--setup_abc.tar.xz", "id": "x"},
                "dcos-metadata--setup_abc": {"filename": "packages/dcos-metadata/dcos-metadata--setup_abc.tar.xz"}
            }"#,
        )
        .expect("manifest");

        let names: Vec<_> = manifest.iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec!["dcos-config--setup_abc", "dcos-metadata--setup_abc"]
        );
    }

    #[test]
    fn rejects_empty_filenames_and_missing_files() {
        assert!(matches!(
            ClusterPackages::from_json_str(r#"{"pkg": {"filename": " "}}"#),
            Err(ManifestError::EmptyFilename(name)) if name == "pkg"
        ));
        assert!(matches!(
            ClusterPackages::load(Path::new("/nonexistent/cluster_packages.json")),
            Err(ManifestError::Missing { .. })
        ));
    }
}
