use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CommitError, Result};

/// Credentials for the distribution registry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DistributionConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Object-store (OSS) backend configuration.
///
/// When `endpoint` is nonempty, blobs are offloaded to the object store
/// instead of the registry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OssConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub access_key_secret: String,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub object_prefix: String,
}

/// Engine socket addresses.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub pouch_addr: PathBuf,
    pub docker_addr: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pouch_addr: PathBuf::from("/var/run/pouchd.sock"),
            docker_addr: PathBuf::from("/var/run/docker.sock"),
        }
    }
}

/// Flag-derived settings (not read from the config file).
#[derive(Debug, Clone)]
pub struct BaseConfig {
    /// Parent directory for per-invocation work directories
    pub work_dir: PathBuf,
    /// Path to the external block-image builder
    pub builder: PathBuf,
    /// Engine socket addresses
    pub runtime: RuntimeConfig,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp"),
            builder: PathBuf::from("nydus-image"),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Full configuration: YAML file contents plus flag-derived base settings.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub distribution: DistributionConfig,
    pub oss: OssConfig,
    pub base: BaseConfig,
}

/// The YAML-file half of [`Config`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    distribution: DistributionConfig,
    #[serde(default)]
    oss: OssConfig,
}

impl Config {
    /// Load the YAML config file (if any) and merge the flag-derived base.
    ///
    /// A missing `path` yields anonymous registry credentials; an unreadable
    /// or malformed file is a configuration error.
    pub fn load(path: Option<&Path>, base: BaseConfig) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    CommitError::Config(format!("load config {}: {}", path.display(), e))
                })?;
                serde_yaml::from_slice::<FileConfig>(&bytes).map_err(|e| {
                    CommitError::Config(format!("parse config {}: {}", path.display(), e))
                })?
            }
            None => FileConfig::default(),
        };

        Ok(Self {
            distribution: file.distribution,
            oss: file.oss,
            base,
        })
    }

    /// Whether the object-store backend is selected.
    pub fn uses_object_store(&self) -> bool {
        !self.oss.endpoint.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_without_file() {
        let config = Config::load(None, BaseConfig::default()).unwrap();
        assert!(config.distribution.username.is_empty());
        assert!(!config.uses_object_store());
        assert_eq!(config.base.builder, PathBuf::from("nydus-image"));
    }

    #[test]
    fn test_load_distribution_only() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "distribution:\n  username: bob\n  password: s3cret").unwrap();

        let config = Config::load(Some(file.path()), BaseConfig::default()).unwrap();
        assert_eq!(config.distribution.username, "bob");
        assert_eq!(config.distribution.password, "s3cret");
        assert!(!config.uses_object_store());
    }

    #[test]
    fn test_load_with_oss() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "distribution:\n  username: bob\n  password: pw\noss:\n  endpoint: oss-cn-hangzhou.aliyuncs.com\n  access_key_id: id\n  access_key_secret: secret\n  bucket_name: blobs\n  object_prefix: nydus/"
        )
        .unwrap();

        let config = Config::load(Some(file.path()), BaseConfig::default()).unwrap();
        assert!(config.uses_object_store());
        assert_eq!(config.oss.bucket_name, "blobs");
        assert_eq!(config.oss.object_prefix, "nydus/");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/config.yaml")), BaseConfig::default())
            .unwrap_err();
        assert!(matches!(err, CommitError::Config(_)));
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "distribution: [not, a, map]").unwrap();

        let err = Config::load(Some(file.path()), BaseConfig::default()).unwrap_err();
        assert!(matches!(err, CommitError::Config(_)));
    }
}
