//! Container introspection over the engine's inspect surface.
//!
//! Parses `engine://id` addresses, queries the matching engine's local
//! socket and extracts everything the commit pipeline needs: image
//! reference, PID, overlay upper/lower dirs and the bind-mount list.

mod engine;
pub mod overlay;

use std::path::{Path, PathBuf};

use serde_json::Value;

use nydus_commit_core::config::RuntimeConfig;
use nydus_commit_core::error::{CommitError, Result};

use crate::reference::{self, ImageReference};
use engine::EngineClient;

/// Supported container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
    Pouch,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Pouch => write!(f, "pouch"),
        }
    }
}

/// A parsed `engine://id` container address.
#[derive(Debug, Clone)]
pub struct ContainerAddress {
    pub engine: EngineKind,
    pub id: String,
}

impl ContainerAddress {
    /// Parse an `engine://id` address. Unknown engines are an error, not a
    /// value.
    pub fn parse(address: &str) -> Result<Self> {
        let (engine, id) = address.split_once("://").ok_or_else(|| {
            CommitError::InvalidContainerAddress(format!(
                "expected engine://id, got '{}'",
                address
            ))
        })?;

        let engine = match engine {
            "docker" => EngineKind::Docker,
            "pouch" => EngineKind::Pouch,
            other => {
                return Err(CommitError::InvalidContainerAddress(format!(
                    "unknown engine '{}' in '{}'",
                    other, address
                )))
            }
        };

        if id.is_empty() {
            return Err(CommitError::InvalidContainerAddress(format!(
                "empty container id in '{}'",
                address
            )));
        }

        Ok(Self {
            engine,
            id: id.to_string(),
        })
    }
}

/// A bind mount of the inspected container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMount {
    pub source: String,
    pub destination: String,
}

/// Everything the commit pipeline needs to know about the container.
#[derive(Debug, Clone)]
pub struct InspectResult {
    /// Image reference the container runs (already nydus-suffixed)
    pub image: String,
    /// PID of the container's init process
    pub pid: i32,
    /// Overlay upper dir
    pub upper_dir: PathBuf,
    /// Ordered overlay lower dirs
    pub lower_dirs: Vec<PathBuf>,
    /// Bind mounts (source/destination pairs)
    pub mounts: Vec<ContainerMount>,
}

/// Talks to the configured engines.
pub struct Manager {
    runtime: RuntimeConfig,
}

impl Manager {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }

    fn socket(&self, engine: EngineKind) -> &Path {
        match engine {
            EngineKind::Docker => &self.runtime.docker_addr,
            EngineKind::Pouch => &self.runtime.pouch_addr,
        }
    }

    /// Inspect the container behind `address`.
    pub async fn inspect(&self, address: &ContainerAddress) -> Result<InspectResult> {
        let client = EngineClient::new(self.socket(address.engine));
        let data = client
            .get_json(&format!("/containers/{}/json", address.id))
            .await?;

        let mut result = parse_inspect(&data, address.engine)?;

        if address.engine == EngineKind::Docker {
            // Docker keeps the lower stack only in the overlay mount options
            // of the merged dir.
            let merged = json_str(&data, "/GraphDriver/Data/MergedDir")?;
            result.lower_dirs = overlay::lower_dirs(Path::new(merged))?;
        }

        tracing::info!(
            image = %result.image,
            pid = result.pid,
            upper = %result.upper_dir.display(),
            lowers = result.lower_dirs.len(),
            "inspected container"
        );

        Ok(result)
    }

    /// Pause the container.
    pub async fn pause(&self, address: &ContainerAddress) -> Result<()> {
        let client = EngineClient::new(self.socket(address.engine));
        client
            .post(&format!("/containers/{}/pause", address.id))
            .await
    }

    /// Unpause the container.
    pub async fn unpause(&self, address: &ContainerAddress) -> Result<()> {
        let client = EngineClient::new(self.socket(address.engine));
        client
            .post(&format!("/containers/{}/unpause", address.id))
            .await
    }
}

fn json_str<'a>(data: &'a Value, pointer: &str) -> Result<&'a str> {
    data.pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| CommitError::Inspect(format!("missing '{}' in inspect data", pointer)))
}

/// Resolve an image reference from `pointer`, validating that it parses.
fn inspect_image(data: &Value, pointer: &str) -> Result<String> {
    let image = json_str(data, pointer)?;
    if image.is_empty() {
        return Err(CommitError::Inspect(format!("empty image name at '{}'", pointer)));
    }
    ImageReference::parse(image)?;
    Ok(image.to_string())
}

/// Resolve a directory from `pointer`, verifying it exists on disk.
fn inspect_dir(data: &Value, pointer: &str) -> Result<PathBuf> {
    let dir = json_str(data, pointer)?;
    let path = PathBuf::from(dir);
    let meta = std::fs::metadata(&path)
        .map_err(|e| CommitError::Inspect(format!("stat {}: {}", dir, e)))?;
    if !meta.is_dir() {
        return Err(CommitError::Inspect(format!("{} is not a directory", dir)));
    }
    Ok(path)
}

/// Extract the inspect fields from the engine's JSON document.
///
/// For docker, `lower_dirs` is left empty here; the caller recovers it from
/// the overlay mount table.
fn parse_inspect(data: &Value, engine: EngineKind) -> Result<InspectResult> {
    // Kubernetes-managed containers carry the original image reference in a
    // label; fall back to Config.Image otherwise.
    let label_pointer = "/Config/Labels/io.kubernetes.container.image";
    let image = match inspect_image(data, label_pointer) {
        Ok(image) => image,
        Err(err) => {
            tracing::warn!(error = %err, "image label unusable, falling back to Config.Image");
            inspect_image(data, "/Config/Image")?
        }
    };

    if !reference::has_nydus_suffix(&image)? {
        return Err(CommitError::NotAnAcceleratedImage(image));
    }

    let upper_dir = inspect_dir(data, "/GraphDriver/Data/UpperDir")?;

    let lower_dirs = match engine {
        EngineKind::Pouch => json_str(data, "/GraphDriver/Data/LowerDir")?
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect(),
        EngineKind::Docker => Vec::new(),
    };

    let pid = data
        .pointer("/State/Pid")
        .and_then(Value::as_i64)
        .ok_or_else(|| CommitError::Inspect("missing '/State/Pid' in inspect data".to_string()))?
        as i32;

    let mut mounts = Vec::new();
    if let Some(entries) = data.pointer("/Mounts").and_then(Value::as_array) {
        for entry in entries {
            let source = entry.pointer("/Source").and_then(Value::as_str);
            let destination = entry.pointer("/Destination").and_then(Value::as_str);
            if let (Some(source), Some(destination)) = (source, destination) {
                mounts.push(ContainerMount {
                    source: source.to_string(),
                    destination: destination.to_string(),
                });
            }
        }
    }

    Ok(InspectResult {
        image,
        pid,
        upper_dir,
        lower_dirs,
        mounts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_address_known_engines() {
        let address = ContainerAddress::parse("docker://abc123").unwrap();
        assert_eq!(address.engine, EngineKind::Docker);
        assert_eq!(address.id, "abc123");

        let address = ContainerAddress::parse("pouch://abc123").unwrap();
        assert_eq!(address.engine, EngineKind::Pouch);
    }

    #[test]
    fn test_parse_address_unknown_engine() {
        let err = ContainerAddress::parse("unknown://abc").unwrap_err();
        assert!(matches!(err, CommitError::InvalidContainerAddress(_)));
    }

    #[test]
    fn test_parse_address_missing_scheme() {
        assert!(ContainerAddress::parse("abc123").is_err());
        assert!(ContainerAddress::parse("docker://").is_err());
    }

    fn sample_inspect(upper: &Path, image: &str) -> Value {
        serde_json::json!({
            "State": { "Pid": 4242 },
            "Config": {
                "Image": image,
                "Labels": {}
            },
            "GraphDriver": {
                "Data": {
                    "UpperDir": upper.to_str().unwrap(),
                    "LowerDir": "/lower/a:/lower/b",
                    "MergedDir": "/merged"
                }
            },
            "Mounts": [
                { "Source": "/host/x", "Destination": "/guest/x" }
            ]
        })
    }

    #[test]
    fn test_parse_inspect_pouch() {
        let upper = TempDir::new().unwrap();
        let data = sample_inspect(upper.path(), "example.com/lib/foo:1.2_nydus_v2");

        let result = parse_inspect(&data, EngineKind::Pouch).unwrap();
        assert_eq!(result.image, "example.com/lib/foo:1.2_nydus_v2");
        assert_eq!(result.pid, 4242);
        assert_eq!(result.upper_dir, upper.path());
        assert_eq!(
            result.lower_dirs,
            vec![PathBuf::from("/lower/a"), PathBuf::from("/lower/b")]
        );
        assert_eq!(
            result.mounts,
            vec![ContainerMount {
                source: "/host/x".to_string(),
                destination: "/guest/x".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_inspect_docker_defers_lower_dirs() {
        let upper = TempDir::new().unwrap();
        let data = sample_inspect(upper.path(), "example.com/lib/foo:1.2_nydus_v2");

        let result = parse_inspect(&data, EngineKind::Docker).unwrap();
        assert!(result.lower_dirs.is_empty());
    }

    #[test]
    fn test_parse_inspect_prefers_kubernetes_label() {
        let upper = TempDir::new().unwrap();
        let mut data = sample_inspect(upper.path(), "example.com/lib/other:2_nydus_v2");
        data["Config"]["Labels"]["io.kubernetes.container.image"] =
            Value::String("example.com/lib/foo:1.2_nydus_v2".to_string());

        let result = parse_inspect(&data, EngineKind::Pouch).unwrap();
        assert_eq!(result.image, "example.com/lib/foo:1.2_nydus_v2");
    }

    #[test]
    fn test_parse_inspect_rejects_plain_image() {
        let upper = TempDir::new().unwrap();
        let data = sample_inspect(upper.path(), "example.com/lib/foo:1.2");

        let err = parse_inspect(&data, EngineKind::Pouch).unwrap_err();
        assert!(matches!(err, CommitError::NotAnAcceleratedImage(_)));
    }

    #[test]
    fn test_parse_inspect_missing_upper_dir() {
        let data = sample_inspect(
            Path::new("/definitely/not/here"),
            "example.com/lib/foo:1.2_nydus_v2",
        );
        let err = parse_inspect(&data, EngineKind::Pouch).unwrap_err();
        assert!(matches!(err, CommitError::Inspect(_)));
    }
}
