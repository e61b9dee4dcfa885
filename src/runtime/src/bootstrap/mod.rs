//! Base image fetch and bootstrap extraction.
//!
//! The base image's manifest carries the accelerated-format bootstrap as
//! its last layer, marked by annotation. The bootstrap file itself lives
//! inside that gzipped layer under `image/image.boot`.

use std::path::Path;

use flate2::read::GzDecoder;
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};

use nydus_commit_core::error::{CommitError, Result};

use crate::builder::BOOTSTRAP_NAME_IN_LAYER;
use crate::labels::{LAYER_ANNOTATION_NYDUS_BOOTSTRAP, LAYER_ANNOTATION_NYDUS_COMMIT_BLOBS};
use crate::remote::Remote;

/// Architecture used to resolve multi-platform base images.
const TARGET_ARCHITECTURE: &str = "amd64";

/// The base image's manifest plus its config kept as raw JSON, so unknown
/// config fields survive the round trip into the committed image.
#[derive(Debug, Clone)]
pub struct NydusImage {
    pub manifest: OciImageManifest,
    pub config: serde_json::Value,
}

/// Pull the base image's manifest and config, resolving an image index
/// down to the linux/amd64 manifest.
pub async fn pull_base_image(remote: &mut Remote) -> Result<NydusImage> {
    let (manifest, _) = remote.pull_manifest().await?;

    let manifest = match manifest {
        OciManifest::Image(manifest) => manifest,
        OciManifest::ImageIndex(index) => {
            let entry = index
                .manifests
                .iter()
                .find(|entry| {
                    entry
                        .platform
                        .as_ref()
                        .map(|platform| {
                            platform.architecture == TARGET_ARCHITECTURE && platform.os == "linux"
                        })
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    CommitError::Fetch(format!(
                        "no linux/{} manifest in image index",
                        TARGET_ARCHITECTURE
                    ))
                })?;
            match remote.pull_manifest_digest(&entry.digest).await?.0 {
                OciManifest::Image(manifest) => manifest,
                OciManifest::ImageIndex(_) => {
                    return Err(CommitError::Fetch(
                        "image index nested inside image index".to_string(),
                    ))
                }
            }
        }
    };

    let mut config_bytes = Vec::new();
    remote.pull_blob(&manifest.config, &mut config_bytes).await?;
    let config: serde_json::Value = serde_json::from_slice(&config_bytes)
        .map_err(|e| CommitError::Fetch(format!("parse image config: {}", e)))?;

    Ok(NydusImage { manifest, config })
}

/// Find the bootstrap layer descriptor of an accelerated image.
pub fn find_bootstrap_desc(manifest: &OciImageManifest) -> Option<&OciDescriptor> {
    manifest.layers.iter().rev().find(|layer| {
        layer
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(LAYER_ANNOTATION_NYDUS_BOOTSTRAP))
            .map(String::as_str)
            == Some("true")
    })
}

/// Number of blobs committed onto this image lineage so far.
pub fn committed_blob_count(desc: &OciDescriptor) -> usize {
    desc.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(LAYER_ANNOTATION_NYDUS_COMMIT_BLOBS))
        .map(|joined| {
            if joined.is_empty() {
                0
            } else {
                joined.split(',').count()
            }
        })
        .unwrap_or(0)
}

/// Pull the base bootstrap layer and unpack `image/image.boot` to `target`.
///
/// Returns the committed-blob count read from the layer's annotation.
pub async fn pull_bootstrap(
    remote: &mut Remote,
    image: &NydusImage,
    target: &Path,
) -> Result<usize> {
    let desc = find_bootstrap_desc(&image.manifest).ok_or_else(|| {
        CommitError::NotAnAcceleratedImage(format!(
            "{}: no bootstrap layer in manifest",
            remote.reference().whole()
        ))
    })?;

    let committed = committed_blob_count(desc);
    if committed > 0 {
        tracing::info!(committed, "detected committed layers");
    }

    let mut compressed = Vec::new();
    remote.pull_blob(desc, &mut compressed).await?;
    unpack_bootstrap(&compressed, target)?;

    Ok(committed)
}

/// Extract the bootstrap file from the gzipped layer bytes.
fn unpack_bootstrap(gz_bytes: &[u8], target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(gz_bytes));
    let entries = archive
        .entries()
        .map_err(|e| CommitError::Fetch(format!("read bootstrap layer: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| CommitError::Fetch(format!("read bootstrap layer: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| CommitError::Fetch(format!("read bootstrap layer: {}", e)))?
            .into_owned();
        if path == Path::new(BOOTSTRAP_NAME_IN_LAYER) {
            let mut out = std::fs::File::create(target)
                .map_err(|e| CommitError::Fetch(format!("create {}: {}", target.display(), e)))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| CommitError::Fetch(format!("unpack bootstrap: {}", e)))?;
            return Ok(());
        }
    }

    Err(CommitError::Fetch(format!(
        "no {} entry in bootstrap layer",
        BOOTSTRAP_NAME_IN_LAYER
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_with_layers(layers: serde_json::Value) -> OciImageManifest {
        serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                "size": 2
            },
            "layers": layers
        }))
        .unwrap()
    }

    fn bootstrap_layer(commit_blobs: Option<&str>) -> serde_json::Value {
        let mut annotations = serde_json::json!({
            "containerd.io/snapshot/nydus-bootstrap": "true",
            "containerd.io/snapshot/nydus-fs-version": "5"
        });
        if let Some(blobs) = commit_blobs {
            annotations["containerd.io/snapshot/nydus-commit-blobs"] =
                serde_json::Value::String(blobs.to_string());
        }
        serde_json::json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
            "size": 10,
            "annotations": annotations
        })
    }

    #[test]
    fn test_find_bootstrap_desc() {
        let manifest = manifest_with_layers(serde_json::json!([
            {
                "mediaType": "application/vnd.oci.image.layer.nydus.blob.v1",
                "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                "size": 5
            },
            bootstrap_layer(None)
        ]));
        let desc = find_bootstrap_desc(&manifest).unwrap();
        assert!(desc.digest.starts_with("sha256:1111"));
    }

    #[test]
    fn test_find_bootstrap_desc_missing() {
        let manifest = manifest_with_layers(serde_json::json!([
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                "size": 5
            }
        ]));
        assert!(find_bootstrap_desc(&manifest).is_none());
    }

    #[test]
    fn test_committed_blob_count() {
        let manifest = manifest_with_layers(serde_json::json!([bootstrap_layer(Some(
            "sha256:aa,sha256:bb,sha256:cc"
        ))]));
        let desc = find_bootstrap_desc(&manifest).unwrap();
        assert_eq!(committed_blob_count(desc), 3);
    }

    #[test]
    fn test_committed_blob_count_at_ceiling() {
        let chain = (0..400)
            .map(|i| format!("sha256:{:064x}", i))
            .collect::<Vec<_>>()
            .join(",");
        let manifest = manifest_with_layers(serde_json::json!([bootstrap_layer(Some(&chain))]));
        let desc = find_bootstrap_desc(&manifest).unwrap();
        assert_eq!(committed_blob_count(desc), 400);
    }

    #[test]
    fn test_committed_blob_count_absent() {
        let manifest = manifest_with_layers(serde_json::json!([bootstrap_layer(None)]));
        let desc = find_bootstrap_desc(&manifest).unwrap();
        assert_eq!(committed_blob_count(desc), 0);
    }

    fn gzipped_layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            for (name, data) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o444);
                builder.append_data(&mut header, name, *data).unwrap();
            }
            builder.finish().unwrap();
        }
        encoder.finish().unwrap()
    }

    #[test]
    fn test_unpack_bootstrap() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("bootstrap-base");
        let layer = gzipped_layer(&[
            ("image/other", b"noise"),
            ("image/image.boot", b"bootstrap-bytes"),
        ]);

        unpack_bootstrap(&layer, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"bootstrap-bytes");
    }

    #[test]
    fn test_unpack_bootstrap_missing_entry() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("bootstrap-base");
        let layer = gzipped_layer(&[("image/other", b"noise")]);

        let err = unpack_bootstrap(&layer, &target).unwrap_err();
        assert!(matches!(err, CommitError::Fetch(_)));
    }
}
