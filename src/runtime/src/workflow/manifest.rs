//! Assembly and publication of the committed image.
//!
//! Starts from the base image's manifest and config. The config keeps all
//! base fields and only swaps the rootfs diff-id list; the manifest keeps
//! the base annotations and swaps config and layers. With an external
//! backend only the bootstrap is listed: the blobs live in the object
//! store and are referenced by annotation instead.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};

use nydus_commit_core::error::{CommitError, Result};

use crate::bootstrap::{find_bootstrap_desc, NydusImage};
use crate::builder::{MergeOutput, FS_VERSION};
use crate::labels::{
    LAYER_ANNOTATION_NYDUS_BLOB_IDS, LAYER_ANNOTATION_NYDUS_BOOTSTRAP,
    LAYER_ANNOTATION_NYDUS_COMMIT_BLOBS, LAYER_ANNOTATION_NYDUS_FS_VERSION,
    MEDIA_TYPE_IMAGE_LAYER_GZIP, MEDIA_TYPE_NYDUS_BLOB,
};
use crate::remote::Remote;
use crate::util::{sha256_bytes, DigestWriter};

use super::{Blob, Workflow, MERGED_BOOTSTRAP_NAME};

/// Derive a descriptor for `data` from an existing one.
fn make_desc(data: &[u8], old: &OciDescriptor) -> OciDescriptor {
    let mut desc = old.clone();
    desc.digest = format!("sha256:{}", sha256_bytes(data));
    desc.size = data.len() as i64;
    desc
}

/// The base image's data-blob layers, bootstrap excluded.
fn nydus_blob_layers(manifest: &OciImageManifest) -> Vec<OciDescriptor> {
    manifest
        .layers
        .iter()
        .filter(|layer| layer.media_type == MEDIA_TYPE_NYDUS_BLOB)
        .cloned()
        .collect()
}

/// Rootfs diff-ids of the committed image's config.
fn build_diff_ids(
    external: bool,
    lower_layers: &[OciDescriptor],
    mount_blobs: &[Blob],
    upper_blob: &Blob,
    bootstrap_diff_id: &str,
) -> Vec<String> {
    if external {
        return vec![bootstrap_diff_id.to_string()];
    }

    let mut diff_ids = Vec::with_capacity(lower_layers.len() + mount_blobs.len() + 2);
    for layer in lower_layers {
        diff_ids.push(layer.digest.clone());
    }
    for blob in mount_blobs {
        diff_ids.push(blob.desc.digest.clone());
    }
    diff_ids.push(upper_blob.desc.digest.clone());
    diff_ids.push(bootstrap_diff_id.to_string());
    diff_ids
}

/// The committed-blobs chain: the base's entries extended by this commit's
/// mount blobs and upper blob.
fn commit_blobs_annotation(
    base_chain: Option<&str>,
    mount_blobs: &[Blob],
    upper_blob: &Blob,
) -> String {
    let mut blobs: Vec<String> = base_chain
        .filter(|chain| !chain.is_empty())
        .map(|chain| chain.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    for blob in mount_blobs {
        blobs.push(blob.desc.digest.clone());
    }
    blobs.push(upper_blob.desc.digest.clone());
    blobs.join(",")
}

/// Descriptor of the gzipped bootstrap layer.
fn bootstrap_descriptor(
    gz_digest_hex: &str,
    gz_size: u64,
    commit_blobs: String,
    blob_ids: Option<String>,
) -> OciDescriptor {
    let mut annotations = vec![
        (
            LAYER_ANNOTATION_NYDUS_FS_VERSION.to_string(),
            FS_VERSION.to_string(),
        ),
        (
            LAYER_ANNOTATION_NYDUS_BOOTSTRAP.to_string(),
            "true".to_string(),
        ),
        (LAYER_ANNOTATION_NYDUS_COMMIT_BLOBS.to_string(), commit_blobs),
    ];
    if let Some(ids) = blob_ids {
        annotations.push((LAYER_ANNOTATION_NYDUS_BLOB_IDS.to_string(), ids));
    }

    OciDescriptor {
        media_type: MEDIA_TYPE_IMAGE_LAYER_GZIP.to_string(),
        digest: format!("sha256:{}", gz_digest_hex),
        size: gz_size as i64,
        annotations: Some(annotations.into_iter().collect()),
        ..Default::default()
    }
}

/// Layer list of the committed image's manifest.
fn build_layers(
    external: bool,
    lower_layers: &[OciDescriptor],
    mount_blobs: &[Blob],
    upper_blob: &Blob,
    bootstrap_desc: &OciDescriptor,
) -> Vec<OciDescriptor> {
    if external {
        return vec![bootstrap_desc.clone()];
    }

    let mut layers = lower_layers.to_vec();
    for blob in mount_blobs {
        layers.push(blob.desc.clone());
    }
    layers.push(upper_blob.desc.clone());
    layers.push(bootstrap_desc.clone());
    layers
}

/// Gzip the merged bootstrap tar, hashing the gzipped bytes.
///
/// The returned digest feeds the bootstrap layer descriptor; the
/// uncompressed tar's hash (the diff-id) was produced by the merge and
/// feeds the config's rootfs list. The split is deliberate.
fn gzip_bootstrap(tar_path: &Path, gz_path: &Path) -> Result<(String, u64)> {
    let mut tar_file = File::open(tar_path)
        .map_err(|e| CommitError::Manifest(format!("open {}: {}", tar_path.display(), e)))?;
    let gz_file = File::create(gz_path)
        .map_err(|e| CommitError::Manifest(format!("create {}: {}", gz_path.display(), e)))?;

    let mut writer = DigestWriter::new(BufWriter::new(gz_file));
    {
        let mut encoder = GzEncoder::new(&mut writer, Compression::default());
        std::io::copy(&mut tar_file, &mut encoder)
            .map_err(|e| CommitError::Manifest(format!("compress bootstrap tar: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| CommitError::Manifest(format!("close gzip writer: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| CommitError::Manifest(format!("flush bootstrap tar.gz: {}", e)))?;
    let (digest, size, inner) = writer.finalize();
    inner
        .into_inner()
        .map_err(|e| CommitError::Manifest(format!("flush bootstrap tar.gz: {}", e)))?;

    Ok((digest, size))
}

impl Workflow {
    /// Assemble and push config, bootstrap layer and manifest, in that
    /// order; the manifest goes last, by tag.
    pub(crate) async fn push_manifest(
        &self,
        image: &NydusImage,
        merge: &MergeOutput,
        target_ref: &str,
        upper_blob: &Blob,
        mount_blobs: &[Blob],
    ) -> Result<()> {
        let backend = self.backend(target_ref).await?;
        let external = backend.external();
        let lower_layers = nydus_blob_layers(&image.manifest);
        let bootstrap_diff_id = format!("sha256:{}", merge.bootstrap_diff_id);

        // Image config: base config with the rootfs diff-ids swapped
        let mut config = image.config.clone();
        let diff_ids = build_diff_ids(
            external,
            &lower_layers,
            mount_blobs,
            upper_blob,
            &bootstrap_diff_id,
        );
        config["rootfs"]["diff_ids"] = serde_json::json!(diff_ids);
        let config_bytes = serde_json::to_vec_pretty(&config)?;
        let config_desc = make_desc(&config_bytes, &image.manifest.config);

        let mut remote = Remote::new(target_ref, &self.credentials())?;
        remote
            .push_blob_retrying(&config_bytes, &config_desc.digest)
            .await?;

        // Bootstrap layer: gzip the merged tar, hash the gzipped bytes
        let tar_path = self.work_dir.path().join(MERGED_BOOTSTRAP_NAME);
        let gz_path = self
            .work_dir
            .path()
            .join(format!("{}.gz", MERGED_BOOTSTRAP_NAME));
        let (gz_digest, gz_size) = {
            let tar_path = tar_path.clone();
            let gz_path = gz_path.clone();
            tokio::task::spawn_blocking(move || gzip_bootstrap(&tar_path, &gz_path))
                .await
                .map_err(|e| CommitError::Manifest(format!("join gzip task: {}", e)))??
        };

        let blob_ids = if external {
            Some(serde_json::to_string(&merge.blob_digests)?)
        } else {
            None
        };
        let base_chain = find_bootstrap_desc(&image.manifest)
            .and_then(|desc| desc.annotations.as_ref())
            .and_then(|annotations| annotations.get(LAYER_ANNOTATION_NYDUS_COMMIT_BLOBS))
            .map(String::as_str);
        let bootstrap_desc = bootstrap_descriptor(
            &gz_digest,
            gz_size,
            commit_blobs_annotation(base_chain, mount_blobs, upper_blob),
            blob_ids,
        );

        let gz_bytes = tokio::fs::read(&gz_path)
            .await
            .map_err(|e| CommitError::Manifest(format!("read {}: {}", gz_path.display(), e)))?;
        remote
            .push_blob_retrying(&gz_bytes, &bootstrap_desc.digest)
            .await?;

        // Image manifest, pushed last
        let mut manifest = image.manifest.clone();
        manifest.config = config_desc;
        manifest.layers = build_layers(
            external,
            &lower_layers,
            mount_blobs,
            upper_blob,
            &bootstrap_desc,
        );
        remote.push_manifest(manifest).await?;

        Ok(())
    }
}
