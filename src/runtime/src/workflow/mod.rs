//! The commit orchestrator.
//!
//! Drives a commit through its states: inspect the container, pull the
//! base bootstrap, pack and push the upper and mount blobs in two parallel
//! waves, merge the bootstraps, then assemble and push the new image.
//! The per-invocation work directory is removed whatever the outcome.

mod manifest;
pub mod mounts;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use oci_distribution::manifest::OciDescriptor;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use nydus_commit_core::config::Config;
use nydus_commit_core::error::{CommitError, Result};

use crate::backend::{self, Backend};
use crate::bootstrap;
use crate::builder::{self, BuilderFlags, MergeOutput};
use crate::container::{ContainerAddress, InspectResult, Manager};
use crate::diff::{diff_upper, DiffOptions};
use crate::labels::{
    LAYER_ANNOTATION_NYDUS_BLOB, LAYER_ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_NYDUS_BLOB,
};
use crate::nsenter;
use crate::reference::append_nydus_suffix;
use crate::remote::retry::{with_retry, RETRY_ATTEMPTS};
use crate::remote::{Credentials, Remote};
use crate::util::format_size;

/// Base bootstrap file name inside the work dir.
const BASE_BOOTSTRAP_NAME: &str = "bootstrap-base";

/// Upper blob file name inside the work dir.
const BLOB_UPPER_NAME: &str = "blob-upper";

/// Merged bootstrap tar name inside the work dir.
pub(crate) const MERGED_BOOTSTRAP_NAME: &str = "bootstrap-merged.tar";

/// Options for one commit invocation.
#[derive(Debug, Clone)]
pub struct CommitOption {
    /// `engine://id` container address
    pub container: String,
    /// Target image reference (suffix appended if missing)
    pub target_ref: String,
    /// Bind-mount paths to commit alongside the upper layer
    pub with_paths: Vec<String>,
    /// Paths excluded from the upper diff
    pub without_paths: Vec<String>,
    /// Pause the container while extracting
    pub pause_container: bool,
    /// Ceiling on the committed-blob chain length
    pub maximum_times: usize,
}

/// A packed blob registered for publication.
#[derive(Debug, Clone)]
pub struct Blob {
    /// File name inside the work dir
    pub name: String,
    pub desc: OciDescriptor,
}

/// Nested mount paths discovered by the diff extractor during wave-1.
#[derive(Debug, Default)]
pub struct MountList {
    paths: Mutex<Vec<PathBuf>>,
}

impl MountList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered mount point. Re-runs of a retried extraction
    /// report the same paths again; duplicates are dropped.
    pub fn add(&self, path: PathBuf) {
        let mut paths = self.paths.lock().expect("mount list poisoned");
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Take all recorded paths, leaving the list empty.
    pub fn drain(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.paths.lock().expect("mount list poisoned"))
    }
}

pub struct Workflow {
    config: Config,
    work_dir: TempDir,
    manager: Manager,
    // Lazy: the backend kind depends on config and the target reference.
    backend: tokio::sync::Mutex<Option<Arc<dyn Backend>>>,
}

impl Workflow {
    /// Create a workflow with a fresh work directory under the configured
    /// work root.
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.base.work_dir).map_err(|e| {
            CommitError::Config(format!(
                "prepare work dir {}: {}",
                config.base.work_dir.display(),
                e
            ))
        })?;
        let work_dir = tempfile::Builder::new()
            .prefix("nydus-commit-")
            .tempdir_in(&config.base.work_dir)
            .map_err(|e| CommitError::Config(format!("create temp work dir: {}", e)))?;
        let manager = Manager::new(config.base.runtime.clone());

        Ok(Self {
            config,
            work_dir,
            manager,
            backend: tokio::sync::Mutex::new(None),
        })
    }

    /// Remove the work directory, reporting any cleanup failure.
    ///
    /// Dropping the workflow also removes it; this variant surfaces errors.
    pub fn destroy(self) -> Result<()> {
        self.work_dir
            .close()
            .map_err(|e| CommitError::Config(format!("clean up work dir: {}", e)))
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            username: self.config.distribution.username.clone(),
            password: self.config.distribution.password.clone(),
        }
    }

    fn builder_flags(&self) -> BuilderFlags {
        BuilderFlags::new(self.work_dir.path(), &self.config.base.builder)
    }

    /// The shared backend, constructed on first use.
    pub(crate) async fn backend(&self, target_ref: &str) -> Result<Arc<dyn Backend>> {
        let mut guard = self.backend.lock().await;
        if let Some(backend) = guard.as_ref() {
            return Ok(backend.clone());
        }
        let backend: Arc<dyn Backend> = Arc::from(backend::from_config(&self.config, target_ref)?);
        *guard = Some(backend.clone());
        Ok(backend)
    }

    pub(crate) fn work_path(&self) -> &Path {
        self.work_dir.path()
    }

    /// Commit the container into a new accelerated image.
    pub async fn commit(&self, opt: CommitOption, cancel: CancellationToken) -> Result<()> {
        let target_ref = append_nydus_suffix(&opt.target_ref)?;
        let address = ContainerAddress::parse(&opt.container)?;
        let inspect = self.manager.inspect(&address).await?;

        // Resolve the requested mount paths before any packer starts.
        if !opt.with_paths.is_empty() {
            mounts::prepare_mounts(&inspect.mounts, &opt.with_paths)?;
        }

        tracing::info!("pulling base bootstrap");
        let start = Instant::now();
        let mut remote = Remote::new(&inspect.image, &self.credentials())?;
        let image = bootstrap::pull_base_image(&mut remote).await?;
        let committed = bootstrap::pull_bootstrap(
            &mut remote,
            &image,
            &self.work_dir.path().join(BASE_BOOTSTRAP_NAME),
        )
        .await?;
        tracing::info!(elapsed = ?start.elapsed(), "pulled base bootstrap");

        if committed >= opt.maximum_times {
            return Err(CommitError::MaximumCommitsReached(opt.maximum_times));
        }

        let mount_list = Arc::new(MountList::new());

        let wave_result = if opt.pause_container {
            tracing::info!(container = %opt.container, "pausing container");
            self.manager.pause(&address).await?;

            let result = self
                .run_waves(&opt, &target_ref, &inspect, &mount_list, &cancel)
                .await;

            tracing::info!(container = %opt.container, "unpausing container");
            match (self.manager.unpause(&address).await, &result) {
                (Err(err), Ok(_)) => return Err(err),
                (Err(err), Err(_)) => {
                    tracing::error!(error = %err, container = %opt.container, "unpause container")
                }
                _ => {}
            }
            result
        } else {
            self.run_waves(&opt, &target_ref, &inspect, &mount_list, &cancel)
                .await
        };
        let (upper_blob, mount_blobs) = wave_result?;

        tracing::info!("merging base and upper bootstraps");
        let merge = self.merge_bootstrap(&upper_blob, &mount_blobs).await?;

        tracing::info!(target = %target_ref, "pushing committed image");
        self.push_manifest(&image, &merge, &target_ref, &upper_blob, &mount_blobs)
            .await?;

        Ok(())
    }

    /// Wave-1 (upper diff + requested mounts) then wave-2 (mounts the diff
    /// discovered). Siblings are joined before the first error propagates;
    /// wave-2 never starts before wave-1 fully completes.
    async fn run_waves(
        &self,
        opt: &CommitOption,
        target_ref: &str,
        inspect: &InspectResult,
        mount_list: &Arc<MountList>,
        cancel: &CancellationToken,
    ) -> Result<(Blob, Vec<Blob>)> {
        if cancel.is_cancelled() {
            return Err(CommitError::Cancelled);
        }

        let upper_task = async {
            let digest = with_retry(
                || self.commit_upper_by_diff(inspect, opt, mount_list, BLOB_UPPER_NAME),
                RETRY_ATTEMPTS,
            )
            .await?;

            tracing::info!("pushing blob for upper");
            let start = Instant::now();
            let desc = self.push_blob(BLOB_UPPER_NAME, &digest, target_ref).await?;
            tracing::info!(elapsed = ?start.elapsed(), "pushed blob for upper");
            Ok::<Blob, CommitError>(Blob {
                name: BLOB_UPPER_NAME.to_string(),
                desc,
            })
        };

        let mount_tasks = opt.with_paths.iter().enumerate().map(|(idx, path)| {
            async move {
                let name = format!("blob-mount-{}", idx);
                let digest = with_retry(
                    || self.commit_mount_by_nsenter(inspect.pid, Path::new(path), &name),
                    RETRY_ATTEMPTS,
                )
                .await?;

                tracing::info!(path = %path, "pushing blob for mount");
                let start = Instant::now();
                let desc = self.push_blob(&name, &digest, target_ref).await?;
                tracing::info!(elapsed = ?start.elapsed(), "pushed blob for mount");
                Ok::<Blob, CommitError>(Blob { name, desc })
            }
        });

        let wave1 = async { tokio::join!(upper_task, futures::future::join_all(mount_tasks)) };
        let (upper_result, mount_results) = tokio::select! {
            results = wave1 => results,
            _ = cancel.cancelled() => return Err(CommitError::Cancelled),
        };

        let upper_blob = upper_result?;
        let mut mount_blobs = Vec::with_capacity(mount_results.len());
        for result in mount_results {
            mount_blobs.push(result?);
        }

        // Wave-2: mounts discovered while diffing the upper layer.
        let appended = mount_list.drain();
        if !appended.is_empty() {
            tracing::info!(paths = ?appended, "committing appended mount paths");
        }
        let appended_tasks = appended.iter().enumerate().map(|(idx, path)| {
            async move {
                let name = format!("blob-appended-mount-{}", idx);
                let digest = with_retry(
                    || self.commit_mount_by_nsenter(inspect.pid, path, &name),
                    RETRY_ATTEMPTS,
                )
                .await?;

                tracing::info!(path = %path.display(), "pushing blob for appended mount");
                let start = Instant::now();
                let desc = self.push_blob(&name, &digest, target_ref).await?;
                tracing::info!(elapsed = ?start.elapsed(), "pushed blob for appended mount");
                Ok::<Blob, CommitError>(Blob { name, desc })
            }
        });

        let wave2 = futures::future::join_all(appended_tasks);
        let appended_results = tokio::select! {
            results = wave2 => results,
            _ = cancel.cancelled() => return Err(CommitError::Cancelled),
        };
        for result in appended_results {
            mount_blobs.push(result?);
        }

        Ok((upper_blob, mount_blobs))
    }

    /// Extract the overlay diff through the packer into `blob_name`.
    async fn commit_upper_by_diff(
        &self,
        inspect: &InspectResult,
        opt: &CommitOption,
        mount_list: &Arc<MountList>,
        blob_name: &str,
    ) -> Result<String> {
        tracing::info!("committing upper");
        let start = Instant::now();

        let flags = self.builder_flags();
        let blob_path = self.work_dir.path().join(blob_name);
        let upper = inspect.upper_dir.clone();
        let lowers = inspect.lower_dirs.clone();
        let with_paths = opt.with_paths.clone();
        let without_paths = opt.without_paths.clone();
        let mount_list = mount_list.clone();

        let (digest, size) = tokio::task::spawn_blocking(move || {
            builder::pack_stream(&flags, &blob_path, |writer| {
                let opts = DiffOptions {
                    upper: &upper,
                    lowers: &lowers,
                    with_paths: &with_paths,
                    without_paths: &without_paths,
                };
                diff_upper(&opts, writer, &mut |path: &Path| {
                    mount_list.add(path.to_path_buf())
                })
            })
        })
        .await
        .map_err(|e| CommitError::Pack(format!("join pack task: {}", e)))??;

        tracing::info!(size = %format_size(size), elapsed = ?start.elapsed(), "committed upper");
        Ok(digest)
    }

    /// Stream a mount subtree out of the container through the packer into
    /// `blob_name`.
    async fn commit_mount_by_nsenter(
        &self,
        pid: i32,
        source: &Path,
        blob_name: &str,
    ) -> Result<String> {
        tracing::info!(source = %source.display(), "committing mount");
        let start = Instant::now();

        let flags = self.builder_flags();
        let blob_path = self.work_dir.path().join(blob_name);
        let source = source.to_path_buf();

        let (digest, size) = tokio::task::spawn_blocking(move || {
            builder::pack_stream(&flags, &blob_path, |writer| {
                nsenter::copy_from_container(pid, &source, writer)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CommitError::Pack(format!("join pack task: {}", e)))??;

        tracing::info!(size = %format_size(size), elapsed = ?start.elapsed(), "committed mount");
        Ok(digest)
    }

    /// Push a packed blob through the backend, returning its descriptor.
    async fn push_blob(
        &self,
        blob_name: &str,
        digest_hex: &str,
        target_ref: &str,
    ) -> Result<OciDescriptor> {
        let blob_path = self.work_dir.path().join(blob_name);
        let size = tokio::fs::metadata(&blob_path)
            .await
            .map_err(|e| CommitError::Push(format!("stat {}: {}", blob_path.display(), e)))?
            .len();

        let annotations = [
            (
                LAYER_ANNOTATION_UNCOMPRESSED.to_string(),
                format!("sha256:{}", digest_hex),
            ),
            (LAYER_ANNOTATION_NYDUS_BLOB.to_string(), "true".to_string()),
        ];
        let desc = OciDescriptor {
            media_type: MEDIA_TYPE_NYDUS_BLOB.to_string(),
            digest: format!("sha256:{}", digest_hex),
            size: size as i64,
            annotations: Some(annotations.into_iter().collect()),
            ..Default::default()
        };

        let backend = self.backend(target_ref).await?;
        backend.push(&blob_path, &desc).await?;
        Ok(desc)
    }

    /// Merge the new blobs into the base bootstrap.
    async fn merge_bootstrap(&self, upper_blob: &Blob, mount_blobs: &[Blob]) -> Result<MergeOutput> {
        let flags = self.builder_flags();
        let base = self.work_dir.path().join(BASE_BOOTSTRAP_NAME);
        let merged_tar = self.work_dir.path().join(MERGED_BOOTSTRAP_NAME);

        let mut blob_paths = vec![self.work_dir.path().join(&upper_blob.name)];
        blob_paths.extend(
            mount_blobs
                .iter()
                .map(|blob| self.work_dir.path().join(&blob.name)),
        );

        tokio::task::spawn_blocking(move || {
            builder::merge_bootstraps(&flags, &base, &blob_paths, &merged_tar)
        })
        .await
        .map_err(|e| CommitError::Merge(format!("join merge task: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nydus_commit_core::config::BaseConfig;

    fn test_config(work_root: &Path) -> Config {
        Config {
            base: BaseConfig {
                work_dir: work_root.to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_mount_list_add_and_drain() {
        let list = MountList::new();
        list.add(PathBuf::from("/guest/a"));
        list.add(PathBuf::from("/guest/b"));
        list.add(PathBuf::from("/guest/a"));

        let drained = list.drain();
        assert_eq!(
            drained,
            vec![PathBuf::from("/guest/a"), PathBuf::from("/guest/b")]
        );
        assert!(list.drain().is_empty());
    }

    #[test]
    fn test_workflow_creates_and_destroys_work_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let workflow = Workflow::new(test_config(root.path())).unwrap();

        let work_path = workflow.work_path().to_path_buf();
        assert!(work_path.exists());
        assert!(work_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("nydus-commit-"));

        workflow.destroy().unwrap();
        assert!(!work_path.exists());
    }

    #[tokio::test]
    async fn test_commit_rejects_digested_target() {
        let root = tempfile::TempDir::new().unwrap();
        let workflow = Workflow::new(test_config(root.path())).unwrap();

        let opt = CommitOption {
            container: "docker://abc".to_string(),
            target_ref: "example.com/lib/foo@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            with_paths: vec![],
            without_paths: vec![],
            pause_container: false,
            maximum_times: 400,
        };
        let err = workflow
            .commit(opt, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::InvalidImageReference(_)));
    }

    #[tokio::test]
    async fn test_commit_rejects_unknown_engine() {
        let root = tempfile::TempDir::new().unwrap();
        let workflow = Workflow::new(test_config(root.path())).unwrap();

        let opt = CommitOption {
            container: "unknown://abc".to_string(),
            target_ref: "example.com/lib/foo:1.2".to_string(),
            with_paths: vec![],
            without_paths: vec![],
            pause_container: false,
            maximum_times: 400,
        };
        let err = workflow
            .commit(opt, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::InvalidContainerAddress(_)));
    }
}
