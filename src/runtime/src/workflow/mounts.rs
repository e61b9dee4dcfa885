//! Bind-mount preparation for requested commit paths.
//!
//! Each `--with-path` entry is resolved against the container's mount
//! table before any packer starts: the longest-destination-prefix mount
//! wins, and the guest path is rewritten to the corresponding host path.

use std::path::{Path, PathBuf};

use nydus_commit_core::error::{CommitError, Result};

use crate::container::ContainerMount;

/// A read-only bind mount prepared from a requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMount {
    /// Host-side source path
    pub source: PathBuf,
    /// Guest path with the leading slash trimmed
    pub target: PathBuf,
    /// Mount options
    pub options: Vec<String>,
}

/// Resolve `target_paths` against the container's mounts.
///
/// Every requested path must be absolute and lie under some mount
/// destination; the prepared source is `join(mount.source,
/// rel(mount.destination, path))`.
pub fn prepare_mounts(
    container_mounts: &[ContainerMount],
    target_paths: &[String],
) -> Result<Vec<PreparedMount>> {
    let find_mount = |target_path: &Path| -> Option<&ContainerMount> {
        let mut matched: Option<&ContainerMount> = None;
        for mount in container_mounts {
            if target_path.starts_with(&mount.destination) {
                let longer = matched
                    .map(|m| m.destination.len() <= mount.destination.len())
                    .unwrap_or(true);
                if longer {
                    matched = Some(mount);
                }
            }
        }
        matched
    };

    let mut prepared = Vec::with_capacity(target_paths.len());
    for target_path in target_paths {
        let path = Path::new(target_path);
        if !path.is_absolute() {
            return Err(CommitError::Config(format!(
                "not an absolute path: {}",
                target_path
            )));
        }

        tracing::info!(target = %target_path, "for target");

        let mount = find_mount(path).ok_or_else(|| {
            CommitError::Config(format!("not found mount path: {}", target_path))
        })?;
        tracing::info!(source = %mount.source, destination = %mount.destination, "container mount");

        let rel = path.strip_prefix(&mount.destination).map_err(|e| {
            CommitError::Config(format!("get rel path for {}: {}", target_path, e))
        })?;
        let source = Path::new(&mount.source).join(rel);
        let target = PathBuf::from(target_path.trim_start_matches('/'));
        tracing::info!(source = %source.display(), target = %target.display(), "prepared mount");

        prepared.push(PreparedMount {
            source,
            target,
            options: vec!["ro".to_string(), "rbind".to_string()],
        });
    }

    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_mounts_rewrites_paths() {
        let container_mounts = vec![ContainerMount {
            source: "/host/ossfs".to_string(),
            destination: "/guest/ossfs".to_string(),
        }];
        let target_paths = vec![
            "/guest/ossfs/foo".to_string(),
            "/guest/ossfs/bar".to_string(),
        ];

        let prepared = prepare_mounts(&container_mounts, &target_paths).unwrap();

        assert_eq!(
            prepared,
            vec![
                PreparedMount {
                    source: PathBuf::from("/host/ossfs/foo"),
                    target: PathBuf::from("guest/ossfs/foo"),
                    options: vec!["ro".to_string(), "rbind".to_string()],
                },
                PreparedMount {
                    source: PathBuf::from("/host/ossfs/bar"),
                    target: PathBuf::from("guest/ossfs/bar"),
                    options: vec!["ro".to_string(), "rbind".to_string()],
                },
            ]
        );
    }

    #[test]
    fn test_prepare_mounts_longest_destination_wins() {
        let container_mounts = vec![
            ContainerMount {
                source: "/host/outer".to_string(),
                destination: "/guest".to_string(),
            },
            ContainerMount {
                source: "/host/inner".to_string(),
                destination: "/guest/data".to_string(),
            },
        ];
        let target_paths = vec!["/guest/data/file".to_string()];

        let prepared = prepare_mounts(&container_mounts, &target_paths).unwrap();
        assert_eq!(prepared[0].source, PathBuf::from("/host/inner/file"));
    }

    #[test]
    fn test_prepare_mounts_rejects_relative_path() {
        let err = prepare_mounts(&[], &["relative/path".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not an absolute path"));
    }

    #[test]
    fn test_prepare_mounts_unmatched_path() {
        let container_mounts = vec![ContainerMount {
            source: "/host/x".to_string(),
            destination: "/guest/x".to_string(),
        }];
        let err =
            prepare_mounts(&container_mounts, &["/guest/y".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not found mount path"));
    }
}
