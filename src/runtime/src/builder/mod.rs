//! Adapters around the external block-image builder.
//!
//! The builder binary turns a streaming tar into the accelerated blob
//! format (`create`) and unions bootstraps (`merge`). Both adapters speak
//! to it purely through pipes and files in the work dir; the builder's
//! stderr surfaces in the returned errors.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;

use nydus_commit_core::error::{CommitError, Result};

use crate::util::DigestWriter;

/// Filesystem version of the produced blobs and bootstraps.
pub const FS_VERSION: &str = "5";

/// Compression applied to blob chunks.
pub const COMPRESSOR: &str = "lz4_block";

/// Name of the bootstrap file inside a bootstrap layer tar.
pub const BOOTSTRAP_NAME_IN_LAYER: &str = "image/image.boot";

/// Invocation settings shared by the pack and merge adapters.
#[derive(Debug, Clone)]
pub struct BuilderFlags {
    pub work_dir: PathBuf,
    pub fs_version: String,
    pub compressor: String,
    pub builder_path: PathBuf,
}

impl BuilderFlags {
    pub fn new(work_dir: &Path, builder_path: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            fs_version: FS_VERSION.to_string(),
            compressor: COMPRESSOR.to_string(),
            builder_path: builder_path.to_path_buf(),
        }
    }
}

/// Feed a tar stream produced by `produce_tar` through the builder,
/// writing the accelerated blob to `blob_path`.
///
/// The builder's stdout is teed through a SHA-256 digester and a byte
/// counter on its way to the file, so the returned `(digest, size)` are
/// guaranteed consistent with the bytes on disk.
pub fn pack_stream<F>(flags: &BuilderFlags, blob_path: &Path, produce_tar: F) -> Result<(String, u64)>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let blob_file = File::create(blob_path)
        .map_err(|e| CommitError::Pack(format!("create {}: {}", blob_path.display(), e)))?;

    let mut child = Command::new(&flags.builder_path)
        .args([
            "create",
            "--log-level",
            "warn",
            "--source-type",
            "tar",
            "--fs-version",
            flags.fs_version.as_str(),
            "--compressor",
            flags.compressor.as_str(),
            "--blob",
            "-",
            "-",
        ])
        .current_dir(&flags.work_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            CommitError::Pack(format!(
                "spawn builder {}: {}",
                flags.builder_path.display(),
                e
            ))
        })?;

    let stdin = child.stdin.take().expect("stdin was piped");
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let stderr_reader = std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf);
        buf
    });

    // Blob bytes flow to disk on a side thread while this thread produces
    // the tar into the builder's stdin.
    let copier = std::thread::spawn(move || -> io::Result<(String, u64)> {
        let mut writer = DigestWriter::new(BufWriter::new(blob_file));
        io::copy(&mut stdout, &mut writer)?;
        writer.flush()?;
        let (digest, size, inner) = writer.finalize();
        inner.into_inner()?;
        Ok((digest, size))
    });

    let produced = (|| -> Result<()> {
        let mut stdin = BufWriter::new(stdin);
        produce_tar(&mut stdin)?;
        stdin
            .flush()
            .map_err(|e| CommitError::Pack(format!("flush builder stdin: {}", e)))?;
        Ok(())
    })();

    let copied = copier
        .join()
        .map_err(|_| CommitError::Pack("blob copier thread panicked".to_string()))?;
    let status = child
        .wait()
        .map_err(|e| CommitError::Pack(format!("wait for builder: {}", e)))?;
    let stderr_text = stderr_reader.join().unwrap_or_default();

    if !status.success() {
        return Err(CommitError::Pack(format!(
            "builder exited with {}: {}",
            status,
            stderr_text.trim()
        )));
    }
    produced?;
    let (digest, size) =
        copied.map_err(|e| CommitError::Pack(format!("write blob {}: {}", blob_path.display(), e)))?;

    Ok((digest, size))
}

/// What a bootstrap merge yields.
#[derive(Debug)]
pub struct MergeOutput {
    /// Per-layer blob digests (lowercase hex) referenced by the merged
    /// bootstrap, in layer order
    pub blob_digests: Vec<String>,
    /// SHA-256 of the uncompressed merged bootstrap tar
    pub bootstrap_diff_id: String,
}

#[derive(Deserialize)]
struct MergeReport {
    blobs: Vec<String>,
}

/// Merge `blobs` (upper first, then mount blobs in insertion order) into
/// `base_bootstrap`, producing the bootstrap tar at `merged_tar_path`.
pub fn merge_bootstraps(
    flags: &BuilderFlags,
    base_bootstrap: &Path,
    blobs: &[PathBuf],
    merged_tar_path: &Path,
) -> Result<MergeOutput> {
    let merged_raw = flags.work_dir.join("bootstrap-merged");
    let report_path = flags.work_dir.join("merge-output.json");

    let mut command = Command::new(&flags.builder_path);
    command
        .args(["merge", "--log-level", "warn"])
        .arg("--parent-bootstrap")
        .arg(base_bootstrap)
        .arg("--bootstrap")
        .arg(&merged_raw)
        .arg("--output-json")
        .arg(&report_path)
        .args(blobs)
        .current_dir(&flags.work_dir);

    let output = command.output().map_err(|e| {
        CommitError::Merge(format!(
            "spawn builder {}: {}",
            flags.builder_path.display(),
            e
        ))
    })?;
    if !output.status.success() {
        return Err(CommitError::Merge(format!(
            "builder merge exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let report: MergeReport = serde_json::from_slice(
        &std::fs::read(&report_path)
            .map_err(|e| CommitError::Merge(format!("read merge report: {}", e)))?,
    )
    .map_err(|e| CommitError::Merge(format!("parse merge report: {}", e)))?;

    let diff_id = wrap_bootstrap_tar(&merged_raw, merged_tar_path)?;

    Ok(MergeOutput {
        blob_digests: report.blobs,
        bootstrap_diff_id: diff_id,
    })
}

/// Wrap the raw merged bootstrap into a single-entry tar, hashing the tar
/// bytes. The hash is the merged bootstrap's uncompressed diff-id; the
/// published descriptor hashes the gzipped bytes instead.
fn wrap_bootstrap_tar(bootstrap: &Path, tar_path: &Path) -> Result<String> {
    let meta = std::fs::metadata(bootstrap)
        .map_err(|e| CommitError::Merge(format!("stat {}: {}", bootstrap.display(), e)))?;
    let file = File::create(tar_path)
        .map_err(|e| CommitError::Merge(format!("create {}: {}", tar_path.display(), e)))?;

    let mut writer = DigestWriter::new(BufWriter::new(file));
    {
        let mut builder = tar::Builder::new(&mut writer);
        let mut header = tar::Header::new_gnu();
        header.set_size(meta.len());
        header.set_mode(0o444);
        header.set_mtime(0);
        let source = File::open(bootstrap)
            .map_err(|e| CommitError::Merge(format!("open {}: {}", bootstrap.display(), e)))?;
        builder
            .append_data(&mut header, BOOTSTRAP_NAME_IN_LAYER, source)
            .map_err(|e| CommitError::Merge(format!("tar merged bootstrap: {}", e)))?;
        builder
            .finish()
            .map_err(|e| CommitError::Merge(format!("finalize bootstrap tar: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| CommitError::Merge(format!("flush bootstrap tar: {}", e)))?;
    let (digest, _, inner) = writer.finalize();
    inner
        .into_inner()
        .map_err(|e| CommitError::Merge(format!("flush bootstrap tar: {}", e)))?;

    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    use crate::util::sha256_bytes;

    fn fake_builder(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("fake-nydus-image");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_pack_stream_digest_and_size() {
        let work = TempDir::new().unwrap();
        // Pass the tar through unchanged
        let builder = fake_builder(work.path(), "#!/bin/sh\nexec cat\n");
        let flags = BuilderFlags::new(work.path(), &builder);

        let blob_path = work.path().join("blob-upper");
        let payload = b"pretend this is a tar stream";
        let (digest, size) = pack_stream(&flags, &blob_path, |writer| {
            writer.write_all(payload).unwrap();
            Ok(())
        })
        .unwrap();

        assert_eq!(size, payload.len() as u64);
        assert_eq!(digest, sha256_bytes(payload));
        assert_eq!(std::fs::read(&blob_path).unwrap(), payload);
    }

    #[test]
    fn test_pack_stream_builder_failure() {
        let work = TempDir::new().unwrap();
        let builder = fake_builder(
            work.path(),
            "#!/bin/sh\necho 'invalid tar input' >&2\nexit 1\n",
        );
        let flags = BuilderFlags::new(work.path(), &builder);

        let blob_path = work.path().join("blob-upper");
        let err = pack_stream(&flags, &blob_path, |writer| {
            let _ = writer.write_all(b"payload");
            Ok(())
        })
        .unwrap_err();

        match err {
            CommitError::Pack(message) => assert!(message.contains("invalid tar input")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pack_stream_missing_builder() {
        let work = TempDir::new().unwrap();
        let flags = BuilderFlags::new(work.path(), Path::new("/no/such/builder"));
        let err = pack_stream(&flags, &work.path().join("blob"), |_| Ok(())).unwrap_err();
        assert!(matches!(err, CommitError::Pack(_)));
    }

    #[test]
    fn test_merge_bootstraps() {
        let work = TempDir::new().unwrap();
        let script = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --bootstrap) shift; printf 'merged-bootstrap-bytes' > "$1";;
    --output-json) shift; printf '{"blobs":["aaaa","bbbb"]}' > "$1";;
  esac
  shift
done
"#;
        let builder = fake_builder(work.path(), script);
        let flags = BuilderFlags::new(work.path(), &builder);

        let base = work.path().join("bootstrap-base");
        std::fs::write(&base, "base").unwrap();
        let blob = work.path().join("blob-upper");
        std::fs::write(&blob, "blob").unwrap();

        let merged_tar = work.path().join("bootstrap-merged.tar");
        let output =
            merge_bootstraps(&flags, &base, &[blob], &merged_tar).unwrap();

        assert_eq!(output.blob_digests, vec!["aaaa", "bbbb"]);

        // The diff-id hashes the tar on disk
        let tar_bytes = std::fs::read(&merged_tar).unwrap();
        assert_eq!(output.bootstrap_diff_id, sha256_bytes(&tar_bytes));

        // The tar holds the bootstrap under the layer's canonical name
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        let mut entries = archive.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap(),
            Path::new(BOOTSTRAP_NAME_IN_LAYER)
        );
    }

    #[test]
    fn test_merge_failure_surfaces_stderr() {
        let work = TempDir::new().unwrap();
        let builder = fake_builder(work.path(), "#!/bin/sh\necho 'merge blew up' >&2\nexit 2\n");
        let flags = BuilderFlags::new(work.path(), &builder);

        let base = work.path().join("bootstrap-base");
        std::fs::write(&base, "base").unwrap();

        let err = merge_bootstraps(
            &flags,
            &base,
            &[],
            &work.path().join("bootstrap-merged.tar"),
        )
        .unwrap_err();
        match err {
            CommitError::Merge(message) => assert!(message.contains("merge blew up")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
