//! Overlay upper-layer change-set extraction.
//!
//! Walks the overlay upper dir and streams an OCI-style changeset tar:
//! additions and modifications verbatim, deletions as whiteout entries,
//! opaque directories as `.wh..wh..opq` markers. Traversal never descends
//! into a subtree living on a different filesystem than the upper root;
//! such paths are reported through a callback and committed separately.
//! The tar is produced entry by entry with no buffering of file contents.

mod filter;

pub use filter::PathFilter;

use std::fs::{File, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use nydus_commit_core::error::{CommitError, Result};

/// Overlay whiteout marker prefix.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Overlay opaque-directory marker name.
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Inputs for one change-set extraction.
pub struct DiffOptions<'a> {
    /// Overlay upper dir
    pub upper: &'a Path,
    /// Ordered overlay lower dirs (top-most first)
    pub lowers: &'a [PathBuf],
    /// Include paths/globs; empty means everything
    pub with_paths: &'a [String],
    /// Exclude paths/globs
    pub without_paths: &'a [String],
}

/// Stream the change-set tar of `opts.upper` into `writer`.
///
/// `on_mount` receives the container-absolute path of every nested mount
/// point encountered; the subtree behind it is not descended into.
pub fn diff_upper<W: Write>(
    opts: &DiffOptions<'_>,
    writer: W,
    on_mount: &mut dyn FnMut(&Path),
) -> Result<()> {
    let filter = PathFilter::new(opts.with_paths, opts.without_paths)?;
    let root_meta = std::fs::metadata(opts.upper)
        .map_err(|e| CommitError::Extraction(format!("stat {}: {}", opts.upper.display(), e)))?;
    let root_dev = root_meta.dev();

    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let mut iter = WalkDir::new(opts.upper)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = iter.next() {
        let entry = entry.map_err(|e| CommitError::Extraction(format!("walk upper dir: {}", e)))?;
        let rel = entry
            .path()
            .strip_prefix(opts.upper)
            .map_err(|e| CommitError::Extraction(format!("relativize {}: {}", entry.path().display(), e)))?
            .to_path_buf();
        let container_path = Path::new("/").join(&rel);

        let meta = entry
            .metadata()
            .map_err(|e| CommitError::Extraction(format!("stat {}: {}", entry.path().display(), e)))?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if meta.dev() != root_dev {
                on_mount(&container_path);
                iter.skip_current_dir();
                continue;
            }
            if !filter.should_descend(&container_path) {
                iter.skip_current_dir();
                continue;
            }
            if filter.should_emit(&container_path) {
                append_dir(&mut builder, &rel, &meta)?;
                if is_opaque(entry.path()) {
                    append_marker(&mut builder, &rel.join(OPAQUE_MARKER), &meta)?;
                }
            }
            continue;
        }

        if !filter.should_emit(&container_path) {
            continue;
        }

        if is_whiteout_device(&meta) {
            // A deletion only matters if the path is visible in some lower.
            if exists_in_lowers(opts.lowers, &rel) {
                append_marker(&mut builder, &whiteout_path(&rel), &meta)?;
            }
        } else if file_type.is_symlink() {
            append_symlink(&mut builder, entry.path(), &rel, &meta)?;
        } else if file_type.is_file() {
            append_file(&mut builder, entry.path(), &rel, &meta)?;
        } else if file_type.is_fifo() || file_type.is_char_device() || file_type.is_block_device()
        {
            append_special(&mut builder, &rel, &meta)?;
        } else {
            // Sockets have no tar representation.
            tracing::debug!(path = %entry.path().display(), "skipping unsupported file type");
        }
    }

    builder
        .finish()
        .map_err(|e| CommitError::Extraction(format!("finalize change-set tar: {}", e)))?;
    Ok(())
}

/// Whiteout entry name for a deleted path: `.wh.` prefixed basename.
fn whiteout_path(rel: &Path) -> PathBuf {
    let name = rel
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match rel.parent() {
        Some(parent) => parent.join(format!("{}{}", WHITEOUT_PREFIX, name)),
        None => PathBuf::from(format!("{}{}", WHITEOUT_PREFIX, name)),
    }
}

/// Overlay represents deletions as 0:0 character devices in the upper dir.
fn is_whiteout_device(meta: &Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// Whether the path exists (without following symlinks) in any lower dir.
fn exists_in_lowers(lowers: &[PathBuf], rel: &Path) -> bool {
    lowers
        .iter()
        .any(|lower| lower.join(rel).symlink_metadata().is_ok())
}

/// Overlay marks a replaced directory with an opaque xattr.
fn is_opaque(path: &Path) -> bool {
    for name in ["trusted.overlay.opaque", "user.overlay.opaque"] {
        if let Ok(Some(value)) = xattr::get(path, name) {
            if value == b"y" {
                return true;
            }
        }
    }
    false
}

fn extraction_err(rel: &Path, err: io::Error) -> CommitError {
    CommitError::Extraction(format!("append {}: {}", rel.display(), err))
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, rel: &Path, meta: &Metadata) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata(meta);
    header.set_size(0);
    header.set_entry_type(tar::EntryType::Directory);
    builder
        .append_data(&mut header, rel, io::empty())
        .map_err(|e| extraction_err(rel, e))
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    rel: &Path,
    meta: &Metadata,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata(meta);
    let file = File::open(path).map_err(|e| extraction_err(rel, e))?;
    builder
        .append_data(&mut header, rel, file)
        .map_err(|e| extraction_err(rel, e))
}

fn append_symlink<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    rel: &Path,
    meta: &Metadata,
) -> Result<()> {
    let target = std::fs::read_link(path).map_err(|e| extraction_err(rel, e))?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata(meta);
    header.set_size(0);
    header.set_entry_type(tar::EntryType::Symlink);
    builder
        .append_link(&mut header, rel, &target)
        .map_err(|e| extraction_err(rel, e))
}

/// Fifo and non-whiteout device nodes keep their type and device numbers.
fn append_special<W: Write>(
    builder: &mut tar::Builder<W>,
    rel: &Path,
    meta: &Metadata,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata(meta);
    header.set_size(0);
    if !meta.file_type().is_fifo() {
        let rdev = meta.rdev();
        header
            .set_device_major(nix::sys::stat::major(rdev) as u32)
            .map_err(|e| extraction_err(rel, e))?;
        header
            .set_device_minor(nix::sys::stat::minor(rdev) as u32)
            .map_err(|e| extraction_err(rel, e))?;
    }
    builder
        .append_data(&mut header, rel, io::empty())
        .map_err(|e| extraction_err(rel, e))
}

/// Whiteout and opaque markers are empty regular files; ownership and
/// mtime follow the upper entry that produced them.
fn append_marker<W: Write>(
    builder: &mut tar::Builder<W>,
    rel: &Path,
    meta: &Metadata,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o600);
    header.set_uid(meta.uid() as u64);
    header.set_gid(meta.gid() as u64);
    header.set_mtime(meta.mtime().max(0) as u64);
    builder
        .append_data(&mut header, rel, io::empty())
        .map_err(|e| extraction_err(rel, e))
}
