//! Streaming a subtree out of a container's mount namespace.
//!
//! Bind-mount contents are only visible inside the target container, so the
//! reader forks a `tar` producer that enters the container's mount
//! namespace via `setns(2)` before exec. The namespace switch happens in
//! the forked child only; no thread of this process ever migrates.

use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::sched::{setns, CloneFlags};

use nydus_commit_core::error::{CommitError, Result};

/// Stream `tar --xattrs --ignore-failed-read --absolute-names -cf - <source>`
/// from inside the mount namespace of `pid` into `writer`.
pub fn copy_from_container<W: Write + ?Sized>(pid: i32, source: &Path, writer: &mut W) -> Result<u64> {
    let ns_path = format!("/proc/{}/ns/mnt", pid);

    let mut command = Command::new("tar");
    command
        .args(["--xattrs", "--ignore-failed-read", "--absolute-names", "-cf", "-"])
        .arg(source)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    unsafe {
        command.pre_exec(move || {
            let ns = std::fs::File::open(&ns_path)?;
            setns(&ns, CloneFlags::CLONE_NEWNS).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|e| {
        CommitError::NamespaceEntry(format!("spawn tar for pid {}: {}", pid, e))
    })?;

    // Drain stderr concurrently so a chatty tar cannot stall the pipe.
    let mut stderr = child.stderr.take().expect("stderr was piped");
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf);
        buf
    });

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let copied = std::io::copy(&mut stdout, writer).map_err(|e| {
        CommitError::NamespaceEntry(format!("stream tar from pid {}: {}", pid, e))
    })?;

    let status = child.wait().map_err(|e| {
        CommitError::NamespaceEntry(format!("wait for tar of pid {}: {}", pid, e))
    })?;
    let stderr_text = stderr_reader.join().unwrap_or_default();

    if !status.success() {
        return Err(CommitError::NamespaceEntry(format!(
            "tar of {} in pid {} exited with {}: {}",
            source.display(),
            pid,
            status,
            stderr_text.trim()
        )));
    }
    if !stderr_text.trim().is_empty() {
        tracing::warn!(pid, source = %source.display(), "from container: {}", stderr_text.trim());
    }

    Ok(copied)
}
