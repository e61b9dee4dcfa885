//! Overlay lower-dir discovery from the mount table.
//!
//! The docker engine does not report the lower-dir stack directly; it is
//! recovered from the overlay mount entry of the container's merged dir.

use std::path::{Path, PathBuf};

use nydus_commit_core::error::{CommitError, Result};

/// Read the ordered lower dirs of the overlay mounted at `mountpoint`.
pub fn lower_dirs(mountpoint: &Path) -> Result<Vec<PathBuf>> {
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
    parse_lower_dirs(&mountinfo, mountpoint)
}

/// Locate `mountpoint` in mountinfo content and split its `lowerdir=`
/// option on `:`.
fn parse_lower_dirs(mountinfo: &str, mountpoint: &Path) -> Result<Vec<PathBuf>> {
    for line in mountinfo.lines() {
        // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - overlay overlay rw,lowerdir=/a:/b,...
        let Some((mount_fields, fs_fields)) = line.split_once(" - ") else {
            continue;
        };
        let fields: Vec<&str> = mount_fields.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        // Mount points escape spaces as \040.
        let entry_point = fields[4].replace("\\040", " ");
        if Path::new(&entry_point) != mountpoint {
            continue;
        }

        let mut fs_iter = fs_fields.split_whitespace();
        let fstype = fs_iter.next().unwrap_or_default();
        if fstype != "overlay" {
            return Err(CommitError::Inspect(format!(
                "mount at {} is {} instead of overlay",
                mountpoint.display(),
                fstype
            )));
        }
        let _source = fs_iter.next();
        let super_options = fs_iter.next().unwrap_or_default();

        for option in super_options.split(',') {
            if let Some(joined) = option.strip_prefix("lowerdir=") {
                return Ok(joined
                    .split(':')
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from)
                    .collect());
            }
        }
        return Err(CommitError::Inspect(format!(
            "overlay mount at {} has no lowerdir option",
            mountpoint.display()
        )));
    }

    Err(CommitError::Inspect(format!(
        "no mount entry found for {}",
        mountpoint.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 27 0:20 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
612 29 0:54 / /var/lib/docker/overlay2/abc/merged rw,relatime shared:303 - overlay overlay rw,lowerdir=/var/lib/docker/overlay2/l/AAA:/var/lib/docker/overlay2/l/BBB,upperdir=/var/lib/docker/overlay2/abc/diff,workdir=/var/lib/docker/overlay2/abc/work
613 29 0:55 / /mnt/plain rw,relatime - ext4 /dev/sda1 rw
";

    #[test]
    fn test_parse_lower_dirs() {
        let dirs = parse_lower_dirs(
            MOUNTINFO,
            Path::new("/var/lib/docker/overlay2/abc/merged"),
        )
        .unwrap();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/var/lib/docker/overlay2/l/AAA"),
                PathBuf::from("/var/lib/docker/overlay2/l/BBB"),
            ]
        );
    }

    #[test]
    fn test_parse_missing_mountpoint() {
        let err = parse_lower_dirs(MOUNTINFO, Path::new("/not/mounted")).unwrap_err();
        assert!(matches!(err, CommitError::Inspect(_)));
    }

    #[test]
    fn test_parse_not_an_overlay() {
        let err = parse_lower_dirs(MOUNTINFO, Path::new("/mnt/plain")).unwrap_err();
        assert!(err.to_string().contains("instead of overlay"));
    }

    #[test]
    fn test_parse_escaped_mountpoint() {
        let mountinfo = "612 29 0:54 / /var/lib/with\\040space/merged rw - overlay overlay rw,lowerdir=/l/A,upperdir=/u,workdir=/w\n";
        let dirs =
            parse_lower_dirs(mountinfo, Path::new("/var/lib/with space/merged")).unwrap();
        assert_eq!(dirs, vec![PathBuf::from("/l/A")]);
    }
}
