//! Recursive ownership changes for run directories.
//!
//! The workspace is handed to a container user and taken back afterwards,
//! so ownership flips twice per run. Traversal is an explicit worklist over
//! `symlink_metadata`: symlinks get their link inode chowned and are never
//! followed, which keeps a hostile workspace from redirecting the chown
//! outside the run directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use nix::fcntl::AtFlags;
use nix::unistd::{self, Gid, Uid};
use tracing::{debug, warn};

/// Uid the sandbox user runs under inside the container.
pub const SANDBOX_UID: u32 = 1000;
/// Gid of the sandbox user.
pub const SANDBOX_GID: u32 = 1000;

/// Tally of one ownership pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChownReport {
    /// Entries whose owner was changed (the root included).
    pub changed: usize,
    /// Entries skipped after a per-entry failure.
    pub skipped: usize,
}

/// The invoking user's uid and gid.
pub fn host_ids() -> (u32, u32) {
    (unistd::getuid().as_raw(), unistd::getgid().as_raw())
}

/// Parse a `--chown` value of the form `UID[:GID]`.
///
/// The uid is required; an omitted gid falls back to `default_gid` (the
/// host gid in practice).
pub fn parse_chown_spec(spec: &str, default_gid: u32) -> Result<(u32, u32)> {
    let trimmed = spec.trim();
    let (uid_part, gid_part) = match trimmed.split_once(':') {
        Some((uid, gid)) => (uid.trim(), Some(gid.trim())),
        None => (trimmed, None),
    };
    if uid_part.is_empty() {
        bail!("invalid --chown value {spec:?}: UID is required");
    }
    let uid = parse_id_component(uid_part, "UID")?;
    let gid = match gid_part {
        None | Some("") => default_gid,
        Some(raw) => parse_id_component(raw, "GID")?,
    };
    Ok((uid, gid))
}

fn parse_id_component(raw: &str, label: &str) -> Result<u32> {
    raw.parse::<u32>().map_err(|_| {
        anyhow!("invalid {label} {raw:?} in --chown value; expected a non-negative integer")
    })
}

/// Change ownership of `root` and everything beneath it to `uid:gid`.
///
/// Failing to chown the root itself is an error; failures on individual
/// children (racing deletions, foreign mounts) are logged and counted but
/// do not abort the pass.
pub fn chown_tree(root: &Path, uid: u32, gid: u32) -> Result<ChownReport> {
    let owner = Uid::from_raw(uid);
    let group = Gid::from_raw(gid);
    let dirfd = fs::File::open(".").context("open current directory for fchownat")?;

    let root_meta =
        fs::symlink_metadata(root).with_context(|| format!("stat {}", root.display()))?;
    unistd::fchownat(
        &dirfd,
        root,
        Some(owner),
        Some(group),
        AtFlags::AT_SYMLINK_NOFOLLOW,
    )
    .with_context(|| format!("chown {} to {uid}:{gid}", root.display()))?;

    let mut report = ChownReport {
        changed: 1,
        skipped: 0,
    };
    if !root_meta.is_dir() {
        return Ok(report);
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %current.display(), %err, "cannot list directory, skipping subtree");
                report.skipped += 1;
                continue;
            }
        };
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    warn!(dir = %current.display(), %err, "unreadable directory entry, skipping");
                    report.skipped += 1;
                    continue;
                }
            };
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %path.display(), %err, "cannot stat, skipping");
                    report.skipped += 1;
                    continue;
                }
            };
            if let Err(err) = unistd::fchownat(
                &dirfd,
                path.as_path(),
                Some(owner),
                Some(group),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            ) {
                warn!(path = %path.display(), %err, "cannot change owner, skipping");
                report.skipped += 1;
                continue;
            }
            report.changed += 1;
            // symlink_metadata never reports a symlink as a directory, so
            // link targets are never descended into.
            if metadata.is_dir() {
                stack.push(path);
            }
        }
    }

    debug!(root = %root.display(), uid, gid, changed = report.changed, skipped = report.skipped, "ownership pass complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn parses_uid_only_with_default_gid() {
        assert_eq!(parse_chown_spec("1000", 42).expect("parse"), (1000, 42));
        assert_eq!(parse_chown_spec(" 1000 : ", 42).expect("parse"), (1000, 42));
    }

    #[test]
    fn parses_uid_and_gid() {
        assert_eq!(
            parse_chown_spec("1000:1001", 42).expect("parse"),
            (1000, 1001)
        );
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(parse_chown_spec(":5", 42).is_err());
        assert!(parse_chown_spec("abc", 42).is_err());
        assert!(parse_chown_spec("-1", 42).is_err());
        assert!(parse_chown_spec("1000:-5", 42).is_err());
    }

    #[test]
    fn chowns_a_nested_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("a/b")).expect("mkdirs");
        fs::write(root.join("a/file.txt"), "x\n").expect("write");
        fs::write(root.join("a/b/deep.txt"), "y\n").expect("write");

        let (uid, gid) = host_ids();
        let report = chown_tree(&root, uid, gid).expect("chown");
        // root + a + b + two files
        assert_eq!(report.changed, 5);
        assert_eq!(report.skipped, 0);
    }

    #[test]
    fn symlink_cycles_terminate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("sub")).expect("mkdirs");
        symlink(&root, root.join("sub/loop")).expect("symlink");

        let (uid, gid) = host_ids();
        let report = chown_tree(&root, uid, gid).expect("chown");
        // root + sub + the link itself, nothing through the link
        assert_eq!(report.changed, 3);
    }

    #[test]
    fn symlink_root_is_not_descended() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("target");
        fs::create_dir_all(&target).expect("mkdir");
        fs::write(target.join("inner.txt"), "z\n").expect("write");
        let link = temp.path().join("link");
        symlink(&target, &link).expect("symlink");

        let (uid, gid) = host_ids();
        let report = chown_tree(&link, uid, gid).expect("chown");
        assert_eq!(report.changed, 1);
    }

    #[test]
    fn missing_root_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (uid, gid) = host_ids();
        assert!(chown_tree(&temp.path().join("nope"), uid, gid).is_err());
    }
}
