//! Remote discovery and fetch for the source repository.
//!
//! A run refuses to start unless the source repo has both an `origin` and
//! an `upstream` remote: the post-run pipeline needs origin to push to and
//! upstream to verify ancestry against, and both URLs are recorded in run
//! metadata before the workspace loses its remotes.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::io::git::Git;

/// Remotes a source repository must have configured.
pub const REQUIRED_REMOTES: [&str; 2] = ["origin", "upstream"];

/// Map of remote name to fetch URL.
pub type RemoteSet = BTreeMap<String, String>;

/// Parse `git remote -v` output into a [`RemoteSet`].
///
/// Only `(fetch)` entries contribute URLs; the first occurrence of a name
/// wins; lines without name, url, and kind are skipped.
pub fn parse_remote_lines(raw: &str) -> RemoteSet {
    let mut remotes = RemoteSet::new();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(url), Some(kind)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if kind != "(fetch)" || remotes.contains_key(name) {
            continue;
        }
        remotes.insert(name.to_string(), url.to_string());
    }
    remotes
}

/// Enumerate the repo's fetch remotes.
pub fn discover_remotes(git: &Git) -> Result<RemoteSet> {
    let raw = git.remote_lines()?;
    let remotes = parse_remote_lines(&raw);
    debug!(count = remotes.len(), "discovered remotes");
    Ok(remotes)
}

/// Discover remotes and require every entry in [`REQUIRED_REMOTES`].
///
/// The error names every absent remote, not just the first, so one failed
/// run tells the operator everything to fix.
pub fn ensure_required_remotes(git: &Git) -> Result<RemoteSet> {
    let remotes = discover_remotes(git)?;
    let mut missing: Vec<&str> = REQUIRED_REMOTES
        .iter()
        .copied()
        .filter(|name| !remotes.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        bail!("missing required git remote(s): {}", missing.join(", "));
    }
    for (name, url) in &remotes {
        info!(remote = %name, url = %url, "detected remote");
    }
    Ok(remotes)
}

/// `git fetch --prune` every discovered remote, logging git's report.
pub fn fetch_remotes(git: &Git, remotes: &RemoteSet) -> Result<()> {
    for name in remotes.keys() {
        let output = git
            .fetch_prune(name)
            .with_context(|| format!("fetch remote {name}"))?;
        if output.is_empty() {
            info!(remote = %name, "fetch complete (up to date)");
        } else {
            info!(remote = %name, output = %output, "fetch complete");
        }
    }
    Ok(())
}
