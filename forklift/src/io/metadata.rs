//! Run metadata persisted next to the workspace.
//!
//! The record is written before the workspace is mutated and read back by
//! the post-run pipeline, possibly by a different process much later. Every
//! field is optional: the pipeline decides per field whether a gap is
//! acceptable, so a missing key must deserialize to `None`, never fail.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// File name inside the run directory.
pub const METADATA_FILE: &str = "metadata.json";

/// One remote as recorded at prepare time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteRecord {
    /// Fetch URL the remote is re-attached with after the run.
    /// Empty when an older record omitted it; the pipeline treats that as
    /// not publishable rather than failing the load.
    #[serde(default)]
    pub fetch_url: String,
}

/// Persisted description of a run (`<run_dir>/metadata.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunMetadata {
    /// Absolute path of the source repository.
    pub source_repo: Option<String>,
    /// Run timestamp (`%Y%m%d_%H%M%S`, UTC).
    pub created_at: Option<String>,
    /// Branch the run targets.
    pub main_branch: Option<String>,
    /// `upstream/<branch>` tip in the source repo at prepare time.
    pub upstream_main_sha: Option<String>,
    /// `origin/<branch>` tip in the source repo at prepare time.
    pub origin_main_sha: Option<String>,
    /// Operator identity the rewrite maps agent commits onto.
    pub operator_name: Option<String>,
    pub operator_email: Option<String>,
    /// Remotes stripped from the workspace, keyed by name.
    pub remotes: Option<BTreeMap<String, RemoteRecord>>,
    /// Short correlator tying logs to this run.
    pub run_id: Option<String>,
}

/// Load metadata for a run directory.
///
/// A missing file is not an error (old or hand-built run dirs): every field
/// reads as absent and the pipeline skips what it cannot prove. Malformed
/// JSON is an error.
pub fn load_metadata(run_dir: &Path) -> Result<RunMetadata> {
    let path = run_dir.join(METADATA_FILE);
    if !path.exists() {
        warn!(path = %path.display(), "run metadata missing, treating every field as absent");
        return Ok(RunMetadata::default());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read metadata {}", path.display()))?;
    let metadata: RunMetadata = serde_json::from_str(&contents)
        .with_context(|| format!("parse metadata {}", path.display()))?;
    debug!(run_id = ?metadata.run_id, "run metadata loaded");
    Ok(metadata)
}

/// Atomically write metadata into a run directory (temp file + rename).
pub fn write_metadata(run_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    let path = run_dir.join(METADATA_FILE);
    debug!(path = %path.display(), run_id = ?metadata.run_id, "writing run metadata");
    let mut buf = serde_json::to_string_pretty(metadata)?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("metadata path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp metadata {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace metadata {}", path.display()))?;
    Ok(())
}
