//! Run directory preparation.
//!
//! Each run gets an isolated directory under the runs root: a full clone of
//! the source repo, sibling state and log directories for the sandbox, and
//! a metadata record capturing everything the post-run pipeline needs. The
//! order of operations matters: metadata is persisted before the workspace
//! is mutated, and the upstream baseline is seeded before ownership is
//! handed to the sandbox user.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::identity::OperatorIdentity;
use crate::io::git::{self, Git};
use crate::io::metadata::{RemoteRecord, RunMetadata, write_metadata};
use crate::io::ownership::{self, SANDBOX_GID, SANDBOX_UID};
use crate::remotes::RemoteSet;

/// Timestamp format used for run directory names and metadata.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const RUN_ID_LEN: usize = 6;

/// Absolute paths for one run. Created once; immutable afterwards. The run
/// directory is never deleted by the pipeline: it is the operator's
/// inspection and recovery surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    /// The isolated clone the sandbox works in.
    pub workspace: PathBuf,
    /// Scratch state the sandbox harness persists between steps.
    pub harness_state: PathBuf,
    /// Agent runtime log directory, bind-mounted into the container.
    pub agent_logs: PathBuf,
    /// Short random correlator tying host logs to sandbox logs.
    pub run_id: String,
}

impl RunPaths {
    /// Derive the standard layout beneath a run directory.
    pub fn new(run_dir: PathBuf, run_id: String) -> Self {
        let workspace = run_dir.join("workspace");
        let harness_state = run_dir.join("harness-state");
        let agent_logs = run_dir.join("opencode-logs");
        Self {
            run_dir,
            workspace,
            harness_state,
            agent_logs,
            run_id,
        }
    }
}

/// Creates and populates run directories.
#[derive(Debug, Clone)]
pub struct RunDirectoryManager {
    pub runs_root: PathBuf,
    /// Identity the run tree is handed to before the sandbox starts.
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
}

impl RunDirectoryManager {
    /// Manager rooted at `runs_root`, defaulting to `~/forklift/runs`.
    pub fn new(runs_root: Option<PathBuf>) -> Result<Self> {
        let runs_root = match runs_root {
            Some(root) => root,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("cannot determine home directory"))?
                .join("forklift")
                .join("runs"),
        };
        Ok(Self {
            runs_root,
            sandbox_uid: SANDBOX_UID,
            sandbox_gid: SANDBOX_GID,
        })
    }

    /// Prepare a fresh run directory for `source_repo`.
    ///
    /// Steps, in order, each a hard failure point: unique run dir, full
    /// clone, FORK.md overlay, baseline capture from the source repo,
    /// metadata persist, remote strip, upstream ref seeding, sandbox
    /// ownership. Partial state is left on disk for postmortem.
    #[instrument(skip_all, fields(branch = main_branch))]
    pub fn prepare(
        &self,
        source_repo: &Path,
        main_branch: &str,
        operator: &OperatorIdentity,
        remotes: &RemoteSet,
    ) -> Result<RunPaths> {
        let source_repo = source_repo
            .canonicalize()
            .with_context(|| format!("resolve source repository {}", source_repo.display()))?;
        let project = source_repo
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow!(
                    "source repository {} has no usable directory name",
                    source_repo.display()
                )
            })?;

        let timestamp = generate_timestamp();
        let run_dir = self.runs_root.join(format!("{project}_{timestamp}"));
        if run_dir.exists() {
            bail!("run directory already exists at {}", run_dir.display());
        }
        let paths = RunPaths::new(run_dir, generate_run_id());

        info!(run_dir = %paths.run_dir.display(), run_id = %paths.run_id, "creating run directory");
        fs::create_dir_all(&self.runs_root)
            .with_context(|| format!("create runs root {}", self.runs_root.display()))?;
        fs::create_dir(&paths.run_dir)
            .with_context(|| format!("create run directory {}", paths.run_dir.display()))?;
        fs::create_dir(&paths.harness_state)
            .with_context(|| format!("create {}", paths.harness_state.display()))?;
        fs::create_dir(&paths.agent_logs)
            .with_context(|| format!("create {}", paths.agent_logs.display()))?;

        git::clone_repo(&source_repo, &paths.workspace)?;
        overlay_fork_context(&source_repo, &paths.workspace)?;

        let source_git = Git::new(&source_repo);
        let upstream_main_sha = source_git.try_rev_parse(&format!("upstream/{main_branch}"))?;
        let origin_main_sha = source_git.try_rev_parse(&format!("origin/{main_branch}"))?;
        debug!(upstream = ?upstream_main_sha, origin = ?origin_main_sha, "captured baseline SHAs from source repo");

        let metadata = RunMetadata {
            source_repo: Some(source_repo.display().to_string()),
            created_at: Some(timestamp),
            main_branch: Some(main_branch.to_string()),
            upstream_main_sha: upstream_main_sha.clone(),
            origin_main_sha,
            operator_name: Some(operator.name.clone()),
            operator_email: Some(operator.email.clone()),
            remotes: Some(
                remotes
                    .iter()
                    .map(|(name, url)| {
                        (
                            name.clone(),
                            RemoteRecord {
                                fetch_url: url.clone(),
                            },
                        )
                    })
                    .collect(),
            ),
            run_id: Some(paths.run_id.clone()),
        };
        write_metadata(&paths.run_dir, &metadata)?;

        strip_remotes(&paths.workspace)?;
        seed_upstream_ref(&paths.workspace, main_branch, upstream_main_sha.as_deref())?;
        self.align_sandbox_ownership(&paths)?;

        Ok(paths)
    }

    fn align_sandbox_ownership(&self, paths: &RunPaths) -> Result<()> {
        info!(
            uid = self.sandbox_uid,
            gid = self.sandbox_gid,
            "aligning run tree ownership for the sandbox user"
        );
        for dir in [&paths.workspace, &paths.harness_state, &paths.agent_logs] {
            let report = ownership::chown_tree(dir, self.sandbox_uid, self.sandbox_gid)
                .with_context(|| format!("set sandbox ownership on {}", dir.display()))?;
            if report.skipped > 0 {
                warn!(dir = %dir.display(), skipped = report.skipped, "some entries kept their previous owner");
            }
        }
        Ok(())
    }
}

/// Copy the source repo's `FORK.md` over the workspace's, when present.
///
/// The overlay wins over any tracked copy so fork-local context reaches the
/// agent even when the file is deliberately kept out of history.
fn overlay_fork_context(source_repo: &Path, workspace: &Path) -> Result<()> {
    let fork_file = source_repo.join("FORK.md");
    if !fork_file.exists() {
        debug!(path = %fork_file.display(), "no FORK.md to overlay");
        return Ok(());
    }
    let destination = workspace.join("FORK.md");
    fs::copy(&fork_file, &destination)
        .with_context(|| format!("overlay {} into workspace", fork_file.display()))?;
    debug!(path = %destination.display(), "overlaid FORK.md");
    Ok(())
}

/// Remove every remote so the sandboxed agent cannot fetch or push.
fn strip_remotes(workspace: &Path) -> Result<()> {
    let git = Git::new(workspace);
    let names = git.remote_names()?;
    info!(count = names.len(), "removing remotes from workspace");
    for name in names {
        git.remove_remote(&name)?;
    }
    Ok(())
}

/// Seed `refs/remotes/upstream/<branch>` plus a helper branch at the
/// captured upstream tip.
///
/// Refused when the tip is unknown: a workspace without a verifiable
/// upstream baseline must never be handed to the sandbox.
fn seed_upstream_ref(workspace: &Path, main_branch: &str, upstream_sha: Option<&str>) -> Result<()> {
    let Some(sha) = upstream_sha else {
        bail!(
            "cannot seed upstream tracking ref: upstream/{main_branch} did not resolve in the source repository"
        );
    };
    let git = Git::new(workspace);
    let tracking_ref = format!("refs/remotes/upstream/{main_branch}");
    git.update_ref(&tracking_ref, sha)?;
    let helper_branch = format!("upstream-{main_branch}");
    git.force_branch(&helper_branch, sha)?;
    info!(
        tracking = %tracking_ref,
        helper = %helper_branch,
        sha = sha.get(..12).unwrap_or(sha),
        "seeded upstream baseline"
    );
    Ok(())
}

fn generate_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Short lowercase alphanumeric id from the thread CSPRNG.
fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(RUN_ID_LEN)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_paths_layout_is_fixed() {
        let paths = RunPaths::new(PathBuf::from("/runs/demo_20260101_120000"), "abc123".into());
        assert_eq!(
            paths.workspace,
            PathBuf::from("/runs/demo_20260101_120000/workspace")
        );
        assert_eq!(
            paths.harness_state,
            PathBuf::from("/runs/demo_20260101_120000/harness-state")
        );
        assert_eq!(
            paths.agent_logs,
            PathBuf::from("/runs/demo_20260101_120000/opencode-logs")
        );
    }

    #[test]
    fn run_ids_are_short_lowercase_tokens() {
        for _ in 0..20 {
            let id = generate_run_id();
            assert_eq!(id.len(), RUN_ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn timestamps_match_the_run_dir_format() {
        let ts = generate_timestamp();
        assert_eq!(ts.len(), 15);
        assert_eq!(ts.as_bytes()[8], b'_');
        assert!(ts.chars().filter(|c| *c != '_').all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn seeding_without_an_upstream_sha_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = crate::test_support::init_repo(temp.path());
        let err =
            seed_upstream_ref(git.workdir(), "main", None).expect_err("seeding should fail");
        assert!(
            format!("{err}").contains("upstream/main"),
            "got: {err}"
        );
    }
}
