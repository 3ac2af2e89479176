//! Post-run verification, authorship rewrite, and publication.
//!
//! After the sandbox exits cleanly the workspace holds agent-authored
//! commits and no remotes. This module walks the recovery pipeline: refuse
//! stuck runs, prove the upstream baseline is still an ancestor, rewrite
//! authorship onto the operator, anchor the previous origin tip under a
//! safety tag, and force-push behind a lease on that tip. Everything here
//! operates on the persisted run metadata, never on ambient CLI state, so
//! the pipeline behaves the same for a fresh run and a re-run of an old
//! run directory.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::identity::{OperatorIdentity, agent_signature, mailmap_line};
use crate::io::git::Git;
use crate::io::metadata::{RunMetadata, load_metadata};
use crate::prepare::RunPaths;
use crate::remotes::REQUIRED_REMOTES;

/// File the agent writes into the workspace when it gives up.
pub const STUCK_SENTINEL: &str = "STUCK.md";
/// How much of the sentinel is surfaced in the logs.
pub const STUCK_PREVIEW_LINES: usize = 40;
/// Stash message used while the pipeline rewrites history.
pub const STASH_MESSAGE: &str = "forklift-authorship-rewrite";
/// Mailmap file name inside the run directory; removed after the rewrite.
pub const MAILMAP_FILE: &str = "authorship.mailmap";

pub const FILTER_REPO_INSTALL_HELP: &str = "Install git filter-repo 2.47.0+: \
    pip install git-filter-repo==2.47.0, brew install git-filter-repo, or \
    download the standalone script from https://github.com/newren/git-filter-repo/releases \
    (requires git >= 2.22 and python >= 3.6).";

/// The agent declared itself stuck instead of finishing the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckSentinelError {
    pub path: PathBuf,
}

impl fmt::Display for StuckSentinelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent reported being stuck via {}", self.path.display())
    }
}

impl std::error::Error for StuckSentinelError {}

/// The upstream baseline is not an ancestor of the branch being published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamDivergenceError {
    pub upstream_ref: String,
    pub branch: String,
    pub detail: String,
}

impl fmt::Display for UpstreamDivergenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is not merged into {}: {}",
            self.upstream_ref, self.branch, self.detail
        )
    }
}

impl std::error::Error for UpstreamDivergenceError {}

/// Agent-authored commits survived the rewrite. Publishing them would leak
/// the synthetic identity into shared history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualAuthorshipError {
    /// First few offending commit SHAs, comma separated.
    pub sample: String,
}

impl fmt::Display for ResidualAuthorshipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "authorship rewrite incomplete; commits authored by {} remain: {}",
            agent_signature(),
            self.sample
        )
    }
}

impl std::error::Error for ResidualAuthorshipError {}

/// What the rewrite/push stage did, for the summary log and for callers
/// that want to assert on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub branch: String,
    pub operator: OperatorIdentity,
    pub origin_sha: String,
    pub tag_name: Option<String>,
    pub stash_created: bool,
    pub stash_conflicts: bool,
    pub pushed: bool,
}

/// Rewrites commit authorship on one branch.
///
/// Production shells out to `git filter-repo`; tests substitute a rewriter
/// that does not need the tool installed.
pub trait HistoryRewriter {
    /// Verify the tool is usable before any history is touched.
    fn ensure_available(&self, git: &Git) -> Result<()>;
    /// Rewrite `branch` so mailmapped authors are replaced.
    fn rewrite(&self, git: &Git, branch: &str, mailmap: &Path) -> Result<()>;
}

/// `git filter-repo` with a mailmap, scoped to a single branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterRepo;

impl HistoryRewriter for FilterRepo {
    fn ensure_available(&self, git: &Git) -> Result<()> {
        let version = git.filter_repo_version().context(FILTER_REPO_INSTALL_HELP)?;
        if !version.is_empty() {
            info!(version = %version, "git filter-repo detected");
        }
        Ok(())
    }

    fn rewrite(&self, git: &Git, branch: &str, mailmap: &Path) -> Result<()> {
        git.filter_repo_mailmap(mailmap, branch)
    }
}

/// Run the whole post-sandbox pipeline for a run directory.
///
/// Returns the rewrite outcome, or `None` when the run was not eligible
/// for publication (incomplete metadata). Stuck runs and upstream
/// divergence surface as typed errors so the process exit code can
/// distinguish them.
#[instrument(skip_all, fields(run_dir = %paths.run_dir.display()))]
pub fn finalize_run(
    source_repo: &Path,
    paths: &RunPaths,
    configured_branch: &str,
    rewriter: &dyn HistoryRewriter,
) -> Result<Option<RewriteOutcome>> {
    let metadata = load_metadata(&paths.run_dir)?;
    let git = Git::new(&paths.workspace);

    fail_if_stuck(&paths.workspace)?;

    let metadata_branch = metadata.main_branch.clone().filter(|b| !b.is_empty());
    let target_branch = match &metadata_branch {
        Some(branch) => branch.clone(),
        None if !configured_branch.is_empty() => configured_branch.to_string(),
        None => git.current_branch()?,
    };
    let upstream_branch = metadata_branch.unwrap_or_else(|| configured_branch.to_string());
    let upstream_ref = format!("upstream/{upstream_branch}");

    verify_upstream_ancestry(
        &git,
        &upstream_ref,
        &target_branch,
        metadata.upstream_main_sha.as_deref(),
    )?;

    let outcome = rewrite_and_push(&git, paths, &metadata, &target_branch, rewriter)?;
    log_rewrite_summary(outcome.as_ref());
    log_pr_stub(source_repo, &target_branch, outcome.as_ref());
    Ok(outcome)
}

/// Fail the run when the agent left a stuck sentinel in the workspace.
///
/// The sentinel's first lines are surfaced so the operator sees why the
/// agent gave up without opening the run directory. An unreadable sentinel
/// still fails the run.
fn fail_if_stuck(workspace: &Path) -> Result<()> {
    let stuck_file = workspace.join(STUCK_SENTINEL);
    if !stuck_file.exists() {
        return Ok(());
    }
    warn!(path = %stuck_file.display(), "STUCK.md detected; skipping verification and publication");
    match fs::read_to_string(&stuck_file) {
        Ok(contents) => {
            let contents = contents.trim();
            if contents.is_empty() {
                warn!("STUCK.md is empty");
            } else {
                let preview = contents
                    .lines()
                    .take(STUCK_PREVIEW_LINES)
                    .collect::<Vec<_>>()
                    .join("\n");
                warn!("STUCK.md preview (first {STUCK_PREVIEW_LINES} lines):\n{preview}");
            }
        }
        Err(err) => warn!("unable to read STUCK.md: {err}"),
    }
    Err(StuckSentinelError { path: stuck_file }.into())
}

/// Prove the upstream baseline is an ancestor of the branch.
///
/// Both "not an ancestor" and "cannot answer" (for example a missing ref)
/// are divergence: the run must not publish anything it cannot prove sits
/// on top of upstream.
fn verify_upstream_ancestry(
    git: &Git,
    upstream_ref: &str,
    branch: &str,
    upstream_sha: Option<&str>,
) -> Result<()> {
    let divergence = |detail: String| UpstreamDivergenceError {
        upstream_ref: upstream_ref.to_string(),
        branch: branch.to_string(),
        detail,
    };
    let merged = match git.is_ancestor(upstream_ref, branch) {
        Ok(merged) => merged,
        Err(err) => {
            error!("upstream verification failed: {err:#}");
            return Err(divergence(format!("{err:#}")).into());
        }
    };
    if !merged {
        error!(upstream = upstream_ref, branch, "upstream tip is not merged into the branch");
        return Err(divergence("upstream tip is not an ancestor of the branch".to_string()).into());
    }
    match upstream_sha {
        Some(sha) => info!(
            upstream = upstream_ref,
            sha = short_sha(sha),
            branch,
            "verified upstream is an ancestor"
        ),
        None => info!(upstream = upstream_ref, branch, "verified upstream is an ancestor"),
    }
    Ok(())
}

#[instrument(skip_all, fields(branch = target_branch))]
fn rewrite_and_push(
    git: &Git,
    paths: &RunPaths,
    metadata: &RunMetadata,
    target_branch: &str,
    rewriter: &dyn HistoryRewriter,
) -> Result<Option<RewriteOutcome>> {
    // Eligibility: without the full identity, baseline, and remote record
    // the pipeline skips publication instead of guessing.
    let operator_name = metadata.operator_name.as_deref().filter(|s| !s.is_empty());
    let operator_email = metadata.operator_email.as_deref().filter(|s| !s.is_empty());
    let origin_sha = metadata.origin_main_sha.as_deref().filter(|s| !s.is_empty());
    let (Some(operator_name), Some(operator_email), Some(origin_sha)) =
        (operator_name, operator_email, origin_sha)
    else {
        info!("missing operator identity or origin baseline in metadata; skipping rewrite/push");
        return Ok(None);
    };
    let Some(remotes) = metadata.remotes.as_ref() else {
        warn!("remote metadata unavailable; skipping rewrite/push");
        return Ok(None);
    };
    let mut remote_urls: Vec<(String, String)> = Vec::new();
    for name in REQUIRED_REMOTES {
        let Some(record) = remotes.get(name) else {
            warn!(remote = name, "remote metadata missing; skipping rewrite/push");
            return Ok(None);
        };
        if record.fetch_url.is_empty() {
            warn!(remote = name, "remote metadata lacks fetch_url; skipping rewrite/push");
            return Ok(None);
        }
        remote_urls.push((name.to_string(), record.fetch_url.clone()));
    }
    let operator = OperatorIdentity {
        name: operator_name.to_string(),
        email: operator_email.to_string(),
    };

    // Idempotency: compare the branch tip itself before creating any stash
    // or tag state that would then need unwinding.
    let branch_tip = git.try_rev_parse(&format!("refs/heads/{target_branch}"))?;
    if branch_tip.as_deref() == Some(origin_sha) {
        info!(
            branch = target_branch,
            sha = short_sha(origin_sha),
            "branch tip already matches the stored origin baseline; nothing to publish"
        );
        return Ok(Some(RewriteOutcome {
            branch: target_branch.to_string(),
            operator,
            origin_sha: origin_sha.to_string(),
            tag_name: None,
            stash_created: false,
            stash_conflicts: false,
            pushed: false,
        }));
    }

    // The stash flag outlives the attempt: on failure the operator must be
    // told their uncommitted work is parked on the stash stack.
    let mut stash_created = false;
    let attempt = (|| -> Result<RewriteOutcome> {
        if git.has_changes()? {
            info!(message = STASH_MESSAGE, "stashing workspace state before rewrite");
            git.stash_push(STASH_MESSAGE)?;
            stash_created = true;
        }

        let current = git.current_branch()?;
        if current != target_branch {
            info!(
                current = %current,
                target = target_branch,
                "checking out the target branch before rewrite"
            );
            git.checkout_branch(target_branch)?;
        }

        for (name, url) in &remote_urls {
            ensure_remote(git, name, url)?;
        }
        for (name, _) in &remote_urls {
            let fetch_output = git
                .fetch_prune(name)
                .with_context(|| format!("fetch remote {name} in workspace"))?;
            if !fetch_output.is_empty() {
                info!(remote = %name, "workspace fetch output:\n{fetch_output}");
            }
        }

        rewriter.ensure_available(git)?;
        rewrite_authorship(git, &paths.run_dir, &operator, target_branch, rewriter)?;
        assert_no_agent_commits(git)?;

        let tag_timestamp = metadata
            .created_at
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("latest");
        let tag_name = format!("forklift/{target_branch}/{tag_timestamp}/pre-push");
        git.tag_force(&tag_name, origin_sha)
            .with_context(|| format!("create safety tag {tag_name}"))?;

        let push_output = git.push_force_with_lease("origin", target_branch, origin_sha)?;
        if !push_output.is_empty() {
            info!("push output:\n{push_output}");
        }

        let stash_conflicts = stash_created && !pop_stash(git);

        Ok(RewriteOutcome {
            branch: target_branch.to_string(),
            operator: operator.clone(),
            origin_sha: origin_sha.to_string(),
            tag_name: Some(tag_name),
            stash_created,
            stash_conflicts,
            pushed: true,
        })
    })();

    match attempt {
        Ok(outcome) => Ok(Some(outcome)),
        Err(err) => {
            error!("failed to rewrite and push the branch: {err:#}");
            if stash_created {
                warn!(
                    "stash '{STASH_MESSAGE}' remains on the stack; recover it via `git stash list` inside {}",
                    git.workdir().display()
                );
            }
            Err(err)
        }
    }
}

/// Re-attach a remote the prepare step stripped, updating a stale URL.
fn ensure_remote(git: &Git, name: &str, url: &str) -> Result<()> {
    match git.remote_url(name)? {
        None => {
            info!(remote = name, url, "reattaching remote");
            git.add_remote(name, url)
        }
        Some(current) if current == url => Ok(()),
        Some(current) => {
            info!(remote = name, url, previous = %current, "updating remote url");
            git.set_remote_url(name, url)
        }
    }
}

/// Write the mailmap, run the rewriter, and always remove the file.
///
/// The mailmap pairs the operator's real identity with the agent identity;
/// it must not outlive the rewrite even when the rewrite fails.
fn rewrite_authorship(
    git: &Git,
    run_dir: &Path,
    operator: &OperatorIdentity,
    branch: &str,
    rewriter: &dyn HistoryRewriter,
) -> Result<()> {
    let mailmap_path = run_dir.join(MAILMAP_FILE);
    fs::write(&mailmap_path, mailmap_line(operator))
        .with_context(|| format!("write {}", mailmap_path.display()))?;
    let result = rewriter.rewrite(git, branch, &mailmap_path);
    if let Err(err) = fs::remove_file(&mailmap_path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %mailmap_path.display(), "unable to remove mailmap: {err}");
    }
    result
}

/// No commit anywhere in the repo may still carry the agent identity.
fn assert_no_agent_commits(git: &Git) -> Result<()> {
    let residual = git.commits_by_author(&agent_signature())?;
    if residual.is_empty() {
        return Ok(());
    }
    let sample = residual
        .iter()
        .take(5)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let err = ResidualAuthorshipError { sample };
    error!("{err}");
    Err(err.into())
}

/// Try to reapply the stash; `false` means it stayed on the stack.
fn pop_stash(git: &Git) -> bool {
    match git.stash_pop() {
        Ok(output) => {
            if !output.is_empty() {
                info!("stash pop output:\n{output}");
            }
            true
        }
        Err(err) => {
            warn!(
                "unable to auto-pop stash '{STASH_MESSAGE}': {err:#}; recover manually via `git stash list`"
            );
            false
        }
    }
}

fn log_rewrite_summary(outcome: Option<&RewriteOutcome>) {
    let Some(outcome) = outcome else {
        info!("rewrite/push pipeline skipped (metadata incomplete)");
        return;
    };
    if !outcome.pushed {
        info!(
            branch = %outcome.branch,
            origin = short_sha(&outcome.origin_sha),
            "branch already matched origin; no rewrite/push required"
        );
        log_stash_outcome(outcome);
        return;
    }
    info!(
        branch = %outcome.branch,
        operator = %outcome.operator.signature(),
        "authorship rewrite complete; branch force-pushed to origin"
    );
    if let Some(tag_name) = &outcome.tag_name {
        info!(
            tag = %tag_name,
            baseline = short_sha(&outcome.origin_sha),
            "local safety tag points to the pre-push baseline"
        );
    }
    log_stash_outcome(outcome);
}

fn log_stash_outcome(outcome: &RewriteOutcome) {
    if !outcome.stash_created {
        return;
    }
    if outcome.stash_conflicts {
        warn!("stash '{STASH_MESSAGE}' reapplied with conflicts; inspect the workspace and `git stash list`");
    } else {
        info!("stash '{STASH_MESSAGE}' reapplied cleanly");
    }
}

/// Final handoff note. Opening the pull request stays manual.
fn log_pr_stub(source_repo: &Path, branch: &str, outcome: Option<&RewriteOutcome>) {
    if outcome.is_some_and(|o| o.pushed) {
        info!(
            branch,
            repo = %source_repo.display(),
            "PR stub: branch is on origin; run `gh pr create --head {branch} --base {branch}` when ready"
        );
    } else {
        info!(
            branch,
            repo = %source_repo.display(),
            "PR stub: no rewritten commits were pushed; nothing to do"
        );
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}
