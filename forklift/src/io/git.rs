//! Git adapter for the run pipeline.
//!
//! Every git interaction goes through this small, explicit wrapper so
//! failures always surface the command and its combined output. History
//! rewriting and pushing are destructive, so nothing shells out ad hoc.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (cannot determine branch)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Resolve a revision to a full SHA.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", rev])?;
        Ok(out.trim().to_string())
    }

    /// Resolve a revision, returning `None` when it does not exist.
    pub fn try_rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let output = self.run(&["rev-parse", "--verify", "--quiet", rev])?;
        if !output.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if sha.is_empty() { None } else { Some(sha) })
    }

    /// Read a config value, `None` when unset.
    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let output = self.run(&["config", "--get", key])?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Raw `git remote -v` output.
    pub fn remote_lines(&self) -> Result<String> {
        self.run_capture(&["remote", "-v"])
    }

    /// Configured remote names.
    pub fn remote_names(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["remote"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Fetch URL of a remote, `None` when the remote does not exist.
    pub fn remote_url(&self, name: &str) -> Result<Option<String>> {
        let output = self.run(&["remote", "get-url", name])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    #[instrument(skip_all, fields(name))]
    pub fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        debug!(name, url, "adding remote");
        self.run_checked(&["remote", "add", name, url])?;
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    pub fn set_remote_url(&self, name: &str, url: &str) -> Result<()> {
        debug!(name, url, "updating remote url");
        self.run_checked(&["remote", "set-url", name, url])?;
        Ok(())
    }

    #[instrument(skip_all, fields(name))]
    pub fn remove_remote(&self, name: &str) -> Result<()> {
        debug!(name, "removing remote");
        self.run_checked(&["remote", "remove", name])?;
        Ok(())
    }

    /// Fetch a remote with prune, returning git's combined chatter
    /// (fetch reports on stderr; empty output means already up to date).
    pub fn fetch_prune(&self, remote: &str) -> Result<String> {
        let output = self.run_checked(&["fetch", remote, "--prune"])?;
        Ok(combined_output(&output))
    }

    /// Point a ref at a SHA, creating it if needed.
    pub fn update_ref(&self, reference: &str, sha: &str) -> Result<()> {
        self.run_checked(&["update-ref", reference, sha])?;
        Ok(())
    }

    /// Force-create a local branch at a SHA without checking it out.
    pub fn force_branch(&self, branch: &str, sha: &str) -> Result<()> {
        self.run_checked(&["branch", "-f", branch, sha])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// True if the worktree has any staged, unstaged, or untracked changes.
    pub fn has_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    /// Stash everything, untracked files included.
    #[instrument(skip_all)]
    pub fn stash_push(&self, message: &str) -> Result<()> {
        debug!(message, "stashing worktree changes");
        self.run_checked(&["stash", "push", "-u", "-m", message])?;
        Ok(())
    }

    /// Pop the most recent stash, surfacing git's conflict report on failure.
    pub fn stash_pop(&self) -> Result<String> {
        let output = self.run_checked(&["stash", "pop"])?;
        Ok(combined_output(&output))
    }

    /// Whether `ancestor` is reachable from `descendant`.
    ///
    /// git distinguishes "not an ancestor" (exit 1) from "cannot answer"
    /// (anything else); only the latter is an error here.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {} {} failed: {}",
                ancestor,
                descendant,
                combined_output(&output)
            )),
        }
    }

    /// Create or move a tag to a target.
    pub fn tag_force(&self, name: &str, target: &str) -> Result<()> {
        self.run_checked(&["tag", "-f", name, target])?;
        Ok(())
    }

    /// Push `branch` to `remote` guarded by a lease on `expected_sha`.
    ///
    /// The push is refused by the remote if its ref no longer equals
    /// `expected_sha`, which is the whole point of the lease.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_force_with_lease(
        &self,
        remote: &str,
        branch: &str,
        expected_sha: &str,
    ) -> Result<String> {
        let refspec = format!("{branch}:{branch}");
        let lease = format!("--force-with-lease={branch}:{expected_sha}");
        let output = self.run_checked(&["push", remote, &refspec, &lease])?;
        Ok(combined_output(&output))
    }

    /// Version banner of `git filter-repo`, erroring when not installed.
    pub fn filter_repo_version(&self) -> Result<String> {
        let out = self.run_capture(&["filter-repo", "--version"])?;
        Ok(out.trim().to_string())
    }

    /// Rewrite authorship on one branch using a mailmap file.
    #[instrument(skip_all, fields(branch))]
    pub fn filter_repo_mailmap(&self, mailmap: &Path, branch: &str) -> Result<()> {
        let mailmap_arg = format!("--mailmap={}", mailmap.display());
        let refs_arg = format!("--refs=refs/heads/{branch}");
        self.run_checked(&["filter-repo", "--force", &mailmap_arg, &refs_arg])?;
        Ok(())
    }

    /// SHAs of all commits by `author`, searched across every ref.
    pub fn commits_by_author(&self, author: &str) -> Result<Vec<String>> {
        let author_arg = format!("--author={author}");
        let out = self.run_capture(&["log", "--all", "--format=%H", &author_arg])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|sha| !sha.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                combined_output(&output)
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Full clone of `source` into `dest` (which must not exist yet).
///
/// Always a real clone: the run directory must stay usable if the source
/// repository is later pruned or deleted, so `--shared`/`--reference` are
/// never used.
#[instrument(skip_all)]
pub fn clone_repo(source: &Path, dest: &Path) -> Result<()> {
    debug!(source = %source.display(), dest = %dest.display(), "cloning repository");
    let output = Command::new("git")
        .arg("clone")
        .arg(source)
        .arg(dest)
        .output()
        .context("spawn git clone")?;
    if !output.status.success() {
        return Err(anyhow!(
            "git clone {} {} failed: {}",
            source.display(),
            dest.display(),
            combined_output(&output)
        ));
    }
    Ok(())
}

/// Stdout and stderr joined for logs and error messages.
fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut combined = stdout.trim_end().to_string();
    let stderr = stderr.trim_end();
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr);
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_repo;
    use tempfile::TempDir;

    #[test]
    fn current_branch_reads_checked_out_branch() {
        let temp = TempDir::new().expect("tempdir");
        let git = init_repo(temp.path());
        assert_eq!(git.current_branch().expect("branch"), "main");
    }

    #[test]
    fn try_rev_parse_returns_none_for_unknown_ref() {
        let temp = TempDir::new().expect("tempdir");
        let git = init_repo(temp.path());
        assert!(
            git.try_rev_parse("refs/remotes/upstream/main")
                .expect("rev-parse")
                .is_none()
        );
        assert!(git.try_rev_parse("HEAD").expect("rev-parse").is_some());
    }

    #[test]
    fn config_get_distinguishes_unset_keys() {
        let temp = TempDir::new().expect("tempdir");
        let git = init_repo(temp.path());
        assert_eq!(
            git.config_get("user.name").expect("config").as_deref(),
            Some("Test Operator")
        );
        assert!(
            git.config_get("forklift.doesnotexist")
                .expect("config")
                .is_none()
        );
    }

    #[test]
    fn failed_command_reports_args_and_output() {
        let temp = TempDir::new().expect("tempdir");
        let git = init_repo(temp.path());
        let err = git.rev_parse("no-such-ref").expect_err("should fail");
        let msg = format!("{err}");
        assert!(msg.contains("rev-parse"), "message was: {msg}");
        assert!(msg.contains("no-such-ref"), "message was: {msg}");
    }

    #[test]
    fn has_changes_sees_untracked_files() {
        let temp = TempDir::new().expect("tempdir");
        let git = init_repo(temp.path());
        assert!(!git.has_changes().expect("status"));
        std::fs::write(temp.path().join("scratch.txt"), "x\n").expect("write");
        assert!(git.has_changes().expect("status"));
    }

    #[test]
    fn is_ancestor_distinguishes_divergence_from_errors() {
        let temp = TempDir::new().expect("tempdir");
        let git = init_repo(temp.path());
        let base = git.rev_parse("HEAD").expect("head");
        crate::test_support::commit_file(&git, "a.txt", "a\n", "second");
        assert!(git.is_ancestor(&base, "HEAD").expect("ancestor"));
        assert!(!git.is_ancestor("HEAD", &base).expect("ancestor"));
        assert!(git.is_ancestor("garbage-ref", "HEAD").is_err());
    }
}
