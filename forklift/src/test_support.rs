//! Test-only fixtures: throwaway git repositories shaped like the fork
//! layout the orchestrator expects, plus substitute history rewriters so
//! the publication pipeline can run without `git filter-repo` installed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, bail};
use tempfile::TempDir;

use crate::identity::{AGENT_EMAIL, AGENT_NAME};
use crate::io::git::Git;
use crate::publish::HistoryRewriter;

/// Run a git command in `dir`, panicking with full output on failure.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialize a repository at `path` with a `main` branch, a test operator
/// identity, and one initial commit.
pub fn init_repo(path: &Path) -> Git {
    fs::create_dir_all(path).expect("create repo dir");
    run_git(path, &["init", "-b", "main"]);
    run_git(path, &["config", "user.name", "Test Operator"]);
    run_git(path, &["config", "user.email", "operator@example.com"]);
    let git = Git::new(path);
    commit_file(&git, "README.md", "# fixture\n", "initial commit");
    git
}

/// Write a file and commit it as the configured (operator) identity.
pub fn commit_file(git: &Git, name: &str, contents: &str, message: &str) {
    let path = git.workdir().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&path, contents).expect("write file");
    run_git(git.workdir(), &["add", "."]);
    run_git(git.workdir(), &["commit", "-m", message]);
}

/// Write a file and commit it with the agent's author and committer
/// identity, like the sandboxed agent would.
pub fn commit_file_as_agent(git: &Git, name: &str, contents: &str, message: &str) {
    let path = git.workdir().join(name);
    fs::write(&path, contents).expect("write file");
    run_git(git.workdir(), &["add", "."]);
    let output = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(git.workdir())
        .env("GIT_AUTHOR_NAME", AGENT_NAME)
        .env("GIT_AUTHOR_EMAIL", AGENT_EMAIL)
        .env("GIT_COMMITTER_NAME", AGENT_NAME)
        .env("GIT_COMMITTER_EMAIL", AGENT_EMAIL)
        .output()
        .expect("spawn git commit");
    assert!(
        output.status.success(),
        "agent commit failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Author signature (`Name <email>`) of a commit.
pub fn author_of(git: &Git, rev: &str) -> String {
    run_git(git.workdir(), &["log", "-1", "--format=%an <%ae>", rev])
}

/// A source repository flanked by bare `origin` and `upstream` remotes,
/// already pushed and fetched so both remote-tracking refs resolve.
pub struct SourceRepo {
    pub dir: TempDir,
    pub repo: PathBuf,
    pub origin: PathBuf,
    pub upstream: PathBuf,
}

impl SourceRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let repo = dir.path().join("project");
        let origin = dir.path().join("origin.git");
        let upstream = dir.path().join("upstream.git");

        run_git(dir.path(), &["init", "--bare", "-b", "main", "origin.git"]);
        run_git(dir.path(), &["init", "--bare", "-b", "main", "upstream.git"]);

        let git = init_repo(&repo);
        git.add_remote("origin", origin.to_str().expect("utf8 path"))
            .expect("add origin");
        git.add_remote("upstream", upstream.to_str().expect("utf8 path"))
            .expect("add upstream");
        run_git(&repo, &["push", "origin", "main"]);
        run_git(&repo, &["push", "upstream", "main"]);
        run_git(&repo, &["fetch", "origin"]);
        run_git(&repo, &["fetch", "upstream"]);

        Self {
            dir,
            repo,
            origin,
            upstream,
        }
    }

    pub fn git(&self) -> Git {
        Git::new(&self.repo)
    }

    /// Tip of a branch in the bare origin repository.
    pub fn origin_tip(&self, branch: &str) -> String {
        run_git(&self.origin, &["rev-parse", branch])
    }
}

impl Default for SourceRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrites authorship with `git filter-branch`, so pipeline tests do not
/// need `git filter-repo` installed. Reads the mailmap the pipeline wrote
/// to learn the replacement identity.
pub struct FilterBranchRewriter;

impl HistoryRewriter for FilterBranchRewriter {
    fn ensure_available(&self, _git: &Git) -> Result<()> {
        Ok(())
    }

    fn rewrite(&self, git: &Git, branch: &str, mailmap: &Path) -> Result<()> {
        let (name, email) = parse_mailmap_target(mailmap);
        let script = r#"
if [ "$GIT_AUTHOR_EMAIL" = "$FORKLIFT_OLD_EMAIL" ]; then
  GIT_AUTHOR_NAME="$FORKLIFT_NEW_NAME"
  GIT_AUTHOR_EMAIL="$FORKLIFT_NEW_EMAIL"
fi
if [ "$GIT_COMMITTER_EMAIL" = "$FORKLIFT_OLD_EMAIL" ]; then
  GIT_COMMITTER_NAME="$FORKLIFT_NEW_NAME"
  GIT_COMMITTER_EMAIL="$FORKLIFT_NEW_EMAIL"
fi
export GIT_AUTHOR_NAME GIT_AUTHOR_EMAIL GIT_COMMITTER_NAME GIT_COMMITTER_EMAIL
"#;
        let ref_arg = format!("refs/heads/{branch}");
        let output = Command::new("git")
            .args(["filter-branch", "--force", "--env-filter", script, "--", &ref_arg])
            .current_dir(git.workdir())
            .env("FILTER_BRANCH_SQUELCH_WARNING", "1")
            .env("FORKLIFT_OLD_EMAIL", AGENT_EMAIL)
            .env("FORKLIFT_NEW_NAME", &name)
            .env("FORKLIFT_NEW_EMAIL", &email)
            .output()?;
        if !output.status.success() {
            bail!(
                "git filter-branch failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        // drop the backup ref filter-branch keeps; it would trip the
        // residual authorship check (absent when nothing changed)
        let _ = Command::new("git")
            .args(["update-ref", "-d", &format!("refs/original/{ref_arg}")])
            .current_dir(git.workdir())
            .output();
        Ok(())
    }
}

/// Claims availability and rewrites nothing; exercises the residual
/// authorship check.
pub struct NoopRewriter;

impl HistoryRewriter for NoopRewriter {
    fn ensure_available(&self, _git: &Git) -> Result<()> {
        Ok(())
    }

    fn rewrite(&self, _git: &Git, _branch: &str, _mailmap: &Path) -> Result<()> {
        Ok(())
    }
}

fn parse_mailmap_target(mailmap: &Path) -> (String, String) {
    let contents = fs::read_to_string(mailmap).expect("read mailmap");
    let line = contents.lines().next().expect("mailmap line");
    // `Proper Name <proper@email>` comes before the commit identity
    let open = line.find('<').expect("open bracket");
    let close = line.find('>').expect("close bracket");
    let name = line[..open].trim().to_string();
    let email = line[open + 1..close].to_string();
    (name, email)
}
