//! Post-run publication pipeline tests against real git repositories.
//!
//! Each test prepares a real run directory (bare `origin` and `upstream`
//! remotes plus an isolated workspace clone) and drives `finalize_run`
//! through one terminal outcome: rewrite-and-push, idempotent skip, stuck
//! sentinel, upstream divergence, eligibility skip, residual authorship,
//! lease rejection, and stash conflicts.

use std::fs;
use std::path::Path;

use forklift::exit_codes;
use forklift::identity::capture_operator;
use forklift::io::git::Git;
use forklift::io::metadata::{load_metadata, write_metadata};
use forklift::io::ownership::host_ids;
use forklift::prepare::{RunDirectoryManager, RunPaths};
use forklift::publish::{
    MAILMAP_FILE, ResidualAuthorshipError, STASH_MESSAGE, STUCK_SENTINEL, StuckSentinelError,
    UpstreamDivergenceError, finalize_run,
};
use forklift::remotes::ensure_required_remotes;
use forklift::test_support::{
    FilterBranchRewriter, NoopRewriter, SourceRepo, author_of, commit_file, commit_file_as_agent,
    run_git,
};

/// Prepare a run directory for `source`, chowned to the invoking user so
/// the tests run without privileges.
fn prepared_run(source: &SourceRepo, runs_root: &Path) -> RunPaths {
    let git = source.git();
    let operator = capture_operator(&git).expect("operator identity");
    let remotes = ensure_required_remotes(&git).expect("remotes");
    let (uid, gid) = host_ids();
    let mut manager = RunDirectoryManager::new(Some(runs_root.to_path_buf())).expect("manager");
    manager.sandbox_uid = uid;
    manager.sandbox_gid = gid;
    let paths = manager
        .prepare(&source.repo, "main", &operator, &remotes)
        .expect("prepare run directory");
    // the clone does not inherit the operator's identity config; stash
    // commits need one
    run_git(&paths.workspace, &["config", "user.name", "Test Operator"]);
    run_git(
        &paths.workspace,
        &["config", "user.email", "operator@example.com"],
    );
    paths
}

#[test]
fn rewrites_authorship_and_force_pushes_to_origin() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());
    let baseline = source.origin_tip("main");

    let workspace = Git::new(&paths.workspace);
    commit_file_as_agent(&workspace, "feature.txt", "agent work\n", "add feature");

    let outcome = finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter)
        .expect("pipeline")
        .expect("eligible for publication");

    assert!(outcome.pushed);
    assert_eq!(outcome.branch, "main");
    assert_eq!(outcome.origin_sha, baseline);
    assert!(!outcome.stash_created);
    assert!(!outcome.stash_conflicts);

    // the agent commit now carries the operator's identity, message intact
    assert_eq!(
        author_of(&workspace, "main"),
        "Test Operator <operator@example.com>"
    );
    assert_eq!(
        run_git(&paths.workspace, &["log", "-1", "--format=%s", "main"]),
        "add feature"
    );

    // origin moved to the rewritten tip
    let new_tip = workspace.rev_parse("refs/heads/main").expect("tip");
    assert_ne!(new_tip, baseline);
    assert_eq!(source.origin_tip("main"), new_tip);

    // the safety tag anchors the pre-push baseline
    let tag = outcome.tag_name.expect("tag name");
    assert!(tag.starts_with("forklift/main/"), "got {tag}");
    assert!(tag.ends_with("/pre-push"), "got {tag}");
    assert_eq!(
        run_git(&paths.workspace, &["rev-parse", &format!("refs/tags/{tag}")]),
        baseline
    );

    // the mailmap must not outlive the rewrite
    assert!(!paths.run_dir.join(MAILMAP_FILE).exists());
}

#[test]
fn branch_matching_the_origin_baseline_publishes_nothing() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());
    let baseline = source.origin_tip("main");

    // untracked scratch state must survive untouched: no stash, no rewrite
    fs::write(paths.workspace.join("scratch.txt"), "uncommitted\n").expect("write scratch");

    let outcome = finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter)
        .expect("pipeline")
        .expect("eligible");

    assert!(!outcome.pushed);
    assert_eq!(outcome.tag_name, None);
    assert!(!outcome.stash_created);
    assert_eq!(outcome.origin_sha, baseline);

    assert_eq!(source.origin_tip("main"), baseline);
    assert_eq!(
        fs::read_to_string(paths.workspace.join("scratch.txt")).expect("scratch"),
        "uncommitted\n"
    );
    assert_eq!(run_git(&paths.workspace, &["stash", "list"]), "");
    assert_eq!(
        run_git(&paths.workspace, &["tag", "--list", "forklift/*"]),
        ""
    );
}

#[test]
fn stuck_sentinel_fails_the_run_before_any_verification() {
    // no git repository needed: the sentinel wins before anything else runs
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = RunPaths::new(temp.path().join("run"), "abc123".to_string());
    fs::create_dir_all(&paths.workspace).expect("workspace dir");
    fs::write(
        paths.workspace.join(STUCK_SENTINEL),
        "blocked on a flaky migration\n",
    )
    .expect("write sentinel");

    let err = finalize_run(temp.path(), &paths, "main", &NoopRewriter).expect_err("stuck");
    assert!(
        err.downcast_ref::<StuckSentinelError>().is_some(),
        "got: {err:#}"
    );
    assert_eq!(exit_codes::for_error(&err), exit_codes::STUCK);
}

#[test]
fn upstream_moving_ahead_is_reported_as_divergence() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");

    // upstream advances past the fork point before the run starts
    let git = source.git();
    run_git(&source.repo, &["checkout", "-b", "upstream-work"]);
    commit_file(&git, "upstream.txt", "upstream change\n", "upstream advance");
    run_git(&source.repo, &["push", "upstream", "upstream-work:main"]);
    run_git(&source.repo, &["checkout", "main"]);
    run_git(&source.repo, &["fetch", "upstream"]);

    let paths = prepared_run(&source, runs.path());
    let err =
        finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter).expect_err("diverged");
    let diverged = err
        .downcast_ref::<UpstreamDivergenceError>()
        .expect("typed divergence");
    assert_eq!(diverged.upstream_ref, "upstream/main");
    assert_eq!(diverged.branch, "main");
    assert_eq!(exit_codes::for_error(&err), exit_codes::UPSTREAM_DIVERGED);

    // nothing was rewritten or pushed
    assert_eq!(
        source.origin_tip("main"),
        run_git(&paths.workspace, &["rev-parse", "refs/heads/main"])
    );
}

#[test]
fn an_unresolvable_upstream_ref_counts_as_divergence() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());

    run_git(
        &paths.workspace,
        &["update-ref", "-d", "refs/remotes/upstream/main"],
    );

    let err =
        finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter).expect_err("missing ref");
    let diverged = err
        .downcast_ref::<UpstreamDivergenceError>()
        .expect("typed divergence");
    assert_eq!(diverged.upstream_ref, "upstream/main");
    assert!(!diverged.detail.is_empty());
    assert_eq!(exit_codes::for_error(&err), exit_codes::UPSTREAM_DIVERGED);
}

#[test]
fn incomplete_metadata_skips_publication() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());
    let baseline = source.origin_tip("main");

    let workspace = Git::new(&paths.workspace);
    commit_file_as_agent(&workspace, "feature.txt", "agent work\n", "add feature");

    let mut metadata = load_metadata(&paths.run_dir).expect("metadata");
    metadata.operator_name = None;
    write_metadata(&paths.run_dir, &metadata).expect("rewrite metadata");

    let outcome = finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter)
        .expect("pipeline");
    assert!(outcome.is_none());

    // nothing was rewritten or pushed
    assert_eq!(
        author_of(&workspace, "main"),
        "Forklift Agent <forklift@github.com>"
    );
    assert_eq!(source.origin_tip("main"), baseline);
}

#[test]
fn surviving_agent_commits_block_the_push() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());
    let baseline = source.origin_tip("main");

    let workspace = Git::new(&paths.workspace);
    commit_file_as_agent(&workspace, "feature.txt", "agent work\n", "add feature");
    let agent_sha = workspace.rev_parse("refs/heads/main").expect("agent tip");

    let err = finalize_run(&source.repo, &paths, "main", &NoopRewriter).expect_err("residual");
    let residual = err
        .downcast_ref::<ResidualAuthorshipError>()
        .expect("typed residual");
    assert!(
        residual.sample.contains(&agent_sha),
        "sample: {}",
        residual.sample
    );
    assert_eq!(exit_codes::for_error(&err), exit_codes::FAILURE);

    // the failure precedes tagging and pushing
    assert_eq!(
        run_git(&paths.workspace, &["tag", "--list", "forklift/*"]),
        ""
    );
    assert_eq!(source.origin_tip("main"), baseline);
}

#[test]
fn a_remote_that_moved_rejects_the_push() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());

    let workspace = Git::new(&paths.workspace);
    commit_file_as_agent(&workspace, "feature.txt", "agent work\n", "add feature");

    // someone pushes to origin while the run is in flight
    commit_file(&source.git(), "hotfix.txt", "hotfix\n", "urgent hotfix");
    run_git(&source.repo, &["push", "origin", "main"]);
    let moved_tip = source.origin_tip("main");

    let err = finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter)
        .expect_err("lease must reject");
    assert_eq!(exit_codes::for_error(&err), exit_codes::FAILURE);

    // the rewrite happened locally, but origin keeps the interleaved push
    assert_eq!(
        author_of(&workspace, "main"),
        "Test Operator <operator@example.com>"
    );
    assert_eq!(source.origin_tip("main"), moved_tip);
}

#[test]
fn a_stash_that_cannot_reapply_is_reported_not_fatal() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());

    // the agent adds shared.txt on main
    let workspace = Git::new(&paths.workspace);
    commit_file_as_agent(&workspace, "shared.txt", "agent version\n", "add shared file");

    // the operator inspects an older commit and drafts the same file
    run_git(&paths.workspace, &["checkout", "-b", "scratch", "main~1"]);
    fs::write(paths.workspace.join("shared.txt"), "operator draft\n").expect("write draft");

    let outcome = finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter)
        .expect("pipeline")
        .expect("eligible");

    assert!(outcome.pushed);
    assert!(outcome.stash_created);
    assert!(outcome.stash_conflicts);

    // the push went through despite the conflicted stash
    assert_eq!(
        source.origin_tip("main"),
        run_git(&paths.workspace, &["rev-parse", "refs/heads/main"])
    );
    // the draft is parked on the stash stack, not lost
    let stash = run_git(&paths.workspace, &["stash", "list"]);
    assert!(stash.contains(STASH_MESSAGE), "got: {stash}");
}

#[test]
fn configured_branch_is_used_when_metadata_lacks_one() {
    let source = SourceRepo::new();
    let runs = tempfile::tempdir().expect("tempdir");
    let paths = prepared_run(&source, runs.path());

    let mut metadata = load_metadata(&paths.run_dir).expect("metadata");
    metadata.main_branch = None;
    write_metadata(&paths.run_dir, &metadata).expect("rewrite metadata");

    let workspace = Git::new(&paths.workspace);
    commit_file_as_agent(&workspace, "feature.txt", "agent work\n", "add feature");

    let outcome = finalize_run(&source.repo, &paths, "main", &FilterBranchRewriter)
        .expect("pipeline")
        .expect("eligible");
    assert!(outcome.pushed);
    assert_eq!(outcome.branch, "main");
}
