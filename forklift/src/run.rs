//! End-to-end orchestration of a single run.
//!
//! Ties the stages together in a fixed order: operator identity and remote
//! discovery against the source repo, run directory preparation, the
//! sandboxed container, artifact ownership handback, then the post-run
//! publication pipeline. Fail-fast checks (env file, timeout knob, branch
//! name) all happen before any run state is created.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info, info_span, warn};

use crate::identity;
use crate::io::env_file::{self, AgentEnv, safe_token};
use crate::io::git::Git;
use crate::io::ownership;
use crate::prepare::RunDirectoryManager;
use crate::publish::{self, FilterRepo};
use crate::remotes;
use crate::sandbox::{SandboxFailure, SandboxRunner, SandboxTimeout};

/// Parsed command-line surface of one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Source repository (defaults to the current directory).
    pub repo: Option<PathBuf>,
    pub main_branch: String,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub agent: Option<String>,
    pub forward_tz: bool,
    /// `UID[:GID]` to reassign artifact ownership to after the run.
    pub chown: Option<String>,
}

/// Run the whole orchestration once.
pub fn execute(options: &RunOptions) -> Result<()> {
    let repo_path = resolve_repo_path(options.repo.as_deref())?;
    info!(repo = %repo_path.display(), "starting forklift orchestration");

    let source_git = Git::new(&repo_path);
    let operator = identity::capture_operator(&source_git)?;
    info!(operator = %operator.signature(), "captured operator identity");

    let main_branch = options.main_branch.trim();
    if main_branch.is_empty() {
        bail!("--main-branch value must not be empty");
    }
    let main_branch = safe_token(main_branch, "--main-branch")?;

    let env_path = env_file::default_env_path()?;
    let agent_env = env_file::load_agent_env(&env_path)
        .with_context(|| format!("load agent env from {}", env_path.display()))?;
    info!(path = %env_path.display(), "loaded agent env");
    let agent_env = apply_cli_overrides(agent_env, options)?;
    debug!(
        model = agent_env.model.as_deref().unwrap_or("(default)"),
        variant = %agent_env.variant,
        agent = %agent_env.agent,
        "forwarding agent configuration"
    );

    let runner = SandboxRunner::from_env()?;
    let (chown_uid, chown_gid) = resolve_chown_target(options.chown.as_deref())?;

    let remotes = remotes::ensure_required_remotes(&source_git)?;
    remotes::fetch_remotes(&source_git, &remotes)?;
    info!("remote discovery and fetch complete");

    let manager = RunDirectoryManager::new(None)?;
    let paths = manager.prepare(&repo_path, &main_branch, &operator, &remotes)?;
    info!(
        run_dir = %paths.run_dir.display(),
        workspace = %paths.workspace.display(),
        harness_state = %paths.harness_state.display(),
        agent_logs = %paths.agent_logs.display(),
        "run directory ready"
    );

    // Everything from the container onwards carries the run id, so host
    // logs can be correlated with the sandbox logs afterwards.
    let span = info_span!("run", id = %paths.run_id);
    let _guard = span.enter();

    let container_env = build_container_env(
        &agent_env,
        &main_branch,
        host_timezone_value(options.forward_tz),
    );
    let result = runner.run(
        &paths.workspace,
        &paths.harness_state,
        &paths.agent_logs,
        &container_env,
    )?;

    chown_artifact(&paths.harness_state, "harness-state", chown_uid, chown_gid);
    chown_artifact(&paths.agent_logs, "opencode-logs", chown_uid, chown_gid);

    let stdout = result.stdout.trim();
    if !stdout.is_empty() {
        info!("container stdout:\n{stdout}");
    }
    let stderr = result.stderr.trim();
    if !stderr.is_empty() {
        info!("container stderr:\n{stderr}");
    }

    if result.timed_out {
        let err = SandboxTimeout {
            container_name: result.container_name,
            timeout_secs: runner.timeout.as_secs(),
        };
        error!("{err}");
        return Err(err.into());
    }
    if result.exit_code != 0 {
        let err = SandboxFailure {
            container_name: result.container_name,
            exit_code: result.exit_code,
        };
        error!("{err}");
        return Err(err.into());
    }
    info!("container run completed successfully");

    publish::finalize_run(&repo_path, &paths, &main_branch, &FilterRepo)?;
    Ok(())
}

fn resolve_repo_path(repo: Option<&Path>) -> Result<PathBuf> {
    let base = match repo {
        Some(path) => path.to_path_buf(),
        None => env::current_dir().context("determine current directory")?,
    };
    base.canonicalize()
        .with_context(|| format!("resolve repository path {}", base.display()))
}

fn apply_cli_overrides(mut env: AgentEnv, options: &RunOptions) -> Result<AgentEnv> {
    if let Some(model) = &options.model {
        env.model = Some(safe_token(model, "--model")?);
    }
    if let Some(variant) = &options.variant {
        env.variant = safe_token(variant, "--variant")?;
    }
    if let Some(agent) = &options.agent {
        env.agent = safe_token(agent, "--agent")?;
    }
    Ok(env)
}

/// Who gets the artifact directories after the run: `--chown UID[:GID]`,
/// defaulting to the invoking user.
fn resolve_chown_target(spec: Option<&str>) -> Result<(u32, u32)> {
    let (default_uid, default_gid) = ownership::host_ids();
    match spec.map(str::trim).filter(|s| !s.is_empty()) {
        Some(spec) => ownership::parse_chown_spec(spec, default_gid),
        None => Ok((default_uid, default_gid)),
    }
}

fn build_container_env(
    agent_env: &AgentEnv,
    main_branch: &str,
    tz: Option<String>,
) -> BTreeMap<String, String> {
    let mut env = agent_env.as_env();
    env.insert("FORKLIFT_MAIN_BRANCH".to_string(), main_branch.to_string());
    if let Some(tz) = tz {
        env.insert("TZ".to_string(), tz);
    }
    env
}

/// Value of `TZ` to forward, when enabled and safe to pass along.
fn host_timezone_value(forward_tz: bool) -> Option<String> {
    if !forward_tz {
        return None;
    }
    let Some(tz) = env::var("TZ").ok().filter(|value| !value.is_empty()) else {
        warn!("--forward-tz enabled but host TZ is unset; skipping TZ forwarding");
        return None;
    };
    if contains_control_characters(&tz) {
        warn!(value = ?tz, "host TZ contains control characters; skipping TZ forwarding");
        return None;
    }
    info!(tz = %tz, "forwarding host TZ into the sandbox");
    Some(tz)
}

fn contains_control_characters(value: &str) -> bool {
    value.chars().any(|c| (c as u32) < 32 || c as u32 == 127)
}

/// Hand an artifact directory back to the operator after the sandbox ran.
///
/// Best effort: a failure leaves sandbox-owned files behind but never
/// fails the run.
fn chown_artifact(target: &Path, label: &str, uid: u32, gid: u32) {
    if !target.exists() {
        debug!(label, path = %target.display(), "directory missing; skipping ownership reset");
        return;
    }
    info!(label, uid, gid, "reassigning artifact ownership");
    if let Err(err) = ownership::chown_tree(target, uid, gid) {
        warn!(label, uid, gid, "unable to chown artifact: {err:#}");
    }
}
