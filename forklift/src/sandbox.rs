//! Sandboxed agent execution via a container runtime.
//!
//! The workspace, harness state, and agent log directories are bind-mounted
//! into a disposable container which runs the harness entrypoint. The host
//! owns the wall-clock budget: on expiry the container is killed through the
//! runtime (so `--rm` cleanup still happens) and the client process is
//! reaped afterwards.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Image used when `FORKLIFT_DOCKER_IMAGE` is unset.
pub const DEFAULT_IMAGE: &str = "forklift/kitchen-sink:latest";
/// Wall-clock budget when `FORKLIFT_TIMEOUT_SECONDS` is unset.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 210;
pub const DEFAULT_RUNTIME_BIN: &str = "docker";
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

const HARNESS_ENTRYPOINT: &str = "/opt/opencode/entrypoint.sh";
const AGENT_LOG_MOUNT: &str = "/home/forklift/.local/share/opencode/log";

/// Env keys whose values are masked in logged commands. Masking applies to
/// log output only; the container always receives the real values.
pub const SENSITIVE_ENV_KEYS: [&str; 6] = [
    "ANTHROPIC_API_KEY",
    "GOOGLE_GENERATIVE_AI_API_KEY",
    "OPENAI_API_KEY",
    "OPENCODE_API_KEY",
    "OPENCODE_SERVER_PASSWORD",
    "OPENROUTER_API_KEY",
];

/// The container exceeded its wall-clock budget and was forcibly stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxTimeout {
    pub container_name: String,
    pub timeout_secs: u64,
}

impl fmt::Display for SandboxTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container {} exceeded {} seconds and was stopped",
            self.container_name, self.timeout_secs
        )
    }
}

impl std::error::Error for SandboxTimeout {}

/// The sandboxed workload finished on its own with a nonzero exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFailure {
    pub container_name: String,
    pub exit_code: i32,
}

impl fmt::Display for SandboxFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container {} exited with code {}",
            self.container_name, self.exit_code
        )
    }
}

impl std::error::Error for SandboxFailure {}

/// Captured outcome of one container run.
#[derive(Debug, Clone)]
pub struct SandboxRunResult {
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub container_name: String,
}

/// Launches the agent container and enforces the run budget.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    pub runtime_bin: String,
    pub image: String,
    pub timeout: Duration,
    pub extra_run_args: Vec<String>,
    pub output_limit_bytes: usize,
}

impl Default for SandboxRunner {
    fn default() -> Self {
        Self {
            runtime_bin: DEFAULT_RUNTIME_BIN.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            extra_run_args: Vec::new(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl SandboxRunner {
    /// Build a runner from the process environment.
    ///
    /// `FORKLIFT_DOCKER_IMAGE`, `FORKLIFT_TIMEOUT_SECONDS`, `DOCKER_BIN`,
    /// and `FORKLIFT_DOCKER_ARGS` override the defaults. A malformed
    /// timeout is rejected here, before any run state is created.
    pub fn from_env() -> Result<Self> {
        let timeout_secs = match env::var("FORKLIFT_TIMEOUT_SECONDS") {
            Ok(raw) => parse_timeout_secs(&raw)?,
            Err(_) => DEFAULT_TIMEOUT_SECONDS,
        };
        // Quoting is not supported in FORKLIFT_DOCKER_ARGS; arguments are
        // split on whitespace.
        let extra_run_args = env::var("FORKLIFT_DOCKER_ARGS")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self {
            runtime_bin: env::var("DOCKER_BIN").unwrap_or_else(|_| DEFAULT_RUNTIME_BIN.to_string()),
            image: env::var("FORKLIFT_DOCKER_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            extra_run_args,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        })
    }

    /// Run the harness entrypoint inside a fresh container.
    ///
    /// Output is drained concurrently while the child runs so full pipes
    /// cannot deadlock the container. A timeout never returns `Err` from
    /// here; it is reported through `timed_out` so the caller can still log
    /// partial output before mapping it to an exit code.
    #[instrument(skip_all, fields(image = %self.image, timeout_secs = self.timeout.as_secs()))]
    pub fn run(
        &self,
        workspace: &Path,
        harness_state: &Path,
        agent_logs: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<SandboxRunResult> {
        let container_name = container_name(workspace);
        let argv = self.build_command(&container_name, workspace, harness_state, agent_logs, env);
        info!(container = %container_name, "launching sandbox container");
        debug!(command = %mask_sensitive(&argv).join(" "), "container command");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.runtime_bin))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let limit = self.output_limit_bytes;
        let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

        let mut timed_out = false;
        let status = match child.wait_timeout(self.timeout).context("wait for container")? {
            Some(status) => status,
            None => {
                warn!(
                    container = %container_name,
                    timeout_secs = self.timeout.as_secs(),
                    "container exceeded its budget, forcing stop"
                );
                timed_out = true;
                self.force_stop(&container_name);
                child.kill().context("kill container client")?;
                child.wait().context("wait container client after kill")?
            }
        };

        let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
        let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "container output truncated");
        }

        let exit_code = status.code().unwrap_or(1);
        debug!(exit_code, timed_out, "container finished");
        Ok(SandboxRunResult {
            exit_code,
            timed_out,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            container_name,
        })
    }

    fn build_command(
        &self,
        container_name: &str,
        workspace: &Path,
        harness_state: &Path,
        agent_logs: &Path,
        env: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut argv = vec![
            self.runtime_bin.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-v".to_string(),
            format!("{}:/workspace", workspace.display()),
            "-v".to_string(),
            format!("{}:/harness-state", harness_state.display()),
            "-v".to_string(),
            format!("{}:{AGENT_LOG_MOUNT}", agent_logs.display()),
        ];
        argv.extend(self.extra_run_args.iter().cloned());
        for (key, value) in env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push(self.image.clone());
        argv.push(HARNESS_ENTRYPOINT.to_string());
        argv
    }

    /// Stop through the runtime so `--rm` cleanup still runs.
    fn force_stop(&self, container_name: &str) {
        let result = Command::new(&self.runtime_bin)
            .args(["kill", container_name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(err) = result {
            error!(container = %container_name, err = %err, "failed to kill container");
        }
    }
}

fn parse_timeout_secs(raw: &str) -> Result<u64> {
    let secs = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("FORKLIFT_TIMEOUT_SECONDS must be a whole number of seconds, got {raw:?}"))?;
    if secs == 0 {
        return Err(anyhow!("FORKLIFT_TIMEOUT_SECONDS must be at least 1"));
    }
    Ok(secs)
}

/// Copy of `argv` with sensitive `-e` values replaced for logging.
fn mask_sensitive(argv: &[String]) -> Vec<String> {
    let mut masked = argv.to_vec();
    for idx in 1..masked.len() {
        if masked[idx - 1] != "-e" {
            continue;
        }
        if let Some((key, _)) = masked[idx].split_once('=')
            && SENSITIVE_ENV_KEYS.contains(&key)
        {
            masked[idx] = format!("{key}=***");
        }
    }
    masked
}

/// Unique name derived from the run directory, safe for container runtimes.
fn container_name(workspace: &Path) -> String {
    let project = workspace
        .parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
        .unwrap_or("run")
        .replace('_', "-");
    let ts = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("forklift-{project}-{ts}-{suffix:06x}").replace("--", "-")
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}
