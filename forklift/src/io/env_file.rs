//! Agent runtime configuration loaded from the operator's env file.
//!
//! The file holds credentials, so loading enforces owner-only permissions
//! and validates every value that later ends up on a command line. The
//! source may be a regular file, a FIFO, or a unix socket (for operators
//! who refuse to keep secrets on disk); the same rules apply to all three.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;

/// Env var overriding the default env file location.
pub const ENV_FILE_VAR: &str = "FORKLIFT_ENV_FILE";

/// Keys that must be present and non-empty.
pub const REQUIRED_KEYS: [&str; 3] = [
    "OPENCODE_VARIANT",
    "OPENCODE_AGENT",
    "OPENCODE_SERVER_PASSWORD",
];

/// Provider credentials; at least one must be set for the agent to work.
pub const PRIMARY_API_KEYS: [&str; 5] = [
    "OPENCODE_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_GENERATIVE_AI_API_KEY",
    "ANTHROPIC_API_KEY",
    "OPENROUTER_API_KEY",
];

pub const DEFAULT_SERVER_PORT: u16 = 4096;

/// Values that reach a command line must stay within this alphabet.
static SAFE_VALUE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap());

/// Validated agent configuration, ready to become container environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEnv {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub variant: String,
    pub agent: String,
    pub server_password: String,
    pub server_port: u16,
    pub org: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub openai_api_key: Option<String>,
    pub google_generative_ai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

impl AgentEnv {
    /// Re-export exactly the recognized keys that are set.
    pub fn as_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("OPENCODE_VARIANT".to_string(), self.variant.clone());
        env.insert("OPENCODE_AGENT".to_string(), self.agent.clone());
        env.insert(
            "OPENCODE_SERVER_PASSWORD".to_string(),
            self.server_password.clone(),
        );
        env.insert(
            "OPENCODE_SERVER_PORT".to_string(),
            self.server_port.to_string(),
        );
        if let Some(api_key) = &self.api_key {
            env.insert("OPENCODE_API_KEY".to_string(), api_key.clone());
        }
        if let Some(model) = &self.model {
            env.insert("OPENCODE_MODEL".to_string(), model.clone());
        }
        if let Some(timeout) = self.timeout_seconds {
            env.insert("OPENCODE_TIMEOUT".to_string(), timeout.to_string());
        }
        if let Some(org) = &self.org {
            env.insert("OPENCODE_ORG".to_string(), org.clone());
        }
        if let Some(key) = &self.openai_api_key {
            env.insert("OPENAI_API_KEY".to_string(), key.clone());
        }
        if let Some(key) = &self.google_generative_ai_api_key {
            env.insert("GOOGLE_GENERATIVE_AI_API_KEY".to_string(), key.clone());
        }
        if let Some(key) = &self.anthropic_api_key {
            env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }
        if let Some(key) = &self.openrouter_api_key {
            env.insert("OPENROUTER_API_KEY".to_string(), key.clone());
        }
        env
    }
}

/// Resolve the env file path: `FORKLIFT_ENV_FILE`, else
/// `~/.config/forklift/opencode.env`.
pub fn default_env_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(ENV_FILE_VAR)
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(home.join(".config/forklift/opencode.env"))
}

/// Load and validate the agent env file.
pub fn load_agent_env(path: &Path) -> Result<AgentEnv> {
    if !path.exists() {
        bail!("missing agent env file at {}", path.display());
    }
    validate_permissions(path)?;
    let raw_text = read_env_text(path)?;
    let values = parse_env_text(&raw_text, path)?;

    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|key| values.get(*key).is_none_or(|value| value.trim().is_empty()))
        .collect();
    if !missing.is_empty() {
        bail!(
            "missing required keys in {}: {}",
            path.display(),
            missing.join(", ")
        );
    }

    let lookup = |key: &str| -> Option<String> {
        values
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let model = lookup("OPENCODE_MODEL")
        .map(|value| safe_token(&value, &format!("OPENCODE_MODEL in {}", path.display())))
        .transpose()?;
    let variant = safe_token(
        &required_value(&values, "OPENCODE_VARIANT", path)?,
        &format!("OPENCODE_VARIANT in {}", path.display()),
    )?;
    let agent = safe_token(
        &required_value(&values, "OPENCODE_AGENT", path)?,
        &format!("OPENCODE_AGENT in {}", path.display()),
    )?;
    let server_password = required_value(&values, "OPENCODE_SERVER_PASSWORD", path)?;

    if !PRIMARY_API_KEYS.iter().any(|key| lookup(key).is_some()) {
        bail!(
            "at least one provider API key must be set (OpenCode, OpenAI, Gemini, Anthropic, or OpenRouter)"
        );
    }

    let timeout_seconds = lookup("OPENCODE_TIMEOUT")
        .map(|raw| parse_timeout(&raw, path))
        .transpose()?;
    let server_port = match lookup("OPENCODE_SERVER_PORT") {
        Some(raw) => parse_port(&raw, path)?,
        None => DEFAULT_SERVER_PORT,
    };

    Ok(AgentEnv {
        api_key: lookup("OPENCODE_API_KEY"),
        model,
        variant,
        agent,
        server_password,
        server_port,
        org: lookup("OPENCODE_ORG"),
        timeout_seconds,
        openai_api_key: lookup("OPENAI_API_KEY"),
        google_generative_ai_api_key: lookup("GOOGLE_GENERATIVE_AI_API_KEY"),
        anthropic_api_key: lookup("ANTHROPIC_API_KEY"),
        openrouter_api_key: lookup("OPENROUTER_API_KEY"),
    })
}

/// Validate a value against the safe command-line alphabet.
///
/// Also used for CLI-provided overrides and branch names; `label` names the
/// offending source in the error.
pub fn safe_token(value: &str, label: &str) -> Result<String> {
    let trimmed = value.trim();
    if !SAFE_VALUE_PATTERN.is_match(trimmed) {
        bail!(
            "{label} contains invalid characters ({trimmed:?}); \
             allowed characters are letters, digits, '.', '_', '-', and '/'"
        );
    }
    Ok(trimmed.to_string())
}

fn required_value(values: &BTreeMap<String, String>, key: &str, path: &Path) -> Result<String> {
    values
        .get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing required keys in {}: {key}", path.display()))
}

fn parse_timeout(raw: &str, path: &Path) -> Result<u64> {
    let seconds: u64 = raw.parse().map_err(|_| {
        anyhow!(
            "OPENCODE_TIMEOUT in {} must be a positive integer",
            path.display()
        )
    })?;
    if seconds == 0 {
        bail!(
            "OPENCODE_TIMEOUT in {} must be a positive integer",
            path.display()
        );
    }
    Ok(seconds)
}

fn parse_port(raw: &str, path: &Path) -> Result<u16> {
    let port: u16 = raw.parse().map_err(|_| {
        anyhow!(
            "OPENCODE_SERVER_PORT in {} must be an integer between 1 and 65535",
            path.display()
        )
    })?;
    if port == 0 {
        bail!(
            "OPENCODE_SERVER_PORT in {} must be between 1 and 65535",
            path.display()
        );
    }
    Ok(port)
}

/// Parse `KEY=VALUE` lines; blank lines and `#` comments are skipped.
fn parse_env_text(raw_text: &str, path: &Path) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for (idx, raw_line) in raw_text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = raw_line.split_once('=') else {
            bail!(
                "invalid line {line_no} in {}: expected KEY=VALUE format",
                path.display()
            );
        };
        let key = key.trim();
        if key.is_empty() {
            bail!(
                "invalid line {line_no} in {}: missing key before '='",
                path.display()
            );
        }
        values.insert(key.to_string(), value.trim_end().to_string());
    }
    Ok(values)
}

/// The file carries secrets: group/world access bits are refused outright.
fn validate_permissions(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        bail!(
            "insecure permissions on {}: expected 0600-style, got {mode:03o}",
            path.display()
        );
    }
    Ok(())
}

/// Read the env text from a regular file, FIFO, or unix socket.
fn read_env_text(path: &Path) -> Result<String> {
    let file_type = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .file_type();
    if file_type.is_socket() {
        let mut stream = UnixStream::connect(path)
            .with_context(|| format!("connect to env socket {}", path.display()))?;
        let mut text = String::new();
        stream
            .read_to_string(&mut text)
            .with_context(|| format!("read env socket {}", path.display()))?;
        return Ok(text);
    }
    // FIFOs read like regular files once opened.
    fs::read_to_string(path).with_context(|| format!("read env file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_env(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("opencode.env");
        fs::write(&path, contents).expect("write env");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod");
        path
    }

    const VALID: &str = "OPENCODE_VARIANT=fast\n\
        OPENCODE_AGENT=builder\n\
        OPENCODE_SERVER_PASSWORD=hunter2\n\
        ANTHROPIC_API_KEY=sk-ant-abc123\n";

    #[test]
    fn loads_a_minimal_valid_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(temp.path(), VALID);
        let env = load_agent_env(&path).expect("load");
        assert_eq!(env.variant, "fast");
        assert_eq!(env.agent, "builder");
        assert_eq!(env.server_password, "hunter2");
        assert_eq!(env.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(env.anthropic_api_key.as_deref(), Some("sk-ant-abc123"));
        assert!(env.model.is_none());
    }

    #[test]
    fn comments_blanks_and_padding_are_tolerated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(
            temp.path(),
            "# agent settings\n\n  OPENCODE_VARIANT = fast  \nOPENCODE_AGENT=builder\n\
             OPENCODE_SERVER_PASSWORD=pw\nOPENCODE_API_KEY=k\n",
        );
        let env = load_agent_env(&path).expect("load");
        assert_eq!(env.variant, "fast");
        assert_eq!(env.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn line_without_equals_names_the_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(temp.path(), "OPENCODE_VARIANT=fast\nbogus line\n");
        let err = load_agent_env(&path).expect_err("should fail");
        assert!(format!("{err}").contains("line 2"), "got: {err}");
    }

    #[test]
    fn empty_key_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(temp.path(), "=value\n");
        let err = load_agent_env(&path).expect_err("should fail");
        assert!(format!("{err}").contains("missing key"), "got: {err}");
    }

    #[test]
    fn all_missing_required_keys_are_named_together() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(temp.path(), "OPENCODE_VARIANT=fast\n");
        let err = load_agent_env(&path).expect_err("should fail");
        let msg = format!("{err}");
        assert!(msg.contains("OPENCODE_AGENT"), "got: {msg}");
        assert!(msg.contains("OPENCODE_SERVER_PASSWORD"), "got: {msg}");
    }

    #[test]
    fn at_least_one_provider_key_is_required() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(
            temp.path(),
            "OPENCODE_VARIANT=fast\nOPENCODE_AGENT=builder\nOPENCODE_SERVER_PASSWORD=pw\n",
        );
        let err = load_agent_env(&path).expect_err("should fail");
        assert!(format!("{err}").contains("provider API key"), "got: {err}");
    }

    #[test]
    fn unsafe_model_value_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(
            temp.path(),
            &format!("{VALID}OPENCODE_MODEL=claude; rm -rf /\n"),
        );
        let err = load_agent_env(&path).expect_err("should fail");
        assert!(format!("{err}").contains("OPENCODE_MODEL"), "got: {err}");
    }

    #[test]
    fn port_out_of_range_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        for bad in ["0", "65536", "not-a-port"] {
            let path = write_env(
                temp.path(),
                &format!("{VALID}OPENCODE_SERVER_PORT={bad}\n"),
            );
            assert!(load_agent_env(&path).is_err(), "port {bad} accepted");
        }
        let path = write_env(temp.path(), &format!("{VALID}OPENCODE_SERVER_PORT=8080\n"));
        assert_eq!(load_agent_env(&path).expect("load").server_port, 8080);
    }

    #[test]
    fn timeout_must_be_positive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(temp.path(), &format!("{VALID}OPENCODE_TIMEOUT=0\n"));
        assert!(load_agent_env(&path).is_err());
        let path = write_env(temp.path(), &format!("{VALID}OPENCODE_TIMEOUT=300\n"));
        assert_eq!(
            load_agent_env(&path).expect("load").timeout_seconds,
            Some(300)
        );
    }

    #[test]
    fn group_readable_file_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(temp.path(), VALID);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).expect("chmod");
        let err = load_agent_env(&path).expect_err("should fail");
        assert!(
            format!("{err}").contains("insecure permissions"),
            "got: {err}"
        );
    }

    #[test]
    fn as_env_exports_exactly_the_set_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_env(
            temp.path(),
            &format!("{VALID}OPENCODE_MODEL=claude-3.5\nOPENCODE_ORG=acme\n"),
        );
        let env = load_agent_env(&path).expect("load").as_env();
        assert_eq!(env.get("OPENCODE_VARIANT").map(String::as_str), Some("fast"));
        assert_eq!(
            env.get("OPENCODE_MODEL").map(String::as_str),
            Some("claude-3.5")
        );
        assert_eq!(env.get("OPENCODE_ORG").map(String::as_str), Some("acme"));
        assert_eq!(
            env.get("OPENCODE_SERVER_PORT").map(String::as_str),
            Some("4096")
        );
        assert!(!env.contains_key("OPENAI_API_KEY"));
    }

    #[test]
    fn safe_token_trims_and_validates() {
        assert_eq!(safe_token(" ok-value ", "--model").expect("ok"), "ok-value");
        assert!(safe_token("has space", "--model").is_err());
        assert!(safe_token("", "--model").is_err());
    }
}
