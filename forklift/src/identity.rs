//! Authorship identities for a run.
//!
//! The sandboxed agent commits as a fixed synthetic author; publication
//! rewrites that author to the human operator. Both identities are defined
//! here so the rewrite and the residual check cannot drift apart.

use anyhow::{Result, anyhow};

use crate::io::git::Git;

/// Author name the sandboxed agent commits under.
pub const AGENT_NAME: &str = "Forklift Agent";
/// Author email the sandboxed agent commits under.
pub const AGENT_EMAIL: &str = "forklift@github.com";

/// The human operator's git identity, read from the source repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorIdentity {
    pub name: String,
    pub email: String,
}

impl OperatorIdentity {
    /// `Name <email>` form, as git author fields render it.
    pub fn signature(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

/// `Name <email>` form of the agent identity.
pub fn agent_signature() -> String {
    format!("{AGENT_NAME} <{AGENT_EMAIL}>")
}

/// One mailmap line mapping the agent identity to the operator.
///
/// This is the entire rewrite instruction handed to `git filter-repo`.
pub fn mailmap_line(operator: &OperatorIdentity) -> String {
    format!(
        "{} <{}> {AGENT_NAME} <{AGENT_EMAIL}>\n",
        operator.name, operator.email
    )
}

/// Read the operator identity from the repo's effective git config.
///
/// Published history is attributed to this identity, so a missing value
/// refuses the run up front with the command that fixes it.
pub fn capture_operator(git: &Git) -> Result<OperatorIdentity> {
    let name = git.config_get("user.name")?.ok_or_else(|| {
        anyhow!("git user.name is not set (fix with: git config --global user.name \"Your Name\")")
    })?;
    let email = git.config_get("user.email")?.ok_or_else(|| {
        anyhow!(
            "git user.email is not set (fix with: git config --global user.email you@example.com)"
        )
    })?;
    Ok(OperatorIdentity { name, email })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailmap_line_maps_agent_to_operator() {
        let operator = OperatorIdentity {
            name: "Ada Lovelace".to_string(),
            email: "ada@example.com".to_string(),
        };
        assert_eq!(
            mailmap_line(&operator),
            "Ada Lovelace <ada@example.com> Forklift Agent <forklift@github.com>\n"
        );
    }

    #[test]
    fn signatures_render_name_email_form() {
        let operator = OperatorIdentity {
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
        };
        assert_eq!(operator.signature(), "Ada <ada@example.com>");
        assert_eq!(agent_signature(), "Forklift Agent <forklift@github.com>");
    }
}
