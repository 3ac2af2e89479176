//! Single-run orchestrator for sandboxed agent work on git forks.
//!
//! One invocation is one run: discover and fetch the source repo's remotes,
//! clone it into an isolated run directory, execute the agent inside a
//! container under a hard timeout, then publish the result back to `origin`
//! with the agent's authorship rewritten to the human operator.
//!
//! The crate separates side-effecting adapters from orchestration:
//!
//! - **[`io`]**: filesystem, git subprocesses, environment files, ownership
//!   syscalls. Everything that touches the outside world lives here.
//! - Orchestration modules ([`remotes`], [`prepare`], [`sandbox`],
//!   [`publish`], [`run`]) coordinate the adapters to implement the run
//!   pipeline and define the typed errors the CLI maps to exit codes.

pub mod exit_codes;
pub mod identity;
pub mod io;
pub mod logging;
pub mod prepare;
pub mod publish;
pub mod remotes;
pub mod run;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
