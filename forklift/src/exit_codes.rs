//! Stable exit codes for the forklift CLI.
//!
//! These are contract: wrapper tooling branches on them.

use crate::publish::{StuckSentinelError, UpstreamDivergenceError};
use crate::sandbox::{SandboxFailure, SandboxTimeout};

/// Run completed (including "nothing to publish").
pub const OK: i32 = 0;
/// Any failure not covered by a more specific code.
pub const FAILURE: i32 = 1;
/// The sandbox hit the wall-clock timeout and was torn down.
pub const SANDBOX_TIMEOUT: i32 = 2;
/// The agent's branch does not contain the seeded upstream tip.
pub const UPSTREAM_DIVERGED: i32 = 3;
/// The agent left a `STUCK.md` sentinel in the workspace.
pub const STUCK: i32 = 4;

/// Map a run error to its exit code.
///
/// A nonzero sandbox exit passes the workload's own code through bit-exact;
/// the typed sentinels get their reserved codes; everything else is
/// [`FAILURE`].
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<StuckSentinelError>().is_some() {
        return STUCK;
    }
    if err.downcast_ref::<UpstreamDivergenceError>().is_some() {
        return UPSTREAM_DIVERGED;
    }
    if err.downcast_ref::<SandboxTimeout>().is_some() {
        return SANDBOX_TIMEOUT;
    }
    if let Some(failure) = err.downcast_ref::<SandboxFailure>() {
        return failure.exit_code;
    }
    FAILURE
}
