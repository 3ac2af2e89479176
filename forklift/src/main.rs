//! Host-side orchestrator for sandboxed agent runs against a repository
//! fork. Prepares an isolated clone, runs the agent in a container, then
//! verifies, rewrites, and force-pushes the result behind a lease.

use std::path::PathBuf;

use clap::Parser;

use forklift::exit_codes;
use forklift::logging;
use forklift::run::{self, RunOptions};

#[derive(Parser)]
#[command(
    name = "forklift",
    version,
    about = "Run a sandboxed agent against a repository fork and publish the result"
)]
struct Cli {
    /// Source repository (defaults to the current directory).
    repo: Option<PathBuf>,

    /// Name of the primary branch to rebase.
    #[arg(long, default_value = "main")]
    main_branch: String,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Override OPENCODE_MODEL (letters, numbers, punctuation ._-/).
    #[arg(long)]
    model: Option<String>,

    /// Override OPENCODE_VARIANT (letters, numbers, punctuation ._-/).
    #[arg(long)]
    variant: Option<String>,

    /// Override OPENCODE_AGENT (letters, numbers, punctuation ._-/).
    #[arg(long)]
    agent: Option<String>,

    /// Forward the host TZ variable into the sandbox.
    #[arg(long)]
    forward_tz: bool,

    /// Reassign artifact ownership to UID[:GID] after runs (defaults to the invoking user).
    #[arg(long, value_name = "UID[:GID]")]
    chown: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let options = RunOptions {
        repo: cli.repo,
        main_branch: cli.main_branch,
        model: cli.model,
        variant: cli.variant,
        agent: cli.agent,
        forward_tz: cli.forward_tz,
        chown: cli.chown,
    };
    if let Err(err) = run::execute(&options) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}
