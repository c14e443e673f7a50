//! The privileged worker: drains the queue once per invocation (woken by a
//! systemd path unit watching the sentinel, an accept-one-and-exit shape)
//! and dispatches each request in-process. Also carries the `spring-clean`
//! subcommand for timer-driven retention.

use clap::{Parser, Subcommand};
use run_deploy_lib::config::AgentPaths;
use run_deploy_lib::journal;
use run_deploy_lib::retention::{self, RetentionOutcome};
use run_deploy_lib::signature::MinisignVerifier;
use run_deploy_lib::target::Target;
use run_deploy_lib::{config::Edition, queue};

#[derive(Debug, Parser)]
#[command(name = "run-deployd")]
struct Opt {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Delete old revisions beyond the retention count.
    SpringClean {
        /// How many of the newest revisions to keep per image.
        #[arg(long, default_value_t = retention::DEFAULT_KEEP)]
        keep: usize,
        /// Actually delete; without this flag only the would-be shell is printed.
        #[arg(long)]
        real_run: bool,
        /// The container to clean (container edition only).
        #[arg(long)]
        incus: Option<String>,
    },
}

fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_env("RUN_DEPLOY_LOG").unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    let paths = AgentPaths::from_env();

    match opt.command {
        None => {
            let processed = queue::drain_once(&paths, &MinisignVerifier)?;
            tracing::debug!(processed, "drained queue");
        }
        Some(Command::SpringClean { keep, real_run, incus }) => {
            let target = match (paths.edition(), incus) {
                (Edition::Container, Some(name)) => Target::Container(name),
                (Edition::Container, None) => anyhow::bail!("`--incus` is required in the container edition"),
                (Edition::BareMetal, _) => Target::Local,
            };
            match retention::clean(&paths, &target, keep, !real_run)? {
                RetentionOutcome::DryRun { script } => {
                    if let Some(script) = script {
                        println!("{script}");
                    }
                }
                RetentionOutcome::Applied { deleted } => {
                    journal::journal_print(
                        libsystemd::logging::Priority::Info,
                        &format!("spring-clean deleted {} revision(s)", deleted.len()),
                    );
                }
            }
        }
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
