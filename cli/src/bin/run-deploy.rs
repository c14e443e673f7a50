//! The unprivileged frontend: packages a request, enqueues it via the FIFO
//! queue, blocks for the reply, and streams the captured output back,
//! exiting with the worker's reported code. Invoked over `ssh` for CLI
//! verbs, or by the upload step for a deploy.

use anyhow::Context;
use clap::{Parser, Subcommand};
use run_deploy_lib::config::AgentPaths;
use run_deploy_lib::error::AgentError;
use run_deploy_lib::queue;

#[derive(Debug, Parser)]
#[command(name = "run-deploy")]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a query/command verb, authenticated by `RUN_DEPLOY_TOKEN`/`RUN_DEPLOY_KEY`.
    Cli {
        /// Verb name followed by its flags, e.g. `last-deploy --image api`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Install a signed image already staged in the drop directory.
    Deploy {
        /// Path to the signed squashfs image.
        target: String,
        /// The key-ref that signed it.
        key: String,
    },
}

fn run() -> anyhow::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_env("RUN_DEPLOY_LOG").unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    let paths = AgentPaths::from_env();

    let reply = match opt.command {
        Command::Cli { args } => {
            let token = std::env::var("RUN_DEPLOY_TOKEN").map_err(|_| AgentError::TokenKey {
                message: "must have env `RUN_DEPLOY_TOKEN` and `RUN_DEPLOY_KEY`".into(),
            })?;
            let key = std::env::var("RUN_DEPLOY_KEY").map_err(|_| AgentError::TokenKey {
                message: "must have env `RUN_DEPLOY_TOKEN` and `RUN_DEPLOY_KEY`".into(),
            })?;
            queue::submit_cli(&paths, token.trim(), key.trim(), args).context("submitting cli request")?
        }
        Command::Deploy { target, key } => {
            queue::submit_deploy(&paths, &target, &key).context("submitting deploy request")?
        }
    };

    if !reply.stderr.is_empty() {
        eprintln!("{}", reply.stderr);
    }
    if !reply.stdout.is_empty() {
        println!("{}", reply.stdout);
    }
    Ok(reply.code)
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(agent_err) = e.downcast_ref::<AgentError>() {
                std::process::exit(agent_err.emit());
            }
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
