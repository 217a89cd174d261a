// ABOUTME: CLI commands for interactive sandbox shells (new session or attach by id)
// ABOUTME: Bridges the local terminal to the sandbox TTY through a console

use anyhow::{Context, Result};
use boxcode_cli::terminal::{current_size, input_frames, output_sink, RawModeGuard};
use boxcode_cli::Config;
use boxcode_sandbox::{
    Console, ConsoleExit, ConsoleOptions, DeleteOutcome, IoBridge, MemoryRegistry, SandboxId,
    Session, SessionManager, SessionSpec, TerminalSize,
};
use clap::Args;
use colored::*;
use std::io::IsTerminal;
use std::sync::Arc;
use tracing::warn;

use super::docker_runtime;

#[derive(Args)]
pub struct ShellArgs {
    #[arg(long, default_value = "ubuntu")]
    image: String,

    #[arg(long, default_value = "22.04")]
    tag: String,

    /// Entry command, e.g. "/bin/bash" or "/bin/sh -c 'top'"
    #[arg(long, default_value = "/bin/bash")]
    command: String,

    /// Stable name for the sandbox
    #[arg(long)]
    name: Option<String>,

    /// Give the sandbox network access
    #[arg(long)]
    network: bool,

    /// Let the runtime delete the sandbox when it exits
    #[arg(long)]
    auto_remove: bool,

    #[command(flatten)]
    terminal: TerminalArgs,

    /// Leave the stopped sandbox in place instead of removing it
    #[arg(long)]
    keep: bool,
}

#[derive(Args)]
pub struct AttachArgs {
    /// Sandbox id as printed by `boxcode shell --keep`
    id: String,

    #[command(flatten)]
    terminal: TerminalArgs,
}

#[derive(Args)]
struct TerminalArgs {
    /// Terminal rows (defaults to the local terminal)
    #[arg(long)]
    rows: Option<u16>,

    /// Terminal columns (defaults to the local terminal)
    #[arg(long)]
    cols: Option<u16>,

    /// Replay output produced before attaching
    #[arg(long)]
    replay: bool,
}

impl TerminalArgs {
    fn size(&self) -> Option<TerminalSize> {
        let local = current_size();
        match (self.rows, self.cols) {
            (None, None) => local,
            (rows, cols) => {
                let fallback = local.unwrap_or_default();
                Some(TerminalSize::new(
                    rows.unwrap_or(fallback.rows),
                    cols.unwrap_or(fallback.cols),
                ))
            }
        }
    }
}

pub async fn shell_command(config: &Config, args: ShellArgs) -> Result<i32> {
    let owner = config
        .owner()
        .await
        .context("Could not resolve the session owner")?;
    let runtime = docker_runtime(config)?;
    let registry = Arc::new(MemoryRegistry::new(config.sandbox.allowed_images.clone()));
    let manager = SessionManager::new(runtime, registry, &config.sandbox);

    let mut spec = SessionSpec::new(args.image, args.tag, args.command)
        .with_network(args.network)
        .with_auto_remove(args.auto_remove);
    if let Some(name) = args.name {
        spec = spec.with_name(name);
    }
    let image_ref = spec.image_ref();

    let session = manager.create_session(&owner, spec).await?;
    let id = session
        .id()
        .cloned()
        .context("Session was created without an id")?;
    eprintln!("{} Session {} ({})", "▶".green(), id, image_ref);

    let exit = interact(session, config, &args.terminal).await;

    if args.keep {
        eprintln!("Sandbox kept. Reattach with: boxcode attach {}", id);
    } else {
        match manager.delete_session(&owner, id.as_str()).await {
            Ok(DeleteOutcome::Removed) => {}
            Ok(outcome) => warn!("Sandbox {} not removed: {:?}", id, outcome),
            Err(e) => warn!("Failed to remove sandbox {}: {}", id, e),
        }
    }

    Ok(exit_status(&exit?))
}

pub async fn attach_command(config: &Config, args: AttachArgs) -> Result<i32> {
    let runtime = docker_runtime(config)?;
    // Reconnecting never reads the session spec, so it can be empty
    let session = Session::reconnect(
        runtime,
        SessionSpec::new("", "", ""),
        SandboxId::new(args.id),
    );

    let exit = interact(session, config, &args.terminal).await?;
    Ok(exit_status(&exit))
}

async fn interact(
    session: Session,
    config: &Config,
    terminal: &TerminalArgs,
) -> Result<ConsoleExit> {
    let console = Console::open(session, IoBridge::new(config.sandbox.output_chunk_size))
        .await
        .context("Failed to start the sandbox")?;

    let options = ConsoleOptions {
        size: terminal.size(),
        replay_output: terminal.replay,
        ..Default::default()
    };

    let raw_mode = if std::io::stdin().is_terminal() {
        RawModeGuard::enable()
    } else {
        RawModeGuard::disabled()
    };
    let exit = console
        .run(
            input_frames(tokio::io::stdin()),
            output_sink(tokio::io::stdout()),
            options,
        )
        .await;
    drop(raw_mode);

    Ok(exit?)
}

fn exit_status(exit: &ConsoleExit) -> i32 {
    i32::try_from(exit.exit_code).unwrap_or(1)
}
