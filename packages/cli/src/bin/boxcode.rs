use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process;

mod cli;

use boxcode_cli::{logging, report, Config};
use cli::shell::{AttachArgs, ShellArgs};

#[derive(Parser)]
#[command(name = "boxcode")]
#[command(about = "boxcode - sandboxed shells and one-shot code runs")]
#[command(version)]
struct Cli {
    /// Debug logging for boxcode crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file in a fresh, network-disabled sandbox
    Run {
        /// Language of the source (rust, python, c, cpp, typescript, go, bash)
        #[arg(short, long)]
        language: String,

        /// Source file; reads stdin when omitted or "-"
        file: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start an interactive shell in a new sandbox
    Shell(ShellArgs),
    /// Attach to an existing sandbox by id
    Attach(AttachArgs),
    /// List the supported languages and their images
    Languages {
        #[arg(long)]
        json: bool,
    },
    /// Check that the container runtime is reachable
    Ping,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match handle_command(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), report::user_facing(&e));
            process::exit(1);
        }
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    let config = Config::from_env()?;

    match command {
        Commands::Run {
            language,
            file,
            json,
        } => cli::exec::run_command(&config, &language, file, json).await,
        Commands::Shell(args) => cli::shell::shell_command(&config, args).await,
        Commands::Attach(args) => cli::shell::attach_command(&config, args).await,
        Commands::Languages { json } => cli::exec::languages_command(json),
        Commands::Ping => cli::ping_command(&config).await,
    }
}
