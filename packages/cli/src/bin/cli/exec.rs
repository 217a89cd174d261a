// ABOUTME: CLI commands for one-shot code execution and the language catalogue
// ABOUTME: Reads a source file, runs it through the execution pipeline and prints the output

use anyhow::{Context, Result};
use boxcode_cli::Config;
use boxcode_sandbox::{ExecutionPipeline, Language, SandboxError};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

use super::docker_runtime;

#[derive(Serialize)]
struct RunReport {
    language: Language,
    sandbox_id: String,
    output: String,
}

pub async fn run_command(
    config: &Config,
    language: &str,
    file: Option<PathBuf>,
    json: bool,
) -> Result<i32> {
    // Reject unknown languages before touching Docker
    let language: Language = language.parse()?;
    let source = read_source(file).await?;

    let pipeline = ExecutionPipeline::new(docker_runtime(config)?)
        .with_archive_mode(config.sandbox.archive_mode);

    let result = match pipeline.run(language.as_str(), &source).await {
        Ok(result) => result,
        Err(e @ SandboxError::RuntimeUnavailable(_)) => {
            return Err(e).context("Is the Docker daemon running? Try 'boxcode ping'");
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        let report = RunReport {
            language: result.language,
            sandbox_id: result.sandbox_id.to_string(),
            output: result.output_lossy(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&result.output)?;
        stdout.flush()?;
    }

    Ok(0)
}

async fn read_source(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut source = String::new();
            tokio::io::stdin()
                .read_to_string(&mut source)
                .await
                .context("Failed to read source from stdin")?;
            Ok(source)
        }
    }
}

pub fn languages_command(json: bool) -> Result<i32> {
    let profiles: Vec<_> = Language::ALL.iter().map(|l| l.profile()).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(0);
    }

    println!("{}", "Supported languages".blue().bold());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Language", "Image", "Command", "Source path"]);
    for profile in &profiles {
        table.add_row(vec![
            profile.language.to_string(),
            format!("{}:{}", profile.image, profile.tag),
            profile.command.to_string(),
            format!("{}/{}", profile.destination, profile.entry_filename),
        ]);
    }

    println!("{}", table);
    Ok(0)
}
