pub mod exec;
pub mod shell;

use anyhow::{Context, Result};
use boxcode_cli::Config;
use boxcode_sandbox::{DockerRuntime, RuntimeClient};
use colored::*;
use std::sync::Arc;

/// Docker client configured from the sandbox settings
pub fn docker_runtime(config: &Config) -> Result<Arc<dyn RuntimeClient>> {
    let runtime = DockerRuntime::connect()
        .context("Failed to connect to Docker")?
        .with_stop_timeout(config.sandbox.stop_timeout())
        .with_image_pull(config.sandbox.pull_missing_images);
    Ok(Arc::new(runtime))
}

pub async fn ping_command(config: &Config) -> Result<i32> {
    let runtime = docker_runtime(config)?;
    runtime
        .ping()
        .await
        .context("Docker daemon did not answer")?;
    println!("{} Docker is reachable", "✓".green());
    Ok(0)
}
