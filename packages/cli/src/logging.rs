// ABOUTME: Tracing subscriber setup for the boxcode binary
// ABOUTME: Logs go to stderr so stdout carries only sandbox output

use tracing_subscriber::EnvFilter;

use crate::config::DEFAULT_LOG_FILTER;

/// `boxcode=debug` when verbose, otherwise `RUST_LOG` or the default filter
pub fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("boxcode=debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

pub fn init(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
