// ABOUTME: Library half of the boxcode command line tool
// ABOUTME: Configuration and error reporting for the binary plus the local terminal transport

pub mod config;
pub mod logging;
pub mod report;
pub mod terminal;

pub use config::{Config, ConfigError};
