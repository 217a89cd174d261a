// ABOUTME: Runtime settings for sessions, the I/O bridge and the execution pipeline
// ABOUTME: Loaded from BOXCODE_* environment variables with safe defaults

use std::env;
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

use crate::registry::AllowedImage;

pub const DEFAULT_MAX_SESSIONS_PER_USER: u32 = 8;
pub const DEFAULT_OUTPUT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_ARCHIVE_MODE: u32 = 0o777;
pub const DEFAULT_STOP_TIMEOUT_SECS: i64 = 10;
pub const DEFAULT_ALLOWED_IMAGES: &str = "ubuntu:22.04=/bin/bash|/bin/sh";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number for {var}: {source}")]
    InvalidNumber {
        var: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("Invalid boolean for {var}: {value}")]
    InvalidBool { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Invalid allowed image entry: {0}")]
    InvalidAllowedImage(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    /// Ceiling checked against the registry count before every create
    pub max_sessions_per_user: u32,
    /// Bytes read from the process stream per outbound transport message
    pub output_chunk_size: usize,
    /// Permission bits for the source file injected by the pipeline
    pub archive_mode: u32,
    pub stop_timeout_secs: i64,
    pub pull_missing_images: bool,
    pub allowed_images: Vec<AllowedImage>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            output_chunk_size: DEFAULT_OUTPUT_CHUNK_SIZE,
            archive_mode: DEFAULT_ARCHIVE_MODE,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            pull_missing_images: false,
            // The default list is a constant known to parse
            allowed_images: parse_allowed_images(DEFAULT_ALLOWED_IMAGES).unwrap_or_default(),
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Missing keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_sessions_per_user = match lookup("BOXCODE_MAX_SESSIONS_PER_USER") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|source| ConfigError::InvalidNumber {
                    var: "BOXCODE_MAX_SESSIONS_PER_USER",
                    source,
                })?,
            None => defaults.max_sessions_per_user,
        };

        let output_chunk_size = match lookup("BOXCODE_OUTPUT_CHUNK_SIZE") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|source| ConfigError::InvalidNumber {
                    var: "BOXCODE_OUTPUT_CHUNK_SIZE",
                    source,
                })?,
            None => defaults.output_chunk_size,
        };
        if output_chunk_size == 0 {
            return Err(ConfigError::Zero("BOXCODE_OUTPUT_CHUNK_SIZE"));
        }

        // Octal, as written in a chmod invocation
        let archive_mode = match lookup("BOXCODE_ARCHIVE_MODE") {
            Some(raw) => u32::from_str_radix(raw.trim().trim_start_matches("0o"), 8).map_err(
                |source| ConfigError::InvalidNumber {
                    var: "BOXCODE_ARCHIVE_MODE",
                    source,
                },
            )?,
            None => defaults.archive_mode,
        };

        let stop_timeout_secs = match lookup("BOXCODE_STOP_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|source| ConfigError::InvalidNumber {
                    var: "BOXCODE_STOP_TIMEOUT_SECS",
                    source,
                })?,
            None => defaults.stop_timeout_secs,
        };

        let pull_missing_images = match lookup("BOXCODE_PULL_MISSING_IMAGES") {
            Some(raw) => parse_bool("BOXCODE_PULL_MISSING_IMAGES", &raw)?,
            None => defaults.pull_missing_images,
        };

        let allowed_images = match lookup("BOXCODE_ALLOWED_IMAGES") {
            Some(raw) => parse_allowed_images(&raw)?,
            None => defaults.allowed_images,
        };

        Ok(Self {
            max_sessions_per_user,
            output_chunk_size,
            archive_mode,
            stop_timeout_secs,
            pull_missing_images,
            allowed_images,
        })
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs.max(0) as u64)
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidBool {
            var,
            value: other.to_string(),
        }),
    }
}

/// Parse `image:tag[=cmd1|cmd2],...`. An entry without commands allows any command.
pub fn parse_allowed_images(raw: &str) -> Result<Vec<AllowedImage>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (image_ref, commands) = match entry.split_once('=') {
                Some((image_ref, commands)) => (image_ref.trim(), commands),
                None => (entry, ""),
            };

            let valid_ref = image_ref
                .rsplit_once(':')
                .map(|(image, tag)| !image.is_empty() && !tag.is_empty() && !tag.contains('/'))
                .unwrap_or(false);
            if !valid_ref {
                return Err(ConfigError::InvalidAllowedImage(entry.to_string()));
            }

            let commands = commands
                .split('|')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();

            Ok(AllowedImage {
                image_ref: image_ref.to_string(),
                commands,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = SandboxSettings::from_lookup(lookup(&[])).unwrap();

        assert_eq!(settings.max_sessions_per_user, 8);
        assert_eq!(settings.output_chunk_size, 1024);
        assert_eq!(settings.archive_mode, 0o777);
        assert!(!settings.pull_missing_images);
        assert_eq!(
            settings.allowed_images,
            vec![AllowedImage {
                image_ref: "ubuntu:22.04".into(),
                commands: vec!["/bin/bash".into(), "/bin/sh".into()],
            }]
        );
    }

    #[test]
    fn test_overrides() {
        let settings = SandboxSettings::from_lookup(lookup(&[
            ("BOXCODE_MAX_SESSIONS_PER_USER", "3"),
            ("BOXCODE_OUTPUT_CHUNK_SIZE", "4096"),
            ("BOXCODE_ARCHIVE_MODE", "0o755"),
            ("BOXCODE_PULL_MISSING_IMAGES", "yes"),
            ("BOXCODE_ALLOWED_IMAGES", "alpine:3.19, debian:bookworm=/bin/sh"),
        ]))
        .unwrap();

        assert_eq!(settings.max_sessions_per_user, 3);
        assert_eq!(settings.output_chunk_size, 4096);
        assert_eq!(settings.archive_mode, 0o755);
        assert!(settings.pull_missing_images);
        assert_eq!(settings.allowed_images.len(), 2);
        assert!(settings.allowed_images[0].commands.is_empty());
        assert_eq!(settings.allowed_images[1].commands, vec!["/bin/sh".to_string()]);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = SandboxSettings::from_lookup(lookup(&[("BOXCODE_OUTPUT_CHUNK_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("BOXCODE_OUTPUT_CHUNK_SIZE")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SandboxSettings::from_lookup(lookup(&[("BOXCODE_MAX_SESSIONS_PER_USER", "many")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            SandboxSettings::from_lookup(lookup(&[("BOXCODE_ARCHIVE_MODE", "999")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            SandboxSettings::from_lookup(lookup(&[("BOXCODE_PULL_MISSING_IMAGES", "maybe")])),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            SandboxSettings::from_lookup(lookup(&[("BOXCODE_ALLOWED_IMAGES", "ubuntu")])),
            Err(ConfigError::InvalidAllowedImage(_))
        ));
    }

    #[test]
    fn test_registry_style_image_ref_with_port() {
        let images = parse_allowed_images("registry.local:5000/tools:1.2").unwrap();
        assert_eq!(images[0].image_ref, "registry.local:5000/tools:1.2");

        // A port alone is not a tag
        assert!(parse_allowed_images("registry.local:5000/tools").is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        env::set_var("BOXCODE_MAX_SESSIONS_PER_USER", "2");
        env::remove_var("BOXCODE_OUTPUT_CHUNK_SIZE");

        let settings = SandboxSettings::from_env().unwrap();
        assert_eq!(settings.max_sessions_per_user, 2);
        assert_eq!(settings.output_chunk_size, 1024);

        env::remove_var("BOXCODE_MAX_SESSIONS_PER_USER");
    }

    #[test]
    #[serial]
    fn test_from_env_without_overrides_matches_default() {
        for var in [
            "BOXCODE_MAX_SESSIONS_PER_USER",
            "BOXCODE_OUTPUT_CHUNK_SIZE",
            "BOXCODE_ARCHIVE_MODE",
            "BOXCODE_STOP_TIMEOUT_SECS",
            "BOXCODE_PULL_MISSING_IMAGES",
            "BOXCODE_ALLOWED_IMAGES",
        ] {
            env::remove_var(var);
        }

        assert_eq!(SandboxSettings::from_env().unwrap(), SandboxSettings::default());
    }
}
