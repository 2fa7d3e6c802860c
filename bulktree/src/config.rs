//! Build configuration module.
//!
//! This module provides configuration loading for the `bulktree` binary from
//! environment variables and positional arguments.
//!
//! # Environment Variables
//!
//! - `BULKTREE_DATA_FILE`: CSV file of `key,id` lines (default: `./data/dataset.csv`)
//! - `BULKTREE_TREE_FILE`: Tree file to create (default: `./result/B_tree`)
//! - `BULKTREE_DUMP_FILE`: Text dump of the built tree (default: `./result/print_tree.txt`)
//! - `BULKTREE_BLOCK_SIZE`: Block size in bytes (default: `512`)
//! - `BULKTREE_WORKERS`: Worker threads, 0 or 1 for a sequential build (default: `0`)
//! - `BULKTREE_NUM_POINTS`: Read at most this many entries (default: all)
//!
//! # Arguments
//!
//! `bulktree [workers] [num_points]` overrides the matching variables.
//!
//! # Invariants
//!
//! - `block_size` is always within the supported block size range

use std::path::PathBuf;

use crate::btree::TreeOptions;
use crate::storage::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, is_valid_block_size};

/// Build configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()` or `from_lookup()`:
/// - `block_size` is in the supported range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// CSV file to read entries from.
    pub data_file: PathBuf,
    /// Tree file to build.
    pub tree_file: PathBuf,
    /// Where the text dump of the tree is written.
    pub dump_file: PathBuf,
    /// Block size in bytes.
    pub block_size: usize,
    /// Worker threads; 0 or 1 builds sequentially.
    pub workers: usize,
    /// Read at most this many entries.
    pub num_points: Option<usize>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable or argument has an invalid value.
    InvalidValue { name: String, message: String },
    /// More positional arguments than `[workers] [num_points]`.
    TooManyArguments(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
            Self::TooManyArguments(count) => {
                write!(
                    f,
                    "expected at most 2 arguments ([workers] [num_points]), got {count}"
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

const DATA_FILE_VAR: &str = "BULKTREE_DATA_FILE";
const TREE_FILE_VAR: &str = "BULKTREE_TREE_FILE";
const DUMP_FILE_VAR: &str = "BULKTREE_DUMP_FILE";
const BLOCK_SIZE_VAR: &str = "BULKTREE_BLOCK_SIZE";
const WORKERS_VAR: &str = "BULKTREE_WORKERS";
const NUM_POINTS_VAR: &str = "BULKTREE_NUM_POINTS";

fn parse_count(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a non-negative integer"),
        })
}

impl BuildConfig {
    /// Default input file.
    pub const DEFAULT_DATA_FILE: &'static str = "./data/dataset.csv";
    /// Default tree file.
    pub const DEFAULT_TREE_FILE: &'static str = "./result/B_tree";
    /// Default dump file.
    pub const DEFAULT_DUMP_FILE: &'static str = "./result/print_tree.txt";

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |name: &str, default: &str| {
            lookup(name).map_or_else(|| PathBuf::from(default), PathBuf::from)
        };

        let block_size = match lookup(BLOCK_SIZE_VAR) {
            Some(value) => parse_count(BLOCK_SIZE_VAR, &value)?,
            None => DEFAULT_BLOCK_SIZE,
        };
        if !is_valid_block_size(block_size) {
            return Err(ConfigError::InvalidValue {
                name: BLOCK_SIZE_VAR.to_string(),
                message: format!(
                    "{block_size} is outside {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}"
                ),
            });
        }

        let workers = match lookup(WORKERS_VAR) {
            Some(value) => parse_count(WORKERS_VAR, &value)?,
            None => 0,
        };
        let num_points = lookup(NUM_POINTS_VAR)
            .map(|value| parse_count(NUM_POINTS_VAR, &value))
            .transpose()?;

        Ok(Self {
            data_file: path(DATA_FILE_VAR, Self::DEFAULT_DATA_FILE),
            tree_file: path(TREE_FILE_VAR, Self::DEFAULT_TREE_FILE),
            dump_file: path(DUMP_FILE_VAR, Self::DEFAULT_DUMP_FILE),
            block_size,
            workers,
            num_points,
        })
    }

    /// Apply positional `[workers] [num_points]` arguments.
    pub fn with_args<I>(mut self, args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();
        if args.len() > 2 {
            return Err(ConfigError::TooManyArguments(args.len()));
        }

        if let Some(workers) = args.first() {
            self.workers = parse_count("workers", workers)?;
        }
        if let Some(num_points) = args.get(1) {
            self.num_points = Some(parse_count("num_points", num_points)?);
        }
        Ok(self)
    }

    /// Tree options matching this configuration.
    #[must_use]
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions::default().with_block_size(self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = BuildConfig::from_lookup(|_| None).expect("defaults");
        assert_eq!(config.data_file, PathBuf::from("./data/dataset.csv"));
        assert_eq!(config.tree_file, PathBuf::from("./result/B_tree"));
        assert_eq!(config.dump_file, PathBuf::from("./result/print_tree.txt"));
        assert_eq!(config.block_size, 512);
        assert_eq!(config.workers, 0);
        assert_eq!(config.num_points, None);
    }

    #[test]
    fn test_values_from_lookup() {
        let config = BuildConfig::from_lookup(lookup_from(&[
            ("BULKTREE_DATA_FILE", "/tmp/points.csv"),
            ("BULKTREE_BLOCK_SIZE", "4096"),
            ("BULKTREE_WORKERS", "8"),
            ("BULKTREE_NUM_POINTS", "1000"),
        ]))
        .expect("config");

        assert_eq!(config.data_file, PathBuf::from("/tmp/points.csv"));
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.workers, 8);
        assert_eq!(config.num_points, Some(1000));
        assert_eq!(config.tree_options().block_size, 4096);
    }

    #[test]
    fn test_invalid_block_size() {
        let result = BuildConfig::from_lookup(lookup_from(&[("BULKTREE_BLOCK_SIZE", "64")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "BULKTREE_BLOCK_SIZE"
        ));

        let result = BuildConfig::from_lookup(lookup_from(&[("BULKTREE_BLOCK_SIZE", "big")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_args_override_env() {
        let config = BuildConfig::from_lookup(lookup_from(&[("BULKTREE_WORKERS", "2")]))
            .expect("config")
            .with_args(["4".to_string(), "500".to_string()])
            .expect("args");
        assert_eq!(config.workers, 4);
        assert_eq!(config.num_points, Some(500));

        let config = BuildConfig::from_lookup(|_| None)
            .expect("config")
            .with_args(["3".to_string()])
            .expect("args");
        assert_eq!(config.workers, 3);
        assert_eq!(config.num_points, None);
    }

    #[test]
    fn test_bad_args() {
        let base = BuildConfig::from_lookup(|_| None).expect("config");
        assert!(matches!(
            base.clone().with_args(["-1".to_string()]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            base.with_args(["1", "2", "3"].map(String::from)),
            Err(ConfigError::TooManyArguments(3))
        );
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
