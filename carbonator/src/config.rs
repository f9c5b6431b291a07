//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use tracing::debug;

use crate::{output, watcher::Selector};

/// Environment variable holding configuration contents. When set it takes
/// precedence over any configuration file.
pub const CONFIG_ENV: &str = "CARBONATOR_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// Error for duplicate IDs in outputs
    #[error("Duplicate output ID found: {0}")]
    DuplicateOutputId(String),
    /// The collection interval was zero
    #[error("collection_interval_milliseconds must be positive")]
    ZeroInterval,
}

fn default_collection_interval() -> u64 {
    1_000
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The method by which to express telemetry
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub telemetry: Option<Telemetry>,
    /// The period on which counters are sampled.
    #[serde(default = "default_collection_interval")]
    pub collection_interval_milliseconds: u64,
    /// The counters to sample
    #[serde(default)]
    pub counters: Vec<Selector>,
    /// The backends samples are delivered to
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub outputs: Vec<output::Config>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Defines the manner of carbonator's own telemetry.
pub enum Telemetry {
    /// In prometheus mode carbonator will emit its internal telemetry for
    /// scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Parse and validate a configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML for [`Config`],
    /// the collection interval is zero or two outputs share an ID.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.collection_interval_milliseconds == 0 {
            return Err(Error::ZeroInterval);
        }
        let mut seen_ids = FxHashSet::default();
        for output in &self.outputs {
            if let Some(ref id) = output.general.id
                && !seen_ids.insert(id.clone())
            {
                return Err(Error::DuplicateOutputId(id.clone()));
            }
        }
        Ok(())
    }
}

/// Load configuration from the file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse, see
/// [`Config::parse`].
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    Config::parse(&contents)
}

/// Load configuration from the [`CONFIG_ENV`] environment variable if it is
/// set, else from the file at `path`.
///
/// # Errors
///
/// See [`load_config_from_path`] and [`Config::parse`].
pub fn load(path: &Path) -> Result<Config, Error> {
    if let Ok(contents) = env::var(CONFIG_ENV) {
        debug!("Using config from env var '{CONFIG_ENV}'");
        Config::parse(&contents)
    } else {
        debug!("Attempting to open configuration file at: {}", path.display());
        load_config_from_path(path)
    }
}
