//! Suite configuration.
//!
//! A fixture root may carry a `mongofixture.yaml` (or `.toml`) providing the connection
//! and run settings shared by every fixture below it. Command-line flags override it.

use crate::normalize::CanonicalResult;
use crate::runner::DEFAULT_MAX_RESULTS;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default server address.
pub const DEFAULT_URI: &str = "mongodb://localhost:27017";

/// Default database name.
pub const DEFAULT_DATABASE: &str = "fixtures";

/// Default number of workers.
pub const DEFAULT_JOBS: usize = 4;

/// Suite-level configuration loaded from `mongofixture.yaml` in the fixture root.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// Schema version (must match crate major version).
    #[serde(default = "default_version")]
    pub version: u32,

    /// Connection string. `${VAR}` references are resolved from the environment.
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Database fixtures run against. With several workers, each uses `<database>_w<n>`.
    #[serde(default = "default_database")]
    pub database: String,

    /// Number of fixtures run concurrently (default: 4).
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Run fixtures one at a time on a single connection (default: false).
    #[serde(default)]
    pub serial: bool,

    /// Largest number of documents a cursor may yield before the statement fails.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Run each fixture's `clear` section before its `before` section (default: true).
    #[serde(default = "default_pre_clear")]
    pub pre_clear: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            uri: default_uri(),
            database: default_database(),
            jobs: None,
            serial: false,
            max_results: default_max_results(),
            pre_clear: default_pre_clear(),
        }
    }
}

impl SuiteConfig {
    /// Number of workers to use.
    pub fn effective_jobs(&self) -> usize {
        if self.serial {
            1
        } else {
            self.jobs.unwrap_or(DEFAULT_JOBS).max(1)
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_uri() -> String {
    DEFAULT_URI.to_string()
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

fn default_pre_clear() -> bool {
    true
}

/// Schemas of the suite configuration and of the canonical result.
#[derive(Debug, Serialize)]
pub struct Schemas {
    pub config: schemars::schema::RootSchema,
    pub result: schemars::schema::RootSchema,
}

/// Generate the JSON schema for suite configuration and canonical results.
pub fn generate_schema() -> Schemas {
    Schemas {
        config: schemars::schema_for!(SuiteConfig),
        result: schemars::schema_for!(CanonicalResult),
    }
}
