//! Layered configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, then `GHWALK_*` environment variables with `__` separating nested
//! keys (e.g. `GHWALK_BUDGET__NODE_CAP=1000`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::checkpoint::validate_traversal_id;
use crate::engine::{EngineConfig, RetryPolicy, DEFAULT_CHECKPOINT_INTERVAL};
use crate::error::SettingsError;
use crate::fetch::{normalize_endpoint, DEFAULT_ENDPOINT, REPOSITORY_NODES_PER_CHILD};
use crate::planner::{PlannerConfig, MAX_PAGE_SIZE};

const ENV_PREFIX: &str = "GHWALK";
const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";
const DEFAULT_CHECKPOINT_DIR: &str = ".ghwalk";

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_enabled() -> bool {
    true
}

/// One organization to traverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationSettings {
    /// Organization login.
    pub name: String,

    /// GitHub base URL or GraphQL endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Disabled organizations stay configured but are never traversed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl OrganizationSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: default_endpoint(),
            token_env: default_token_env(),
            enabled: true,
        }
    }

    /// Key of the credential this organization spends budget from.
    ///
    /// Organizations read through the same token against the same host share
    /// one rate limit.
    pub fn credential_key(&self) -> (String, String) {
        (self.token_env.clone(), normalize_endpoint(&self.endpoint))
    }
}

/// Where and how often checkpoints are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub dir: PathBuf,
    /// Successful fetches between checkpoints.
    pub interval: u32,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

/// Full application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub organizations: Vec<OrganizationSettings>,
    pub budget: BudgetConfig,
    pub planner: PlannerConfig,
    pub retry: RetryPolicy,
    pub checkpoint: CheckpointSettings,
}

impl Settings {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text alone, without the environment.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective settings as TOML.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut names = HashSet::new();
        for org in &self.organizations {
            validate_traversal_id(&org.name).map_err(|_| {
                SettingsError::Invalid(format!("invalid organization name {:?}", org.name))
            })?;
            // Logins are case-insensitive on GitHub.
            if !names.insert(org.name.to_ascii_lowercase()) {
                return Err(SettingsError::Invalid(format!(
                    "organization name must be unique within organizations: {}",
                    org.name
                )));
            }
            if org.token_env.trim().is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "organization {} has an empty token_env",
                    org.name
                )));
            }
        }

        if self.budget.node_cap == 0 || self.budget.request_cap == 0 {
            return Err(SettingsError::Invalid(
                "budget caps must be greater than zero".to_string(),
            ));
        }
        // The smallest repository page bills its parent plus the weighted children.
        let smallest_inner = 1 + u64::from(self.planner.min_page_size) * REPOSITORY_NODES_PER_CHILD;
        if self.budget.node_cap < smallest_inner {
            return Err(SettingsError::Invalid(format!(
                "budget.node_cap must be at least {smallest_inner} (one parent plus planner.min_page_size repositories)"
            )));
        }

        let planner = &self.planner;
        for (field, size) in [
            ("outer_page_size", planner.outer_page_size),
            ("inner_page_size", planner.inner_page_size),
            ("min_page_size", planner.min_page_size),
        ] {
            if size == 0 || size > MAX_PAGE_SIZE {
                return Err(SettingsError::Invalid(format!(
                    "planner.{field} must be between 1 and {MAX_PAGE_SIZE}, got {size}"
                )));
            }
        }
        if planner.min_page_size > planner.outer_page_size.min(planner.inner_page_size) {
            return Err(SettingsError::Invalid(
                "planner.min_page_size cannot exceed the outer or inner page size".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(SettingsError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier <= 1.0 {
            return Err(SettingsError::Invalid(
                "retry.multiplier must be a finite number greater than 1.0".to_string(),
            ));
        }
        if self.retry.initial_backoff.is_zero() {
            return Err(SettingsError::Invalid(
                "retry.initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(SettingsError::Invalid(
                "retry.max_backoff_ms cannot be below retry.initial_backoff_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Look up an organization by name.
    pub fn organization(&self, name: &str) -> Option<&OrganizationSettings> {
        self.organizations
            .iter()
            .find(|org| org.name.eq_ignore_ascii_case(name))
    }

    /// Configured organizations that are not disabled.
    pub fn enabled_organizations(&self) -> impl Iterator<Item = &OrganizationSettings> {
        self.organizations.iter().filter(|org| org.enabled)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_checkpoint_interval(self.checkpoint.interval)
            .with_retry(self.retry.clone())
    }
}
