//! Configuration for the mock fleet binary.
//!
//! Declares the descriptor directory, the endpoints to start and the rules
//! to load once they are up.

use crate::dispatcher::CallSettings;
use crate::fleet::{EndpointSpec, FleetSettings};
use crate::rule::Rule;
use crate::value::GenericValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the mock fleet.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Default directory of `.proto` files
    #[serde(default)]
    pub descriptors: PathBuf,

    /// Endpoints to start
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Rules registered on every endpoint after startup
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("At least one endpoint is required");
        }

        let mut ports = BTreeSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if self.descriptors_for(endpoint).as_os_str().is_empty() {
                anyhow::bail!("Endpoint {}: descriptor directory not specified", i);
            }
            if endpoint.port != 0 && !ports.insert(endpoint.port) {
                anyhow::bail!("Endpoint {}: duplicate port {}", i, endpoint.port);
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            rule.to_rule()
                .map_err(|e| anyhow::anyhow!("Rule {}: {}", i, e))?;
        }
        Ok(())
    }

    fn descriptors_for<'a>(&'a self, endpoint: &'a EndpointConfig) -> &'a Path {
        endpoint.descriptors.as_deref().unwrap_or(&self.descriptors)
    }

    /// Endpoints to hand to [`MockFleet::start_all`](crate::MockFleet::start_all).
    pub fn endpoint_specs(&self) -> Vec<EndpointSpec> {
        self.endpoints
            .iter()
            .enumerate()
            .map(|(i, endpoint)| {
                let label = endpoint
                    .label
                    .clone()
                    .unwrap_or_else(|| format!("mock-{i}"));
                EndpointSpec::new(label, endpoint.port, self.descriptors_for(endpoint))
            })
            .collect()
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        self.settings.to_fleet_settings()
    }

    /// Decode every rule definition.
    pub fn to_rules(&self) -> anyhow::Result<Vec<Rule>> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                rule.to_rule()
                    .map_err(|e| anyhow::anyhow!("Rule {}: {}", i, e))
            })
            .collect()
    }
}

/// A single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Port to listen on (0 = any free port)
    pub port: u16,

    /// Label used in logs
    #[serde(default)]
    pub label: Option<String>,

    /// Overrides the top-level descriptor directory
    #[serde(default)]
    pub descriptors: Option<PathBuf>,
}

/// A rule as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Fully-qualified service name
    pub service: String,

    /// Method name
    pub method: String,

    /// `matches`/`equals` criteria, optionally `headers`
    #[serde(default)]
    pub input: GenericValue,

    /// `data` or `error` response
    #[serde(default)]
    pub output: GenericValue,
}

impl RuleDefinition {
    /// Decode into a [`Rule`].
    pub fn to_rule(&self) -> anyhow::Result<Rule> {
        if self.service.is_empty() {
            anyhow::bail!("Rule service cannot be empty");
        }
        if self.method.is_empty() {
            anyhow::bail!("Rule method cannot be empty");
        }
        Ok(Rule::from_values(
            self.service.clone(),
            self.method.clone(),
            self.input.clone(),
            self.output.clone(),
        )?)
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Interface every endpoint binds
    #[serde(default = "default_host")]
    pub host: String,

    /// How long each endpoint may take to accept connections
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Log all matched calls
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched calls
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl GlobalSettings {
    pub fn to_fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            host: self.host.clone(),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            calls: CallSettings {
                log_matches: self.log_matches,
                log_unmatched: self.log_unmatched,
            },
        }
    }
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            ready_timeout_ms: default_ready_timeout_ms(),
            log_matches: true,
            log_unmatched: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ready_timeout_ms() -> u64 {
    5000
}
