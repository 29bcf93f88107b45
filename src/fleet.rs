//! Multi-port fleet of mock endpoints.

use crate::descriptor::DescriptorSet;
use crate::dispatcher::CallSettings;
use crate::endpoint::{EndpointSettings, MockEndpoint};
use crate::error::{ConfigError, EndpointError, FleetError};
use crate::rule::Rule;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One endpoint to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub label: String,
    /// `0` picks a free port
    pub port: u16,
    /// Directory of `.proto` files, also the import root
    pub descriptors: PathBuf,
}

impl EndpointSpec {
    pub fn new(label: impl Into<String>, port: u16, descriptors: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            port,
            descriptors: descriptors.into(),
        }
    }
}

/// Settings shared by every endpoint of a fleet.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub host: String,
    pub ready_timeout: Duration,
    pub calls: CallSettings,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            ready_timeout: Duration::from_secs(5),
            calls: CallSettings::default(),
        }
    }
}

/// Registry of running endpoints keyed by bound port.
///
/// `start_all` and `stop_all` hold the registry exclusively for their whole
/// run; every other operation shares it.
pub struct MockFleet {
    settings: FleetSettings,
    endpoints: RwLock<BTreeMap<u16, Arc<MockEndpoint>>>,
}

impl MockFleet {
    pub fn new(settings: FleetSettings) -> Self {
        Self {
            settings,
            endpoints: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    /// Start every endpoint in `specs`, all or nothing.
    ///
    /// Returns the bound ports in `specs` order.
    pub async fn start_all(&self, specs: Vec<EndpointSpec>) -> Result<Vec<u16>, FleetError> {
        let mut endpoints = self.endpoints.write().await;

        let mut seen = BTreeSet::new();
        for spec in &specs {
            if spec.port != 0 && (endpoints.contains_key(&spec.port) || !seen.insert(spec.port)) {
                return Err(ConfigError::DuplicatePort(spec.port).into());
            }
        }

        let mut compiled: HashMap<PathBuf, Arc<DescriptorSet>> = HashMap::new();
        let mut started: Vec<Arc<MockEndpoint>> = Vec::with_capacity(specs.len());

        for spec in &specs {
            match self.start_one(spec, &mut compiled).await {
                Ok(endpoint) => started.push(endpoint),
                Err(err) => {
                    warn!(
                        label = %spec.label,
                        port = spec.port,
                        error = %err,
                        rollback = started.len(),
                        "Fleet startup failed, stopping started endpoints"
                    );
                    for endpoint in &started {
                        if let Err(e) = endpoint.stop().await {
                            warn!(port = endpoint.port(), error = %e, "Rollback stop failed");
                        }
                    }
                    return Err(err);
                }
            }
        }

        let ports: Vec<u16> = started.iter().map(|e| e.port()).collect();
        for endpoint in started {
            endpoints.insert(endpoint.port(), endpoint);
        }

        info!(ports = ?ports, "Fleet started");
        Ok(ports)
    }

    async fn start_one(
        &self,
        spec: &EndpointSpec,
        compiled: &mut HashMap<PathBuf, Arc<DescriptorSet>>,
    ) -> Result<Arc<MockEndpoint>, FleetError> {
        let descriptors = match compiled.get(&spec.descriptors) {
            Some(set) => Arc::clone(set),
            None => {
                let set = Arc::new(DescriptorSet::load(&spec.descriptors)?);
                compiled.insert(spec.descriptors.clone(), Arc::clone(&set));
                set
            }
        };

        let endpoint = Arc::new(MockEndpoint::new(
            spec.label.clone(),
            spec.port,
            descriptors,
            EndpointSettings {
                host: self.settings.host.clone(),
                calls: self.settings.calls,
            },
        ));

        let fail = |source: EndpointError| FleetError::Endpoint {
            port: spec.port,
            label: spec.label.clone(),
            source,
        };

        endpoint.start().await.map_err(fail)?;

        if let Err(err) = endpoint.wait_until_ready(self.settings.ready_timeout).await {
            if let Err(e) = endpoint.stop().await {
                debug!(port = endpoint.port(), error = %e, "Stop after failed readiness");
            }
            return Err(fail(err));
        }

        Ok(endpoint)
    }

    /// Stop every endpoint and empty the registry.
    pub async fn stop_all(&self) {
        let mut endpoints = self.endpoints.write().await;
        let drained = std::mem::take(&mut *endpoints);

        for (port, endpoint) in drained {
            match endpoint.stop().await {
                Ok(()) => debug!(port = port, label = %endpoint.label(), "Stopped"),
                Err(err) => warn!(port = port, error = %err, "Failed to stop endpoint"),
            }
        }

        info!("Fleet stopped");
    }

    /// Register `rule` on every endpoint.
    ///
    /// Endpoints that accept the rule keep it even when others reject it.
    pub async fn add_rule(&self, rule: Rule) -> Result<(), FleetError> {
        let endpoints = self.endpoints.read().await;
        if endpoints.is_empty() {
            return Err(FleetError::NoEndpoints);
        }

        let failures: Vec<(u16, EndpointError)> = endpoints
            .iter()
            .filter_map(|(port, endpoint)| {
                endpoint.add_rule(rule.clone()).err().map(|e| (*port, e))
            })
            .collect();

        if failures.is_empty() {
            debug!(service = %rule.service, method = %rule.method, "Rule added to fleet");
            Ok(())
        } else {
            Err(FleetError::RuleRejected { failures })
        }
    }

    pub async fn clear_all(&self) {
        let endpoints = self.endpoints.read().await;
        for endpoint in endpoints.values() {
            endpoint.clear_rules();
        }
    }

    /// Registered ports, ascending.
    pub async fn list_ports(&self) -> Vec<u16> {
        self.endpoints.read().await.keys().copied().collect()
    }

    pub async fn get(&self, port: u16) -> Option<Arc<MockEndpoint>> {
        self.endpoints.read().await.get(&port).cloned()
    }

    /// Non-empty and every endpoint running.
    pub async fn is_running(&self) -> bool {
        let endpoints = self.endpoints.read().await;
        !endpoints.is_empty() && endpoints.values().all(|e| e.is_running())
    }
}

impl Default for MockFleet {
    fn default() -> Self {
        Self::new(FleetSettings::default())
    }
}
