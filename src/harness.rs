//! Programmatic surface for embedding a fleet in tests.
//!
//! ```no_run
//! use zentinel_grpc_mock::{GenericValue, MockHarness};
//! use serde_json::json;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let harness = MockHarness::new();
//! harness.initialize("./protos", &[50051]).await?;
//! harness
//!     .add_rule(
//!         "helloworld.Greeter",
//!         "SayHello",
//!         GenericValue::from(json!({"equals": {"name": "world"}})),
//!         GenericValue::from(json!({"data": {"message": "hi"}})),
//!     )
//!     .await?;
//! harness.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::error::{ConfigError, FleetError, HarnessError};
use crate::fleet::{EndpointSpec, FleetSettings, MockFleet};
use crate::rule::Rule;
use crate::value::GenericValue;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

type InitOutcome = Result<(), Arc<FleetError>>;

/// Owned handle around one [`MockFleet`], initialized at most once.
pub struct MockHarness {
    fleet: MockFleet,
    init: Mutex<Option<InitOutcome>>,
}

impl MockHarness {
    pub fn new() -> Self {
        Self::with_settings(FleetSettings::default())
    }

    pub fn with_settings(settings: FleetSettings) -> Self {
        Self {
            fleet: MockFleet::new(settings),
            init: Mutex::new(None),
        }
    }

    pub fn fleet(&self) -> &MockFleet {
        &self.fleet
    }

    /// Start one endpoint per port, labelled `mock-{index}`.
    ///
    /// Later calls return the first outcome until [`shutdown`](Self::shutdown).
    pub async fn initialize(
        &self,
        descriptors: impl AsRef<Path>,
        ports: &[u16],
    ) -> Result<(), HarnessError> {
        let mut init = self.init.lock().await;
        if let Some(outcome) = init.as_ref() {
            return outcome.clone().map_err(HarnessError::Initialization);
        }

        let outcome = self.start(descriptors.as_ref(), ports).await.map_err(Arc::new);
        *init = Some(outcome.clone());
        outcome.map_err(HarnessError::Initialization)
    }

    async fn start(&self, descriptors: &Path, ports: &[u16]) -> Result<(), FleetError> {
        if ports.is_empty() {
            return Err(ConfigError::Invalid("no ports given".to_string()).into());
        }

        let specs = ports
            .iter()
            .enumerate()
            .map(|(i, port)| EndpointSpec::new(format!("mock-{i}"), *port, descriptors))
            .collect();

        let bound = self.fleet.start_all(specs).await?;
        info!(ports = ?bound, "Mock harness initialized");
        Ok(())
    }

    /// Stop the fleet and allow a new `initialize`.
    pub async fn shutdown(&self) {
        let mut init = self.init.lock().await;
        self.fleet.stop_all().await;
        *init = None;
    }

    /// Decode `input`/`output` and register the rule on every endpoint.
    pub async fn add_rule(
        &self,
        service: &str,
        method: &str,
        input: GenericValue,
        output: GenericValue,
    ) -> Result<(), HarnessError> {
        if !matches!(*self.init.lock().await, Some(Ok(()))) {
            return Err(HarnessError::NotInitialized);
        }

        let rule = Rule::from_values(service, method, input, output)?;
        self.fleet.add_rule(rule).await?;
        Ok(())
    }

    pub async fn clear_all_rules(&self) {
        self.fleet.clear_all().await;
    }

    pub async fn list_active_ports(&self) -> Vec<u16> {
        self.fleet.list_ports().await
    }

    pub async fn is_fleet_running(&self) -> bool {
        self.fleet.is_running().await
    }
}

impl Default for MockHarness {
    fn default() -> Self {
        Self::new()
    }
}
