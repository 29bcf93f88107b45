//! Error types for the mock fleet.
//!
//! Configuration and readiness failures abort fleet startup. Everything a
//! single call can run into is collected in [`DispatchError`] and turned
//! into a gRPC status, so it never reaches the endpoint itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};

/// Bad or missing configuration: descriptor directory, files, ports.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("descriptor directory not specified")]
    EmptyDirectory,

    #[error("descriptor directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("descriptor path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("no .proto files found in directory: {}", .0.display())]
    NoDescriptorFiles(PathBuf),

    #[error("error walking descriptor directory {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to compile descriptors in {}: {message}", .path.display())]
    Compile { path: PathBuf, message: String },

    #[error("port {0} is configured more than once")]
    DuplicatePort(u16),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service or method missing from the loaded descriptor set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("method not found: {service}/{method}")]
    MethodNotFound { service: String, method: String },
}

/// Conversion failure between a protobuf message and a generic value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("message {message} has no field named {field:?}")]
    UnknownField { message: String, field: String },

    #[error("field {field}: expected {expected}, found {found}")]
    KindMismatch {
        field: String,
        expected: String,
        found: &'static str,
    },

    #[error("field {field}: value {value} is out of range for {kind}")]
    OutOfRange {
        field: String,
        value: String,
        kind: &'static str,
    },

    #[error("field {field}: enum {enum_name} has no value named {value:?}")]
    UnknownEnumValue {
        field: String,
        enum_name: String,
        value: String,
    },

    #[error("field {field}: invalid base64: {reason}")]
    InvalidBase64 { field: String, reason: String },

    #[error("field {field}: invalid map key {key:?} for {kind}")]
    InvalidMapKey {
        field: String,
        key: String,
        kind: &'static str,
    },

    #[error("malformed wire message: {0}")]
    Wire(String),
}

/// Failure inside the rule store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("rule store lock poisoned")]
    Poisoned,
}

/// Malformed rule input or output mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("invalid rule input: {0}")]
    InvalidInput(String),

    #[error("invalid rule output: {0}")]
    InvalidOutput(String),
}

/// Everything that can fail a single call.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to find rule: {0}")]
    Match(#[from] MatchError),

    #[error("failed to render response template: {0}")]
    Template(String),

    #[error("no rule found for service {service}, method {method}")]
    NotFound { service: String, method: String },

    #[error("{message}")]
    RuleDefined { code: Code, message: String },
}

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound { .. } => Status::not_found(err.to_string()),
            DispatchError::RuleDefined { code, message } => Status::new(code, message),
            DispatchError::Codec(e) => Status::internal(format!("failed to create response: {e}")),
            other => Status::internal(other.to_string()),
        }
    }
}

/// Lifecycle and configuration failures of a single endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("endpoint on port {port} failed to start: {reason}")]
    StartFailed { port: u16, reason: String },

    #[error("endpoint on port {port} not ready after {timeout:?}")]
    ReadinessTimeout { port: u16, timeout: Duration },

    #[error("endpoint on port {port} is stopped")]
    Stopped { port: u16 },

    #[error("endpoint on port {port} is not started")]
    NotStarted { port: u16 },

    #[error("server task on port {port} failed: {reason}")]
    Task { port: u16, reason: String },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Match(#[from] MatchError),
}

/// Fleet-wide failures.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("endpoint {label} on port {port}: {source}")]
    Endpoint {
        port: u16,
        label: String,
        #[source]
        source: EndpointError,
    },

    #[error("no endpoints running")]
    NoEndpoints,

    #[error("rule rejected by {} endpoint(s): {}", .failures.len(), format_failures(.failures))]
    RuleRejected { failures: Vec<(u16, EndpointError)> },
}

fn format_failures(failures: &[(u16, EndpointError)]) -> String {
    failures
        .iter()
        .map(|(port, err)| format!("port {port}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the programmatic harness surface.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("mock fleet not initialized - call initialize first")]
    NotInitialized,

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("initialization failed: {0}")]
    Initialization(Arc<FleetError>),
}
