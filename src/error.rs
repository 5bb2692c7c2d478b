//! Error types for podrelay using snafu.
//!
//! Each concern gets its own enum with context selectors. Only configuration
//! and startup failures ever reach `main`; everything raised while the relay
//! is running is logged at the point of failure and the operation is retried
//! the next time it naturally occurs.

use snafu::prelude::*;
use std::path::PathBuf;

/// Boxed error used where the underlying transport error is opaque.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ============ Config Errors ============

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// An environment override could not be parsed.
    #[snafu(display("Invalid value {value:?} for {key}: {message}"))]
    InvalidEnvValue {
        key: String,
        value: String,
        message: String,
    },

    /// The target endpoint is not a valid URL.
    #[snafu(display("Invalid target endpoint {endpoint:?}: {source}"))]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },

    /// The target endpoint uses a scheme other than http or https.
    #[snafu(display("Target endpoint {endpoint:?} must use http or https, not {scheme}"))]
    UnsupportedScheme { endpoint: String, scheme: String },

    /// The dispatch queue needs at least one slot.
    #[snafu(display("max_concurrent_requests must be at least 1"))]
    ZeroConcurrency,

    /// More concurrent requests than the dispatch queue can hold.
    #[snafu(display("max_concurrent_requests cannot exceed {max}, got {value}"))]
    TooManyConcurrent { value: usize, max: usize },

    /// A failure threshold of zero would recover on every event.
    #[snafu(display("consecutive_failure_threshold must be at least 1"))]
    ZeroFailureThreshold,

    /// No supervisor command to invoke.
    #[snafu(display("recovery.supervisor_command cannot be empty"))]
    EmptySupervisorCommand,

    /// A configured interval is zero.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroDuration { field: &'static str },
}

// ============ Forward Errors ============

/// Errors raised while loading an event file before it is dispatched.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ForwardError {
    /// The event file could not be read.
    #[snafu(display("Failed to read event file {}: {source}", path.display()))]
    ReadEvent {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The event file is not a single JSON object.
    #[snafu(display("Malformed event file {}: {source}", path.display()))]
    ParseEvent {
        path: PathBuf,
        content: String,
        source: serde_json::Error,
    },

    /// The event's IRIs cannot be carried in a request header.
    #[snafu(display("Event file {} has IRIs unusable as a header value: {source}", path.display()))]
    InvalidIris {
        path: PathBuf,
        source: reqwest::header::InvalidHeaderValue,
    },

    /// The dispatch queue refused the task.
    #[snafu(display("Dispatch queue closed"))]
    QueueClosed,
}

// ============ Transport Errors ============

/// How a failed delivery bears on producer health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The downstream endpoint refused the connection. Restarting the producer
    /// cannot fix this, so it never counts toward recovery.
    NetworkOnly,
    /// Any other failure; counts toward the consecutive-failure threshold.
    ProducerRelated,
}

/// Errors returned by the outbound HTTP transport after retries are exhausted.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// Nothing is listening on the downstream endpoint.
    #[snafu(display("Connection refused by {url}: {source}"))]
    ConnectionRefused { url: String, source: BoxError },

    /// The request did not complete within the configured timeout.
    #[snafu(display("Request to {url} timed out: {source}"))]
    Timeout { url: String, source: BoxError },

    /// The endpoint answered with a non-2xx status.
    #[snafu(display("Request to {url} returned HTTP {status}"))]
    Status { url: String, status: u16 },

    /// The event's IRIs cannot be sent as a header. Never retried.
    #[snafu(display("IRIs for {url} are not a valid header value: {source}"))]
    InvalidHeader {
        url: String,
        source: reqwest::header::InvalidHeaderValue,
    },

    /// Any other transport failure (DNS, TLS, protocol, ...).
    #[snafu(display("Request to {url} failed: {source}"))]
    Request { url: String, source: BoxError },
}

impl TransportError {
    /// Classify this failure for the health monitor.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::ConnectionRefused { .. } => FailureKind::NetworkOnly,
            TransportError::Timeout { .. }
            | TransportError::Status { .. }
            | TransportError::InvalidHeader { .. }
            | TransportError::Request { .. } => FailureKind::ProducerRelated,
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidHeader { .. })
    }
}

// ============ Supervisor Errors ============

/// Errors from the external process supervisor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SupervisorError {
    /// No supervisor command configured.
    #[snafu(display("Supervisor command is empty"))]
    EmptyCommand,

    /// The supervisor command could not be spawned.
    #[snafu(display("Failed to run `{command}`: {source}"))]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// The supervisor command exited unsuccessfully.
    #[snafu(display("`{command}` exited with {status}: {stderr}"))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

// ============ Recovery Errors ============

/// Errors from a single recovery attempt. Never propagated past the
/// recovery controller; logged and retried on the next trigger.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RecoveryError {
    /// Now minus the lookback is outside the representable date range.
    #[snafu(display("Lookback of {lookback_minutes} minutes is out of range"))]
    CheckpointOutOfRange { lookback_minutes: i64 },

    /// Failed to read the producer configuration.
    #[snafu(display("Failed to read producer config {}", path.display()))]
    ReadProducerConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write the producer configuration.
    #[snafu(display("Failed to write producer config {}", path.display()))]
    WriteProducerConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The supervisor failed to restart the producer.
    #[snafu(display("Failed to restart producer"))]
    Restart { source: SupervisorError },
}

// ============ Watch Errors ============

/// Errors from the directory watch handle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WatchError {
    /// The platform watcher could not be created.
    #[snafu(display("Failed to create watcher: {source}"))]
    CreateWatcher { source: notify::Error },

    /// The directory could not be registered with the watcher.
    #[snafu(display("Failed to watch {}: {source}", path.display()))]
    WatchDirectory {
        path: PathBuf,
        source: notify::Error,
    },

    /// The directory could not be listed.
    #[snafu(display("Failed to list {}: {source}", path.display()))]
    ListDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Relay Error (top-level) ============

/// Top-level errors that stop the relay before it starts running.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RelayError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address {address:?}"))]
    AddressParse {
        address: String,
        source: std::net::AddrParseError,
    },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// The HTTP client could not be constructed.
    #[snafu(display("Failed to build HTTP client"))]
    HttpClient { source: reqwest::Error },

    /// The health monitor task panicked.
    #[snafu(display("Health monitor task failed"))]
    MonitorJoin { source: tokio::task::JoinError },

    /// Failed to render the effective configuration.
    #[snafu(display("Failed to render configuration"))]
    RenderConfig { source: serde_yaml::Error },
}
