//! Typed collector configuration document
//!
//! Component sections are ordered maps so the rendered YAML is stable for
//! identical input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Pod IP environment variable injected into every collector container
pub const ENV_VAR_POD_IP: &str = "MY_POD_IP";
/// Node name environment variable injected into agents
pub const ENV_VAR_NODE_NAME: &str = "MY_NODE_NAME";

pub const OTLP_GRPC_PORT: i32 = 4317;
pub const OTLP_HTTP_PORT: i32 = 4318;
pub const METRICS_PORT: i32 = 8888;
pub const HEALTH_CHECK_PORT: i32 = 13133;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CollectorConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
    #[serde(default)]
    pub receivers: BTreeMap<String, Value>,
    #[serde(default)]
    pub processors: BTreeMap<String, Value>,
    #[serde(default)]
    pub exporters: BTreeMap<String, Value>,
    pub service: Service,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Service {
    #[serde(default)]
    pub pipelines: BTreeMap<String, ServicePipeline>,
    pub telemetry: ServiceTelemetry,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServicePipeline {
    pub receivers: Vec<String>,
    pub processors: Vec<String>,
    pub exporters: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceTelemetry {
    pub metrics: TelemetryMetrics,
    pub logs: TelemetryLogs,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TelemetryMetrics {
    pub readers: Vec<MetricReader>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MetricReader {
    pub pull: PullMetricReader,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PullMetricReader {
    pub exporter: MetricExporter,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MetricExporter {
    pub prometheus: PrometheusMetricExporter,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PrometheusMetricExporter {
    pub host: String,
    pub port: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TelemetryLogs {
    pub level: String,
    pub encoding: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Endpoint {
    pub endpoint: String,
}

// ============================================================================
// Receivers
// ============================================================================

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OtlpReceiver {
    pub protocols: ReceiverProtocols,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ReceiverProtocols {
    pub http: Endpoint,
    pub grpc: Endpoint,
}

// ============================================================================
// Processors
// ============================================================================

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct BatchProcessor {
    pub send_batch_size: u32,
    pub timeout: String,
    pub send_batch_max_size: u32,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct MemoryLimiter {
    pub check_interval: String,
    pub limit_percentage: u32,
    pub spike_limit_percentage: u32,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct K8sAttributesProcessor {
    pub auth_type: String,
    pub passthrough: bool,
    pub extract: ExtractK8sMetadata,
    pub pod_association: Vec<PodAssociations>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ExtractK8sMetadata {
    pub metadata: Vec<String>,
    pub labels: Vec<ExtractLabel>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ExtractLabel {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_regex: Option<String>,
    pub tag_name: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PodAssociations {
    pub sources: Vec<PodAssociation>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PodAssociation {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ResourceProcessor {
    pub attributes: Vec<AttributeAction>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct AttributeAction {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct TransformProcessor {
    pub error_mode: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log_statements: Vec<TransformStatements>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trace_statements: Vec<TransformStatements>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metric_statements: Vec<TransformStatements>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TransformStatements {
    pub statements: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct FilterProcessor {
    pub error_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<FilterLogs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traces: Option<FilterTraces>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<FilterMetrics>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct FilterLogs {
    pub log_record: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct FilterTraces {
    pub span: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct FilterMetrics {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metric: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub datapoint: Vec<String>,
}

// ============================================================================
// Exporters and extensions
// ============================================================================

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OtlpExporter {
    pub endpoint: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub tls: ExporterTls,
    pub sending_queue: SendingQueue,
    pub retry_on_failure: RetryOnFailure,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Authenticator>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ExporterTls {
    pub insecure: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SendingQueue {
    pub enabled: bool,
    pub queue_size: u32,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RetryOnFailure {
    pub enabled: bool,
    pub initial_interval: String,
    pub max_interval: String,
    pub max_elapsed_time: String,
}

impl Default for RetryOnFailure {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: "5s".to_string(),
            max_interval: "30s".to_string(),
            max_elapsed_time: "300s".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Authenticator {
    pub authenticator: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OAuth2Extension {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoint_params: BTreeMap<String, String>,
}

/// Reference to an environment variable, expanded by the collector at start-up
pub fn env_ref(name: &str) -> String {
    format!("${{{name}}}")
}

/// Skeleton shared by gateways and agents: health check, pprof and self-metrics
pub fn base_config() -> CollectorConfig {
    let mut extensions = BTreeMap::new();
    extensions.insert(
        "health_check".to_string(),
        endpoint_value(format!("{}:{HEALTH_CHECK_PORT}", env_ref(ENV_VAR_POD_IP))),
    );
    extensions.insert(
        "pprof".to_string(),
        endpoint_value("127.0.0.1:1777".to_string()),
    );

    CollectorConfig {
        extensions,
        service: Service {
            pipelines: BTreeMap::new(),
            telemetry: ServiceTelemetry {
                metrics: TelemetryMetrics {
                    readers: vec![MetricReader {
                        pull: PullMetricReader {
                            exporter: MetricExporter {
                                prometheus: PrometheusMetricExporter {
                                    host: env_ref(ENV_VAR_POD_IP),
                                    port: METRICS_PORT,
                                },
                            },
                        },
                    }],
                },
                logs: TelemetryLogs {
                    level: "info".to_string(),
                    encoding: "json".to_string(),
                },
            },
            extensions: vec!["health_check".to_string(), "pprof".to_string()],
        },
        ..Default::default()
    }
}

fn endpoint_value(endpoint: String) -> Value {
    let mut map = serde_yaml::Mapping::new();
    map.insert(Value::from("endpoint"), Value::from(endpoint));
    Value::Mapping(map)
}
