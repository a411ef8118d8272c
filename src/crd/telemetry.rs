//! Telemetry Custom Resource Definition
//!
//! The Telemetry resource is the single root object of the module. It carries
//! cluster-wide enrichment settings and reports the aggregated state of all
//! pipelines.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SpecValidationError};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1alpha1",
    kind = "Telemetry",
    namespaced,
    status = "TelemetryStatus",
    shortname = "tel",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichments: Option<EnrichmentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<SignalSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<SignalSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<SignalSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentSpec {
    /// Pod labels copied onto every signal as `k8s.pod.label.<key>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract_pod_labels: Vec<PodLabel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,
}

/// Label allow-list entry: exactly one of `key` or `keyPrefix`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodLabel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewaySpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_: Option<StaticScaling>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticScaling {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

fn default_replicas() -> i32 {
    2
}

/// Overall module state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum State {
    #[default]
    Ready,
    Warning,
    Deleting,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Ready => write!(f, "Ready"),
            State::Warning => write!(f, "Warning"),
            State::Deleting => write!(f, "Deleting"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStatus {
    #[serde(default)]
    pub state: State,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<GatewayEndpoints>,
}

/// OTLP push endpoints of the gateways that currently exist
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<OtlpEndpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces: Option<OtlpEndpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<OtlpEndpoints>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtlpEndpoints {
    pub http: String,
    pub grpc: String,
}

impl TelemetrySpec {
    /// Replicas requested for a gateway, if any
    pub fn gateway_replicas(signal: &Option<SignalSpec>) -> Option<i32> {
        signal
            .as_ref()
            .and_then(|s| s.gateway.as_ref())
            .and_then(|g| g.scaling.as_ref())
            .and_then(|s| s.static_.as_ref())
            .map(|s| s.replicas)
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if let Some(enrichments) = &self.enrichments {
            for (i, label) in enrichments.extract_pod_labels.iter().enumerate() {
                let field = format!("spec.enrichments.extractPodLabels[{i}]");
                let key = label.key.as_deref().filter(|k| !k.is_empty());
                let prefix = label.key_prefix.as_deref().filter(|k| !k.is_empty());
                match (key, prefix) {
                    (Some(_), Some(_)) => errors.push(SpecValidationError::new(
                        field,
                        "key and keyPrefix are mutually exclusive",
                        "Set either key or keyPrefix.",
                    )),
                    (None, None) => errors.push(SpecValidationError::new(
                        field,
                        "either key or keyPrefix is required",
                        "Set the exact label key or a key prefix.",
                    )),
                    _ => {}
                }
            }
        }

        for (name, signal) in [("log", &self.log), ("trace", &self.trace), ("metric", &self.metric)] {
            if let Some(replicas) = Self::gateway_replicas(signal) {
                if !(1..=10).contains(&replicas) {
                    errors.push(SpecValidationError::new(
                        format!("spec.{name}.gateway.scaling.static.replicas"),
                        "replicas must be between 1 and 10",
                        "Choose a replica count between 1 and 10.",
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
