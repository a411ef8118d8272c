//! MetricPipeline Custom Resource Definition
//!
//! Metrics are pushed over OTLP or collected by the metric agent from the
//! kubelet (runtime), from annotated workloads (prometheus) and from the
//! Istio sidecars (istio).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    validate_transforms, FilterSpec, NamespaceSelector, OtlpInput, OtlpOutput, PipelineStatus,
    SpecValidationError, TransformSpec,
};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.kyma-project.io",
    version = "v1alpha1",
    kind = "MetricPipeline",
    status = "PipelineStatus",
    shortname = "mp",
    printcolumn = r#"{"name":"Configuration Generated","type":"string","jsonPath":".status.conditions[?(@.type=='ConfigurationGenerated')].status"}"#,
    printcolumn = r#"{"name":"Gateway Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='GatewayHealthy')].status"}"#,
    printcolumn = r#"{"name":"Agent Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='AgentHealthy')].status"}"#,
    printcolumn = r#"{"name":"Flow Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='FlowHealthy')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetricPipelineSpec {
    #[serde(default)]
    pub input: MetricInput,

    pub output: MetricOutput,

    #[serde(default, rename = "transform", skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformSpec>,

    #[serde(default, rename = "filter", skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<MetricPrometheusInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<MetricRuntimeInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub istio: Option<MetricIstioInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpInput>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricPrometheusInput {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_metrics: Option<DiagnosticMetrics>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricRuntimeInput {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<RuntimeResources>,
}

/// Per-resource toggles for kubelet metrics; each defaults to enabled
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<ResourceToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ResourceToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<ResourceToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<ResourceToggle>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceToggle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricIstioInput {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_metrics: Option<DiagnosticMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy_metrics: Option<EnvoyMetrics>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticMetrics {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyMetrics {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricOutput {
    pub otlp: OtlpOutput,
}

impl RuntimeResources {
    pub fn pod_enabled(&self) -> bool {
        toggle(&self.pod)
    }
    pub fn container_enabled(&self) -> bool {
        toggle(&self.container)
    }
    pub fn node_enabled(&self) -> bool {
        toggle(&self.node)
    }
    pub fn volume_enabled(&self) -> bool {
        toggle(&self.volume)
    }
}

fn toggle(t: &Option<ResourceToggle>) -> bool {
    t.as_ref().and_then(|t| t.enabled).unwrap_or(true)
}

impl MetricPipelineSpec {
    pub fn runtime_enabled(&self) -> bool {
        self.input.runtime.as_ref().is_some_and(|i| i.enabled)
    }

    pub fn prometheus_enabled(&self) -> bool {
        self.input.prometheus.as_ref().is_some_and(|i| i.enabled)
    }

    pub fn istio_enabled(&self) -> bool {
        self.input.istio.as_ref().is_some_and(|i| i.enabled)
    }

    pub fn otlp_enabled(&self) -> bool {
        !self.input.otlp.as_ref().is_some_and(|o| o.disabled)
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = self.output.otlp.validate("spec.output.otlp");

        let selectors = [
            (
                "spec.input.prometheus.namespaces",
                self.input.prometheus.as_ref().and_then(|i| i.namespaces.as_ref()),
            ),
            (
                "spec.input.runtime.namespaces",
                self.input.runtime.as_ref().and_then(|i| i.namespaces.as_ref()),
            ),
            (
                "spec.input.istio.namespaces",
                self.input.istio.as_ref().and_then(|i| i.namespaces.as_ref()),
            ),
            (
                "spec.input.otlp.namespaces",
                self.input.otlp.as_ref().and_then(|i| i.namespaces.as_ref()),
            ),
        ];
        for (field, selector) in selectors {
            if let Some(selector) = selector {
                errors.extend(selector.validate(field));
            }
        }
        errors.extend(validate_transforms(&self.transforms, &self.filters));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
