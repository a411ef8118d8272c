//! TracePipeline Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    validate_transforms, FilterSpec, OtlpInput, OtlpOutput, PipelineStatus, SpecValidationError,
    TransformSpec,
};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.kyma-project.io",
    version = "v1alpha1",
    kind = "TracePipeline",
    status = "PipelineStatus",
    shortname = "tp",
    printcolumn = r#"{"name":"Configuration Generated","type":"string","jsonPath":".status.conditions[?(@.type=='ConfigurationGenerated')].status"}"#,
    printcolumn = r#"{"name":"Gateway Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='GatewayHealthy')].status"}"#,
    printcolumn = r#"{"name":"Flow Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='FlowHealthy')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TracePipelineSpec {
    #[serde(default)]
    pub input: TraceInput,

    pub output: TraceOutput,

    #[serde(default, rename = "transform", skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformSpec>,

    #[serde(default, rename = "filter", skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpInput>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceOutput {
    pub otlp: OtlpOutput,
}

impl TracePipelineSpec {
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = self.output.otlp.validate("spec.output.otlp");
        if let Some(ns) = self.input.otlp.as_ref().and_then(|o| o.namespaces.as_ref()) {
            errors.extend(ns.validate("spec.input.otlp.namespaces"));
        }
        errors.extend(validate_transforms(&self.transforms, &self.filters));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
