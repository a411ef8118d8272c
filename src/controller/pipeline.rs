//! Signal-agnostic view over the three pipeline kinds
//!
//! Log, Trace and Metric pipelines share their output and transform shape
//! but differ in the inputs they offer. `PipelineView` flattens the common
//! part and keeps the input as a tagged variant so the rest of the
//! controller can work on one type.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};

use super::fluentbit;
use super::secret_ref::secret_refs;
use crate::crd::{
    Condition, FilterSpec, LogEngine, LogInput, LogPipeline, MetricInput, MetricPipeline, OtlpOutput,
    SpecValidationError, TraceInput, TracePipeline, TransformSpec,
};

/// Signal type handled by one reconciliation worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalType {
    Log,
    Trace,
    Metric,
}

impl SignalType {
    pub const ALL: [SignalType; 3] = [SignalType::Log, SignalType::Trace, SignalType::Metric];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Log => "log",
            SignalType::Trace => "trace",
            SignalType::Metric => "metric",
        }
    }

    /// Plural form used by the collector for service pipeline ids
    pub fn otel_signal(&self) -> &'static str {
        match self {
            SignalType::Log => "logs",
            SignalType::Trace => "traces",
            SignalType::Metric => "metrics",
        }
    }

    pub fn pipeline_kind(&self) -> &'static str {
        match self {
            SignalType::Log => "LogPipeline",
            SignalType::Trace => "TracePipeline",
            SignalType::Metric => "MetricPipeline",
        }
    }

    pub fn api_version(&self) -> String {
        match self {
            SignalType::Log => LogPipeline::api_version(&()).to_string(),
            SignalType::Trace => TracePipeline::api_version(&()).to_string(),
            SignalType::Metric => MetricPipeline::api_version(&()).to_string(),
        }
    }

    pub fn gateway_name(&self) -> String {
        format!("telemetry-{}-gateway", self.as_str())
    }

    /// Node-local agent name; traces have no agent
    pub fn agent_name(&self) -> Option<String> {
        match self {
            SignalType::Log | SignalType::Metric => Some(format!("telemetry-{}-agent", self.as_str())),
            SignalType::Trace => None,
        }
    }

    /// Condition type on the Telemetry resource that rolls up this signal
    pub fn components_condition_type(&self) -> &'static str {
        match self {
            SignalType::Log => "LogComponentsHealthy",
            SignalType::Trace => "TraceComponentsHealthy",
            SignalType::Metric => "MetricComponentsHealthy",
        }
    }

    /// Name of the override section that pauses this signal
    pub fn override_section(&self) -> &'static str {
        match self {
            SignalType::Log => "logging",
            SignalType::Trace => "tracing",
            SignalType::Metric => "metrics",
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input capability set of a pipeline, tagged by signal kind
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineInput {
    Log(LogInput),
    Trace(TraceInput),
    Metric(MetricInput),
}

impl PipelineInput {
    pub fn signal(&self) -> SignalType {
        match self {
            PipelineInput::Log(_) => SignalType::Log,
            PipelineInput::Trace(_) => SignalType::Trace,
            PipelineInput::Metric(_) => SignalType::Metric,
        }
    }

    /// Whether the pipeline needs node-local collection
    pub fn needs_agent(&self) -> bool {
        match self {
            PipelineInput::Log(input) => match &input.runtime {
                Some(runtime) => runtime.enabled.unwrap_or(true),
                None => true,
            },
            PipelineInput::Trace(_) => false,
            PipelineInput::Metric(input) => {
                input.runtime.as_ref().is_some_and(|i| i.enabled)
                    || input.prometheus.as_ref().is_some_and(|i| i.enabled)
                    || input.istio.as_ref().is_some_and(|i| i.enabled)
            }
        }
    }

    pub fn otlp_enabled(&self) -> bool {
        let otlp = match self {
            PipelineInput::Log(input) => &input.otlp,
            PipelineInput::Trace(input) => &input.otlp,
            PipelineInput::Metric(input) => &input.otlp,
        };
        !otlp.as_ref().is_some_and(|o| o.disabled)
    }
}

/// Owned, signal-agnostic snapshot of one pipeline resource
#[derive(Clone, Debug)]
pub struct PipelineView {
    pub name: String,
    pub uid: String,
    pub generation: Option<i64>,
    pub created: Option<DateTime<Utc>>,
    pub deleting: bool,
    pub input: PipelineInput,
    pub output: OtlpOutput,
    pub transforms: Vec<TransformSpec>,
    pub filters: Vec<FilterSpec>,
    pub conditions: Vec<Condition>,
    admission: Result<(), Vec<SpecValidationError>>,
}

impl PipelineView {
    pub fn signal(&self) -> SignalType {
        self.input.signal()
    }

    /// Errors the admission webhook would have rejected the resource with
    pub fn admission_errors(&self) -> &[SpecValidationError] {
        match &self.admission {
            Ok(()) => &[],
            Err(errors) => errors,
        }
    }

    pub fn needs_agent(&self) -> bool {
        self.input.needs_agent()
    }
}

/// Conversion from a concrete pipeline resource into its view
pub trait TelemetryPipeline:
    Resource<DynamicType = ()>
    + ResourceExt
    + Clone
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const SIGNAL: SignalType;

    fn view(&self) -> PipelineView;

    /// False for pipelines served by Fluent Bit instead of the collectors
    fn uses_collector(&self) -> bool {
        true
    }

    /// Every Secret the pipeline points to, as (namespace, name)
    fn referenced_secrets(&self) -> BTreeSet<(String, String)> {
        secret_refs(&self.view().output)
    }

    /// Conditions of the status subresource, created if absent
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

fn base_view<K: ResourceExt>(
    obj: &K,
    input: PipelineInput,
    output: OtlpOutput,
    transforms: Vec<TransformSpec>,
    filters: Vec<FilterSpec>,
    conditions: Vec<Condition>,
    admission: Result<(), Vec<SpecValidationError>>,
) -> PipelineView {
    let meta = obj.meta();
    PipelineView {
        name: obj.name_any(),
        uid: meta.uid.clone().unwrap_or_default(),
        generation: meta.generation,
        created: meta.creation_timestamp.as_ref().map(|t| t.0),
        deleting: meta.deletion_timestamp.is_some(),
        input,
        output,
        transforms,
        filters,
        conditions,
        admission,
    }
}

impl TelemetryPipeline for LogPipeline {
    const SIGNAL: SignalType = SignalType::Log;

    fn view(&self) -> PipelineView {
        base_view(
            self,
            PipelineInput::Log(self.spec.input.clone()),
            self.spec.output.otlp.clone().unwrap_or_default(),
            self.spec.transforms.clone(),
            self.spec.filters.clone(),
            self.status.clone().unwrap_or_default().conditions,
            self.spec.validate(),
        )
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    fn uses_collector(&self) -> bool {
        self.spec.engine() == LogEngine::OpenTelemetry
    }

    fn referenced_secrets(&self) -> BTreeSet<(String, String)> {
        match &self.spec.output.otlp {
            Some(otlp) => secret_refs(otlp),
            None => fluentbit::secret_refs(&self.spec),
        }
    }
}

impl TelemetryPipeline for TracePipeline {
    const SIGNAL: SignalType = SignalType::Trace;

    fn view(&self) -> PipelineView {
        base_view(
            self,
            PipelineInput::Trace(self.spec.input.clone()),
            self.spec.output.otlp.clone(),
            self.spec.transforms.clone(),
            self.spec.filters.clone(),
            self.status.clone().unwrap_or_default().conditions,
            self.spec.validate(),
        )
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl TelemetryPipeline for MetricPipeline {
    const SIGNAL: SignalType = SignalType::Metric;

    fn view(&self) -> PipelineView {
        base_view(
            self,
            PipelineInput::Metric(self.spec.input.clone()),
            self.spec.output.otlp.clone(),
            self.spec.transforms.clone(),
            self.spec.filters.clone(),
            self.status.clone().unwrap_or_default().conditions,
            self.spec.validate(),
        )
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders shared by the controller tests

    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::crd::{
        HttpOutput, LogOutput, LogPipelineSpec, MetricOutput, MetricPipelineSpec, TraceOutput,
        TracePipelineSpec, ValueType,
    };

    pub fn meta(name: &str, created_secs: i64) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            generation: Some(1),
            creation_timestamp: Some(Time(
                Utc.timestamp_opt(1_700_000_000 + created_secs, 0).unwrap(),
            )),
            ..Default::default()
        }
    }

    pub fn otlp(endpoint: &str) -> OtlpOutput {
        OtlpOutput {
            endpoint: ValueType::literal(endpoint),
            ..Default::default()
        }
    }

    pub fn trace_pipeline(name: &str, created_secs: i64, endpoint: &str) -> TracePipeline {
        TracePipeline {
            metadata: meta(name, created_secs),
            spec: TracePipelineSpec {
                output: TraceOutput { otlp: otlp(endpoint) },
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn log_pipeline(name: &str, created_secs: i64, endpoint: &str) -> LogPipeline {
        LogPipeline {
            metadata: meta(name, created_secs),
            spec: LogPipelineSpec {
                output: LogOutput {
                    otlp: Some(otlp(endpoint)),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    /// Log pipeline with an HTTP output, served by Fluent Bit
    pub fn http_log_pipeline(name: &str, created_secs: i64, host: &str) -> LogPipeline {
        LogPipeline {
            metadata: meta(name, created_secs),
            spec: LogPipelineSpec {
                output: LogOutput {
                    http: Some(HttpOutput {
                        host: ValueType::literal(host),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn metric_pipeline(name: &str, created_secs: i64, endpoint: &str) -> MetricPipeline {
        MetricPipeline {
            metadata: meta(name, created_secs),
            spec: MetricPipelineSpec {
                output: MetricOutput { otlp: otlp(endpoint) },
                ..Default::default()
            },
            status: None,
        }
    }
}
