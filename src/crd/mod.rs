//! Custom Resource Definitions for the telemetry module
//!
//! Pipelines are cluster-scoped and owned by tenants; the Telemetry resource
//! is the namespaced root object that reports the overall module state.

mod log_pipeline;
mod metric_pipeline;
mod telemetry;
mod trace_pipeline;
pub mod types;


pub use log_pipeline::{
    parse_section, section_plugin, FileMount, FluentBitFilter, HttpOutput, HttpOutputTls,
    LogEngine, LogInput, LogNamespaceSelector, LogOutput, LogPipeline, LogPipelineSpec,
    LogPipelineStatus, LogRuntimeInput, SectionEntry, VariableReference, DENIED_FILTER_PLUGINS,
};
pub use metric_pipeline::{
    DiagnosticMetrics, EnvoyMetrics, MetricInput, MetricIstioInput, MetricOutput,
    MetricPipeline, MetricPipelineSpec, MetricPrometheusInput, MetricRuntimeInput,
    ResourceToggle, RuntimeResources,
};
pub use telemetry::{
    ClusterInfo, EnrichmentSpec, GatewayEndpoints, GatewaySpec, OtlpEndpoints, PodLabel, Scaling,
    SignalSpec, State, StaticScaling, Telemetry, TelemetrySpec, TelemetryStatus,
};
pub use trace_pipeline::{TraceInput, TraceOutput, TracePipeline, TracePipelineSpec};
pub use types::*;
