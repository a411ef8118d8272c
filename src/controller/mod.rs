//! Controller module for telemetry pipeline reconciliation
//!
//! Pipelines are validated and merged into one collector configuration per
//! signal; the generated gateway and agent objects are applied and their
//! health is reported back onto the pipelines and the Telemetry resource.

pub mod components;
pub mod conditions;
pub mod config;
pub mod endpoint;
mod finalizers;
pub mod fluentbit;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod overrides;
pub mod pipeline;
pub mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod resources;
#[cfg(test)]
mod resources_test;
pub mod secret_ref;
pub mod selector;
pub mod self_monitor;
mod status;
pub mod tls_cert;
pub mod validator;

pub use config::{synthesizer_for, BuildOptions, SynthesizedConfig, Synthesizer, UsablePipeline};
pub use finalizers::TELEMETRY_FINALIZER;
pub use pipeline::{PipelineView, SignalType, TelemetryPipeline};
pub use reconciler::{reconcile, ControllerState, OperatorSettings, PassOutcome, SignalSnapshot};
pub use self_monitor::SelfMonitor;
pub use validator::{Classification, PipelineValidator, Verdict};
