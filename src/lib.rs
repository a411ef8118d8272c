//! Telemetry-K8s: Kubernetes operator for telemetry pipelines
//!
//! Tenants declare LogPipelines, TracePipelines and MetricPipelines; the
//! operator merges them into one OpenTelemetry Collector configuration per
//! signal, runs the collectors, and reports pipeline health back onto the
//! resources and the Telemetry resource.

pub mod controller;
pub mod crd;
pub mod error;
pub mod scheduler;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
