//! Collector configuration synthesis
//!
//! All usable pipelines of one signal are merged into a single gateway
//! document and, when at least one pipeline needs node-local collection, an
//! agent document. Each pipeline becomes its own service pipeline in the
//! gateway so data fans out to every backend independently.

mod agent;
mod exporter;
mod gateway;
pub mod ottl;
mod processors;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::controller::pipeline::{PipelineView, SignalType};
use crate::controller::secret_ref::ResolvedOutput;
use crate::controller::selector::LabelAllowList;
use crate::error::{Error, Result};

pub use agent::{LOG_AGENT_STATE_DIR, LOG_ROOT};
pub use exporter::{exporter_id, sanitize_env_var_name};
pub use ottl::OttlError;
pub use types::CollectorConfig;

/// Resource attribute agents use to tag where a record was collected
pub const INPUT_SOURCE_ATTRIBUTE: &str = "kyma.input.name";
/// Prefix of every scratch attribute; stripped before export
pub const SCRATCH_ATTRIBUTE_PATTERN: &str = "kyma.*";

/// Where a record entered the collector
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InputSource {
    Otlp,
    Runtime,
    Prometheus,
    Istio,
}

impl InputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputSource::Otlp => "otlp",
            InputSource::Runtime => "runtime",
            InputSource::Prometheus => "prometheus",
            InputSource::Istio => "istio",
        }
    }

    /// Condition that is true for records from this source
    pub fn condition(&self) -> String {
        match self {
            InputSource::Otlp => ottl::resource_attribute_is_nil(INPUT_SOURCE_ATTRIBUTE),
            other => ottl::resource_attribute_equals(INPUT_SOURCE_ATTRIBUTE, other.as_str()),
        }
    }
}

/// Cluster facts that go into every document of a pass
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Namespace the generated workloads run in
    pub namespace: String,
    pub cluster_name: String,
    pub cluster_uid: String,
    pub pod_labels: LabelAllowList,
}

/// A pipeline that passed validation, with its values resolved
#[derive(Clone, Debug)]
pub struct UsablePipeline {
    pub view: PipelineView,
    pub resolved: ResolvedOutput,
}

/// API access a rendered document needs from the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    /// Pod, namespace, node and owner metadata for enrichment
    K8sMetadata,
    /// Node stats endpoints of the kubelet
    KubeletStats,
    /// Pod and endpoint discovery for scraping
    ServiceDiscovery,
}

/// A rendered collector document plus what it needs to run
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedDocument {
    pub config: CollectorConfig,
    pub yaml: String,
    pub permissions: BTreeSet<Permission>,
}

/// Result of merging all usable pipelines of one signal
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesizedConfig {
    pub signal: SignalType,
    pub gateway: RenderedDocument,
    pub agent: Option<RenderedDocument>,
    /// Exporter credentials, mounted into the workloads as environment variables
    pub env: BTreeMap<String, Vec<u8>>,
    /// Names of the contributing pipelines, sorted
    pub pipelines: Vec<String>,
    pub checksum: String,
}

impl SynthesizedConfig {
    pub fn needs_agent(&self) -> bool {
        self.agent.is_some()
    }
}

/// Signal-specific validation and synthesis
pub trait Synthesizer: Send + Sync {
    fn signal(&self) -> SignalType;

    /// Checks only this synthesizer can make, run as part of validation
    fn validate(&self, view: &PipelineView) -> std::result::Result<(), OttlError> {
        ottl::validate_statements(self.signal(), &view.transforms, &view.filters)
    }

    fn synthesize(&self, usable: &[UsablePipeline], opts: &BuildOptions) -> Result<SynthesizedConfig>;
}

pub struct LogSynthesizer;
pub struct TraceSynthesizer;
pub struct MetricSynthesizer;

impl Synthesizer for LogSynthesizer {
    fn signal(&self) -> SignalType {
        SignalType::Log
    }

    fn synthesize(&self, usable: &[UsablePipeline], opts: &BuildOptions) -> Result<SynthesizedConfig> {
        synthesize(SignalType::Log, usable, opts, agent::build_log_agent)
    }
}

impl Synthesizer for TraceSynthesizer {
    fn signal(&self) -> SignalType {
        SignalType::Trace
    }

    fn synthesize(&self, usable: &[UsablePipeline], opts: &BuildOptions) -> Result<SynthesizedConfig> {
        synthesize(SignalType::Trace, usable, opts, |_, _| Ok(None))
    }
}

impl Synthesizer for MetricSynthesizer {
    fn signal(&self) -> SignalType {
        SignalType::Metric
    }

    fn synthesize(&self, usable: &[UsablePipeline], opts: &BuildOptions) -> Result<SynthesizedConfig> {
        synthesize(SignalType::Metric, usable, opts, agent::build_metric_agent)
    }
}

pub fn synthesizer_for(signal: SignalType) -> Box<dyn Synthesizer> {
    match signal {
        SignalType::Log => Box::new(LogSynthesizer),
        SignalType::Trace => Box::new(TraceSynthesizer),
        SignalType::Metric => Box::new(MetricSynthesizer),
    }
}

type AgentBuilder = fn(&[&UsablePipeline], &BuildOptions) -> Result<Option<RenderedDocument>>;

fn synthesize(
    signal: SignalType,
    usable: &[UsablePipeline],
    opts: &BuildOptions,
    build_agent: AgentBuilder,
) -> Result<SynthesizedConfig> {
    if usable.is_empty() {
        return Err(Error::SynthesisError(format!(
            "no usable {signal} pipelines to synthesize"
        )));
    }
    if let Some(other) = usable.iter().find(|p| p.view.signal() != signal) {
        return Err(Error::SynthesisError(format!(
            "pipeline {} is a {} pipeline, expected {signal}",
            other.view.name,
            other.view.signal()
        )));
    }

    let mut sorted: Vec<&UsablePipeline> = usable.iter().collect();
    sorted.sort_by(|a, b| a.view.name.cmp(&b.view.name));
    if let Some(w) = sorted.windows(2).find(|w| w[0].view.name == w[1].view.name) {
        return Err(Error::SynthesisError(format!(
            "duplicate pipeline name {}",
            w[0].view.name
        )));
    }

    let (gateway, env) = gateway::build_gateway(signal, &sorted, opts)?;
    let agent_pipelines: Vec<&UsablePipeline> =
        sorted.iter().copied().filter(|p| p.view.needs_agent()).collect();
    let agent = if agent_pipelines.is_empty() {
        None
    } else {
        build_agent(&agent_pipelines, opts)?
    };

    let checksum = checksum(&gateway.yaml, agent.as_ref().map(|a| a.yaml.as_str()), &env);
    let pipelines = sorted.iter().map(|p| p.view.name.clone()).collect();

    debug!(
        "Synthesized {} configuration for {} pipelines (checksum {})",
        signal,
        sorted.len(),
        checksum
    );

    Ok(SynthesizedConfig {
        signal,
        gateway,
        agent,
        env,
        pipelines,
        checksum,
    })
}

pub(crate) fn render(config: CollectorConfig, permissions: BTreeSet<Permission>) -> Result<RenderedDocument> {
    let yaml = serde_yaml::to_string(&config)?;
    Ok(RenderedDocument {
        config,
        yaml,
        permissions,
    })
}

/// SHA-256 over everything that ends up in the workloads
fn checksum(gateway: &str, agent: Option<&str>, env: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(gateway.as_bytes());
    hasher.update([0u8]);
    if let Some(agent) = agent {
        hasher.update(agent.as_bytes());
    }
    hasher.update([0u8]);
    for (key, value) in env {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests;
