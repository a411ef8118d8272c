//! Node-local agents: collect what cannot be pushed and forward it, tagged
//! with its input source, to the signal's gateway

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::json;

use super::gateway::ComponentBuilder;
use super::processors;
use super::types::{
    env_ref, ExporterTls, OtlpExporter, RetryOnFailure, SendingQueue, ServicePipeline,
    ENV_VAR_NODE_NAME, OTLP_GRPC_PORT,
};
use super::{BuildOptions, InputSource, Permission, RenderedDocument, UsablePipeline};
use crate::controller::pipeline::{PipelineInput, SignalType};
use crate::controller::selector::namespace_matcher;
use crate::crd::{LogRuntimeInput, MetricInput};
use crate::error::Result;

const GATEWAY_EXPORTER: &str = "otlp/gateway";
const MEMORY_LIMITER: &str = "memory_limiter";
const BATCH: &str = "batch";

const FILE_STORAGE: &str = "file_storage";
/// Host directory the log agent keeps its read offsets in
pub const LOG_AGENT_STATE_DIR: &str = "/var/lib/telemetry-log-agent";
const FILE_STORAGE_DIRECTORY: &str = "/var/lib/telemetry-log-agent/file-log-receiver";
/// Host directory holding the container logs of every pod
pub const LOG_ROOT: &str = "/var/log/pods";
const ORIGINAL_BODY_ATTRIBUTE: &str = "log.original";

const KUBELET_PORT: u16 = 10250;
const ISTIO_METRICS_PORT: u16 = 15090;
const SCRAPE_INTERVAL: &str = "30s";

fn gateway_exporter(signal: SignalType, namespace: &str) -> OtlpExporter {
    OtlpExporter {
        endpoint: format!(
            "{}.{namespace}.svc.cluster.local:{OTLP_GRPC_PORT}",
            signal.gateway_name()
        ),
        headers: BTreeMap::new(),
        tls: ExporterTls {
            insecure: true,
            ..Default::default()
        },
        sending_queue: SendingQueue {
            enabled: true,
            queue_size: 512,
        },
        retry_on_failure: RetryOnFailure::default(),
        auth: None,
    }
}

fn input_source_processor_id(source: InputSource) -> String {
    format!("resource/insert-input-source-{}", source.as_str())
}

// ============================================================================
// Log agent
// ============================================================================

#[derive(Clone, Debug, Serialize, PartialEq)]
struct FileLogReceiver {
    include: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    exclude: Vec<String>,
    include_file_path: bool,
    include_file_name: bool,
    start_at: String,
    storage: String,
    retry_on_failure: RetryOnFailure,
    operators: Vec<serde_json::Value>,
}

/// Collection scope shared by every pipeline that reads container logs
#[derive(Debug, Default, PartialEq)]
struct LogCollectionScope {
    /// None collects every namespace not excluded
    include: Option<BTreeSet<String>>,
    exclude: BTreeSet<String>,
    keep_original_body: bool,
}

impl LogCollectionScope {
    /// Union of the runtime inputs: a namespace is collected when at least
    /// one pipeline wants it
    fn union(inputs: &[LogRuntimeInput]) -> Self {
        let matchers: Vec<_> = inputs
            .iter()
            .map(|i| namespace_matcher(Some(&i.namespaces.selector), i.namespaces.system))
            .collect();

        let include = if matchers.iter().all(|m| !m.include().is_empty()) {
            Some(
                matchers
                    .iter()
                    .flat_map(|m| m.include().iter().cloned())
                    .collect(),
            )
        } else {
            None
        };

        let exclude = if include.is_some() {
            BTreeSet::new()
        } else {
            let mut open = matchers.iter().filter(|m| m.include().is_empty());
            let first: BTreeSet<String> = open
                .next()
                .map(|m| m.exclude().iter().cloned().collect())
                .unwrap_or_default();
            let mut exclude = open.fold(first, |acc, m| {
                acc.intersection(&m.exclude().iter().cloned().collect())
                    .cloned()
                    .collect()
            });
            for m in &matchers {
                for ns in m.include() {
                    exclude.remove(ns);
                }
            }
            exclude
        };

        Self {
            include,
            exclude,
            keep_original_body: inputs.iter().any(|i| i.keep_original_body.unwrap_or(true)),
        }
    }

    fn include_globs(&self) -> Vec<String> {
        match &self.include {
            Some(namespaces) => namespaces
                .iter()
                .map(|ns| format!("{LOG_ROOT}/{ns}_*/*/*.log"))
                .collect(),
            None => vec![format!("{LOG_ROOT}/*/*/*.log")],
        }
    }

    fn exclude_globs(&self, own_namespace: &str, agent_name: &str) -> Vec<String> {
        let mut globs: Vec<String> = self
            .exclude
            .iter()
            .map(|ns| format!("{LOG_ROOT}/{ns}_*/*/*.log"))
            .collect();
        globs.push(format!("{LOG_ROOT}/{own_namespace}_{agent_name}-*/*/*.log"));
        globs
    }
}

fn log_operators(keep_original_body: bool) -> Vec<serde_json::Value> {
    let mut operators = vec![
        json!({
            "id": "containerd-parser",
            "type": "container",
            "add_metadata_from_filepath": true,
            "format": "containerd",
        }),
        json!({
            "id": "move-to-log-stream",
            "type": "move",
            "from": "attributes.stream",
            "to": "attributes[\"log.iostream\"]",
            "if": "attributes.stream != nil",
        }),
        json!({
            "id": "json-parser-router",
            "type": "router",
            "routes": [{"expr": "body matches '^{.*}$'", "output": "json-parser"}],
            "default": "noop",
        }),
        json!({
            "id": "json-parser",
            "type": "json_parser",
            "parse_from": "body",
            "parse_to": "attributes",
        }),
        json!({"id": "noop", "type": "noop"}),
    ];
    if keep_original_body {
        operators.push(json!({
            "id": "copy-body-to-attributes-original",
            "type": "copy",
            "from": "body",
            "to": format!("attributes[\"{ORIGINAL_BODY_ATTRIBUTE}\"]"),
            "if": "body matches '^{.*}$'",
        }));
    }
    operators.extend([
        json!({
            "id": "move-message-to-body",
            "type": "move",
            "from": "attributes.message",
            "to": "body",
            "if": "attributes.message != nil",
        }),
        json!({
            "id": "move-msg-to-body",
            "type": "move",
            "from": "attributes.msg",
            "to": "body",
            "if": "attributes.msg != nil",
        }),
        json!({
            "id": "severity-parser",
            "type": "severity_parser",
            "parse_from": "attributes.level",
            "if": "attributes.level != nil",
        }),
        json!({
            "id": "trace-parser",
            "type": "trace_parser",
            "trace_id": {"parse_from": "attributes.trace_id"},
            "span_id": {"parse_from": "attributes.span_id"},
            "trace_flags": {"parse_from": "attributes.trace_flags"},
            "if": "attributes.trace_id != nil",
        }),
    ]);
    operators
}

pub(super) fn build_log_agent(
    pipelines: &[&UsablePipeline],
    opts: &BuildOptions,
) -> Result<Option<RenderedDocument>> {
    let inputs: Vec<LogRuntimeInput> = pipelines
        .iter()
        .filter_map(|p| match &p.view.input {
            PipelineInput::Log(input) => match &input.runtime {
                Some(r) if !r.enabled.unwrap_or(true) => None,
                Some(r) => Some(r.clone()),
                None => Some(LogRuntimeInput::default()),
            },
            _ => None,
        })
        .collect();
    if inputs.is_empty() {
        return Ok(None);
    }

    let scope = LogCollectionScope::union(&inputs);
    let agent_name = SignalType::Log
        .agent_name()
        .unwrap_or_else(|| "telemetry-log-agent".to_string());

    let mut builder = ComponentBuilder::new();
    builder.add_extension(FILE_STORAGE, &json!({ "directory": FILE_STORAGE_DIRECTORY }))?;

    let receiver = builder.add_receiver(
        "filelog",
        &FileLogReceiver {
            include: scope.include_globs(),
            exclude: scope.exclude_globs(&opts.namespace, &agent_name),
            include_file_path: true,
            include_file_name: false,
            start_at: "beginning".to_string(),
            storage: FILE_STORAGE.to_string(),
            retry_on_failure: RetryOnFailure::default(),
            operators: log_operators(scope.keep_original_body),
        },
    )?;

    let processors = vec![
        builder.add_processor(MEMORY_LIMITER, &processors::memory_limiter())?,
        builder.add_processor(
            &input_source_processor_id(InputSource::Runtime),
            &processors::insert_input_source(InputSource::Runtime),
        )?,
        builder.add_processor(BATCH, &processors::batch(SignalType::Log))?,
    ];
    let exporter = builder.add_exporter(
        GATEWAY_EXPORTER,
        &gateway_exporter(SignalType::Log, &opts.namespace),
    )?;

    builder.add_pipeline(
        "logs/runtime".to_string(),
        ServicePipeline {
            receivers: vec![receiver],
            processors,
            exporters: vec![exporter],
        },
    );

    builder.finish(BTreeSet::new()).map(Some)
}

// ============================================================================
// Metric agent
// ============================================================================

#[derive(Clone, Debug, Serialize, PartialEq)]
struct KubeletStatsReceiver {
    collection_interval: String,
    auth_type: String,
    endpoint: String,
    insecure_skip_verify: bool,
    metric_groups: Vec<String>,
}

/// Which pull inputs at least one pipeline enables
#[derive(Debug, Default, PartialEq)]
struct MetricCollectionScope {
    runtime_groups: BTreeSet<&'static str>,
    prometheus: bool,
    istio: bool,
}

impl MetricCollectionScope {
    fn union<'a>(inputs: impl IntoIterator<Item = &'a MetricInput>) -> Self {
        let mut scope = Self::default();
        for input in inputs {
            if let Some(runtime) = input.runtime.as_ref().filter(|r| r.enabled) {
                let resources = runtime.resources.clone().unwrap_or_default();
                if resources.pod_enabled() {
                    scope.runtime_groups.insert("pod");
                }
                if resources.container_enabled() {
                    scope.runtime_groups.insert("container");
                }
                if resources.node_enabled() {
                    scope.runtime_groups.insert("node");
                }
                if resources.volume_enabled() {
                    scope.runtime_groups.insert("volume");
                }
            }
            scope.prometheus |= input.prometheus.as_ref().is_some_and(|p| p.enabled);
            scope.istio |= input.istio.as_ref().is_some_and(|i| i.enabled);
        }
        scope
    }
}

/// Scrape pods on this node that opt in through the prometheus.io annotations
fn app_pods_scrape_config() -> serde_json::Value {
    json!({
        "config": {
            "scrape_configs": [{
                "job_name": "app-pods",
                "scrape_interval": SCRAPE_INTERVAL,
                "kubernetes_sd_configs": [{
                    "role": "pod",
                    "selectors": [{
                        "role": "pod",
                        "field": format!("spec.nodeName={}", env_ref(ENV_VAR_NODE_NAME)),
                    }],
                }],
                "relabel_configs": [
                    {
                        "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_scrape"],
                        "regex": "true",
                        "action": "keep",
                    },
                    {
                        "source_labels": ["__meta_kubernetes_pod_phase"],
                        "regex": "Pending|Succeeded|Failed",
                        "action": "drop",
                    },
                    {
                        "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_path"],
                        "regex": "(.+)",
                        "target_label": "__metrics_path__",
                        "action": "replace",
                    },
                    {
                        "source_labels": [
                            "__address__",
                            "__meta_kubernetes_pod_annotation_prometheus_io_port",
                        ],
                        "regex": "([^:]+)(?::\\d+)?;(\\d+)",
                        "replacement": "$$1:$$2",
                        "target_label": "__address__",
                        "action": "replace",
                    },
                ],
            }],
        },
    })
}

/// Scrape the merged metrics endpoint of istio sidecars on this node
fn istio_scrape_config() -> serde_json::Value {
    json!({
        "config": {
            "scrape_configs": [{
                "job_name": "istio-proxy",
                "scrape_interval": SCRAPE_INTERVAL,
                "metrics_path": "/stats/prometheus",
                "kubernetes_sd_configs": [{
                    "role": "pod",
                    "selectors": [{
                        "role": "pod",
                        "field": format!("spec.nodeName={}", env_ref(ENV_VAR_NODE_NAME)),
                    }],
                }],
                "relabel_configs": [
                    {
                        "source_labels": ["__meta_kubernetes_pod_container_name"],
                        "regex": "istio-proxy",
                        "action": "keep",
                    },
                    {
                        "source_labels": ["__meta_kubernetes_pod_container_port_name"],
                        "regex": "http-envoy-prom",
                        "action": "keep",
                    },
                    {
                        "source_labels": ["__address__"],
                        "regex": "([^:]+)(?::\\d+)?",
                        "replacement": format!("$$1:{ISTIO_METRICS_PORT}"),
                        "target_label": "__address__",
                        "action": "replace",
                    },
                ],
            }],
        },
    })
}

pub(super) fn build_metric_agent(
    pipelines: &[&UsablePipeline],
    opts: &BuildOptions,
) -> Result<Option<RenderedDocument>> {
    let scope = MetricCollectionScope::union(pipelines.iter().filter_map(|p| match &p.view.input {
        PipelineInput::Metric(input) => Some(input),
        _ => None,
    }));
    if scope.runtime_groups.is_empty() && !scope.prometheus && !scope.istio {
        return Ok(None);
    }

    let mut builder = ComponentBuilder::new();
    let mut permissions = BTreeSet::new();

    let memory_limiter = builder.add_processor(MEMORY_LIMITER, &processors::memory_limiter())?;
    let batch = builder.add_processor(BATCH, &processors::batch(SignalType::Metric))?;
    let exporter = builder.add_exporter(
        GATEWAY_EXPORTER,
        &gateway_exporter(SignalType::Metric, &opts.namespace),
    )?;

    let mut inputs: Vec<(InputSource, String)> = Vec::new();
    if !scope.runtime_groups.is_empty() {
        let receiver = builder.add_receiver(
            "kubeletstats",
            &KubeletStatsReceiver {
                collection_interval: SCRAPE_INTERVAL.to_string(),
                auth_type: "serviceAccount".to_string(),
                endpoint: format!("https://{}:{KUBELET_PORT}", env_ref(ENV_VAR_NODE_NAME)),
                insecure_skip_verify: true,
                metric_groups: scope.runtime_groups.iter().map(|g| g.to_string()).collect(),
            },
        )?;
        permissions.insert(Permission::KubeletStats);
        inputs.push((InputSource::Runtime, receiver));
    }
    if scope.prometheus {
        let receiver = builder.add_receiver("prometheus/app-pods", &app_pods_scrape_config())?;
        permissions.insert(Permission::ServiceDiscovery);
        inputs.push((InputSource::Prometheus, receiver));
    }
    if scope.istio {
        let receiver = builder.add_receiver("prometheus/istio", &istio_scrape_config())?;
        permissions.insert(Permission::ServiceDiscovery);
        inputs.push((InputSource::Istio, receiver));
    }

    for (source, receiver) in inputs {
        let tag = builder.add_processor(
            &input_source_processor_id(source),
            &processors::insert_input_source(source),
        )?;
        builder.add_pipeline(
            format!("metrics/{}", source.as_str()),
            ServicePipeline {
                receivers: vec![receiver],
                processors: vec![memory_limiter.clone(), tag, batch.clone()],
                exporters: vec![exporter.clone()],
            },
        );
    }

    builder.finish(permissions).map(Some)
}
