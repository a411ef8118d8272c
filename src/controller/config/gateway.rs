//! Gateway document: one OTLP receiver fanned out to a service pipeline per
//! pipeline resource

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_yaml::Value;

use super::exporter::build_exporter;
use super::processors::{self, K8S_CONTAINER_NAME, K8S_NAMESPACE_NAME};
use super::types::{base_config, CollectorConfig, FilterProcessor, ServicePipeline};
use super::{render, BuildOptions, InputSource, Permission, RenderedDocument, UsablePipeline};
use crate::controller::pipeline::{PipelineInput, SignalType};
use crate::controller::selector::{namespace_matcher, NameMatcher};
use crate::crd::{LogInput, MetricInput, OtlpInput, TraceInput};
use crate::error::Result;

/// Total exporter queue capacity of a gateway, split between its pipelines
const MAX_QUEUE_SIZE: u32 = 256;

const OTLP_RECEIVER: &str = "otlp";
const MEMORY_LIMITER: &str = "memory_limiter";
const K8S_ATTRIBUTES: &str = "k8sattributes";
const DROP_INTERNAL_TRAFFIC: &str = "filter/drop-internal-traffic";
const INSERT_CLUSTER_ATTRIBUTES: &str = "resource/insert-cluster-attributes";
const RESOLVE_SERVICE_NAME: &str = "transform/resolve-service-name";
const DROP_SCRATCH_ATTRIBUTES: &str = "resource/drop-kyma-attributes";
const BATCH: &str = "batch";

/// Accumulates components of one collector document
pub(super) struct ComponentBuilder {
    config: CollectorConfig,
}

impl ComponentBuilder {
    pub fn new() -> Self {
        Self {
            config: base_config(),
        }
    }

    pub fn add_receiver<T: Serialize>(&mut self, id: &str, component: &T) -> Result<String> {
        self.config
            .receivers
            .insert(id.to_string(), serde_yaml::to_value(component)?);
        Ok(id.to_string())
    }

    pub fn add_processor<T: Serialize>(&mut self, id: &str, component: &T) -> Result<String> {
        self.config
            .processors
            .insert(id.to_string(), serde_yaml::to_value(component)?);
        Ok(id.to_string())
    }

    pub fn add_exporter<T: Serialize>(&mut self, id: &str, component: &T) -> Result<String> {
        self.config
            .exporters
            .insert(id.to_string(), serde_yaml::to_value(component)?);
        Ok(id.to_string())
    }

    pub fn add_extension<T: Serialize>(&mut self, id: &str, component: &T) -> Result<()> {
        self.config
            .extensions
            .insert(id.to_string(), serde_yaml::to_value(component)?);
        if !self.config.service.extensions.iter().any(|e| e == id) {
            self.config.service.extensions.push(id.to_string());
        }
        Ok(())
    }

    pub fn add_pipeline(&mut self, id: String, pipeline: ServicePipeline) {
        self.config.service.pipelines.insert(id, pipeline);
    }

    pub fn finish(self, permissions: BTreeSet<Permission>) -> Result<RenderedDocument> {
        render(self.config, permissions)
    }
}

pub(super) fn build_gateway(
    signal: SignalType,
    pipelines: &[&UsablePipeline],
    opts: &BuildOptions,
) -> Result<(RenderedDocument, BTreeMap<String, Vec<u8>>)> {
    let mut builder = ComponentBuilder::new();
    let mut env = BTreeMap::new();
    let queue_size = (MAX_QUEUE_SIZE / pipelines.len().max(1) as u32).max(1);

    builder.add_receiver(OTLP_RECEIVER, &processors::otlp_receiver())?;

    let mut head = vec![
        builder.add_processor(MEMORY_LIMITER, &processors::memory_limiter())?,
        builder.add_processor(K8S_ATTRIBUTES, &processors::k8s_attributes(&opts.pod_labels))?,
    ];
    if let Some(filter) = processors::drop_internal_traffic(signal, &opts.namespace) {
        head.push(builder.add_processor(DROP_INTERNAL_TRAFFIC, &filter)?);
    }
    head.push(builder.add_processor(
        INSERT_CLUSTER_ATTRIBUTES,
        &processors::insert_cluster_attributes(&opts.cluster_name, &opts.cluster_uid),
    )?);
    head.push(builder.add_processor(
        RESOLVE_SERVICE_NAME,
        &processors::resolve_service_name(signal),
    )?);

    let drop_scratch =
        builder.add_processor(DROP_SCRATCH_ATTRIBUTES, &processors::drop_scratch_attributes())?;
    let batch = builder.add_processor(BATCH, &processors::batch(signal))?;

    for pipeline in pipelines {
        let name = pipeline.view.name.as_str();
        let mut chain = head.clone();

        for (suffix, processor) in input_processors(&pipeline.view.input)? {
            chain.push(builder.add_processor(&format!("{suffix}-{name}"), &processor)?);
        }
        if let Some(transform) = processors::user_transform(signal, &pipeline.view.transforms) {
            chain.push(builder.add_processor(&format!("transform/user-defined-{name}"), &transform)?);
        }
        if let Some(filter) = processors::user_filter(signal, &pipeline.view.filters) {
            chain.push(builder.add_processor(&format!("filter/user-defined-{name}"), &filter)?);
        }
        chain.push(drop_scratch.clone());
        chain.push(batch.clone());

        let parts = build_exporter(name, &pipeline.view.output, &pipeline.resolved, queue_size)?;
        let exporter = builder.add_exporter(&parts.id, &parts.config)?;
        if let Some((id, extension)) = &parts.extension {
            builder.add_extension(id, extension)?;
        }
        env.extend(parts.env);

        builder.add_pipeline(
            format!("{}/{name}", signal.otel_signal()),
            ServicePipeline {
                receivers: vec![OTLP_RECEIVER.to_string()],
                processors: chain,
                exporters: vec![exporter],
            },
        );
    }

    let document = builder.finish(BTreeSet::from([Permission::K8sMetadata]))?;
    Ok((document, env))
}

/// Processors that route a pipeline's share of the common receiver.
///
/// Every record reaching the gateway is tagged with the input it was
/// collected by; untagged records were pushed over OTLP. Sources a pipeline
/// did not ask for are dropped, the others are narrowed by their selectors.
fn input_processors(input: &PipelineInput) -> Result<Vec<(&'static str, Value)>> {
    let filters = match input {
        PipelineInput::Log(input) => log_input_processors(input),
        PipelineInput::Trace(input) => trace_input_processors(input),
        PipelineInput::Metric(input) => metric_input_processors(input),
    };
    let mut out = filters
        .into_iter()
        .map(|(id, filter)| Ok((id, serde_yaml::to_value(filter)?)))
        .collect::<Result<Vec<_>>>()?;

    if let PipelineInput::Log(input) = input {
        let drops_body = input
            .runtime
            .as_ref()
            .is_some_and(|r| r.enabled.unwrap_or(true) && r.keep_original_body == Some(false));
        if drops_body {
            out.push((
                "transform/drop-original-body",
                serde_yaml::to_value(processors::drop_original_body())?,
            ));
        }
    }
    Ok(out)
}

fn trace_input_processors(input: &TraceInput) -> Vec<(&'static str, FilterProcessor)> {
    let mut out = Vec::new();
    if input.otlp.as_ref().is_some_and(|o| o.disabled) {
        if let Some(filter) =
            processors::drop_input_sources(SignalType::Trace, &[InputSource::Otlp])
        {
            out.push(("filter/drop-input-sources", filter));
        }
    }
    if let Some(filter) = otlp_namespace_filter(SignalType::Trace, input.otlp.as_ref()) {
        out.push(("filter/filter-by-namespace-otlp-input", filter));
    }
    out
}

fn otlp_namespace_filter(
    signal: SignalType,
    otlp: Option<&OtlpInput>,
) -> Option<FilterProcessor> {
    let selector = otlp.and_then(|o| o.namespaces.as_ref())?;
    processors::selector_filter(
        signal,
        InputSource::Otlp,
        K8S_NAMESPACE_NAME,
        &NameMatcher::from(selector),
    )
}

fn log_input_processors(
    input: &LogInput,
) -> Vec<(&'static str, FilterProcessor)> {
    let mut out = Vec::new();
    let runtime = match &input.runtime {
        Some(r) if !r.enabled.unwrap_or(true) => None,
        Some(r) => Some(r.clone()),
        None => Some(Default::default()),
    };

    let mut dropped = Vec::new();
    if input.otlp.as_ref().is_some_and(|o| o.disabled) {
        dropped.push(InputSource::Otlp);
    }
    if runtime.is_none() {
        dropped.push(InputSource::Runtime);
    }
    if let Some(filter) = processors::drop_input_sources(SignalType::Log, &dropped) {
        out.push(("filter/drop-input-sources", filter));
    }

    if let Some(runtime) = runtime {
        let namespaces =
            namespace_matcher(Some(&runtime.namespaces.selector), runtime.namespaces.system);
        if let Some(filter) = processors::selector_filter(
            SignalType::Log,
            InputSource::Runtime,
            K8S_NAMESPACE_NAME,
            &namespaces,
        ) {
            out.push(("filter/filter-by-namespace-runtime-input", filter));
        }
        if let Some(filter) = processors::selector_filter(
            SignalType::Log,
            InputSource::Runtime,
            K8S_CONTAINER_NAME,
            &NameMatcher::from(&runtime.containers),
        ) {
            out.push(("filter/filter-by-container-runtime-input", filter));
        }
    }
    if let Some(filter) = otlp_namespace_filter(SignalType::Log, input.otlp.as_ref()) {
        out.push(("filter/filter-by-namespace-otlp-input", filter));
    }
    out
}

fn metric_input_processors(
    input: &MetricInput,
) -> Vec<(&'static str, FilterProcessor)> {
    let mut out = Vec::new();
    let runtime = input.runtime.as_ref().filter(|i| i.enabled);
    let prometheus = input.prometheus.as_ref().filter(|i| i.enabled);
    let istio = input.istio.as_ref().filter(|i| i.enabled);

    let mut dropped = Vec::new();
    if input.otlp.as_ref().is_some_and(|o| o.disabled) {
        dropped.push(InputSource::Otlp);
    }
    if runtime.is_none() {
        dropped.push(InputSource::Runtime);
    }
    if prometheus.is_none() {
        dropped.push(InputSource::Prometheus);
    }
    if istio.is_none() {
        dropped.push(InputSource::Istio);
    }
    if let Some(filter) = processors::drop_input_sources(SignalType::Metric, &dropped) {
        out.push(("filter/drop-input-sources", filter));
    }

    let namespace_filter = |source: InputSource, selector| {
        processors::selector_filter(
            SignalType::Metric,
            source,
            K8S_NAMESPACE_NAME,
            &namespace_matcher(selector, false),
        )
    };

    if let Some(runtime) = runtime {
        if let Some(filter) = namespace_filter(InputSource::Runtime, runtime.namespaces.as_ref()) {
            out.push(("filter/filter-by-namespace-runtime-input", filter));
        }
        let resources = runtime.resources.clone().unwrap_or_default();
        let disabled: Vec<&str> = [
            ("pod", resources.pod_enabled()),
            ("container", resources.container_enabled()),
            ("node", resources.node_enabled()),
            ("volume", resources.volume_enabled()),
        ]
        .into_iter()
        .filter(|(_, enabled)| !enabled)
        .map(|(name, _)| name)
        .collect();
        if let Some(filter) = processors::drop_runtime_resources(&disabled) {
            out.push(("filter/drop-runtime-resources", filter));
        }
    }

    if let Some(prometheus) = prometheus {
        if let Some(filter) =
            namespace_filter(InputSource::Prometheus, prometheus.namespaces.as_ref())
        {
            out.push(("filter/filter-by-namespace-prometheus-input", filter));
        }
        if !prometheus.diagnostic_metrics.as_ref().is_some_and(|d| d.enabled) {
            out.push((
                "filter/drop-diagnostic-metrics-prometheus-input",
                processors::drop_diagnostic_metrics(InputSource::Prometheus),
            ));
        }
    }

    if let Some(istio) = istio {
        if let Some(filter) = namespace_filter(InputSource::Istio, istio.namespaces.as_ref()) {
            out.push(("filter/filter-by-namespace-istio-input", filter));
        }
        if !istio.diagnostic_metrics.as_ref().is_some_and(|d| d.enabled) {
            out.push((
                "filter/drop-diagnostic-metrics-istio-input",
                processors::drop_diagnostic_metrics(InputSource::Istio),
            ));
        }
        if !istio.envoy_metrics.as_ref().is_some_and(|e| e.enabled) {
            out.push(("filter/drop-envoy-metrics", processors::drop_envoy_metrics()));
        }
    }

    if let Some(filter) = otlp_namespace_filter(SignalType::Metric, input.otlp.as_ref()) {
        out.push(("filter/filter-by-namespace-otlp-input", filter));
    }
    out
}
