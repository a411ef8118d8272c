//! Synthesis tests across gateway and agent documents

use super::*;
use crate::controller::pipeline::fixtures::*;
use crate::controller::pipeline::TelemetryPipeline;
use crate::controller::secret_ref::{Provenance, ResolvedReference};
use crate::crd::{
    FilterSpec, LogRuntimeInput, MetricIstioInput, MetricPrometheusInput, MetricRuntimeInput,
    NamespaceSelector, OtlpInput, SecretKeyRef,
};

fn opts() -> BuildOptions {
    BuildOptions {
        namespace: "kyma-system".to_string(),
        cluster_name: "test-cluster".to_string(),
        cluster_uid: "cluster-uid".to_string(),
        pod_labels: LabelAllowList::default(),
    }
}

fn usable(view: PipelineView, endpoint: &str) -> UsablePipeline {
    UsablePipeline {
        view,
        resolved: ResolvedOutput {
            endpoint: ResolvedReference::literal(endpoint),
            basic_auth: None,
            oauth2: None,
            headers: vec![],
            tls: None,
        },
    }
}

fn trace(name: &str) -> UsablePipeline {
    let endpoint = format!("http://{name}:4317");
    usable(trace_pipeline(name, 0, &endpoint).view(), &endpoint)
}

fn processors_of<'a>(doc: &'a RenderedDocument, pipeline: &str) -> &'a [String] {
    &doc.config.service.pipelines[pipeline].processors
}

#[test]
fn test_one_service_pipeline_per_resource() {
    let config = TraceSynthesizer
        .synthesize(&[trace("b"), trace("a")], &opts())
        .unwrap();

    assert_eq!(config.pipelines, vec!["a", "b"]);
    let ids: Vec<_> = config.gateway.config.service.pipelines.keys().cloned().collect();
    assert_eq!(ids, vec!["traces/a", "traces/b"]);
    assert_eq!(
        config.gateway.config.service.pipelines["traces/a"].exporters,
        vec!["otlp/a"]
    );
    assert!(config.gateway.config.exporters.contains_key("otlp/b"));
    assert!(!config.needs_agent());
    assert!(config.gateway.permissions.contains(&Permission::K8sMetadata));
}

#[test]
fn test_synthesis_is_deterministic() {
    let first = TraceSynthesizer
        .synthesize(&[trace("a"), trace("b")], &opts())
        .unwrap();
    let second = TraceSynthesizer
        .synthesize(&[trace("b"), trace("a")], &opts())
        .unwrap();

    assert_eq!(first.gateway.yaml, second.gateway.yaml);
    assert_eq!(first.checksum, second.checksum);
}

#[test]
fn test_queue_is_shared_between_pipelines() {
    let config = TraceSynthesizer
        .synthesize(&[trace("a"), trace("b"), trace("c"), trace("d")], &opts())
        .unwrap();

    let exporter = &config.gateway.config.exporters["otlp/a"];
    assert_eq!(exporter["sending_queue"]["queue_size"], serde_yaml::Value::from(64u32));
}

#[test]
fn test_processor_order() {
    let config = TraceSynthesizer.synthesize(&[trace("a")], &opts()).unwrap();
    let chain = processors_of(&config.gateway, "traces/a");

    assert_eq!(chain.first().map(String::as_str), Some("memory_limiter"));
    assert_eq!(chain.last().map(String::as_str), Some("batch"));
    assert_eq!(chain[chain.len() - 2], "resource/drop-kyma-attributes");
    assert!(chain.contains(&"k8sattributes".to_string()));
    assert!(chain.contains(&"resource/insert-cluster-attributes".to_string()));
}

#[test]
fn test_user_filters_are_per_pipeline() {
    let mut filtered = trace_pipeline("filtered", 0, "http://a:4317");
    filtered.spec.filters = vec![FilterSpec {
        conditions: vec![r#"span.attributes["http.route"] == "/healthz""#.to_string()],
    }];

    let config = TraceSynthesizer
        .synthesize(
            &[usable(filtered.view(), "http://a:4317"), trace("plain")],
            &opts(),
        )
        .unwrap();

    assert!(processors_of(&config.gateway, "traces/filtered")
        .contains(&"filter/user-defined-filtered".to_string()));
    assert!(!processors_of(&config.gateway, "traces/plain")
        .iter()
        .any(|p| p.starts_with("filter/user-defined")));
}

#[test]
fn test_otlp_namespace_selector_becomes_filter() {
    let mut pipeline = trace_pipeline("scoped", 0, "http://a:4317");
    pipeline.spec.input.otlp = Some(OtlpInput {
        disabled: false,
        namespaces: Some(NamespaceSelector {
            include: vec!["shop".to_string()],
            exclude: vec![],
        }),
    });

    let config = TraceSynthesizer
        .synthesize(&[usable(pipeline.view(), "http://a:4317")], &opts())
        .unwrap();

    let id = "filter/filter-by-namespace-otlp-input-scoped";
    assert!(processors_of(&config.gateway, "traces/scoped").contains(&id.to_string()));
    assert!(config.gateway.yaml.contains("k8s.namespace.name"));
}

#[test]
fn test_log_agent_only_when_runtime_input_is_used() {
    let with_runtime = usable(log_pipeline("tail", 0, "http://a:4317").view(), "http://a:4317");
    let config = LogSynthesizer.synthesize(&[with_runtime], &opts()).unwrap();
    let agent = config.agent.as_ref().unwrap();
    assert!(agent.config.receivers.contains_key("filelog"));
    assert_eq!(
        agent.config.exporters["otlp/gateway"]["endpoint"],
        serde_yaml::Value::from("telemetry-log-gateway.kyma-system.svc.cluster.local:4317")
    );

    let mut otlp_only = log_pipeline("push", 0, "http://a:4317");
    otlp_only.spec.input.runtime = Some(LogRuntimeInput {
        enabled: Some(false),
        ..Default::default()
    });
    let config = LogSynthesizer
        .synthesize(&[usable(otlp_only.view(), "http://a:4317")], &opts())
        .unwrap();
    assert!(config.agent.is_none());
    assert!(processors_of(&config.gateway, "logs/push")
        .contains(&"filter/drop-input-sources-push".to_string()));
}

#[test]
fn test_metric_agent_collects_union_of_inputs() {
    let mut runtime = metric_pipeline("runtime", 0, "http://a:4317");
    runtime.spec.input.runtime = Some(MetricRuntimeInput {
        enabled: true,
        ..Default::default()
    });
    let mut scraped = metric_pipeline("scraped", 1, "http://b:4317");
    scraped.spec.input.prometheus = Some(MetricPrometheusInput {
        enabled: true,
        ..Default::default()
    });
    scraped.spec.input.istio = Some(MetricIstioInput {
        enabled: true,
        ..Default::default()
    });

    let config = MetricSynthesizer
        .synthesize(
            &[
                usable(runtime.view(), "http://a:4317"),
                usable(scraped.view(), "http://b:4317"),
            ],
            &opts(),
        )
        .unwrap();

    let agent = config.agent.as_ref().unwrap();
    let pipelines: Vec<_> = agent.config.service.pipelines.keys().cloned().collect();
    assert_eq!(pipelines, vec!["metrics/istio", "metrics/prometheus", "metrics/runtime"]);
    assert!(agent.permissions.contains(&Permission::KubeletStats));
    assert!(agent.permissions.contains(&Permission::ServiceDiscovery));

    // each gateway pipeline drops the sources it did not ask for
    assert!(processors_of(&config.gateway, "metrics/runtime")
        .contains(&"filter/drop-input-sources-runtime".to_string()));
    assert!(processors_of(&config.gateway, "metrics/scraped")
        .contains(&"filter/drop-envoy-metrics-scraped".to_string()));
}

#[test]
fn test_secret_values_stay_out_of_the_document() {
    let mut pipeline = usable(trace_pipeline("secret", 0, "unused").view(), "unused");
    pipeline.resolved.endpoint = ResolvedReference {
        value: "https://backend.example.com:4317".to_string(),
        provenance: Provenance::Secret(SecretKeyRef {
            name: "creds".to_string(),
            namespace: "default".to_string(),
            key: "endpoint".to_string(),
        }),
        resource_version: Some("7".to_string()),
    };

    let config = TraceSynthesizer.synthesize(&[pipeline.clone()], &opts()).unwrap();
    assert!(!config.gateway.yaml.contains("backend.example.com"));
    assert_eq!(
        config.env["OTLP_ENDPOINT_SECRET"],
        b"https://backend.example.com:4317".to_vec()
    );

    pipeline.resolved.endpoint.value = "https://other.example.com:4317".to_string();
    let rotated = TraceSynthesizer.synthesize(&[pipeline], &opts()).unwrap();
    assert_eq!(rotated.gateway.yaml, config.gateway.yaml);
    assert_ne!(rotated.checksum, config.checksum);
}

#[test]
fn test_rejects_invalid_input() {
    assert!(TraceSynthesizer.synthesize(&[], &opts()).is_err());
    assert!(TraceSynthesizer
        .synthesize(&[trace("a"), trace("a")], &opts())
        .is_err());

    let log = usable(log_pipeline("logs", 0, "http://a:4317").view(), "http://a:4317");
    assert!(TraceSynthesizer.synthesize(&[log], &opts()).is_err());
}

#[test]
fn test_cluster_attributes_are_inserted() {
    let config = TraceSynthesizer.synthesize(&[trace("a")], &opts()).unwrap();
    let processor = &config.gateway.config.processors["resource/insert-cluster-attributes"];
    let rendered = serde_yaml::to_string(processor).unwrap();
    assert!(rendered.contains("test-cluster"));
    assert!(rendered.contains("cluster-uid"));
}
