//! Processor builders shared by gateways and agents

use super::ottl;
use super::types::*;
use super::{InputSource, SCRATCH_ATTRIBUTE_PATTERN, INPUT_SOURCE_ATTRIBUTE};
use crate::controller::pipeline::SignalType;
use crate::controller::selector::{LabelAllowList, NameMatcher};
use crate::crd::{FilterSpec, TransformSpec};

const ERROR_MODE_IGNORE: &str = "ignore";

const APP_NAME_LABEL_ATTRIBUTE: &str = "kyma.kubernetes_io_app_name";
const APP_LABEL_ATTRIBUTE: &str = "kyma.app_name";

pub const K8S_NAMESPACE_NAME: &str = "k8s.namespace.name";
pub const K8S_CONTAINER_NAME: &str = "k8s.container.name";

pub fn otlp_receiver() -> OtlpReceiver {
    OtlpReceiver {
        protocols: ReceiverProtocols {
            http: Endpoint {
                endpoint: format!("{}:{OTLP_HTTP_PORT}", env_ref(ENV_VAR_POD_IP)),
            },
            grpc: Endpoint {
                endpoint: format!("{}:{OTLP_GRPC_PORT}", env_ref(ENV_VAR_POD_IP)),
            },
        },
    }
}

pub fn memory_limiter() -> MemoryLimiter {
    MemoryLimiter {
        check_interval: "1s".to_string(),
        limit_percentage: 75,
        spike_limit_percentage: 15,
    }
}

pub fn batch(signal: SignalType) -> BatchProcessor {
    let size = match signal {
        SignalType::Trace => 512,
        SignalType::Log | SignalType::Metric => 1024,
    };
    BatchProcessor {
        send_batch_size: size,
        timeout: "10s".to_string(),
        send_batch_max_size: size,
    }
}

pub fn k8s_attributes(pod_labels: &LabelAllowList) -> K8sAttributesProcessor {
    let metadata = [
        "k8s.pod.name",
        "k8s.node.name",
        "k8s.namespace.name",
        "k8s.deployment.name",
        "k8s.statefulset.name",
        "k8s.daemonset.name",
        "k8s.cronjob.name",
        "k8s.job.name",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let fixed = [
        ("pod", "app.kubernetes.io/name", APP_NAME_LABEL_ATTRIBUTE),
        ("pod", "app", APP_LABEL_ATTRIBUTE),
        ("node", "topology.kubernetes.io/region", "cloud.region"),
        ("node", "topology.kubernetes.io/zone", "cloud.availability_zone"),
        ("node", "node.kubernetes.io/instance-type", "host.type"),
        ("node", "kubernetes.io/arch", "host.arch"),
    ];
    let mut labels: Vec<ExtractLabel> = fixed
        .iter()
        .map(|(from, key, tag)| ExtractLabel {
            from: from.to_string(),
            key: Some(key.to_string()),
            key_regex: None,
            tag_name: tag.to_string(),
        })
        .collect();
    labels.extend(pod_labels.matchers().iter().map(|m| ExtractLabel {
        from: "pod".to_string(),
        key: None,
        key_regex: Some(m.key_regex()),
        tag_name: "k8s.pod.label.$0".to_string(),
    }));

    let association = |from: &str, name: Option<&str>| PodAssociations {
        sources: vec![PodAssociation {
            from: from.to_string(),
            name: name.map(str::to_string),
        }],
    };

    K8sAttributesProcessor {
        auth_type: "serviceAccount".to_string(),
        passthrough: false,
        extract: ExtractK8sMetadata { metadata, labels },
        pod_association: vec![
            association("resource_attribute", Some("k8s.pod.ip")),
            association("resource_attribute", Some("k8s.pod.uid")),
            association("connection", None),
        ],
    }
}

pub fn insert_cluster_attributes(cluster_name: &str, cluster_uid: &str) -> ResourceProcessor {
    let mut attributes = vec![AttributeAction {
        action: "insert".to_string(),
        key: Some("k8s.cluster.name".to_string()),
        value: Some(cluster_name.to_string()),
        pattern: None,
    }];
    if !cluster_uid.is_empty() {
        attributes.push(AttributeAction {
            action: "insert".to_string(),
            key: Some("k8s.cluster.uid".to_string()),
            value: Some(cluster_uid.to_string()),
            pattern: None,
        });
    }
    ResourceProcessor { attributes }
}

/// Tag records with the input they were collected by
pub fn insert_input_source(source: InputSource) -> ResourceProcessor {
    ResourceProcessor {
        attributes: vec![AttributeAction {
            action: "insert".to_string(),
            key: Some(INPUT_SOURCE_ATTRIBUTE.to_string()),
            value: Some(source.as_str().to_string()),
            pattern: None,
        }],
    }
}

pub fn drop_scratch_attributes() -> ResourceProcessor {
    ResourceProcessor {
        attributes: vec![AttributeAction {
            action: "delete".to_string(),
            pattern: Some(SCRATCH_ATTRIBUTE_PATTERN.to_string()),
            ..Default::default()
        }],
    }
}

fn transform_for(signal: SignalType, statements: Vec<TransformStatements>) -> TransformProcessor {
    let mut processor = TransformProcessor {
        error_mode: ERROR_MODE_IGNORE.to_string(),
        ..Default::default()
    };
    match signal {
        SignalType::Log => processor.log_statements = statements,
        SignalType::Trace => processor.trace_statements = statements,
        SignalType::Metric => processor.metric_statements = statements,
    }
    processor
}

/// Derive `service.name` when it is missing or a generated placeholder.
///
/// Sources are tried in order: the well-known app labels, then the owning
/// workload, then the pod name.
pub fn resolve_service_name(signal: SignalType) -> TransformProcessor {
    let service_name = ottl::resource_attribute("service.name");
    let unset = format!(
        "({} or {})",
        ottl::resource_attribute_is_nil("service.name"),
        ottl::is_match(&service_name, "^unknown_service(:.+)?$")
    );

    let sources = [
        APP_NAME_LABEL_ATTRIBUTE,
        APP_LABEL_ATTRIBUTE,
        "k8s.deployment.name",
        "k8s.daemonset.name",
        "k8s.statefulset.name",
        "k8s.job.name",
        "k8s.pod.name",
    ];
    let mut statements: Vec<String> = sources
        .iter()
        .map(|source| {
            format!(
                "set({service_name}, {}) where {}",
                ottl::resource_attribute(source),
                ottl::join_with_and([unset.clone(), ottl::resource_attribute_is_not_nil(source)])
            )
        })
        .collect();
    statements.push(format!(
        "set({service_name}, \"unknown_service\") where {}",
        ottl::resource_attribute_is_nil("service.name")
    ));

    transform_for(
        signal,
        vec![TransformStatements {
            statements,
            conditions: vec![],
        }],
    )
}

/// Filter with the given drop conditions in the signal's record context
pub fn filter_for(signal: SignalType, conditions: Vec<String>) -> FilterProcessor {
    let mut processor = FilterProcessor {
        error_mode: ERROR_MODE_IGNORE.to_string(),
        ..Default::default()
    };
    match signal {
        SignalType::Log => processor.logs = Some(FilterLogs { log_record: conditions }),
        SignalType::Trace => processor.traces = Some(FilterTraces { span: conditions }),
        SignalType::Metric => {
            processor.metrics = Some(FilterMetrics {
                metric: conditions,
                datapoint: vec![],
            })
        }
    }
    processor
}

/// Drop health checks, self-scrapes and mesh control-plane traffic of the
/// telemetry workloads themselves
pub fn drop_internal_traffic(signal: SignalType, namespace: &str) -> Option<FilterProcessor> {
    let own_namespace = ottl::resource_attribute_equals(K8S_NAMESPACE_NAME, namespace);
    let conditions = match signal {
        SignalType::Trace => vec![
            // istio proxy spans of the telemetry workloads
            ottl::join_with_and([
                own_namespace.clone(),
                format!("{} == \"proxy\"", ottl::attribute("component")),
                ottl::is_match(
                    &ottl::attribute("istio.canonical_service"),
                    "^telemetry-(log|trace|metric)-(gateway|agent)$",
                ),
            ]),
            // probes and metric scrapes
            ottl::join_with_or([
                ottl::is_match(&ottl::attribute("http.url"), ".+/(healthz|readyz|metrics)$"),
                ottl::is_match(&ottl::attribute("url.full"), ".+/(healthz|readyz|metrics)$"),
            ]),
            format!(
                "{} == \"Prometheus\"",
                ottl::attribute("user_agent.original")
            ),
        ],
        SignalType::Log => vec![ottl::join_with_and([
            own_namespace,
            ottl::is_match(
                &ottl::resource_attribute("k8s.pod.name"),
                "^telemetry-(log|trace|metric)-(gateway|agent)-.*",
            ),
        ])],
        SignalType::Metric => return None,
    };
    Some(filter_for(signal, conditions))
}

/// Drop records of `source` whose attribute does not pass the matcher
pub fn selector_filter(
    signal: SignalType,
    source: InputSource,
    attribute: &str,
    matcher: &NameMatcher,
) -> Option<FilterProcessor> {
    let drop = matcher.drop_condition(attribute)?;
    Some(filter_for(
        signal,
        vec![ottl::join_with_and([source.condition(), drop])],
    ))
}

/// Drop every record collected by one of the given sources
pub fn drop_input_sources(signal: SignalType, sources: &[InputSource]) -> Option<FilterProcessor> {
    if sources.is_empty() {
        return None;
    }
    Some(filter_for(
        signal,
        sources.iter().map(InputSource::condition).collect(),
    ))
}

/// Metric name regexes per runtime resource group
pub fn runtime_resource_pattern(resource: &str) -> &'static str {
    match resource {
        "pod" => "^k8s.pod.*",
        "container" => "(^k8s.container.*)|(^container.*)",
        "node" => "^k8s.node.*",
        _ => "^k8s.volume.*",
    }
}

/// Drop runtime metrics of disabled resource groups
pub fn drop_runtime_resources(disabled: &[&str]) -> Option<FilterProcessor> {
    if disabled.is_empty() {
        return None;
    }
    let conditions = disabled
        .iter()
        .map(|r| {
            ottl::join_with_and([
                InputSource::Runtime.condition(),
                ottl::is_match("name", runtime_resource_pattern(r)),
            ])
        })
        .collect();
    Some(filter_for(SignalType::Metric, conditions))
}

/// Scrape bookkeeping metrics emitted by the prometheus receiver
pub fn drop_diagnostic_metrics(source: InputSource) -> FilterProcessor {
    filter_for(
        SignalType::Metric,
        vec![ottl::join_with_and([
            source.condition(),
            ottl::is_match("name", "^(up|scrape_.*)$"),
        ])],
    )
}

pub fn drop_envoy_metrics() -> FilterProcessor {
    filter_for(
        SignalType::Metric,
        vec![ottl::join_with_and([
            InputSource::Istio.condition(),
            ottl::is_match("name", "^envoy_.*"),
        ])],
    )
}

/// Remove the original body the agent kept for other pipelines
pub fn drop_original_body() -> TransformProcessor {
    transform_for(
        SignalType::Log,
        vec![TransformStatements {
            statements: vec!["delete_key(log.attributes, \"log.original\")".to_string()],
            conditions: vec![InputSource::Runtime.condition()],
        }],
    )
}

pub fn user_transform(signal: SignalType, transforms: &[TransformSpec]) -> Option<TransformProcessor> {
    if transforms.is_empty() {
        return None;
    }
    Some(transform_for(
        signal,
        transforms
            .iter()
            .map(|t| TransformStatements {
                statements: t.statements.clone(),
                conditions: t.conditions.clone(),
            })
            .collect(),
    ))
}

pub fn user_filter(signal: SignalType, filters: &[FilterSpec]) -> Option<FilterProcessor> {
    let conditions: Vec<String> = filters.iter().flat_map(|f| f.conditions.clone()).collect();
    if conditions.is_empty() {
        return None;
    }
    if signal == SignalType::Metric && conditions.iter().any(|c| c.contains("datapoint.")) {
        return Some(FilterProcessor {
            error_mode: ERROR_MODE_IGNORE.to_string(),
            metrics: Some(FilterMetrics {
                metric: vec![],
                datapoint: conditions,
            }),
            ..Default::default()
        });
    }
    Some(filter_for(signal, conditions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PodLabel;

    #[test]
    fn test_k8s_attributes_includes_allow_list() {
        let list = LabelAllowList::new(&[PodLabel {
            key: None,
            key_prefix: Some("team.".to_string()),
        }]);
        let processor = k8s_attributes(&list);

        assert_eq!(processor.extract.metadata.len(), 8);
        let last = processor.extract.labels.last().unwrap();
        assert_eq!(last.key_regex.as_deref(), Some(r"(team\..*)"));
        assert_eq!(last.tag_name, "k8s.pod.label.$0");
    }

    #[test]
    fn test_selector_filter_scopes_to_input_source() {
        let matcher = NameMatcher::new(&[], &["noisy".to_string()]);
        let filter = selector_filter(
            SignalType::Log,
            InputSource::Runtime,
            K8S_NAMESPACE_NAME,
            &matcher,
        )
        .unwrap();

        assert_eq!(
            filter.logs.unwrap().log_record,
            vec![r#"resource.attributes["kyma.input.name"] == "runtime" and resource.attributes["k8s.namespace.name"] == "noisy""#.to_string()]
        );
        assert!(selector_filter(
            SignalType::Log,
            InputSource::Runtime,
            K8S_NAMESPACE_NAME,
            &NameMatcher::any()
        )
        .is_none());
    }

    #[test]
    fn test_otlp_source_is_untagged() {
        assert_eq!(
            InputSource::Otlp.condition(),
            r#"resource.attributes["kyma.input.name"] == nil"#
        );
    }

    #[test]
    fn test_user_metric_filter_context() {
        let filters = vec![FilterSpec {
            conditions: vec![r#"datapoint.attributes["a"] == "b""#.to_string()],
        }];
        let processor = user_filter(SignalType::Metric, &filters).unwrap();
        let metrics = processor.metrics.unwrap();
        assert!(metrics.metric.is_empty());
        assert_eq!(metrics.datapoint.len(), 1);
    }

    #[test]
    fn test_no_internal_traffic_filter_for_metrics() {
        assert!(drop_internal_traffic(SignalType::Metric, "kyma-system").is_none());
        assert!(drop_internal_traffic(SignalType::Trace, "kyma-system").is_some());
    }
}
