//! Unit tests for the generated Kubernetes resources.
//!
//! Run with: `cargo test -p telemetry-k8s resources_test`

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use crate::controller::config::{
        BuildOptions, LogSynthesizer, Permission, Synthesizer, TraceSynthesizer, UsablePipeline,
    };
    use crate::controller::pipeline::fixtures::*;
    use crate::controller::pipeline::{SignalType, TelemetryPipeline};
    use crate::controller::resources::*;
    use crate::controller::secret_ref::{ResolvedOutput, ResolvedReference};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn options() -> WorkloadOptions {
        WorkloadOptions {
            image: "otel/opentelemetry-collector-contrib:0.114.0".to_string(),
            priority_class_name: Some("telemetry-priority-class".to_string()),
        }
    }

    fn usable(view: crate::controller::pipeline::PipelineView) -> UsablePipeline {
        UsablePipeline {
            view,
            resolved: ResolvedOutput {
                endpoint: ResolvedReference::literal("http://backend:4317"),
                basic_auth: None,
                oauth2: None,
                headers: vec![],
                tls: None,
            },
        }
    }

    fn build_options() -> BuildOptions {
        BuildOptions {
            namespace: "kyma-system".to_string(),
            ..Default::default()
        }
    }

    fn port_numbers(policy: &k8s_openapi::api::networking::v1::NetworkPolicy) -> Vec<i32> {
        let spec = policy.spec.as_ref().unwrap();
        spec.ingress.as_ref().unwrap()[0]
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .filter_map(|p| match p.port {
                Some(IntOrString::Int(port)) => Some(port),
                _ => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Naming and labels
    // -----------------------------------------------------------------------

    #[test]
    fn test_component_names() {
        let gateway = Component::gateway(SignalType::Trace, "kyma-system");
        assert_eq!(gateway.name, "telemetry-trace-gateway");
        assert_eq!(gateway.otlp_service_name(), "telemetry-otlp-traces");
        assert_eq!(gateway.metrics_service_name(), "telemetry-trace-gateway-metrics");
        assert_eq!(
            gateway.pod_selector(),
            "app.kubernetes.io/name=telemetry-trace-gateway"
        );
        assert_eq!(gateway.pod_metrics_url("10.0.0.7"), "http://10.0.0.7:8888/metrics");

        assert!(Component::agent(SignalType::Trace, "kyma-system").is_none());
        let agent = Component::agent(SignalType::Log, "kyma-system").unwrap();
        assert_eq!(agent.name, "telemetry-log-agent");
        assert_eq!(agent.role, Role::Agent);

        let fluent_bit = Component::fluent_bit("kyma-system");
        assert_eq!(fluent_bit.signal, SignalType::Log);
        assert_eq!(
            fluent_bit.pod_metrics_url("10.0.0.7"),
            "http://10.0.0.7:2020/api/v2/metrics/prometheus"
        );
    }

    #[test]
    fn test_otlp_endpoints() {
        let endpoints = otlp_endpoints(SignalType::Metric, "kyma-system");
        assert_eq!(endpoints.grpc, "http://telemetry-otlp-metrics.kyma-system:4317");
        assert_eq!(endpoints.http, "http://telemetry-otlp-metrics.kyma-system:4318");
    }

    #[test]
    fn test_labels_map_back_to_signal() {
        let component = Component::gateway(SignalType::Metric, "kyma-system");
        let cm = build_config_map(
            &component,
            &LogSynthesizer
                .synthesize(&[usable(log_pipeline("a", 0, "http://b:4317").view())], &build_options())
                .unwrap()
                .gateway,
            &[],
        );

        assert_eq!(managed_signal(&cm.metadata), Some(SignalType::Metric));

        let mut foreign = cm.metadata.clone();
        foreign
            .labels
            .as_mut()
            .unwrap()
            .insert("app.kubernetes.io/managed-by".to_string(), "helm".to_string());
        assert_eq!(managed_signal(&foreign), None);
    }

    #[test]
    fn test_owner_references_are_not_controllers() {
        let pipelines = vec![
            usable(trace_pipeline("b", 1, "http://b:4317").view()),
            usable(trace_pipeline("a", 0, "http://a:4317").view()),
        ];
        let owners = owner_references(&pipelines);

        assert_eq!(owners.len(), 2);
        assert_eq!(owners[0].name, "a");
        assert_eq!(owners[0].kind, "TracePipeline");
        assert_eq!(owners[0].uid, "uid-a");
        assert!(owners.iter().all(|o| o.controller == Some(false)));
    }

    // -----------------------------------------------------------------------
    // RBAC
    // -----------------------------------------------------------------------

    #[test]
    fn test_policy_rules_follow_permissions() {
        let rules = policy_rules(&BTreeSet::from([Permission::K8sMetadata]));
        let groups: Vec<_> = rules
            .iter()
            .map(|r| r.api_groups.as_ref().unwrap()[0].as_str())
            .collect();
        assert_eq!(groups, vec!["", "apps", "batch"]);
        assert!(rules.iter().all(|r| r.non_resource_urls.is_none()));
        assert!(rules
            .iter()
            .all(|r| r.verbs == vec!["get", "list", "watch"]));

        let rules = policy_rules(&BTreeSet::from([
            Permission::KubeletStats,
            Permission::ServiceDiscovery,
        ]));
        let core = rules[0].resources.as_ref().unwrap();
        assert!(core.contains(&"nodes/stats".to_string()));
        assert!(core.contains(&"endpoints".to_string()));
        assert_eq!(
            rules.last().unwrap().non_resource_urls,
            Some(vec!["/metrics".to_string()])
        );
    }

    #[test]
    fn test_no_permissions_no_rules() {
        assert!(policy_rules(&BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_cluster_role_binding_targets_service_account() {
        let component = Component::gateway(SignalType::Log, "kyma-system");
        let binding = build_cluster_role_binding(&component, &[]);

        assert!(binding.metadata.namespace.is_none());
        assert_eq!(binding.role_ref.name, "telemetry-log-gateway");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.namespace.as_deref(), Some("kyma-system"));
    }

    // -----------------------------------------------------------------------
    // Workloads
    // -----------------------------------------------------------------------

    #[test]
    fn test_gateway_deployment() {
        let component = Component::gateway(SignalType::Trace, "kyma-system");
        let deployment = build_gateway_deployment(&component, 3, "abc123", &options(), &[]);
        let spec = deployment.spec.unwrap();

        assert_eq!(spec.replicas, Some(3));
        let template = spec.template;
        assert_eq!(
            template.metadata.unwrap().annotations.unwrap()[CHECKSUM_ANNOTATION],
            "abc123"
        );

        let pod = template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("telemetry-trace-gateway"));
        assert_eq!(pod.priority_class_name.as_deref(), Some("telemetry-priority-class"));
        assert!(pod.tolerations.is_none());

        let container = &pod.containers[0];
        assert_eq!(container.args, Some(vec!["--config=/conf/relay.conf".to_string()]));
        let env_from = container.env_from.as_ref().unwrap();
        assert_eq!(
            env_from[0].secret_ref.as_ref().unwrap().name.as_deref(),
            Some("telemetry-trace-gateway")
        );
        let ports: Vec<_> = container
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.container_port)
            .collect();
        assert!(ports.contains(&4317));
        assert!(ports.contains(&4318));
        assert_eq!(
            container.security_context.as_ref().unwrap().run_as_non_root,
            Some(true)
        );
    }

    #[test]
    fn test_log_agent_mounts_host_logs() {
        let component = Component::agent(SignalType::Log, "kyma-system").unwrap();
        let daemonset = build_agent_daemonset(&component, "abc123", &options(), &[]);
        let pod = daemonset.spec.unwrap().template.spec.unwrap();

        let volumes: Vec<_> = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(volumes, vec!["config", "varlogpods", "varlibstate"]);
        assert!(pod.tolerations.is_some());

        let container = &pod.containers[0];
        assert!(container.env_from.is_none());
        assert!(container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .any(|e| e.name == "MY_NODE_NAME"));
        assert_eq!(container.security_context.as_ref().unwrap().run_as_user, Some(0));
    }

    #[test]
    fn test_metric_agent_has_no_host_mounts() {
        let component = Component::agent(SignalType::Metric, "kyma-system").unwrap();
        let daemonset = build_agent_daemonset(&component, "abc123", &options(), &[]);
        let pod = daemonset.spec.unwrap().template.spec.unwrap();

        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(
            pod.containers[0].security_context.as_ref().unwrap().run_as_non_root,
            Some(true)
        );
    }

    #[test]
    fn test_selector_is_stable_across_checksums() {
        let component = Component::gateway(SignalType::Log, "kyma-system");
        let first = build_gateway_deployment(&component, 2, "one", &options(), &[]);
        let second = build_gateway_deployment(&component, 2, "two", &options(), &[]);

        assert_eq!(
            first.spec.as_ref().unwrap().selector,
            second.spec.as_ref().unwrap().selector
        );
        assert_eq!(
            first.spec.unwrap().selector.match_labels.unwrap(),
            BTreeMap::from([(
                "app.kubernetes.io/name".to_string(),
                "telemetry-log-gateway".to_string()
            )])
        );
    }

    // -----------------------------------------------------------------------
    // Config, Secret, Services, NetworkPolicy
    // -----------------------------------------------------------------------

    #[test]
    fn test_config_map_and_secret_carry_synthesized_config() {
        let mut pipeline = usable(trace_pipeline("a", 0, "http://b:4317").view());
        pipeline.resolved.endpoint = ResolvedReference::literal("http://backend:4317");
        let config = TraceSynthesizer.synthesize(&[pipeline], &build_options()).unwrap();

        let component = Component::gateway(SignalType::Trace, "kyma-system");
        let cm = build_config_map(&component, &config.gateway, &[]);
        assert_eq!(cm.data.unwrap()["relay.conf"], config.gateway.yaml);

        let secret = build_env_secret(&component, &config.env, &[]);
        let data = secret.data.unwrap();
        assert_eq!(data.len(), config.env.len());
        for (key, value) in &config.env {
            assert_eq!(&data[key].0, value);
        }
    }

    #[test]
    fn test_services() {
        let component = Component::gateway(SignalType::Trace, "kyma-system");

        let otlp = build_otlp_service(&component, &[]);
        assert_eq!(otlp.metadata.name.as_deref(), Some("telemetry-otlp-traces"));
        let ports: Vec<_> = otlp.spec.unwrap().ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![4317, 4318]);

        let metrics = build_metrics_service(&component, &[]);
        assert_eq!(
            metrics.metadata.name.as_deref(),
            Some("telemetry-trace-gateway-metrics")
        );
        assert_eq!(metrics.spec.unwrap().ports.unwrap()[0].port, 8888);
    }

    #[test]
    fn test_network_policy_ports_by_role() {
        let gateway = Component::gateway(SignalType::Log, "kyma-system");
        let mut ports = port_numbers(&build_network_policy(&gateway, &[]));
        ports.sort();
        assert_eq!(ports, vec![4317, 4318, 8888, 13133]);

        let agent = Component::agent(SignalType::Log, "kyma-system").unwrap();
        let mut ports = port_numbers(&build_network_policy(&agent, &[]));
        ports.sort();
        assert_eq!(ports, vec![8888, 13133]);
    }

    #[test]
    fn test_owners_are_attached_everywhere() {
        let pipelines = vec![usable(trace_pipeline("a", 0, "http://a:4317").view())];
        let owners = owner_references(&pipelines);
        let component = Component::gateway(SignalType::Trace, "kyma-system");

        assert_eq!(
            build_service_account(&component, &owners).metadata.owner_references,
            Some(owners.clone())
        );
        assert_eq!(
            build_network_policy(&component, &owners).metadata.owner_references,
            Some(owners.clone())
        );
        assert_eq!(
            build_cluster_role(&component, &BTreeSet::new(), &owners)
                .metadata
                .owner_references,
            Some(owners)
        );
    }
}
