//! Tests for the reconciler module
//!
//! Covers the pure parts of a pass: settings lookups, gateway scaling, the
//! apply/teardown decision of a signal pass and the Telemetry status shapes
//! for endpoints and blocked deletion.

#[cfg(test)]
mod tests {
    use super::super::conditions::*;
    use super::super::pipeline::SignalType;
    use super::super::reconciler::*;
    use crate::crd::{
        GatewaySpec, Scaling, SignalSpec, State, StaticScaling, TelemetrySpec, TelemetryStatus,
    };
    use crate::controller::config::{synthesizer_for, BuildOptions, SynthesizedConfig, UsablePipeline};
    use crate::controller::pipeline::fixtures::{http_log_pipeline, log_pipeline, trace_pipeline};
    use crate::controller::pipeline::TelemetryPipeline;
    use crate::controller::secret_ref::{ResolvedOutput, ResolvedReference};
    use crate::controller::selector::LabelAllowList;
    use crate::Error;
    use std::time::Duration;

    fn settings() -> OperatorSettings {
        OperatorSettings {
            namespace: "kyma-system".to_string(),
            collector_image: "otel/opentelemetry-collector-contrib:0.102.1".to_string(),
            fluent_bit_image: "fluent/fluent-bit:3.1.3".to_string(),
            priority_class_name: None,
            cluster_name: "test-cluster".to_string(),
            max_log_pipelines: 5,
            max_trace_pipelines: 3,
            max_metric_pipelines: 7,
            cert_expiry_lead_time: chrono::Duration::days(14),
            reference_timeout: Duration::from_secs(5),
            dry_run: false,
        }
    }

    fn scaled(replicas: i32) -> Option<SignalSpec> {
        Some(SignalSpec {
            gateway: Some(GatewaySpec {
                scaling: Some(Scaling {
                    static_: Some(StaticScaling { replicas }),
                }),
            }),
        })
    }

    #[test]
    fn test_max_pipelines_per_signal() {
        let settings = settings();
        assert_eq!(settings.max_pipelines(SignalType::Log), 5);
        assert_eq!(settings.max_pipelines(SignalType::Trace), 3);
        assert_eq!(settings.max_pipelines(SignalType::Metric), 7);
    }

    #[test]
    fn test_gateway_replicas_from_spec() {
        let spec = TelemetrySpec {
            trace: scaled(4),
            ..Default::default()
        };
        assert_eq!(gateway_replicas(&spec, SignalType::Trace), Some(4));
        assert_eq!(gateway_replicas(&spec, SignalType::Log), None);
        assert_eq!(gateway_replicas(&spec, SignalType::Metric), None);
    }

    #[test]
    fn test_gateway_replicas_out_of_range_ignored() {
        let spec = TelemetrySpec {
            log: scaled(0),
            metric: scaled(11),
            ..Default::default()
        };
        assert_eq!(gateway_replicas(&spec, SignalType::Log), None);
        assert_eq!(gateway_replicas(&spec, SignalType::Metric), None);
    }

    #[test]
    fn test_gateway_endpoints_only_for_existing_gateways() {
        assert!(gateway_endpoints(&[], "kyma-system").is_none());

        let endpoints = gateway_endpoints(&[SignalType::Trace], "kyma-system").unwrap();
        assert!(endpoints.logs.is_none());
        assert!(endpoints.metrics.is_none());
        let traces = endpoints.traces.unwrap();
        assert!(traces.grpc.ends_with(".kyma-system:4317"));
        assert!(traces.http.ends_with(".kyma-system:4318"));
    }

    #[test]
    fn test_blocked_status_marks_every_signal() {
        let mut current = TelemetryStatus::default();
        set_condition(
            &mut current.conditions,
            "LogComponentsHealthy",
            CONDITION_STATUS_TRUE,
            REASON_COMPONENTS_RUNNING,
            "All log components are running",
        );

        let status = blocked_status(&current, "The deletion is blocked by: LogPipeline backend");

        assert_eq!(status.state, State::Warning);
        assert_eq!(status.conditions.len(), 3);
        for signal in SignalType::ALL {
            let condition = find_condition(&status.conditions, signal.components_condition_type()).unwrap();
            assert_eq!(condition.status, CONDITION_STATUS_FALSE);
            assert_eq!(condition.reason, REASON_RESOURCE_BLOCKS_DELETION);
            assert!(condition.message.contains("LogPipeline backend"));
        }
    }

    fn trace_config(name: &str) -> SynthesizedConfig {
        let usable = vec![UsablePipeline {
            view: trace_pipeline(name, 0, "http://backend:4317").view(),
            resolved: ResolvedOutput {
                endpoint: ResolvedReference::literal("http://backend:4317"),
                basic_auth: None,
                oauth2: None,
                headers: vec![],
                tls: None,
            },
        }];
        let opts = BuildOptions {
            namespace: "kyma-system".to_string(),
            cluster_name: "test-cluster".to_string(),
            cluster_uid: "cluster-uid".to_string(),
            pod_labels: LabelAllowList::default(),
        };
        synthesizer_for(SignalType::Trace).synthesize(&usable, &opts).unwrap()
    }

    #[test]
    fn test_plan_teardown_without_usable_pipelines() {
        let last_good = LastGoodConfig {
            checksum: "abc".to_string(),
            needs_agent: false,
        };
        assert!(matches!(plan_pass(None, Some(last_good)), PassPlan::Teardown));
        assert!(matches!(plan_pass(None, None), PassPlan::Teardown));
    }

    #[test]
    fn test_plan_applies_fresh_configuration() {
        let config = trace_config("backend");
        let checksum = config.checksum.clone();

        match plan_pass(Some(Ok(config)), None) {
            PassPlan::Apply(config) => {
                assert_eq!(config.checksum, checksum);
                let applied = LastGoodConfig::of(&config);
                assert_eq!(applied.checksum, checksum);
                assert!(!applied.needs_agent);
            }
            other => panic!("expected Apply, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_keeps_last_good_on_synthesis_error() {
        let last_good = LastGoodConfig::of(&trace_config("backend"));

        let plan = plan_pass(
            Some(Err(Error::SynthesisError("duplicate exporter id".to_string()))),
            Some(last_good.clone()),
        );
        match plan {
            PassPlan::KeepLastGood { error, last_good: kept } => {
                assert!(error.contains("duplicate exporter id"));
                assert_eq!(kept, Some(last_good));
            }
            other => panic!("expected KeepLastGood, got {other:?}"),
        }

        let plan = plan_pass(Some(Err(Error::SynthesisError("broken".to_string()))), None);
        assert!(matches!(plan, PassPlan::KeepLastGood { last_good: None, .. }));
    }

    #[test]
    fn test_fluent_bit_pipelines_are_left_out_of_the_collector_pass() {
        let pipelines = vec![
            log_pipeline("otlp", 0, "http://backend:4317"),
            http_log_pipeline("http", 1, "logs.example.com"),
        ];
        let names: Vec<String> = collector_views(&pipelines).into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["otlp"]);
    }
}
