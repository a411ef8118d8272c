//! Self-monitor for the telemetry flow
//!
//! Every 30 seconds the collectors' own metrics are scraped, turned into
//! rates and matched against a fixed set of alerting rules. The outcome is
//! written to the `FlowHealthy` condition of each pipeline, the only
//! condition type this task touches. Fluent Bit pipelines are judged on
//! the Fluent Bit pods' own metrics instead of collector alerts.

pub mod fluent_bit;
pub mod prober;
pub mod rules;
pub mod scrape;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::conditions::*;
use super::pipeline::{PipelineView, SignalType, TelemetryPipeline};
use super::reconciler::ControllerState;
use super::resources::Component;
use super::status::write_pipeline_conditions;
use crate::crd::{LogPipeline, MetricPipeline, TracePipeline};
use crate::error::Result;

use prober::{flow_condition, probe, FlowCondition, ProbeTarget};
use rules::Alert;
use scrape::{is_component_key, pod_key, RateTracker, Scraper, Snapshot};

/// Interval between two evaluations
pub const EVALUATION_INTERVAL: Duration = Duration::from_secs(30);

pub struct SelfMonitor {
    client: Client,
    namespace: String,
    scraper: Scraper,
    rates: RateTracker,
}

impl SelfMonitor {
    pub fn new(client: Client, namespace: &str) -> Result<Self> {
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            scraper: Scraper::new()?,
            rates: RateTracker::default(),
        })
    }

    /// Evaluate on a fixed interval until the process exits
    pub async fn run(mut self, state: Arc<ControllerState>) {
        info!(
            "Starting self-monitor with an interval of {}s",
            EVALUATION_INTERVAL.as_secs()
        );
        let mut interval = tokio::time::interval(EVALUATION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !state.is_leader.load(Ordering::Relaxed) {
                debug!("Not the leader, skipping self-monitor evaluation");
                continue;
            }

            let overrides = state.overrides.read().await.clone();
            for signal in SignalType::ALL {
                if overrides.signal_paused(signal) {
                    debug!("Reconciliation of {} is paused, skipping flow evaluation", signal);
                    continue;
                }
                let dry_run = state.settings.dry_run;
                let result = match signal {
                    SignalType::Log => {
                        let collector = self.evaluate::<LogPipeline>(dry_run).await;
                        if let Err(e) = self.evaluate_fluent_bit(dry_run).await {
                            warn!("Flow evaluation of Fluent Bit pipelines failed: {}", e);
                        }
                        collector
                    }
                    SignalType::Trace => self.evaluate::<TracePipeline>(dry_run).await,
                    SignalType::Metric => self.evaluate::<MetricPipeline>(dry_run).await,
                };
                if let Err(e) = result {
                    warn!("Flow evaluation of {} pipelines failed: {}", signal, e);
                }
            }
        }
    }

    #[instrument(skip(self), fields(signal = %K::SIGNAL))]
    async fn evaluate<K: TelemetryPipeline>(&mut self, dry_run: bool) -> Result<()> {
        let signal = K::SIGNAL;
        let api: Api<K> = Api::all(self.client.clone());
        let views: Vec<PipelineView> = api
            .list(&ListParams::default())
            .await?
            .iter()
            .filter(|p| p.uses_collector())
            .map(|p| p.view())
            .filter(|v| !v.deleting)
            .collect();

        let gateway = Component::gateway(signal, &self.namespace);
        let agent = Component::agent(signal, &self.namespace);
        let plan = ScrapePlan::for_views(&views);

        let gateway_alerts = if plan.gateway {
            self.alerts_of(&gateway).await
        } else {
            self.rates.forget_component(&gateway.name);
            None
        };
        let agent_alerts = match &agent {
            Some(agent) if plan.agent => self.alerts_of(agent).await,
            Some(agent) => {
                self.rates.forget_component(&agent.name);
                Some(Vec::new())
            }
            None => Some(Vec::new()),
        };

        let outcomes = flow_conditions(
            signal,
            &views,
            gateway_alerts.as_deref(),
            agent_alerts.as_deref(),
        );
        for (view, flow) in views.iter().zip(outcomes) {
            let mut conditions = view.conditions.clone();
            set_condition_with_generation(
                &mut conditions,
                CONDITION_TYPE_FLOW_HEALTHY,
                flow.status,
                flow.reason,
                &flow.message,
                view.generation,
            );

            #[cfg(feature = "metrics")]
            super::metrics::inc_flow_health_evaluation(signal.as_str(), flow.reason);

            if dry_run {
                debug!("[dry-run] {} {} FlowHealthy={}/{}", signal.pipeline_kind(), view.name, flow.status, flow.reason);
                continue;
            }

            if let Err(e) = write_pipeline_conditions::<K>(
                &self.client,
                &view.name,
                &conditions,
                &[CONDITION_TYPE_FLOW_HEALTHY],
            )
            .await
            {
                warn!("Failed to write FlowHealthy of {} {}: {}", signal.pipeline_kind(), view.name, e);
            }
        }
        Ok(())
    }

    /// `FlowHealthy` of the LogPipelines served by Fluent Bit
    #[instrument(skip(self))]
    async fn evaluate_fluent_bit(&mut self, dry_run: bool) -> Result<()> {
        let api: Api<LogPipeline> = Api::all(self.client.clone());
        let views: Vec<PipelineView> = api
            .list(&ListParams::default())
            .await?
            .iter()
            .filter(|p| !p.uses_collector())
            .map(|p| p.view())
            .filter(|v| !v.deleting)
            .collect();

        let component = Component::fluent_bit(&self.namespace);
        let snapshots = if views.iter().any(is_configured) {
            self.snapshots_of(&component).await
        } else {
            self.rates.forget_component(&component.name);
            None
        };

        for view in &views {
            let result = snapshots.as_deref().map(|s| fluent_bit::flow_of(s, &view.name));
            let flow = flow_condition(SignalType::Log, is_configured(view), result.as_ref());
            let mut conditions = view.conditions.clone();
            set_condition_with_generation(
                &mut conditions,
                CONDITION_TYPE_FLOW_HEALTHY,
                flow.status,
                flow.reason,
                &flow.message,
                view.generation,
            );

            #[cfg(feature = "metrics")]
            super::metrics::inc_flow_health_evaluation(SignalType::Log.as_str(), flow.reason);

            if dry_run {
                debug!("[dry-run] LogPipeline {} FlowHealthy={}/{}", view.name, flow.status, flow.reason);
                continue;
            }
            if let Err(e) = write_pipeline_conditions::<LogPipeline>(
                &self.client,
                &view.name,
                &conditions,
                &[CONDITION_TYPE_FLOW_HEALTHY],
            )
            .await
            {
                warn!("Failed to write FlowHealthy of LogPipeline {}: {}", view.name, e);
            }
        }
        Ok(())
    }

    /// Alerts firing on any pod of one workload.
    ///
    /// `None` when no pod could be scraped.
    async fn alerts_of(&mut self, component: &Component) -> Option<Vec<Alert>> {
        let snapshots = self.snapshots_of(component).await?;
        let alerts = rules::evaluate_all(component.signal, component.role, &snapshots);
        debug!(
            "{} alerts firing on {} ({} pods scraped)",
            alerts.len(),
            component.name,
            snapshots.len()
        );
        Some(alerts)
    }

    /// Counter rates of every ready pod of one workload.
    ///
    /// Each pod is scraped on its own so counter rates are never computed
    /// across replicas. `None` when no pod could be scraped.
    async fn snapshots_of(&mut self, component: &Component) -> Option<Vec<Snapshot>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &component.namespace);
        let lp = ListParams::default().labels(&component.pod_selector());
        let targets = match pods.list(&lp).await {
            Ok(list) => scrape_targets(component, &list.items),
            Err(e) => {
                warn!("Failed to list pods of {}: {}", component.name, e);
                self.rates.forget_component(&component.name);
                return None;
            }
        };
        self.rates
            .retain(|key| !is_component_key(key, &component.name) || targets.iter().any(|t| t.key == key));

        if targets.is_empty() {
            debug!("No ready pods of {} to scrape", component.name);
            return None;
        }

        let mut snapshots = Vec::with_capacity(targets.len());
        for target in &targets {
            match self.scraper.scrape(&target.url).await {
                Ok(samples) => {
                    snapshots.push(self.rates.observe(&target.key, samples, Instant::now()));
                }
                Err(e) => {
                    warn!("Failed to scrape {} pod {}: {}", component.name, target.pod, e);
                    #[cfg(feature = "metrics")]
                    super::metrics::inc_scrape_failure(component.signal.as_str());
                    self.rates.forget(&target.key);
                }
            }
        }
        if snapshots.is_empty() {
            return None;
        }
        Some(snapshots)
    }
}

/// Which workloads an evaluation scrapes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScrapePlan {
    pub gateway: bool,
    pub agent: bool,
}

impl ScrapePlan {
    /// Only workloads serving a configured pipeline are scraped. Pipelines
    /// that are not configured still get their `FlowHealthy` written.
    pub fn for_views(views: &[PipelineView]) -> Self {
        Self {
            gateway: views.iter().any(is_configured),
            agent: views.iter().any(|v| is_configured(v) && v.needs_agent()),
        }
    }
}

/// One pod to scrape
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub pod: String,
    pub url: String,
    /// Rate history key, unique per pod
    pub key: String,
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Ready pods of a workload with an IP, sorted by name
pub fn scrape_targets(component: &Component, pods: &[Pod]) -> Vec<ScrapeTarget> {
    let mut targets: Vec<ScrapeTarget> = pods
        .iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none() && is_pod_ready(pod))
        .filter_map(|pod| {
            let ip = pod.status.as_ref()?.pod_ip.as_ref()?;
            let name = pod.name_any();
            Some(ScrapeTarget {
                url: component.pod_metrics_url(ip),
                key: pod_key(&component.name, &name),
                pod: name,
            })
        })
        .collect();
    targets.sort_by(|a, b| a.pod.cmp(&b.pod));
    targets
}

fn is_configured(view: &PipelineView) -> bool {
    is_condition_true(&view.conditions, CONDITION_TYPE_CONFIGURATION_GENERATED)
}

/// `FlowHealthy` of every pipeline given the alerts of both workloads.
///
/// A pipeline that collects through the agent is only judged when both the
/// gateway and the agent could be scraped.
pub fn flow_conditions(
    signal: SignalType,
    views: &[PipelineView],
    gateway_alerts: Option<&[Alert]>,
    agent_alerts: Option<&[Alert]>,
) -> Vec<FlowCondition> {
    views
        .iter()
        .map(|view| {
            let target = ProbeTarget::from_view(view);
            let alerts: Option<Vec<Alert>> = match (gateway_alerts, agent_alerts) {
                (Some(gateway), _) if !target.needs_agent => Some(gateway.to_vec()),
                (Some(gateway), Some(agent)) => Some(gateway.iter().chain(agent).cloned().collect()),
                _ => None,
            };
            let result = alerts.map(|alerts| probe(&target, &alerts));
            flow_condition(signal, is_configured(view), result.as_ref())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::rules::Rule;
    use super::scrape::parse_exposition;
    use super::*;
    use crate::controller::pipeline::fixtures::*;
    use crate::controller::resources::Role;
    use crate::crd::LogRuntimeInput;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;

    const NO_ALERTS: &[Alert] = &[];

    fn configured(mut view: PipelineView) -> PipelineView {
        set_condition(
            &mut view.conditions,
            CONDITION_TYPE_CONFIGURATION_GENERATED,
            CONDITION_STATUS_TRUE,
            REASON_GATEWAY_CONFIGURED,
            "ok",
        );
        view
    }

    #[test]
    fn test_unconfigured_pipeline_is_not_judged() {
        let views = vec![trace_pipeline("a", 0, "http://b:4317").view()];
        let flows = flow_conditions(SignalType::Trace, &views, None, None);
        assert_eq!(flows[0].reason, REASON_CONFIGURATION_NOT_GENERATED);
    }

    #[test]
    fn test_gateway_alerts_reach_their_pipeline() {
        let views = vec![
            configured(trace_pipeline("a", 0, "http://a:4317").view()),
            configured(trace_pipeline("b", 1, "http://b:4317").view()),
        ];
        let alerts = vec![Alert {
            rule: Rule::ExporterDroppedData,
            source: Role::Gateway,
            exporter: Some("otlp/b".to_string()),
        }];

        let flows = flow_conditions(SignalType::Trace, &views, Some(alerts.as_slice()), Some(NO_ALERTS));
        assert_eq!(flows[0].reason, REASON_FLOW_HEALTHY);
        assert_eq!(flows[1].reason, REASON_ALL_DATA_DROPPED);
    }

    #[test]
    fn test_agent_scrape_failure_only_affects_agent_pipelines() {
        let mut push = log_pipeline("push", 1, "http://b:4317");
        push.spec.input.runtime = Some(LogRuntimeInput {
            enabled: Some(false),
            ..Default::default()
        });
        let views = vec![
            configured(log_pipeline("agent", 0, "http://a:4317").view()),
            configured(push.view()),
        ];
        let flows = flow_conditions(SignalType::Log, &views, Some(NO_ALERTS), None);
        assert_eq!(flows[0].reason, REASON_PROBING_FAILED);
        assert_eq!(flows[1].reason, REASON_FLOW_HEALTHY);
    }

    #[test]
    fn test_gateway_scrape_failure() {
        let views = vec![configured(trace_pipeline("a", 0, "http://a:4317").view())];
        let flows = flow_conditions(SignalType::Trace, &views, None, Some(NO_ALERTS));
        assert_eq!(flows[0].status, CONDITION_STATUS_UNKNOWN);
    }

    fn exposition(sent: u64, failed: u64) -> String {
        format!(
            "# TYPE otelcol_exporter_sent_spans counter\n\
             otelcol_exporter_sent_spans{{exporter=\"otlp/a\"}} {sent}\n\
             # TYPE otelcol_exporter_send_failed_spans counter\n\
             otelcol_exporter_send_failed_spans{{exporter=\"otlp/a\"}} {failed}\n"
        )
    }

    fn pod(name: &str, ip: Option<&str>, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_replicas_with_old_failures_do_not_alert() {
        // one replica failed long ago, neither is failing now
        let gateway = Component::gateway(SignalType::Trace, "kyma-system");
        let mut tracker = RateTracker::default();
        let start = Instant::now();
        let pods = [("gw-a", exposition(5000, 1000)), ("gw-b", exposition(4000, 0))];

        for round in 0..3u64 {
            let now = start + EVALUATION_INTERVAL * round as u32;
            let snapshots: Vec<_> = pods
                .iter()
                .map(|(name, body)| {
                    let key = pod_key(&gateway.name, name);
                    tracker.observe(&key, parse_exposition(body).unwrap(), now)
                })
                .collect();
            let alerts = rules::evaluate_all(SignalType::Trace, Role::Gateway, &snapshots);
            assert!(alerts.is_empty(), "round {round}: {alerts:?}");
            for snapshot in &snapshots {
                assert!(snapshot.rates.iter().all(|r| r.value == 0.0));
            }
        }
    }

    #[test]
    fn test_new_failures_on_one_replica_alert() {
        let gateway = Component::gateway(SignalType::Trace, "kyma-system");
        let mut tracker = RateTracker::default();
        let start = Instant::now();
        let key_a = pod_key(&gateway.name, "gw-a");
        let key_b = pod_key(&gateway.name, "gw-b");

        tracker.observe(&key_a, parse_exposition(&exposition(5000, 1000)).unwrap(), start);
        tracker.observe(&key_b, parse_exposition(&exposition(4000, 0)).unwrap(), start);

        let later = start + EVALUATION_INTERVAL;
        let snapshots = vec![
            tracker.observe(&key_a, parse_exposition(&exposition(5000, 1300)).unwrap(), later),
            tracker.observe(&key_b, parse_exposition(&exposition(4600, 0)).unwrap(), later),
        ];
        let alerts = rules::evaluate_all(SignalType::Trace, Role::Gateway, &snapshots);

        let views = vec![configured(trace_pipeline("a", 0, "http://a:4317").view())];
        let flows = flow_conditions(SignalType::Trace, &views, Some(alerts.as_slice()), Some(NO_ALERTS));
        assert_eq!(flows[0].reason, REASON_SOME_DATA_DROPPED);
    }

    #[test]
    fn test_scrape_targets_are_ready_pods() {
        let gateway = Component::gateway(SignalType::Trace, "kyma-system");
        let pods = vec![
            pod("gw-b", Some("10.0.0.2"), true),
            pod("gw-a", Some("10.0.0.1"), true),
            pod("gw-starting", Some("10.0.0.3"), false),
            pod("gw-pending", None, true),
        ];

        let targets = scrape_targets(&gateway, &pods);
        assert_eq!(
            targets,
            vec![
                ScrapeTarget {
                    pod: "gw-a".to_string(),
                    url: "http://10.0.0.1:8888/metrics".to_string(),
                    key: "telemetry-trace-gateway/gw-a".to_string(),
                },
                ScrapeTarget {
                    pod: "gw-b".to_string(),
                    url: "http://10.0.0.2:8888/metrics".to_string(),
                    key: "telemetry-trace-gateway/gw-b".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_unconfigured_signal_still_reports_flow() {
        let views = vec![
            trace_pipeline("a", 0, "http://a:4317").view(),
            trace_pipeline("b", 1, "http://b:4317").view(),
        ];

        let plan = ScrapePlan::for_views(&views);
        assert_eq!(
            plan,
            ScrapePlan {
                gateway: false,
                agent: false
            }
        );

        let flows = flow_conditions(SignalType::Trace, &views, None, Some(NO_ALERTS));
        assert_eq!(flows.len(), 2);
        for flow in flows {
            assert_eq!(flow.status, CONDITION_STATUS_FALSE);
            assert_eq!(flow.reason, REASON_CONFIGURATION_NOT_GENERATED);
        }
    }

    #[test]
    fn test_agent_is_scraped_only_for_agent_pipelines() {
        let mut push = log_pipeline("push", 1, "http://b:4317");
        push.spec.input.runtime = Some(LogRuntimeInput {
            enabled: Some(false),
            ..Default::default()
        });
        let plan = ScrapePlan::for_views(&[configured(push.view())]);
        assert!(plan.gateway);
        assert!(!plan.agent);

        let plan = ScrapePlan::for_views(&[configured(log_pipeline("agent", 0, "http://a:4317").view())]);
        assert!(plan.agent);
    }
}
