//! Per-pipeline flow health derived from firing alerts

use crate::controller::conditions::*;
use crate::controller::config::exporter_id;
use crate::controller::pipeline::{PipelineView, SignalType};
use crate::controller::resources::Role;

use super::rules::{Alert, Rule};

/// Flow problems detected for one pipeline
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub all_data_dropped: bool,
    pub some_data_dropped: bool,
    pub queue_almost_full: bool,
    pub throttling: bool,
    /// Fluent Bit reads logs but hands nothing to its output
    pub no_logs_delivered: bool,
}

/// What a pipeline's alerts are matched against
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeTarget {
    pub name: String,
    /// Exporter id of the pipeline in the gateway document
    pub exporter: String,
    pub needs_agent: bool,
}

impl ProbeTarget {
    pub fn from_view(view: &PipelineView) -> Self {
        Self {
            name: view.name.clone(),
            exporter: exporter_id(view.output.protocol, &view.name),
            needs_agent: view.needs_agent(),
        }
    }

    fn matches(&self, alert: &Alert) -> bool {
        match alert.source {
            Role::Gateway => match &alert.exporter {
                Some(exporter) => *exporter == self.exporter,
                None => true,
            },
            // agents export to the gateway, so their alerts concern every
            // pipeline that collects through them
            Role::Agent => self.needs_agent,
        }
    }
}

/// Fold the alerts that concern `target` into a probe result
pub fn probe(target: &ProbeTarget, alerts: &[Alert]) -> ProbeResult {
    let firing = |rule: Rule| {
        alerts
            .iter()
            .any(|a| a.rule == rule && target.matches(a))
    };

    let sent = firing(Rule::ExporterSentData);
    let dropped = firing(Rule::ExporterDroppedData) || firing(Rule::ExporterEnqueueFailed);

    ProbeResult {
        all_data_dropped: dropped && !sent,
        some_data_dropped: dropped && sent,
        queue_almost_full: firing(Rule::ExporterQueueAlmostFull),
        throttling: firing(Rule::ReceiverRefusedData),
        no_logs_delivered: false,
    }
}

/// Value of the `FlowHealthy` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowCondition {
    pub status: &'static str,
    pub reason: &'static str,
    pub message: String,
}

impl FlowCondition {
    fn new(status: &'static str, reason: &'static str, message: String) -> Self {
        Self {
            status,
            reason,
            message,
        }
    }
}

fn data_noun(signal: SignalType) -> &'static str {
    match signal {
        SignalType::Log => "logs",
        SignalType::Trace => "spans",
        SignalType::Metric => "metrics",
    }
}

/// Map a probe to `FlowHealthy`; the first matching case wins.
///
/// `configured` is whether the pipeline's configuration has been generated,
/// `probe` is `None` when the collector could not be scraped.
pub fn flow_condition(
    signal: SignalType,
    configured: bool,
    probe: Option<&ProbeResult>,
) -> FlowCondition {
    let noun = data_noun(signal);

    if !configured {
        return FlowCondition::new(
            CONDITION_STATUS_FALSE,
            REASON_CONFIGURATION_NOT_GENERATED,
            "No data flows because the pipeline configuration was not generated".to_string(),
        );
    }
    let Some(probe) = probe else {
        return FlowCondition::new(
            CONDITION_STATUS_UNKNOWN,
            REASON_PROBING_FAILED,
            "Could not determine the health of the telemetry flow".to_string(),
        );
    };

    if probe.all_data_dropped {
        FlowCondition::new(
            CONDITION_STATUS_FALSE,
            REASON_ALL_DATA_DROPPED,
            format!("Backend is not reachable or rejecting {noun}. All {noun} are dropped."),
        )
    } else if probe.some_data_dropped {
        FlowCondition::new(
            CONDITION_STATUS_FALSE,
            REASON_SOME_DATA_DROPPED,
            format!("Backend is reachable, but rejecting {noun}. Some {noun} are dropped."),
        )
    } else if probe.no_logs_delivered {
        FlowCondition::new(
            CONDITION_STATUS_FALSE,
            REASON_NO_LOGS_DELIVERED,
            "Backend is not reachable or rejecting logs. Logs are buffered and not yet dropped.".to_string(),
        )
    } else if probe.queue_almost_full {
        FlowCondition::new(
            CONDITION_STATUS_FALSE,
            REASON_BUFFER_FILLING_UP,
            format!("Buffer nearing capacity. Incoming {noun} rate exceeds export rate."),
        )
    } else if probe.throttling {
        FlowCondition::new(
            CONDITION_STATUS_FALSE,
            REASON_GATEWAY_THROTTLING,
            format!("Gateway is refusing {noun} due to high load."),
        )
    } else {
        FlowCondition::new(
            CONDITION_STATUS_TRUE,
            REASON_FLOW_HEALTHY,
            "No problems detected in the telemetry flow".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, needs_agent: bool) -> ProbeTarget {
        ProbeTarget {
            name: name.to_string(),
            exporter: format!("otlp/{name}"),
            needs_agent,
        }
    }

    fn alert(rule: Rule, source: Role, exporter: Option<&str>) -> Alert {
        Alert {
            rule,
            source,
            exporter: exporter.map(str::to_string),
        }
    }

    #[test]
    fn test_all_vs_some_dropped() {
        let dropping = vec![alert(Rule::ExporterDroppedData, Role::Gateway, Some("otlp/a"))];
        assert!(probe(&target("a", false), &dropping).all_data_dropped);

        let mut partial = dropping.clone();
        partial.push(alert(Rule::ExporterSentData, Role::Gateway, Some("otlp/a")));
        let result = probe(&target("a", false), &partial);
        assert!(!result.all_data_dropped);
        assert!(result.some_data_dropped);
    }

    #[test]
    fn test_exporter_alerts_match_only_their_pipeline() {
        let alerts = vec![alert(Rule::ExporterEnqueueFailed, Role::Gateway, Some("otlp/a"))];
        assert_eq!(probe(&target("b", false), &alerts), ProbeResult::default());
    }

    #[test]
    fn test_signal_wide_alerts_match_every_pipeline() {
        let alerts = vec![alert(Rule::ReceiverRefusedData, Role::Gateway, None)];
        assert!(probe(&target("a", false), &alerts).throttling);
        assert!(probe(&target("b", true), &alerts).throttling);
    }

    #[test]
    fn test_agent_alerts_match_agent_pipelines() {
        let alerts = vec![alert(Rule::ExporterQueueAlmostFull, Role::Agent, Some("otlp"))];
        assert!(probe(&target("a", true), &alerts).queue_almost_full);
        assert!(!probe(&target("b", false), &alerts).queue_almost_full);
    }

    #[test]
    fn test_flow_condition_order() {
        let everything = ProbeResult {
            all_data_dropped: true,
            some_data_dropped: true,
            queue_almost_full: true,
            throttling: true,
            no_logs_delivered: true,
        };
        assert_eq!(
            flow_condition(SignalType::Trace, false, Some(&everything)).reason,
            REASON_CONFIGURATION_NOT_GENERATED
        );
        assert_eq!(
            flow_condition(SignalType::Trace, true, Some(&everything)).reason,
            REASON_ALL_DATA_DROPPED
        );

        let throttled = ProbeResult {
            queue_almost_full: true,
            throttling: true,
            ..Default::default()
        };
        assert_eq!(
            flow_condition(SignalType::Log, true, Some(&throttled)).reason,
            REASON_BUFFER_FILLING_UP
        );
    }

    #[test]
    fn test_undelivered_logs_rank_above_a_filling_buffer() {
        let stuck = ProbeResult {
            no_logs_delivered: true,
            queue_almost_full: true,
            ..Default::default()
        };
        let condition = flow_condition(SignalType::Log, true, Some(&stuck));
        assert_eq!(condition.status, CONDITION_STATUS_FALSE);
        assert_eq!(condition.reason, REASON_NO_LOGS_DELIVERED);

        let dropping = ProbeResult {
            some_data_dropped: true,
            ..stuck
        };
        assert_eq!(
            flow_condition(SignalType::Log, true, Some(&dropping)).reason,
            REASON_SOME_DATA_DROPPED
        );
    }

    #[test]
    fn test_probing_failed_is_unknown() {
        let condition = flow_condition(SignalType::Metric, true, None);
        assert_eq!(condition.status, CONDITION_STATUS_UNKNOWN);
        assert_eq!(condition.reason, REASON_PROBING_FAILED);
    }

    #[test]
    fn test_healthy_flow() {
        let condition = flow_condition(SignalType::Metric, true, Some(&ProbeResult::default()));
        assert_eq!(condition.status, CONDITION_STATUS_TRUE);
        assert_eq!(condition.reason, REASON_FLOW_HEALTHY);
    }
}
