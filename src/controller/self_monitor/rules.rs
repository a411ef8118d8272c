//! Alerting rules evaluated against collector self-metrics

use crate::controller::pipeline::SignalType;
use crate::controller::resources::Role;

use super::scrape::Snapshot;

/// Queue utilisation above which `ExporterQueueAlmostFull` fires
pub const QUEUE_ALMOST_FULL_RATIO: f64 = 0.8;

const EXPORTER_LABEL: &str = "exporter";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rule {
    ExporterSentData,
    ExporterDroppedData,
    ExporterEnqueueFailed,
    ExporterQueueAlmostFull,
    ReceiverRefusedData,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::ExporterSentData => "ExporterSentData",
            Rule::ExporterDroppedData => "ExporterDroppedData",
            Rule::ExporterEnqueueFailed => "ExporterEnqueueFailed",
            Rule::ExporterQueueAlmostFull => "ExporterQueueAlmostFull",
            Rule::ReceiverRefusedData => "ReceiverRefusedData",
        }
    }
}

/// A firing rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub rule: Rule,
    /// Workload that reported the series
    pub source: Role,
    /// Exporter the series belongs to; `None` for signal-wide series
    pub exporter: Option<String>,
}

/// Unit the collector uses in its metric names for a signal
fn data_unit(signal: SignalType) -> &'static str {
    match signal {
        SignalType::Log => "log_records",
        SignalType::Trace => "spans",
        SignalType::Metric => "metric_points",
    }
}

/// Evaluate the fixed rule set against one endpoint's snapshot
pub fn evaluate(signal: SignalType, source: Role, snapshot: &Snapshot) -> Vec<Alert> {
    let unit = data_unit(signal);
    let mut alerts = Vec::new();

    let counter_rules = [
        (Rule::ExporterSentData, format!("otelcol_exporter_sent_{unit}")),
        (Rule::ExporterDroppedData, format!("otelcol_exporter_send_failed_{unit}")),
        (Rule::ExporterEnqueueFailed, format!("otelcol_exporter_enqueue_failed_{unit}")),
        (Rule::ReceiverRefusedData, format!("otelcol_receiver_refused_{unit}")),
    ];
    for (rule, metric) in &counter_rules {
        for sample in snapshot.rates_of(metric).filter(|s| s.value > 0.0) {
            push_unique(
                &mut alerts,
                Alert {
                    rule: *rule,
                    source,
                    exporter: match rule {
                        Rule::ReceiverRefusedData => None,
                        _ => sample.labels.get(EXPORTER_LABEL).cloned(),
                    },
                },
            );
        }
    }

    for size in snapshot.gauges_of("otelcol_exporter_queue_size") {
        let capacity = snapshot
            .gauges_of("otelcol_exporter_queue_capacity")
            .find(|c| c.labels.get(EXPORTER_LABEL) == size.labels.get(EXPORTER_LABEL))
            .map(|c| c.value)
            .filter(|c| *c > 0.0);
        if let Some(capacity) = capacity {
            if size.value / capacity > QUEUE_ALMOST_FULL_RATIO {
                push_unique(
                    &mut alerts,
                    Alert {
                        rule: Rule::ExporterQueueAlmostFull,
                        source,
                        exporter: size.labels.get(EXPORTER_LABEL).cloned(),
                    },
                );
            }
        }
    }

    alerts
}

/// Union of the alerts firing on any pod of one workload
pub fn evaluate_all(signal: SignalType, source: Role, snapshots: &[Snapshot]) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for snapshot in snapshots {
        for alert in evaluate(signal, source, snapshot) {
            push_unique(&mut alerts, alert);
        }
    }
    alerts.sort_by(|a, b| (a.rule, &a.exporter).cmp(&(b.rule, &b.exporter)));
    alerts
}

fn push_unique(alerts: &mut Vec<Alert>, alert: Alert) {
    if !alerts.contains(&alert) {
        alerts.push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::self_monitor::scrape::{Labels, MetricKind, Sample};

    fn sample(name: &str, exporter: Option<&str>, value: f64, kind: MetricKind) -> Sample {
        let mut labels = Labels::new();
        if let Some(exporter) = exporter {
            labels.insert("exporter".to_string(), exporter.to_string());
        }
        Sample {
            name: name.to_string(),
            labels,
            value,
            kind,
        }
    }

    fn rate(name: &str, exporter: Option<&str>, value: f64) -> Sample {
        sample(name, exporter, value, MetricKind::Counter)
    }

    fn gauge(name: &str, exporter: &str, value: f64) -> Sample {
        sample(name, Some(exporter), value, MetricKind::Gauge)
    }

    #[test]
    fn test_counter_rules() {
        let snapshot = Snapshot {
            rates: vec![
                rate("otelcol_exporter_sent_spans", Some("otlp/a"), 5.0),
                rate("otelcol_exporter_sent_spans", Some("otlp/b"), 0.0),
                rate("otelcol_exporter_send_failed_spans", Some("otlp/b"), 1.5),
                rate("otelcol_receiver_refused_spans", None, 0.2),
            ],
            gauges: vec![],
        };

        let alerts = evaluate(SignalType::Trace, Role::Gateway, &snapshot);
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].rule, Rule::ExporterSentData);
        assert_eq!(alerts[0].exporter.as_deref(), Some("otlp/a"));
        assert_eq!(alerts[1].rule, Rule::ExporterDroppedData);
        assert_eq!(alerts[1].exporter.as_deref(), Some("otlp/b"));
        assert_eq!(alerts[2].rule, Rule::ReceiverRefusedData);
        assert!(alerts[2].exporter.is_none());
    }

    #[test]
    fn test_rules_use_signal_unit() {
        let snapshot = Snapshot {
            rates: vec![rate("otelcol_exporter_sent_spans", Some("otlp/a"), 5.0)],
            gauges: vec![],
        };
        assert!(evaluate(SignalType::Log, Role::Gateway, &snapshot).is_empty());
    }

    #[test]
    fn test_queue_almost_full() {
        let snapshot = Snapshot {
            rates: vec![],
            gauges: vec![
                gauge("otelcol_exporter_queue_size", "otlp/a", 90.0),
                gauge("otelcol_exporter_queue_capacity", "otlp/a", 100.0),
                gauge("otelcol_exporter_queue_size", "otlp/b", 80.0),
                gauge("otelcol_exporter_queue_capacity", "otlp/b", 100.0),
            ],
        };

        let alerts = evaluate(SignalType::Metric, Role::Gateway, &snapshot);
        assert_eq!(
            alerts,
            vec![Alert {
                rule: Rule::ExporterQueueAlmostFull,
                source: Role::Gateway,
                exporter: Some("otlp/a".to_string()),
            }]
        );
    }

    #[test]
    fn test_alerts_of_all_pods_are_merged() {
        let sending = Snapshot {
            rates: vec![rate("otelcol_exporter_sent_spans", Some("otlp/a"), 5.0)],
            gauges: vec![],
        };
        let failing = Snapshot {
            rates: vec![
                rate("otelcol_exporter_sent_spans", Some("otlp/a"), 2.0),
                rate("otelcol_exporter_send_failed_spans", Some("otlp/a"), 1.0),
            ],
            gauges: vec![],
        };

        let alerts = evaluate_all(SignalType::Trace, Role::Gateway, &[sending, failing]);
        let rules: Vec<Rule> = alerts.iter().map(|a| a.rule).collect();
        assert_eq!(rules, vec![Rule::ExporterSentData, Rule::ExporterDroppedData]);
    }

    #[test]
    fn test_queue_without_capacity_is_ignored() {
        let snapshot = Snapshot {
            rates: vec![],
            gauges: vec![gauge("otelcol_exporter_queue_size", "otlp/a", 90.0)],
        };
        assert!(evaluate(SignalType::Metric, Role::Gateway, &snapshot).is_empty());
    }
}
