//! Flow health of Fluent Bit pipelines
//!
//! Fluent Bit labels its input and output series with the section alias,
//! which is the pipeline name. Each pod is judged on its own and the
//! findings are merged, so one stuck node is enough to flag a pipeline.

use super::prober::ProbeResult;
use super::scrape::Snapshot;

const NAME_LABEL: &str = "name";

const INPUT_BYTES: &str = "fluentbit_input_bytes";
const OUTPUT_PROC_BYTES: &str = "fluentbit_output_proc_bytes";
const OUTPUT_DROPPED_RECORDS: &str = "fluentbit_output_dropped_records";
/// 1 while the filesystem buffer of an input is over its limit
const INPUT_STORAGE_OVERLIMIT: &str = "fluentbit_input_storage_overlimit";

fn rate(snapshot: &Snapshot, metric: &str, pipeline: &str) -> Option<f64> {
    snapshot
        .rates_of(metric)
        .filter(|s| s.labels.get(NAME_LABEL).map(String::as_str) == Some(pipeline))
        .map(|s| s.value)
        .reduce(|a, b| a + b)
}

fn flow_of_pod(snapshot: &Snapshot, pipeline: &str) -> ProbeResult {
    let read = rate(snapshot, INPUT_BYTES, pipeline);
    let processed = rate(snapshot, OUTPUT_PROC_BYTES, pipeline);
    let sent = processed.is_some_and(|r| r > 0.0);
    let dropped = rate(snapshot, OUTPUT_DROPPED_RECORDS, pipeline).is_some_and(|r| r > 0.0);
    let overlimit = snapshot
        .gauges_of(INPUT_STORAGE_OVERLIMIT)
        .any(|s| s.labels.get(NAME_LABEL).map(String::as_str) == Some(pipeline) && s.value > 0.0);

    ProbeResult {
        all_data_dropped: dropped && !sent,
        some_data_dropped: dropped && sent,
        queue_almost_full: overlimit,
        throttling: false,
        no_logs_delivered: read.is_some_and(|r| r > 0.0) && !sent,
    }
}

/// Merge the findings of every scraped Fluent Bit pod for one pipeline
pub fn flow_of(snapshots: &[Snapshot], pipeline: &str) -> ProbeResult {
    snapshots
        .iter()
        .map(|s| flow_of_pod(s, pipeline))
        .fold(ProbeResult::default(), |acc, pod| ProbeResult {
            all_data_dropped: acc.all_data_dropped || pod.all_data_dropped,
            some_data_dropped: acc.some_data_dropped || pod.some_data_dropped,
            queue_almost_full: acc.queue_almost_full || pod.queue_almost_full,
            throttling: false,
            no_logs_delivered: acc.no_logs_delivered || pod.no_logs_delivered,
        })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::super::scrape::{parse_exposition, RateTracker};
    use super::*;

    fn exposition(read: u64, processed: u64, dropped: u64, overlimit: u8) -> String {
        format!(
            "# TYPE fluentbit_input_bytes_total counter\n\
             fluentbit_input_bytes_total{{name=\"app\"}} {read}\n\
             # TYPE fluentbit_output_proc_bytes_total counter\n\
             fluentbit_output_proc_bytes_total{{name=\"app\"}} {processed}\n\
             # TYPE fluentbit_output_dropped_records_total counter\n\
             fluentbit_output_dropped_records_total{{name=\"app\"}} {dropped}\n\
             # TYPE fluentbit_input_storage_overlimit gauge\n\
             fluentbit_input_storage_overlimit{{name=\"app\"}} {overlimit}\n"
        )
    }

    /// Snapshot of one pod going from `before` to `after` in 30 seconds
    fn pod(key: &str, before: &str, after: &str) -> Snapshot {
        let mut tracker = RateTracker::default();
        let start = Instant::now();
        tracker.observe(key, parse_exposition(before).unwrap(), start);
        tracker.observe(key, parse_exposition(after).unwrap(), start + Duration::from_secs(30))
    }

    #[test]
    fn test_healthy_pipeline() {
        let snapshot = pod("fb/a", &exposition(100, 100, 0, 0), &exposition(900, 900, 0, 0));
        assert_eq!(flow_of(&[snapshot], "app"), ProbeResult::default());
    }

    #[test]
    fn test_all_and_some_dropped() {
        let dropping = pod("fb/a", &exposition(100, 100, 0, 0), &exposition(900, 100, 50, 0));
        let result = flow_of(&[dropping], "app");
        assert!(result.all_data_dropped);
        assert!(result.no_logs_delivered);

        let partial = pod("fb/a", &exposition(100, 100, 0, 0), &exposition(900, 500, 50, 0));
        let result = flow_of(&[partial], "app");
        assert!(result.some_data_dropped);
        assert!(!result.all_data_dropped);
    }

    #[test]
    fn test_reading_without_delivering() {
        let stuck = pod("fb/a", &exposition(100, 100, 0, 1), &exposition(900, 100, 0, 1));
        let result = flow_of(&[stuck], "app");
        assert!(result.no_logs_delivered);
        assert!(result.queue_almost_full);
        assert!(!result.all_data_dropped);
    }

    #[test]
    fn test_one_stuck_node_flags_the_pipeline() {
        let healthy = pod("fb/a", &exposition(100, 100, 0, 0), &exposition(900, 900, 0, 0));
        let stuck = pod("fb/b", &exposition(100, 100, 0, 0), &exposition(900, 100, 0, 0));
        assert!(flow_of(&[healthy, stuck], "app").no_logs_delivered);
    }

    #[test]
    fn test_other_pipelines_are_ignored() {
        let stuck = pod("fb/a", &exposition(100, 100, 0, 1), &exposition(900, 100, 50, 1));
        assert_eq!(flow_of(&[stuck], "other"), ProbeResult::default());
    }

    #[test]
    fn test_first_scrape_has_no_rates() {
        let mut tracker = RateTracker::default();
        let first = tracker.observe("fb/a", parse_exposition(&exposition(100, 0, 0, 0)).unwrap(), Instant::now());
        assert!(!flow_of(&[first], "app").no_logs_delivered);
    }
}
