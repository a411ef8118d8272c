//! Reconciliation scheduler
//!
//! Four work items are reconciled independently: one per signal and one for
//! the Telemetry status. Each has a [`CoalescingQueue`] so at most one pass
//! per item is in flight and bursts of triggers collapse into one pass.
//! Watchers translate cluster events into triggers; workers drain the queues.

pub mod queue;
pub mod watch;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::controller::pipeline::SignalType;
use crate::controller::reconciler::{self, ControllerState};

pub use queue::{Backoff, CoalescingQueue, QueueState};

/// Resync interval after a successful pass
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Resync interval while a generated workload is not ready yet
pub const NOT_READY_RESYNC_INTERVAL: Duration = Duration::from_secs(10);
/// Poll interval of a replica that does not hold the lease
const STANDBY_INTERVAL: Duration = Duration::from_secs(5);

/// Unit of work with its own queue and worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkItem {
    Signal(SignalType),
    Telemetry,
}

impl WorkItem {
    pub const ALL: [WorkItem; 4] = [
        WorkItem::Signal(SignalType::Log),
        WorkItem::Signal(SignalType::Trace),
        WorkItem::Signal(SignalType::Metric),
        WorkItem::Telemetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItem::Signal(signal) => signal.as_str(),
            WorkItem::Telemetry => "telemetry",
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queue per work item
#[derive(Default)]
pub struct WorkQueues {
    log: CoalescingQueue,
    trace: CoalescingQueue,
    metric: CoalescingQueue,
    telemetry: CoalescingQueue,
}

impl WorkQueues {
    pub fn get(&self, item: WorkItem) -> &CoalescingQueue {
        match item {
            WorkItem::Signal(SignalType::Log) => &self.log,
            WorkItem::Signal(SignalType::Trace) => &self.trace,
            WorkItem::Signal(SignalType::Metric) => &self.metric,
            WorkItem::Telemetry => &self.telemetry,
        }
    }

    pub fn trigger(&self, item: WorkItem) {
        debug!("Triggering {} reconciliation", item);
        self.get(item).trigger();
    }

    pub fn trigger_all(&self) {
        for item in WorkItem::ALL {
            self.trigger(item);
        }
    }
}

/// Secrets referenced by the live pipelines of each signal.
///
/// Includes the references of unusable pipelines so that a Secret appearing
/// later unblocks them.
#[derive(Clone, Debug, Default)]
pub struct SecretIndex {
    by_signal: BTreeMap<SignalType, BTreeSet<(String, String)>>,
}

impl SecretIndex {
    pub fn replace(&mut self, signal: SignalType, refs: BTreeSet<(String, String)>) {
        self.by_signal.insert(signal, refs);
    }

    /// Signals with a pipeline referencing the Secret
    pub fn signals_for(&self, namespace: &str, name: &str) -> Vec<SignalType> {
        let key = (namespace.to_string(), name.to_string());
        self.by_signal
            .iter()
            .filter(|(_, refs)| refs.contains(&key))
            .map(|(signal, _)| *signal)
            .collect()
    }
}

/// Start the watchers and workers and run until one of them stops
pub async fn run(state: Arc<ControllerState>) {
    info!("Starting reconciliation scheduler");

    let mut tasks = tokio::task::JoinSet::new();
    watch::spawn_watchers(&mut tasks, state.clone());
    for item in WorkItem::ALL {
        tasks.spawn(run_worker(state.clone(), item));
    }

    // seed one pass of everything so generated objects converge on startup
    state.queues.trigger_all();

    if let Some(result) = tasks.join_next().await {
        error!("Scheduler task stopped unexpectedly: {:?}", result);
    }
    tasks.abort_all();
}

/// Drain the queue of one work item
async fn run_worker(state: Arc<ControllerState>, item: WorkItem) {
    let queue = state.queues.get(item);
    let mut backoff = Backoff::default();
    let mut delay = RESYNC_INTERVAL;

    loop {
        queue.next_within(delay).await;

        if !state.is_leader.load(Ordering::Relaxed) {
            queue.finish();
            delay = STANDBY_INTERVAL;
            continue;
        }

        let paused = {
            let overrides = state.overrides.read().await;
            match item {
                WorkItem::Signal(signal) => overrides.signal_paused(signal),
                WorkItem::Telemetry => overrides.telemetry_paused(),
            }
        };
        if paused {
            debug!("Reconciliation of {} is paused by the override ConfigMap", item);
            queue.finish();
            delay = RESYNC_INTERVAL;
            continue;
        }

        let started = Instant::now();
        let result = reconciler::reconcile(&state, item).await;

        #[cfg(feature = "metrics")]
        crate::controller::metrics::observe_reconcile_duration_seconds(
            item.as_str(),
            started.elapsed().as_secs_f64(),
        );

        delay = match result {
            Ok(outcome) => {
                backoff.reset();
                debug!("Reconciled {} in {:?}", item, started.elapsed());
                if outcome.all_ready {
                    RESYNC_INTERVAL
                } else {
                    NOT_READY_RESYNC_INTERVAL
                }
            }
            Err(e) => {
                let retry = backoff.next_delay();
                error!(
                    "Reconciliation of {} failed (retriable: {}), retrying in {:?}: {}",
                    item,
                    e.is_retriable(),
                    retry,
                    e
                );
                #[cfg(feature = "metrics")]
                crate::controller::metrics::inc_reconcile_error(item.as_str(), e.kind());
                retry
            }
        };

        if queue.finish() {
            debug!("Follow-up pass of {} queued while running", item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_index_lookup() {
        let mut index = SecretIndex::default();
        index.replace(
            SignalType::Log,
            BTreeSet::from([("default".to_string(), "backend".to_string())]),
        );
        index.replace(
            SignalType::Trace,
            BTreeSet::from([
                ("default".to_string(), "backend".to_string()),
                ("prod".to_string(), "tls".to_string()),
            ]),
        );

        assert_eq!(
            index.signals_for("default", "backend"),
            vec![SignalType::Log, SignalType::Trace]
        );
        assert_eq!(index.signals_for("prod", "tls"), vec![SignalType::Trace]);
        assert!(index.signals_for("prod", "backend").is_empty());

        index.replace(SignalType::Trace, BTreeSet::new());
        assert_eq!(index.signals_for("default", "backend"), vec![SignalType::Log]);
    }

    #[test]
    fn test_trigger_all_queues_every_item() {
        let queues = WorkQueues::default();
        queues.trigger_all();
        for item in WorkItem::ALL {
            assert_eq!(queues.get(item).state(), QueueState::Queued);
        }
    }

    #[test]
    fn test_work_item_names() {
        assert_eq!(WorkItem::Signal(SignalType::Metric).to_string(), "metric");
        assert_eq!(WorkItem::Telemetry.to_string(), "telemetry");
    }
}
