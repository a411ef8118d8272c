//! Watchers that turn cluster events into queue triggers

use std::collections::HashMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::WorkItem;
use crate::controller::overrides::{load_overrides, OVERRIDE_CONFIG_MAP};
use crate::controller::pipeline::{SignalType, TelemetryPipeline};
use crate::controller::reconciler::ControllerState;
use crate::controller::resources::{managed_selector, managed_signal};
use crate::crd::{LogPipeline, MetricPipeline, Telemetry, TracePipeline};

pub fn spawn_watchers(tasks: &mut JoinSet<()>, state: Arc<ControllerState>) {
    tasks.spawn(watch_pipelines::<LogPipeline>(state.clone()));
    tasks.spawn(watch_pipelines::<TracePipeline>(state.clone()));
    tasks.spawn(watch_pipelines::<MetricPipeline>(state.clone()));
    tasks.spawn(watch_secrets(state.clone()));
    tasks.spawn(watch_overrides(state.clone()));
    tasks.spawn(watch_workloads::<Deployment>(state.clone()));
    tasks.spawn(watch_workloads::<DaemonSet>(state.clone()));
    tasks.spawn(watch_telemetry(state));
}

/// Objects touched by the stream; watch errors are logged and retried with backoff
fn touched<K>(api: Api<K>, config: watcher::Config) -> impl Stream<Item = K> + Send
where
    K: Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
{
    watcher(api, config)
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!("Watch error: {}", e);
                    None
                }
            }
        })
}

async fn watch_pipelines<K: TelemetryPipeline>(state: Arc<ControllerState>) {
    info!("Watching {}s", K::SIGNAL.pipeline_kind());
    let api: Api<K> = Api::all(state.client.clone());
    let mut stream = Box::pin(touched(api, watcher::Config::default()));

    while let Some(pipeline) = stream.next().await {
        debug!("{} {} changed", K::SIGNAL.pipeline_kind(), pipeline.name_any());
        state.queues.trigger(WorkItem::Signal(K::SIGNAL));
        state.queues.trigger(WorkItem::Telemetry);
    }
}

/// Only Secrets referenced by a pipeline trigger, and only that pipeline's signal
async fn watch_secrets(state: Arc<ControllerState>) {
    info!("Watching referenced Secrets");
    let api: Api<Secret> = Api::all(state.client.clone());
    let mut stream = Box::pin(touched(api, watcher::Config::default()));

    while let Some(secret) = stream.next().await {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        let signals = state.secret_index.read().await.signals_for(&namespace, &name);
        for signal in signals {
            debug!("Secret {}/{} referenced by {} pipelines changed", namespace, name, signal);
            state.queues.trigger(WorkItem::Signal(signal));
        }
    }
}

/// Reload the overrides and rerun everything so pauses take effect at once
async fn watch_overrides(state: Arc<ControllerState>) {
    let namespace = state.settings.namespace.clone();
    info!("Watching {}/{}", namespace, OVERRIDE_CONFIG_MAP);
    let api: Api<ConfigMap> = Api::namespaced(state.client.clone(), &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={OVERRIDE_CONFIG_MAP}"));
    let mut stream = Box::pin(touched(api, config));

    while stream.next().await.is_some() {
        let overrides = match load_overrides(&state.client, &namespace).await {
            Ok(overrides) => overrides,
            Err(e) => {
                warn!("Failed to load overrides: {}", e);
                continue;
            }
        };

        if let Some(log_level) = &state.log_level {
            if let Err(e) = log_level.apply(overrides.log_level()) {
                warn!("Failed to apply log level override: {}", e);
            }
        }

        let changed = {
            let mut current = state.overrides.write().await;
            let changed = *current != overrides;
            *current = overrides;
            changed
        };
        if changed {
            info!("Overrides changed");
            state.queues.trigger_all();
        }
    }
}

/// Generated workloads changing under us are corrected by rerunning their signal
async fn watch_workloads<K>(state: Arc<ControllerState>)
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let namespace = state.settings.namespace.clone();
    info!("Watching managed {}s in {}", K::kind(&()), namespace);
    let api: Api<K> = Api::namespaced(state.client.clone(), &namespace);
    let config = watcher::Config::default().labels(&managed_selector());
    let mut stream = Box::pin(touched(api, config));

    while let Some(workload) = stream.next().await {
        if let Some(signal) = managed_signal(workload.meta()) {
            debug!("{} {} changed", K::kind(&()), workload.name_any());
            state.queues.trigger(WorkItem::Signal(signal));
        }
    }
}

async fn watch_telemetry(state: Arc<ControllerState>) {
    let namespace = state.settings.namespace.clone();
    info!("Watching Telemetry resources in {}", namespace);
    let api: Api<Telemetry> = Api::namespaced(state.client.clone(), &namespace);
    let mut stream = Box::pin(touched(api, watcher::Config::default()));
    let mut generations: HashMap<String, Option<i64>> = HashMap::new();

    while let Some(telemetry) = stream.next().await {
        let name = telemetry.name_any();
        debug!("Telemetry {} changed", name);
        state.queues.trigger(WorkItem::Telemetry);

        // enrichment and scaling settings feed every signal; status writes
        // leave the generation alone
        let generation = telemetry.metadata.generation;
        if generations.insert(name, generation) != Some(generation) {
            for signal in SignalType::ALL {
                state.queues.trigger(WorkItem::Signal(signal));
            }
        }
    }
}
