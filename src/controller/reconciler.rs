//! Reconciliation passes
//!
//! A signal pass lists every pipeline of the signal, classifies it, merges
//! the usable ones into one collector configuration and applies the
//! generated objects. The Telemetry pass rolls the pipeline conditions up
//! into the status of the Telemetry resource and guards its deletion.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, Namespace};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::components::{components_health, fetch_readiness, pipeline_conditions, telemetry_state, SignalReadiness};
use super::conditions::*;
use super::config::{synthesizer_for, BuildOptions, SynthesizedConfig};
use super::finalizers::{
    add_finalizer, blocking_message, has_finalizer, is_being_deleted, list_blocking_pipelines,
    remove_finalizer,
};
use super::overrides::Overrides;
use super::pipeline::{PipelineView, SignalType, TelemetryPipeline};
use super::resources::{
    delete_signal_resources, ensure_signal_resources, otlp_endpoints, owner_references,
    WorkloadOptions,
};
use super::fluentbit::reconcile_fluent_bit;
use super::secret_ref::ReferenceResolver;
use super::selector::LabelAllowList;
use super::status::{write_pipeline_conditions, write_telemetry_status};
use super::tls_cert::TlsCertValidator;
use super::validator::{self, PipelineValidator, Verdict};
use crate::crd::{
    Condition, GatewayEndpoints, LogPipeline, MetricPipeline, State, Telemetry, TelemetrySpec,
    TelemetryStatus, TracePipeline,
};
use crate::error::{Error, Result};
use crate::scheduler::{SecretIndex, WorkItem, WorkQueues};
use crate::telemetry::LogLevel;

/// Gateway replicas when the Telemetry resource does not set any
pub const DEFAULT_GATEWAY_REPLICAS: i32 = 2;

/// Operator-wide settings taken from the command line
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// Namespace of the Telemetry resource and the generated workloads
    pub namespace: String,
    pub collector_image: String,
    pub fluent_bit_image: String,
    pub priority_class_name: Option<String>,
    /// Cluster name used when the Telemetry resource does not set one
    pub cluster_name: String,
    pub max_log_pipelines: usize,
    pub max_trace_pipelines: usize,
    pub max_metric_pipelines: usize,
    pub cert_expiry_lead_time: chrono::Duration,
    pub reference_timeout: Duration,
    /// Compute everything but write nothing
    pub dry_run: bool,
}

impl OperatorSettings {
    pub fn max_pipelines(&self, signal: SignalType) -> usize {
        match signal {
            SignalType::Log => self.max_log_pipelines,
            SignalType::Trace => self.max_trace_pipelines,
            SignalType::Metric => self.max_metric_pipelines,
        }
    }

    fn workload_options(&self) -> WorkloadOptions {
        WorkloadOptions {
            image: self.collector_image.clone(),
            priority_class_name: self.priority_class_name.clone(),
        }
    }
}

/// A pipeline left out of the last pass and why
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnusablePipeline {
    pub name: String,
    pub reason: String,
}

/// Outcome of the last pass of one signal
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSnapshot {
    pub signal: String,
    pub usable: Vec<String>,
    pub unusable: Vec<UnusablePipeline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_error: Option<String>,
    pub gateway_ready: Option<bool>,
    pub agent_ready: Option<bool>,
    pub completed_at: DateTime<Utc>,
}

/// Shared state for the scheduler, the self-monitor and the REST API
pub struct ControllerState {
    pub client: Client,
    pub settings: OperatorSettings,
    pub is_leader: Arc<AtomicBool>,
    pub overrides: RwLock<Overrides>,
    pub queues: WorkQueues,
    pub secret_index: RwLock<SecretIndex>,
    pub log_level: Option<LogLevel>,
    last_good: Mutex<BTreeMap<SignalType, LastGoodConfig>>,
    snapshots: RwLock<BTreeMap<SignalType, SignalSnapshot>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        settings: OperatorSettings,
        is_leader: Arc<AtomicBool>,
        overrides: Overrides,
        log_level: Option<LogLevel>,
    ) -> Self {
        Self {
            client,
            settings,
            is_leader,
            overrides: RwLock::new(overrides),
            queues: WorkQueues::default(),
            secret_index: RwLock::new(SecretIndex::default()),
            log_level,
            last_good: Mutex::new(BTreeMap::new()),
            snapshots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Snapshots of the last pass of every signal that completed one
    pub async fn snapshots(&self) -> Vec<SignalSnapshot> {
        self.snapshots.read().await.values().cloned().collect()
    }

    async fn has_gateway(&self, signal: SignalType) -> bool {
        self.snapshots
            .read()
            .await
            .get(&signal)
            .map(|s| !s.usable.is_empty())
            .unwrap_or(false)
    }
}

/// Result of a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassOutcome {
    /// Everything reconciled is ready; otherwise the next resync comes sooner
    pub all_ready: bool,
}

/// What was applied by the last successful synthesis of a signal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastGoodConfig {
    pub checksum: String,
    pub needs_agent: bool,
}

impl LastGoodConfig {
    pub fn of(config: &SynthesizedConfig) -> Self {
        Self {
            checksum: config.checksum.clone(),
            needs_agent: config.needs_agent(),
        }
    }
}

/// What a signal pass does with the generated objects
#[derive(Debug)]
pub enum PassPlan {
    /// No usable pipeline is left; every generated object goes away
    Teardown,
    Apply(SynthesizedConfig),
    /// Synthesis failed; the objects of the last good configuration stay
    /// untouched and the error is reported on the pipelines
    KeepLastGood {
        error: String,
        last_good: Option<LastGoodConfig>,
    },
}

/// Decide the outcome of a signal pass.
///
/// `synthesized` is `None` when no pipeline is usable.
pub fn plan_pass(
    synthesized: Option<Result<SynthesizedConfig>>,
    last_good: Option<LastGoodConfig>,
) -> PassPlan {
    match synthesized {
        None => PassPlan::Teardown,
        Some(Ok(config)) => PassPlan::Apply(config),
        Some(Err(e)) => PassPlan::KeepLastGood {
            error: e.to_string(),
            last_good,
        },
    }
}

/// Run one pass of a work item
pub async fn reconcile(state: &ControllerState, item: WorkItem) -> Result<PassOutcome> {
    match item {
        WorkItem::Signal(SignalType::Log) => {
            // both engines run even if one fails
            let collector = reconcile_signal::<LogPipeline>(state).await;
            let fluent_bit = reconcile_fluent_bit(state).await;
            Ok(PassOutcome {
                all_ready: collector?.all_ready && fluent_bit?.all_ready,
            })
        }
        WorkItem::Signal(SignalType::Trace) => reconcile_signal::<TracePipeline>(state).await,
        WorkItem::Signal(SignalType::Metric) => reconcile_signal::<MetricPipeline>(state).await,
        WorkItem::Telemetry => reconcile_telemetry(state).await,
    }
}

async fn list_views<K: TelemetryPipeline>(client: &Client) -> Result<Vec<PipelineView>> {
    let api: Api<K> = Api::all(client.clone());
    let list = api.list(&ListParams::default()).await?;
    Ok(list.iter().map(|p| p.view()).collect())
}

/// Views of the pipelines served by the collectors
pub fn collector_views<K: TelemetryPipeline>(pipelines: &[K]) -> Vec<PipelineView> {
    pipelines
        .iter()
        .filter(|p| p.uses_collector())
        .map(|p| p.view())
        .collect()
}

async fn list_signal_views(client: &Client, signal: SignalType) -> Result<Vec<PipelineView>> {
    match signal {
        SignalType::Log => list_views::<LogPipeline>(client).await,
        SignalType::Trace => list_views::<TracePipeline>(client).await,
        SignalType::Metric => list_views::<MetricPipeline>(client).await,
    }
}

// ============================================================================
// Signal pass
// ============================================================================

#[instrument(skip(state), fields(signal = %K::SIGNAL))]
async fn reconcile_signal<K: TelemetryPipeline>(state: &ControllerState) -> Result<PassOutcome> {
    let signal = K::SIGNAL;
    let client = &state.client;
    let settings = &state.settings;
    let namespace = settings.namespace.as_str();

    let pipelines = Api::<K>::all(client.clone()).list(&ListParams::default()).await?.items;
    let refs = pipelines
        .iter()
        .filter(|p| p.meta().deletion_timestamp.is_none())
        .flat_map(|p| p.referenced_secrets())
        .collect();
    state.secret_index.write().await.replace(signal, refs);

    let views = collector_views(&pipelines);
    info!("Reconciling {} {}s", views.len(), signal.pipeline_kind());

    let resolver = ReferenceResolver::new(client.clone(), settings.reference_timeout);
    let tls = TlsCertValidator::new(settings.cert_expiry_lead_time);
    let synthesizer = synthesizer_for(signal);
    let classified = PipelineValidator {
        resolver: &resolver,
        tls: &tls,
        synthesizer: synthesizer.as_ref(),
        max_pipelines: settings.max_pipelines(signal),
    }
    .classify(views)
    .await;
    let usable = validator::usable(&classified);
    let unusable: Vec<UnusablePipeline> = classified
        .iter()
        .filter_map(|c| match &c.verdict {
            Verdict::Unusable(finding) => Some(UnusablePipeline {
                name: c.view.name.clone(),
                reason: finding.reason.to_string(),
            }),
            _ => None,
        })
        .collect();

    #[cfg(feature = "metrics")]
    super::metrics::set_pipeline_counts(signal.as_str(), usable.len(), unusable.len());

    let prepared = if usable.is_empty() {
        None
    } else {
        let telemetry = find_telemetry(client, namespace).await?;
        let opts = build_options(client, settings, telemetry.as_ref()).await?;
        let replicas = telemetry
            .as_ref()
            .and_then(|t| gateway_replicas(&t.spec, signal))
            .unwrap_or(DEFAULT_GATEWAY_REPLICAS);
        Some((opts, replicas))
    };
    let synthesized = prepared
        .as_ref()
        .map(|(opts, _)| synthesizer.synthesize(&usable, opts));
    let last_good = state.last_good.lock().await.get(&signal).cloned();

    let mut synthesis_error = None;
    let mut checksum = None;
    let readiness = match plan_pass(synthesized, last_good) {
        PassPlan::Teardown => {
            state.last_good.lock().await.remove(&signal);
            if settings.dry_run {
                info!("[dry-run] Would delete all generated {} resources", signal);
            } else {
                delete_signal_resources(client, namespace, signal).await?;
            }
            SignalReadiness::default()
        }
        PassPlan::Apply(config) => {
            #[cfg(feature = "metrics")]
            {
                super::metrics::set_generated_config_bytes(signal.as_str(), "gateway", config.gateway.yaml.len());
                let agent_bytes = config.agent.as_ref().map(|a| a.yaml.len()).unwrap_or(0);
                super::metrics::set_generated_config_bytes(signal.as_str(), "agent", agent_bytes);
            }

            let replicas = prepared
                .as_ref()
                .map(|(_, replicas)| *replicas)
                .unwrap_or(DEFAULT_GATEWAY_REPLICAS);
            checksum = Some(config.checksum.clone());
            if settings.dry_run {
                info!(
                    "[dry-run] Would apply {} configuration {} for {:?}",
                    signal, config.checksum, config.pipelines
                );
            } else {
                ensure_signal_resources(
                    client,
                    namespace,
                    &config,
                    &owner_references(&usable),
                    replicas,
                    &settings.workload_options(),
                )
                .await?;
            }
            let applied = LastGoodConfig::of(&config);
            state.last_good.lock().await.insert(signal, applied.clone());
            fetch_readiness(client, namespace, signal, applied.needs_agent).await?
        }
        PassPlan::KeepLastGood { error, last_good } => {
            warn!(
                "Failed to synthesize {} configuration, keeping the last good one: {}",
                signal, error
            );
            synthesis_error = Some(error);
            checksum = last_good.as_ref().map(|c| c.checksum.clone());
            let needs_agent = last_good.map(|c| c.needs_agent).unwrap_or(false);
            fetch_readiness(client, namespace, signal, needs_agent).await?
        }
    };

    for classification in &classified {
        if matches!(classification.verdict, Verdict::Deleting) {
            continue;
        }
        let conditions = pipeline_conditions(classification, synthesis_error.as_deref(), &readiness);
        if settings.dry_run {
            debug!(
                "[dry-run] Would write conditions of {} {}: {:?}",
                signal.pipeline_kind(),
                classification.view.name,
                conditions
            );
            continue;
        }
        write_pipeline_conditions::<K>(
            client,
            &classification.view.name,
            &conditions,
            RECONCILER_CONDITION_TYPES,
        )
        .await?;
    }

    let snapshot = SignalSnapshot {
        signal: signal.as_str().to_string(),
        usable: usable.iter().map(|p| p.view.name.clone()).collect(),
        unusable,
        checksum,
        synthesis_error,
        gateway_ready: readiness.gateway.as_ref().map(|h| h.ready),
        agent_ready: readiness.agent.as_ref().map(|h| h.ready),
        completed_at: Utc::now(),
    };
    state.snapshots.write().await.insert(signal, snapshot);
    state.queues.trigger(WorkItem::Telemetry);

    Ok(PassOutcome {
        all_ready: readiness.all_ready(),
    })
}

/// The Telemetry resource in the operator namespace, if one exists
async fn find_telemetry(client: &Client, namespace: &str) -> Result<Option<Telemetry>> {
    let api: Api<Telemetry> = Api::namespaced(client.clone(), namespace);
    let mut items = api.list(&ListParams::default()).await?.items;
    items.sort_by_key(|t| t.metadata.creation_timestamp.clone().map(|t| t.0));
    Ok(items.into_iter().find(|t| !is_being_deleted(t)))
}

/// Replicas requested for the gateway of a signal; out-of-range values are ignored
pub fn gateway_replicas(spec: &TelemetrySpec, signal: SignalType) -> Option<i32> {
    let signal_spec = match signal {
        SignalType::Log => &spec.log,
        SignalType::Trace => &spec.trace,
        SignalType::Metric => &spec.metric,
    };
    TelemetrySpec::gateway_replicas(signal_spec).filter(|r| (1..=10).contains(r))
}

async fn build_options(
    client: &Client,
    settings: &OperatorSettings,
    telemetry: Option<&Telemetry>,
) -> Result<BuildOptions> {
    let enrichments = telemetry.and_then(|t| t.spec.enrichments.as_ref());
    if let Some(Err(errors)) = telemetry.map(|t| t.spec.validate()) {
        warn!(
            "Telemetry resource has invalid settings, ignoring them: {}",
            errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
        );
    }

    let cluster_uid = Api::<Namespace>::all(client.clone())
        .get_opt("kube-system")
        .await?
        .and_then(|ns| ns.metadata.uid)
        .unwrap_or_default();

    Ok(BuildOptions {
        namespace: settings.namespace.clone(),
        cluster_name: enrichments
            .and_then(|e| e.cluster.as_ref())
            .map(|c| c.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| settings.cluster_name.clone()),
        cluster_uid,
        pod_labels: LabelAllowList::new(
            enrichments
                .map(|e| e.extract_pod_labels.as_slice())
                .unwrap_or_default(),
        ),
    })
}

// ============================================================================
// Telemetry pass
// ============================================================================

#[instrument(skip(state))]
async fn reconcile_telemetry(state: &ControllerState) -> Result<PassOutcome> {
    let api: Api<Telemetry> = Api::namespaced(state.client.clone(), &state.settings.namespace);
    let items = api.list(&ListParams::default()).await?.items;

    let mut all_ready = true;
    for telemetry in &items {
        all_ready &= reconcile_one_telemetry(state, telemetry).await?;
    }
    Ok(PassOutcome { all_ready })
}

#[instrument(skip(state, telemetry), fields(name = %telemetry.name_any()))]
async fn reconcile_one_telemetry(state: &ControllerState, telemetry: &Telemetry) -> Result<bool> {
    let client = &state.client;
    let namespace = state.settings.namespace.as_str();
    let name = telemetry.name_any();
    let dry_run = state.settings.dry_run;
    let current = telemetry.status.clone().unwrap_or_default();

    if is_being_deleted(telemetry) {
        if !has_finalizer(telemetry) {
            return Ok(true);
        }
        let blocking = list_blocking_pipelines(client).await?;
        if let Some(message) = blocking_message(&blocking) {
            warn!("Deletion of Telemetry {} is blocked: {}", name, message);
            let status = blocked_status(&current, &message);
            if !dry_run {
                if current.state != State::Warning {
                    emit_event(client, telemetry, "Warning", REASON_RESOURCE_BLOCKS_DELETION, &message).await?;
                }
                write_telemetry_status(client, namespace, &name, &status).await?;
            }
            return Err(Error::DeletionBlocked(message));
        }

        info!("No pipelines left, completing deletion of Telemetry {}", name);
        if !dry_run {
            let status = TelemetryStatus {
                state: State::Deleting,
                ..current
            };
            write_telemetry_status(client, namespace, &name, &status).await?;
            remove_finalizer(client, telemetry).await?;
        }
        return Ok(true);
    }

    if !dry_run {
        add_finalizer(client, telemetry).await?;
    }

    let mut conditions = current.conditions.clone();
    let mut with_gateway = Vec::new();
    for signal in SignalType::ALL {
        let views = list_signal_views(client, signal).await?;
        let health = components_health(signal, &views);
        set_condition_with_generation(
            &mut conditions,
            signal.components_condition_type(),
            health.status,
            &health.reason,
            &health.message,
            telemetry.metadata.generation,
        );
        if state.has_gateway(signal).await {
            with_gateway.push(signal);
        }
    }

    let status = TelemetryStatus {
        state: telemetry_state(&conditions),
        conditions,
        endpoints: gateway_endpoints(&with_gateway, namespace),
    };
    if dry_run {
        debug!("[dry-run] Would write Telemetry status: {:?}", status);
        return Ok(status.state == State::Ready);
    }

    if status.state != current.state {
        info!("Telemetry {} is now {}", name, status.state);
        let event_type = if status.state == State::Ready { "Normal" } else { "Warning" };
        emit_event(client, telemetry, event_type, "StateChanged", &format!("Telemetry is {}", status.state)).await?;
    }
    write_telemetry_status(client, namespace, &name, &status).await?;
    Ok(status.state == State::Ready)
}

/// Status of a Telemetry resource whose deletion waits for pipelines
pub fn blocked_status(current: &TelemetryStatus, message: &str) -> TelemetryStatus {
    let mut conditions: Vec<Condition> = current.conditions.clone();
    for signal in SignalType::ALL {
        set_condition(
            &mut conditions,
            signal.components_condition_type(),
            CONDITION_STATUS_FALSE,
            REASON_RESOURCE_BLOCKS_DELETION,
            message,
        );
    }
    TelemetryStatus {
        state: State::Warning,
        conditions,
        endpoints: current.endpoints.clone(),
    }
}

/// Push endpoints of the gateways that exist
pub fn gateway_endpoints(signals: &[SignalType], namespace: &str) -> Option<GatewayEndpoints> {
    if signals.is_empty() {
        return None;
    }
    let endpoint = |signal: SignalType| signals.contains(&signal).then(|| otlp_endpoints(signal, namespace));
    Some(GatewayEndpoints {
        logs: endpoint(SignalType::Log),
        traces: endpoint(SignalType::Trace),
        metrics: endpoint(SignalType::Metric),
    })
}

/// Emit a Kubernetes Event on the Telemetry resource
async fn emit_event(
    client: &Client,
    telemetry: &Telemetry,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = telemetry.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now());
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", telemetry.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: telemetry.object_ref(&()),
        first_timestamp: Some(time.clone()),
        last_timestamp: Some(time),
        count: Some(1),
        ..Default::default()
    };

    events.create(&PostParams::default(), &event).await?;
    Ok(())
}
