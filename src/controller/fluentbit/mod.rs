//! Fluent Bit log engine
//!
//! LogPipelines with an HTTP or custom output are not served by the
//! collectors. They are rendered into Fluent Bit sections and run by a
//! single DaemonSet. The pass mirrors the collector pass: classify, render,
//! apply, then report conditions back onto every pipeline.

pub mod config;
pub mod resources;

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use self::config::{
    env_var_name, synthesize, tls_file_key, unescape_pem, FluentBitConfig, FluentBitPipeline, TlsFile,
};
use self::resources::{delete_fluent_bit_resources, ensure_fluent_bit_resources};
use super::components::{daemonset_health, WorkloadHealth};
use super::conditions::*;
use super::pipeline::{SignalType, TelemetryPipeline};
use super::reconciler::{ControllerState, PassOutcome};
use super::resources::{Component, WorkloadOptions};
use super::secret_ref::{value_refs, ReferenceError, ReferenceResolver, SecretReader};
use super::status::write_log_pipeline_status;
use super::tls_cert::{TlsCertValidator, TlsMaterial};
use super::validator::{rank, reference_finding, tls_finding, Finding};
use crate::crd::{Condition, LogPipeline, LogPipelineSpec, ValueType};
use crate::error::Result;
use crate::scheduler::WorkItem;

/// Every Secret a Fluent Bit pipeline points to, as (namespace, name)
pub fn secret_refs(spec: &LogPipelineSpec) -> BTreeSet<(String, String)> {
    let mut values: Vec<&ValueType> = Vec::new();
    if let Some(http) = &spec.output.http {
        values.push(&http.host);
        values.extend([&http.user, &http.password].into_iter().flatten());
        values.extend([&http.tls.ca, &http.tls.cert, &http.tls.key].into_iter().flatten());
    }
    let mut refs = value_refs(values);
    refs.extend(
        spec.variables
            .iter()
            .filter_map(|v| v.value_from.secret_key_ref.as_ref())
            .map(|r| (r.namespace.clone(), r.name.clone())),
    );
    refs
}

// ============================================================================
// Classification
// ============================================================================

#[derive(Clone, Debug)]
pub enum Outcome {
    Usable {
        pipeline: FluentBitPipeline,
        warning: Option<Finding>,
    },
    Unusable(Finding),
    Deleting,
}

#[derive(Clone, Debug)]
pub struct Classified {
    pub pipeline: LogPipeline,
    pub outcome: Outcome,
}

/// Read every Secret-backed value of a pipeline.
///
/// Output values land in the environment under their variable name, user
/// variables under the name the user gave them. TLS material is returned
/// twice: as files for the TLS Secret and as text for validation.
async fn resolve_values<R: SecretReader>(
    name: &str,
    spec: &LogPipelineSpec,
    resolver: &ReferenceResolver<R>,
) -> std::result::Result<(FluentBitPipeline, TlsMaterial), ReferenceError> {
    let mut resolved = FluentBitPipeline {
        name: name.to_string(),
        spec: spec.clone(),
        ..Default::default()
    };
    let mut material = TlsMaterial::default();

    if let Some(http) = &spec.output.http {
        for value in [Some(&http.host), http.user.as_ref(), http.password.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(var) = env_var_name(name, value) {
                let value = resolver.resolve(value).await?.value;
                resolved.env.insert(var, value.into_bytes());
            }
        }

        let tls = [
            (TlsFile::Ca, &http.tls.ca, &mut material.ca),
            (TlsFile::Cert, &http.tls.cert, &mut material.cert),
            (TlsFile::Key, &http.tls.key, &mut material.key),
        ];
        for (kind, value, text) in tls {
            let Some(value) = value.as_ref().filter(|v| v.is_set()) else {
                continue;
            };
            let value = resolver.resolve(value).await?.value;
            resolved.tls_files.insert(tls_file_key(name, kind), unescape_pem(&value));
            *text = Some(value);
        }
    }

    for variable in &spec.variables {
        let value = ValueType {
            value: None,
            value_from: Some(variable.value_from.clone()),
        };
        let value = resolver.resolve(&value).await?.value;
        resolved.env.insert(variable.name.clone(), value.into_bytes());
    }

    Ok((resolved, material))
}

/// Classify every Fluent Bit pipeline. The first failing check decides the
/// reason: admission rules, the pipeline limit, Secret references, TLS.
#[instrument(skip_all, fields(count = pipelines.len()))]
pub async fn classify<R: SecretReader>(
    pipelines: Vec<LogPipeline>,
    resolver: &ReferenceResolver<R>,
    tls: &TlsCertValidator,
    max_pipelines: usize,
) -> Vec<Classified> {
    let views: Vec<_> = pipelines.iter().map(|p| p.view()).collect();
    let eligible = rank(&views, max_pipelines);

    let mut out = Vec::with_capacity(pipelines.len());
    for pipeline in pipelines {
        let outcome = classify_one(&pipeline, &eligible, resolver, tls, max_pipelines).await;
        debug!(
            "Fluent Bit pipeline {} classified: usable={}",
            pipeline.name_any(),
            matches!(outcome, Outcome::Usable { .. })
        );
        out.push(Classified { pipeline, outcome });
    }
    out
}

async fn classify_one<R: SecretReader>(
    pipeline: &LogPipeline,
    eligible: &BTreeSet<String>,
    resolver: &ReferenceResolver<R>,
    tls: &TlsCertValidator,
    max_pipelines: usize,
) -> Outcome {
    if pipeline.meta().deletion_timestamp.is_some() {
        return Outcome::Deleting;
    }
    let name = pipeline.name_any();

    if let Err(errors) = pipeline.spec.validate() {
        let errors: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Outcome::Unusable(Finding::new(
            REASON_VALIDATION_FAILED,
            format!("Pipeline specification is invalid: {}", errors.join("; ")),
        ));
    }

    if !eligible.contains(&name) {
        return Outcome::Unusable(Finding::new(
            REASON_MAX_PIPELINES_EXCEEDED,
            format!("Maximum pipeline count limit of {max_pipelines} exceeded"),
        ));
    }

    let (resolved, material) = match resolve_values(&name, &pipeline.spec, resolver).await {
        Ok(resolved) => resolved,
        Err(e) => return Outcome::Unusable(reference_finding(&e)),
    };

    let mut warning = None;
    if material.ca.is_some() || material.cert.is_some() || material.key.is_some() {
        if let Err(e) = tls.validate(&material) {
            let finding = tls_finding(&e);
            if !e.is_warning() {
                return Outcome::Unusable(finding);
            }
            warning = Some(finding);
        }
    }

    Outcome::Usable {
        pipeline: resolved,
        warning,
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Conditions owned by the reconciler for one Fluent Bit pipeline.
///
/// `agent` is `None` when the DaemonSet is not deployed. Fluent Bit has no
/// gateway, so `GatewayHealthy` is removed.
pub fn pipeline_conditions(classified: &Classified, agent: Option<&WorkloadHealth>) -> Vec<Condition> {
    let generation = classified.pipeline.meta().generation;
    let mut conditions = classified
        .pipeline
        .status
        .clone()
        .unwrap_or_default()
        .conditions;

    let (status, reason, message) = match &classified.outcome {
        Outcome::Deleting => return conditions,
        Outcome::Unusable(finding) => {
            set_condition_with_generation(
                &mut conditions,
                CONDITION_TYPE_CONFIGURATION_GENERATED,
                CONDITION_STATUS_FALSE,
                finding.reason,
                &finding.message,
                generation,
            );
            (
                CONDITION_STATUS_TRUE,
                REASON_AGENT_NOT_REQUIRED,
                "Agent is not required by this pipeline".to_string(),
            )
        }
        Outcome::Usable { warning, .. } => {
            let (reason, message) = match warning {
                Some(w) => (w.reason, w.message.clone()),
                None => (
                    REASON_AGENT_CONFIGURED,
                    "Fluent Bit agent successfully configured".to_string(),
                ),
            };
            set_condition_with_generation(
                &mut conditions,
                CONDITION_TYPE_CONFIGURATION_GENERATED,
                CONDITION_STATUS_TRUE,
                reason,
                &message,
                generation,
            );
            match agent {
                Some(h) if h.ready => (
                    CONDITION_STATUS_TRUE,
                    REASON_AGENT_READY,
                    "Fluent Bit DaemonSet is ready".to_string(),
                ),
                Some(h) => (
                    CONDITION_STATUS_FALSE,
                    REASON_AGENT_NOT_READY,
                    format!("Fluent Bit DaemonSet is not ready: {}", h.message),
                ),
                None => (
                    CONDITION_STATUS_FALSE,
                    REASON_AGENT_NOT_READY,
                    "Fluent Bit DaemonSet is not deployed".to_string(),
                ),
            }
        }
    };
    set_condition_with_generation(
        &mut conditions,
        CONDITION_TYPE_AGENT_HEALTHY,
        status,
        reason,
        &message,
        generation,
    );
    remove_condition(&mut conditions, CONDITION_TYPE_GATEWAY_HEALTHY);

    sort_conditions(&mut conditions);
    conditions
}

fn owner_references(usable: &[&LogPipeline]) -> Vec<OwnerReference> {
    let mut owners: Vec<OwnerReference> = usable
        .iter()
        .map(|p| OwnerReference {
            api_version: SignalType::Log.api_version(),
            kind: SignalType::Log.pipeline_kind().to_string(),
            name: p.name_any(),
            uid: p.meta().uid.clone().unwrap_or_default(),
            controller: Some(false),
            block_owner_deletion: Some(false),
        })
        .collect();
    owners.sort_by(|a, b| a.name.cmp(&b.name));
    owners
}

// ============================================================================
// Pass
// ============================================================================

/// Reconcile the Fluent Bit DaemonSet and the status of every LogPipeline
/// it serves
#[instrument(skip(state))]
pub async fn reconcile_fluent_bit(state: &ControllerState) -> Result<PassOutcome> {
    let client = &state.client;
    let settings = &state.settings;
    let namespace = settings.namespace.as_str();

    let api: Api<LogPipeline> = Api::all(client.clone());
    let (pipelines, collector): (Vec<LogPipeline>, Vec<LogPipeline>) = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .partition(|p| !p.uses_collector());

    // unsupportedMode is only meaningful for Fluent Bit pipelines
    for pipeline in collector.iter().filter(|p| p.status.as_ref().is_some_and(|s| s.unsupported_mode.is_some())) {
        if !settings.dry_run {
            write_log_pipeline_status(client, &pipeline.name_any(), &[], &[], None).await?;
        }
    }

    info!("Reconciling {} Fluent Bit LogPipelines", pipelines.len());
    let resolver = ReferenceResolver::new(client.clone(), settings.reference_timeout);
    let tls = TlsCertValidator::new(settings.cert_expiry_lead_time);
    let classified = classify(pipelines, &resolver, &tls, settings.max_log_pipelines).await;

    let usable: Vec<FluentBitPipeline> = classified
        .iter()
        .filter_map(|c| match &c.outcome {
            Outcome::Usable { pipeline, .. } => Some(pipeline.clone()),
            _ => None,
        })
        .collect();

    let agent = if usable.is_empty() {
        if settings.dry_run {
            info!("[dry-run] Would delete the Fluent Bit resources");
        } else {
            delete_fluent_bit_resources(client, namespace).await?;
        }
        None
    } else {
        let config: FluentBitConfig = synthesize(&usable, namespace);
        if settings.dry_run {
            info!(
                "[dry-run] Would apply Fluent Bit configuration {} for {:?}",
                config.checksum, config.pipelines
            );
        } else {
            let owners = owner_references(
                &classified
                    .iter()
                    .filter(|c| matches!(c.outcome, Outcome::Usable { .. }))
                    .map(|c| &c.pipeline)
                    .collect::<Vec<_>>(),
            );
            let options = WorkloadOptions {
                image: settings.fluent_bit_image.clone(),
                priority_class_name: settings.priority_class_name.clone(),
            };
            ensure_fluent_bit_resources(client, namespace, &config, &owners, &options).await?;
        }
        let component = Component::fluent_bit(namespace);
        let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
        Some(match daemonsets.get_opt(&component.name).await? {
            Some(ds) => daemonset_health(&ds),
            None => WorkloadHealth::missing("DaemonSet", &component.name),
        })
    };

    for c in &classified {
        if matches!(c.outcome, Outcome::Deleting) {
            continue;
        }
        let name = c.pipeline.name_any();
        let conditions = pipeline_conditions(c, agent.as_ref());
        let unsupported_mode = Some(c.pipeline.spec.contains_custom_plugin());
        if settings.dry_run {
            debug!("[dry-run] Would write conditions of LogPipeline {}: {:?}", name, conditions);
            continue;
        }
        write_log_pipeline_status(client, &name, &conditions, RECONCILER_CONDITION_TYPES, unsupported_mode)
            .await?;
    }

    state.queues.trigger(WorkItem::Telemetry);
    Ok(PassOutcome {
        all_ready: agent.map(|h| h.ready).unwrap_or(true),
    })
}
