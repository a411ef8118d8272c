//! Workload readiness and condition roll-up
//!
//! Pipeline conditions are derived from the classification of a pass and the
//! readiness of the generated workloads. The Telemetry resource then carries
//! one `{Signal}ComponentsHealthy` condition per signal that surfaces the
//! first unhealthy pipeline condition verbatim.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::Api;
use kube::Client;
use tracing::debug;

use super::conditions::*;
use super::pipeline::{PipelineView, SignalType};
use super::resources::Component;
use super::validator::{Classification, Verdict};
use crate::crd::{Condition, State};
use crate::error::Result;

/// Readiness of one generated workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadHealth {
    pub ready: bool,
    pub message: String,
}

impl WorkloadHealth {
    pub(crate) fn missing(kind: &str, name: &str) -> Self {
        Self {
            ready: false,
            message: format!("{kind} {name} not found"),
        }
    }
}

/// Ready when the rollout is observed and every desired replica is ready
pub fn deployment_health(deployment: &Deployment) -> WorkloadHealth {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    let ready = status.ready_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let observed = status.observed_generation >= deployment.metadata.generation;

    if !observed || updated < desired {
        return WorkloadHealth {
            ready: false,
            message: format!("Rollout in progress: {updated}/{desired} replicas updated"),
        };
    }
    WorkloadHealth {
        ready: ready >= desired,
        message: format!("{ready}/{desired} replicas ready"),
    }
}

/// Ready when the pods on every scheduled node are updated and ready
pub fn daemonset_health(daemonset: &DaemonSet) -> WorkloadHealth {
    let status = daemonset.status.clone().unwrap_or_default();
    let desired = status.desired_number_scheduled;
    let ready = status.number_ready;
    let updated = status.updated_number_scheduled.unwrap_or(0);

    if updated < desired {
        return WorkloadHealth {
            ready: false,
            message: format!("Rollout in progress: {updated}/{desired} pods updated"),
        };
    }
    WorkloadHealth {
        ready: ready >= desired,
        message: format!("{ready}/{desired} pods ready"),
    }
}

/// Readiness of the workloads of one signal
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignalReadiness {
    /// `None` when no gateway is deployed
    pub gateway: Option<WorkloadHealth>,
    /// `None` when no agent is required
    pub agent: Option<WorkloadHealth>,
}

impl SignalReadiness {
    pub fn all_ready(&self) -> bool {
        self.gateway.as_ref().map(|g| g.ready).unwrap_or(true)
            && self.agent.as_ref().map(|a| a.ready).unwrap_or(true)
    }
}

/// Read the readiness of the generated workloads of one signal
pub async fn fetch_readiness(
    client: &Client,
    namespace: &str,
    signal: SignalType,
    agent_expected: bool,
) -> Result<SignalReadiness> {
    let gateway = Component::gateway(signal, namespace);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let gateway_health = match deployments.get_opt(&gateway.name).await? {
        Some(d) => deployment_health(&d),
        None => WorkloadHealth::missing("Deployment", &gateway.name),
    };

    let agent_health = match Component::agent(signal, namespace) {
        Some(agent) if agent_expected => {
            let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
            Some(match daemonsets.get_opt(&agent.name).await? {
                Some(ds) => daemonset_health(&ds),
                None => WorkloadHealth::missing("DaemonSet", &agent.name),
            })
        }
        _ => None,
    };

    debug!(
        "{} readiness: gateway={:?} agent={:?}",
        signal, gateway_health, agent_health
    );
    Ok(SignalReadiness {
        gateway: Some(gateway_health),
        agent: agent_health,
    })
}

// ============================================================================
// Pipeline conditions
// ============================================================================

/// Conditions owned by the reconciler for one pipeline after a pass.
///
/// Starts from the conditions currently on the resource so transition times
/// only move when a status flips.
pub fn pipeline_conditions(
    classification: &Classification,
    synthesis_error: Option<&str>,
    readiness: &SignalReadiness,
) -> Vec<Condition> {
    let view = &classification.view;
    let generation = view.generation;
    let mut conditions = view.conditions.clone();

    let usable = match &classification.verdict {
        Verdict::Deleting => return conditions,
        Verdict::Unusable(finding) => {
            set_condition_with_generation(
                &mut conditions,
                CONDITION_TYPE_CONFIGURATION_GENERATED,
                CONDITION_STATUS_FALSE,
                finding.reason,
                &finding.message,
                generation,
            );
            false
        }
        Verdict::Usable { .. } if synthesis_error.is_some() => {
            set_condition_with_generation(
                &mut conditions,
                CONDITION_TYPE_CONFIGURATION_GENERATED,
                CONDITION_STATUS_FALSE,
                REASON_SYNTHESIS_FAILED,
                &format!(
                    "Failed to generate the collector configuration: {}",
                    synthesis_error.unwrap_or_default()
                ),
                generation,
            );
            false
        }
        Verdict::Usable { warning, .. } => {
            let (reason, message) = match warning {
                Some(w) => (w.reason, w.message.clone()),
                None if view.needs_agent() => (
                    REASON_AGENT_CONFIGURED,
                    format!("{} gateway and agent successfully configured", view.signal().pipeline_kind()),
                ),
                None => (
                    REASON_GATEWAY_CONFIGURED,
                    format!("{} gateway successfully configured", view.signal().pipeline_kind()),
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
            true
        }
    };

    match &readiness.gateway {
        Some(h) if h.ready => set_condition_with_generation(
            &mut conditions,
            CONDITION_TYPE_GATEWAY_HEALTHY,
            CONDITION_STATUS_TRUE,
            REASON_GATEWAY_READY,
            "Gateway Deployment is ready",
            generation,
        ),
        Some(h) => set_condition_with_generation(
            &mut conditions,
            CONDITION_TYPE_GATEWAY_HEALTHY,
            CONDITION_STATUS_FALSE,
            REASON_GATEWAY_NOT_READY,
            &format!("Gateway Deployment is not ready: {}", h.message),
            generation,
        ),
        None => set_condition_with_generation(
            &mut conditions,
            CONDITION_TYPE_GATEWAY_HEALTHY,
            CONDITION_STATUS_FALSE,
            REASON_GATEWAY_NOT_READY,
            "Gateway Deployment is not deployed",
            generation,
        ),
    }

    if view.signal().agent_name().is_some() {
        let (status, reason, message) = match (&readiness.agent, usable && view.needs_agent()) {
            (_, false) => (
                CONDITION_STATUS_TRUE,
                REASON_AGENT_NOT_REQUIRED,
                "Agent is not required by this pipeline".to_string(),
            ),
            (Some(h), true) if h.ready => (
                CONDITION_STATUS_TRUE,
                REASON_AGENT_READY,
                "Agent DaemonSet is ready".to_string(),
            ),
            (Some(h), true) => (
                CONDITION_STATUS_FALSE,
                REASON_AGENT_NOT_READY,
                format!("Agent DaemonSet is not ready: {}", h.message),
            ),
            (None, true) => (
                CONDITION_STATUS_FALSE,
                REASON_AGENT_NOT_READY,
                "Agent DaemonSet is not deployed".to_string(),
            ),
        };
        set_condition_with_generation(
            &mut conditions,
            CONDITION_TYPE_AGENT_HEALTHY,
            status,
            reason,
            &message,
            generation,
        );
    }

    sort_conditions(&mut conditions);
    conditions
}

// ============================================================================
// Telemetry roll-up
// ============================================================================

/// Value of one `{Signal}ComponentsHealthy` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentsHealth {
    pub status: &'static str,
    pub reason: String,
    pub message: String,
}

/// Roll the pipelines of one signal up into a single condition.
///
/// Pipelines are visited by name and the first False sub-condition wins,
/// reported with the pipeline's own reason and message. A certificate about
/// to expire keeps the condition True but is surfaced as its reason.
pub fn components_health(signal: SignalType, pipelines: &[PipelineView]) -> ComponentsHealth {
    let mut live: Vec<&PipelineView> = pipelines.iter().filter(|p| !p.deleting).collect();
    if live.is_empty() {
        return ComponentsHealth {
            status: CONDITION_STATUS_TRUE,
            reason: REASON_NO_PIPELINE_DEPLOYED.to_string(),
            message: format!("No {} deployed", plural(signal)),
        };
    }
    live.sort_by(|a, b| a.name.cmp(&b.name));

    let mut types = vec![CONDITION_TYPE_CONFIGURATION_GENERATED, CONDITION_TYPE_GATEWAY_HEALTHY];
    if signal.agent_name().is_some() {
        types.push(CONDITION_TYPE_AGENT_HEALTHY);
    }
    types.push(CONDITION_TYPE_FLOW_HEALTHY);

    for pipeline in &live {
        for type_ in &types {
            if let Some(c) = find_condition(&pipeline.conditions, type_) {
                if c.status == CONDITION_STATUS_FALSE {
                    return ComponentsHealth {
                        status: CONDITION_STATUS_FALSE,
                        reason: c.reason.clone(),
                        message: c.message.clone(),
                    };
                }
            }
        }
    }

    let expiring = live.iter().find_map(|p| {
        find_condition(&p.conditions, CONDITION_TYPE_CONFIGURATION_GENERATED)
            .filter(|c| c.reason == REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE)
    });
    match expiring {
        Some(c) => ComponentsHealth {
            status: CONDITION_STATUS_TRUE,
            reason: c.reason.clone(),
            message: c.message.clone(),
        },
        None => ComponentsHealth {
            status: CONDITION_STATUS_TRUE,
            reason: REASON_COMPONENTS_RUNNING.to_string(),
            message: format!("All {} components are running", signal),
        },
    }
}

/// `Warning` when any component condition is False or carries an expiry warning
pub fn telemetry_state(conditions: &[Condition]) -> State {
    let unhealthy = SignalType::ALL.iter().any(|signal| {
        find_condition(conditions, signal.components_condition_type())
            .map(|c| {
                c.status == CONDITION_STATUS_FALSE
                    || c.reason == REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE
            })
            .unwrap_or(false)
    });
    if unhealthy {
        State::Warning
    } else {
        State::Ready
    }
}

/// Resource kind in plural, as used in user-facing messages
pub fn plural(signal: SignalType) -> String {
    format!("{}s", signal.pipeline_kind())
}
