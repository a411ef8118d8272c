//! Status subresource writes
//!
//! The reconciler and the self-monitor both write pipeline conditions. Each
//! writer reads the current object, replaces only the condition types it
//! owns and writes the status back with the read `resourceVersion`. A
//! conflict means another writer got there first; the write is retried on a
//! fresh read.

use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, warn};

use super::conditions::{merge_owned_conditions, sort_conditions};
use super::pipeline::TelemetryPipeline;
use crate::crd::{Condition, LogPipeline, Telemetry, TelemetryStatus};
use crate::error::{Error, Result};

const MAX_CONFLICT_RETRIES: usize = 5;

/// Outcome of a guarded status write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
    /// The object no longer exists
    Gone,
}

/// Merge the owned condition types into a pipeline's status
pub async fn write_pipeline_conditions<K: TelemetryPipeline>(
    client: &Client,
    name: &str,
    desired: &[Condition],
    owned: &[&str],
) -> Result<WriteOutcome> {
    update_pipeline_status::<K, _>(client, name, |current| {
        let conditions = current.conditions_mut();
        merge_owned_conditions(conditions, desired, owned);
        sort_conditions(conditions);
    })
    .await
}

/// Merge the owned conditions and set `unsupportedMode` of a LogPipeline.
///
/// `None` removes the flag; OTLP pipelines do not carry it.
pub async fn write_log_pipeline_status(
    client: &Client,
    name: &str,
    desired: &[Condition],
    owned: &[&str],
    unsupported_mode: Option<bool>,
) -> Result<WriteOutcome> {
    update_pipeline_status::<LogPipeline, _>(client, name, |current| {
        let conditions = current.conditions_mut();
        merge_owned_conditions(conditions, desired, owned);
        sort_conditions(conditions);
        if let Some(status) = current.status.as_mut() {
            status.unsupported_mode = unsupported_mode;
        }
    })
    .await
}

/// Read, mutate and replace the status of a pipeline, retrying on conflicts.
///
/// Nothing is written when the mutation leaves the status unchanged.
async fn update_pipeline_status<K, F>(client: &Client, name: &str, mutate: F) -> Result<WriteOutcome>
where
    K: TelemetryPipeline,
    F: Fn(&mut K),
{
    let api: Api<K> = Api::all(client.clone());

    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut current) = api.get_opt(name).await? else {
            return Ok(WriteOutcome::Gone);
        };

        let before = serde_json::to_value(&current)?;
        mutate(&mut current);
        if serde_json::to_value(&current)? == before {
            return Ok(WriteOutcome::Unchanged);
        }

        let data = serde_json::to_vec(&current)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => {
                debug!("Updated status of {} {}", K::SIGNAL.pipeline_kind(), name);
                return Ok(WriteOutcome::Written);
            }
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < MAX_CONFLICT_RETRIES => {
                debug!(
                    "Status conflict on {} {} (attempt {})",
                    K::SIGNAL.pipeline_kind(),
                    name,
                    attempt
                );
            }
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(WriteOutcome::Gone),
            Err(e) => {
                warn!(
                    "Failed to write status of {} {}: {}",
                    K::SIGNAL.pipeline_kind(),
                    name,
                    e
                );
                return Err(Error::KubeError(e));
            }
        }
    }
}

/// Replace the status of the Telemetry resource
pub async fn write_telemetry_status(
    client: &Client,
    namespace: &str,
    name: &str,
    desired: &TelemetryStatus,
) -> Result<WriteOutcome> {
    let api: Api<Telemetry> = Api::namespaced(client.clone(), namespace);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut current) = api.get_opt(name).await? else {
            return Ok(WriteOutcome::Gone);
        };

        let mut next = desired.clone();
        sort_conditions(&mut next.conditions);
        if current.status.as_ref() == Some(&next) {
            return Ok(WriteOutcome::Unchanged);
        }
        current.status = Some(next);

        let data = serde_json::to_vec(&current)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => return Ok(WriteOutcome::Written),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < MAX_CONFLICT_RETRIES => {
                debug!("Status conflict on Telemetry {} (attempt {})", name, attempt);
            }
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(WriteOutcome::Gone),
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
}
