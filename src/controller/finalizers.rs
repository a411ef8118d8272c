//! Finalizer handling for the Telemetry resource
//!
//! The Telemetry resource may only go away once no pipeline of any signal
//! remains. While pipelines exist the finalizer stays and every component
//! condition names the resources that block the deletion.

use std::collections::BTreeMap;

use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::info;

use super::components::plural;
use super::pipeline::SignalType;
use super::resources::FIELD_MANAGER;
use crate::crd::{LogPipeline, MetricPipeline, Telemetry, TracePipeline};
use crate::error::Result;

/// Finalizer name used to protect the Telemetry resource
pub const TELEMETRY_FINALIZER: &str = "telemetry.kyma-project.io/finalizer";

/// Names of the remaining pipelines per signal
pub type BlockingPipelines = BTreeMap<SignalType, Vec<String>>;

async fn patch_finalizers(client: &Client, telemetry: &Telemetry, finalizers: Vec<String>) -> Result<()> {
    let namespace = telemetry.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Telemetry> = Api::namespaced(client.clone(), &namespace);

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &telemetry.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Add the finalizer if not present
pub async fn add_finalizer(client: &Client, telemetry: &Telemetry) -> Result<()> {
    if has_finalizer(telemetry) {
        return Ok(());
    }
    let mut finalizers: Vec<String> = telemetry.finalizers().to_vec();
    finalizers.push(TELEMETRY_FINALIZER.to_string());
    patch_finalizers(client, telemetry, finalizers).await?;
    info!("Added finalizer to Telemetry: {}", telemetry.name_any());
    Ok(())
}

/// Remove the finalizer so the API server can complete the deletion
pub async fn remove_finalizer(client: &Client, telemetry: &Telemetry) -> Result<()> {
    if !has_finalizer(telemetry) {
        return Ok(());
    }
    let finalizers: Vec<String> = telemetry
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != TELEMETRY_FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(client, telemetry, finalizers).await?;
    info!("Removed finalizer from Telemetry: {}", telemetry.name_any());
    Ok(())
}

/// Check if the resource is being deleted
pub fn is_being_deleted(telemetry: &Telemetry) -> bool {
    telemetry.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(telemetry: &Telemetry) -> bool {
    telemetry.finalizers().iter().any(|f| f == TELEMETRY_FINALIZER)
}

/// List every pipeline that still exists, grouped by signal
pub async fn list_blocking_pipelines(client: &Client) -> Result<BlockingPipelines> {
    let lp = ListParams::default();
    let mut blocking = BlockingPipelines::new();

    let names = Api::<LogPipeline>::all(client.clone()).list(&lp).await?;
    blocking.insert(SignalType::Log, names.iter().map(|p| p.name_any()).collect());
    let names = Api::<TracePipeline>::all(client.clone()).list(&lp).await?;
    blocking.insert(SignalType::Trace, names.iter().map(|p| p.name_any()).collect());
    let names = Api::<MetricPipeline>::all(client.clone()).list(&lp).await?;
    blocking.insert(SignalType::Metric, names.iter().map(|p| p.name_any()).collect());

    blocking.retain(|_, names| !names.is_empty());
    Ok(blocking)
}

/// Message naming the resources that block deletion, `None` when nothing blocks
pub fn blocking_message(blocking: &BlockingPipelines) -> Option<String> {
    let parts: Vec<String> = blocking
        .iter()
        .filter(|(_, names)| !names.is_empty())
        .map(|(signal, names)| {
            let mut names = names.clone();
            names.sort();
            format!("{} ({})", plural(*signal), names.join(","))
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(format!(
            "The deletion of the module is blocked. To unblock the deletion, delete the following resources: {}",
            parts.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn test_finalizer_name() {
        assert_eq!(TELEMETRY_FINALIZER, "telemetry.kyma-project.io/finalizer");
    }

    #[test]
    fn test_blocking_message_lists_kinds_and_names() {
        let blocking = BlockingPipelines::from([
            (SignalType::Trace, vec!["t1".to_string()]),
            (SignalType::Log, vec!["b".to_string(), "a".to_string()]),
            (SignalType::Metric, vec![]),
        ]);

        assert_eq!(
            blocking_message(&blocking).unwrap(),
            "The deletion of the module is blocked. To unblock the deletion, delete the following resources: LogPipelines (a,b), TracePipelines (t1)"
        );
    }

    #[test]
    fn test_nothing_blocks() {
        assert!(blocking_message(&BlockingPipelines::new()).is_none());
    }

    #[test]
    fn test_has_finalizer() {
        let mut telemetry = Telemetry::new("default", Default::default());
        assert!(!has_finalizer(&telemetry));
        assert!(!is_being_deleted(&telemetry));

        telemetry.metadata = ObjectMeta {
            finalizers: Some(vec![TELEMETRY_FINALIZER.to_string()]),
            ..telemetry.metadata
        };
        assert!(has_finalizer(&telemetry));
    }
}
