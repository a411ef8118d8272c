//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Per-pipeline condition types
pub const CONDITION_TYPE_CONFIGURATION_GENERATED: &str = "ConfigurationGenerated";
pub const CONDITION_TYPE_GATEWAY_HEALTHY: &str = "GatewayHealthy";
pub const CONDITION_TYPE_AGENT_HEALTHY: &str = "AgentHealthy";
pub const CONDITION_TYPE_FLOW_HEALTHY: &str = "FlowHealthy";

/// Condition types owned by the reconciler; `FlowHealthy` belongs to the self-monitor
pub const RECONCILER_CONDITION_TYPES: &[&str] = &[
    CONDITION_TYPE_CONFIGURATION_GENERATED,
    CONDITION_TYPE_GATEWAY_HEALTHY,
    CONDITION_TYPE_AGENT_HEALTHY,
];

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

// Configuration
pub const REASON_GATEWAY_CONFIGURED: &str = "GatewayConfigured";
pub const REASON_AGENT_CONFIGURED: &str = "AgentConfigured";
pub const REASON_REFERENCED_SECRET_MISSING: &str = "ReferencedSecretMissing";
pub const REASON_MAX_PIPELINES_EXCEEDED: &str = "MaxPipelinesExceeded";
pub const REASON_ENDPOINT_INVALID: &str = "EndpointInvalid";
pub const REASON_TLS_CERTIFICATE_EXPIRED: &str = "TLSCertificateExpired";
pub const REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE: &str = "TLSCertificateAboutToExpire";
pub const REASON_TLS_CONFIGURATION_INVALID: &str = "TLSConfigurationInvalid";
pub const REASON_OTTL_SPEC_INVALID: &str = "OTTLSpecInvalid";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_SYNTHESIS_FAILED: &str = "SynthesisFailed";

// Workloads
pub const REASON_GATEWAY_READY: &str = "GatewayReady";
pub const REASON_GATEWAY_NOT_READY: &str = "GatewayNotReady";
pub const REASON_AGENT_READY: &str = "AgentReady";
pub const REASON_AGENT_NOT_READY: &str = "AgentNotReady";
pub const REASON_AGENT_NOT_REQUIRED: &str = "AgentNotRequired";

// Flow
pub const REASON_FLOW_HEALTHY: &str = "FlowHealthy";
pub const REASON_ALL_DATA_DROPPED: &str = "AllDataDropped";
pub const REASON_SOME_DATA_DROPPED: &str = "SomeDataDropped";
pub const REASON_BUFFER_FILLING_UP: &str = "BufferFillingUp";
pub const REASON_NO_LOGS_DELIVERED: &str = "NoLogsDelivered";
pub const REASON_GATEWAY_THROTTLING: &str = "GatewayThrottling";
pub const REASON_CONFIGURATION_NOT_GENERATED: &str = "ConfigurationNotGenerated";
pub const REASON_PROBING_FAILED: &str = "ProbingFailed";

// Telemetry
pub const REASON_COMPONENTS_RUNNING: &str = "ComponentsRunning";
pub const REASON_NO_PIPELINE_DEPLOYED: &str = "NoPipelineDeployed";
pub const REASON_RESOURCE_BLOCKS_DELETION: &str = "ResourceBlocksDeletion";

/// Update or add a condition to the conditions list
///
/// If a condition with the same type exists, reason and message are replaced
/// and the transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    set_condition_with_generation(conditions, type_, status, reason, message, None);
}

/// Same as [`set_condition`] but records the generation the condition was computed for
pub fn set_condition_with_generation(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Check if a condition is explicitly false
pub fn is_condition_false(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_FALSE)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Copy the conditions of the given types from `from` into `into`, keeping
/// everything else in `into` untouched. Used to merge a writer's view into
/// freshly read status without clobbering other writers.
pub fn merge_owned_conditions(into: &mut Vec<Condition>, from: &[Condition], owned: &[&str]) {
    for type_ in owned {
        match find_condition(from, type_) {
            Some(c) => {
                if let Some(existing) = into.iter_mut().find(|e| e.type_ == *type_) {
                    *existing = c.clone();
                } else {
                    into.push(c.clone());
                }
            }
            None => remove_condition(into, type_),
        }
    }
}

/// Conditions in a stable order so status diffs stay quiet
pub fn sort_conditions(conditions: &mut [Condition]) {
    conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(type_: &str, status: &str, time: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: time.to_string(),
            reason: "Old".to_string(),
            message: "old".to_string(),
            observed_generation: None,
        }
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_CONFIGURATION_GENERATED,
            CONDITION_STATUS_TRUE,
            REASON_GATEWAY_CONFIGURED,
            "Telemetry gateway successfully configured",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_CONFIGURATION_GENERATED);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_set_condition_updates_time_on_status_change() {
        let mut conditions = vec![condition(
            CONDITION_TYPE_GATEWAY_HEALTHY,
            CONDITION_STATUS_FALSE,
            "2024-01-01T00:00:00Z",
        )];

        set_condition(
            &mut conditions,
            CONDITION_TYPE_GATEWAY_HEALTHY,
            CONDITION_STATUS_TRUE,
            REASON_GATEWAY_READY,
            "Gateway is ready",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_set_condition_keeps_time_when_only_reason_changes() {
        let mut conditions = vec![condition(
            CONDITION_TYPE_CONFIGURATION_GENERATED,
            CONDITION_STATUS_FALSE,
            "2024-01-01T00:00:00Z",
        )];

        set_condition(
            &mut conditions,
            CONDITION_TYPE_CONFIGURATION_GENERATED,
            CONDITION_STATUS_FALSE,
            REASON_ENDPOINT_INVALID,
            "endpoint is invalid",
        );

        assert_eq!(conditions[0].reason, REASON_ENDPOINT_INVALID);
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_is_condition_true_and_false() {
        let conditions = vec![
            condition(CONDITION_TYPE_GATEWAY_HEALTHY, CONDITION_STATUS_TRUE, "t"),
            condition(CONDITION_TYPE_FLOW_HEALTHY, CONDITION_STATUS_UNKNOWN, "t"),
        ];

        assert!(is_condition_true(&conditions, CONDITION_TYPE_GATEWAY_HEALTHY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_FLOW_HEALTHY));
        assert!(!is_condition_false(&conditions, CONDITION_TYPE_FLOW_HEALTHY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_AGENT_HEALTHY));
    }

    #[test]
    fn test_merge_owned_conditions_leaves_foreign_types() {
        let mut stored = vec![
            condition(CONDITION_TYPE_FLOW_HEALTHY, CONDITION_STATUS_FALSE, "flow"),
            condition(CONDITION_TYPE_GATEWAY_HEALTHY, CONDITION_STATUS_FALSE, "old"),
            condition(CONDITION_TYPE_AGENT_HEALTHY, CONDITION_STATUS_TRUE, "old"),
        ];
        let computed = vec![condition(
            CONDITION_TYPE_GATEWAY_HEALTHY,
            CONDITION_STATUS_TRUE,
            "new",
        )];

        merge_owned_conditions(&mut stored, &computed, RECONCILER_CONDITION_TYPES);

        assert_eq!(stored.len(), 2);
        assert!(is_condition_false(&stored, CONDITION_TYPE_FLOW_HEALTHY));
        assert!(is_condition_true(&stored, CONDITION_TYPE_GATEWAY_HEALTHY));
        assert!(find_condition(&stored, CONDITION_TYPE_AGENT_HEALTHY).is_none());
    }
}
