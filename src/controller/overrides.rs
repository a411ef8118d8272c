//! Operator overrides read from a well-known ConfigMap
//!
//! The ConfigMap is meant for debugging: it can pause the reconciliation of
//! a signal, or of the Telemetry resource, and change the operator log level
//! without a restart.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::pipeline::SignalType;
use crate::error::Result;

pub const OVERRIDE_CONFIG_MAP: &str = "telemetry-override-config";
pub const OVERRIDE_CONFIG_KEY: &str = "override-config";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalOverrides {
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PauseOverride {
    #[serde(default)]
    pub paused: bool,
}

/// Parsed content of the override ConfigMap; absent sections keep defaults
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Overrides {
    #[serde(default)]
    pub global: GlobalOverrides,
    #[serde(default)]
    pub logging: PauseOverride,
    #[serde(default)]
    pub tracing: PauseOverride,
    #[serde(default)]
    pub metrics: PauseOverride,
    #[serde(default)]
    pub telemetry: PauseOverride,
}

impl Overrides {
    pub fn parse(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn signal_paused(&self, signal: SignalType) -> bool {
        match signal {
            SignalType::Log => self.logging.paused,
            SignalType::Trace => self.tracing.paused,
            SignalType::Metric => self.metrics.paused,
        }
    }

    pub fn telemetry_paused(&self) -> bool {
        self.telemetry.paused
    }

    pub fn log_level(&self) -> Option<&str> {
        self.global.log_level.as_deref().filter(|l| !l.is_empty())
    }
}

/// Read the overrides; a missing ConfigMap or key means no overrides.
///
/// An unparsable document is logged and ignored so a typo cannot stop the
/// operator.
pub async fn load_overrides(client: &Client, namespace: &str) -> Result<Overrides> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let Some(cm) = api.get_opt(OVERRIDE_CONFIG_MAP).await? else {
        return Ok(Overrides::default());
    };
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(OVERRIDE_CONFIG_KEY))
        .cloned()
        .unwrap_or_default();

    match Overrides::parse(&raw) {
        Ok(overrides) => {
            debug!("Loaded overrides: {:?}", overrides);
            Ok(overrides)
        }
        Err(e) => {
            warn!("Ignoring invalid {}/{}: {}", namespace, OVERRIDE_CONFIG_MAP, e);
            Ok(Overrides::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_document() {
        let overrides = Overrides::parse(
            r#"
global:
  logLevel: debug
tracing:
  paused: true
telemetry:
  paused: true
"#,
        )
        .unwrap();

        assert_eq!(overrides.log_level(), Some("debug"));
        assert!(overrides.signal_paused(SignalType::Trace));
        assert!(!overrides.signal_paused(SignalType::Log));
        assert!(!overrides.signal_paused(SignalType::Metric));
        assert!(overrides.telemetry_paused());
    }

    #[test]
    fn test_empty_document_means_defaults() {
        assert_eq!(Overrides::parse("").unwrap(), Overrides::default());
        assert_eq!(Overrides::parse("logging: {}\n").unwrap(), Overrides::default());
    }

    #[test]
    fn test_empty_log_level_is_ignored() {
        let overrides = Overrides::parse("global:\n  logLevel: \"\"\n").unwrap();
        assert!(overrides.log_level().is_none());
    }

    #[test]
    fn test_invalid_document() {
        assert!(Overrides::parse("logging: [1, 2").is_err());
    }
}
