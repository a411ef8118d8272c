//! Shared types for the pipeline Custom Resource Definitions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Structured validation error for pipeline specs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A value that is either given literally or read from a Secret key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValueType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFromSource>,
}

impl ValueType {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            value_from: None,
        }
    }

    pub fn from_secret(
        name: impl Into<String>,
        namespace: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            value: None,
            value_from: Some(ValueFromSource {
                secret_key_ref: Some(SecretKeyRef {
                    name: name.into(),
                    namespace: namespace.into(),
                    key: key.into(),
                }),
            }),
        }
    }

    /// True when the field carries either a non-empty literal or a secret reference
    pub fn is_set(&self) -> bool {
        self.value.as_deref().is_some_and(|v| !v.is_empty()) || self.secret_key_ref().is_some()
    }

    pub fn secret_key_ref(&self) -> Option<&SecretKeyRef> {
        self.value_from
            .as_ref()
            .and_then(|from| from.secret_key_ref.as_ref())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValueFromSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub key: String,
}

impl std::fmt::Display for SecretKeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.name, self.key)
    }
}

/// Transport used by the OTLP exporter
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

impl std::fmt::Display for OtlpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtlpProtocol::Grpc => write!(f, "grpc"),
            OtlpProtocol::Http => write!(f, "http"),
        }
    }
}

/// Destination of a pipeline
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtlpOutput {
    #[serde(default)]
    pub protocol: OtlpProtocol,
    pub endpoint: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationOptions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<OutputTls>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Options>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthOptions {
    pub user: ValueType,
    pub password: ValueType,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2Options {
    #[serde(rename = "tokenURL")]
    pub token_url: ValueType,
    #[serde(rename = "clientID")]
    pub client_id: ValueType,
    pub client_secret: ValueType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub params: std::collections::BTreeMap<String, String>,
}

/// Additional header sent with every export request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(flatten)]
    pub value: ValueType,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputTls {
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ValueType>,
}

impl OtlpOutput {
    /// Admission-time rules shared by every pipeline kind
    pub fn validate(&self, field: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();

        if self.path.as_deref().is_some_and(|p| !p.is_empty())
            && self.protocol == OtlpProtocol::Grpc
        {
            errors.push(SpecValidationError::new(
                format!("{field}.path"),
                "path is only available with http protocol",
                format!("Remove {field}.path or set {field}.protocol to http."),
            ));
        }

        validate_value(&self.endpoint, &format!("{field}.endpoint"), true, &mut errors);

        if let Some(auth) = &self.authentication {
            if auth.basic.is_some() && auth.oauth2.is_some() {
                errors.push(SpecValidationError::new(
                    format!("{field}.authentication"),
                    "only one authentication method can be configured",
                    "Configure either basic or oauth2 authentication, not both.",
                ));
            }
            if let Some(basic) = &auth.basic {
                let f = format!("{field}.authentication.basic");
                validate_value(&basic.user, &format!("{f}.user"), true, &mut errors);
                validate_value(&basic.password, &format!("{f}.password"), true, &mut errors);
            }
            if let Some(oauth2) = &auth.oauth2 {
                let f = format!("{field}.authentication.oauth2");
                validate_value(&oauth2.token_url, &format!("{f}.tokenURL"), true, &mut errors);
                validate_value(&oauth2.client_id, &format!("{f}.clientID"), true, &mut errors);
                validate_value(
                    &oauth2.client_secret,
                    &format!("{f}.clientSecret"),
                    true,
                    &mut errors,
                );
                if self.tls.as_ref().is_some_and(|tls| tls.insecure) {
                    errors.push(SpecValidationError::new(
                        f,
                        "oauth2 authentication requires TLS",
                        format!("Set {field}.tls.insecure to false when using oauth2."),
                    ));
                }
            }
        }

        for (i, header) in self.headers.iter().enumerate() {
            let f = format!("{field}.headers[{i}]");
            if header.name.trim().is_empty() {
                errors.push(SpecValidationError::new(
                    format!("{f}.name"),
                    "header name must not be empty",
                    "Give every header a name.",
                ));
            }
            validate_value(&header.value, &f, true, &mut errors);
        }

        if let Some(tls) = &self.tls {
            let f = format!("{field}.tls");
            if tls.cert.is_some() != tls.key.is_some() {
                errors.push(SpecValidationError::new(
                    f.clone(),
                    "cert and key must be provided together",
                    format!("Set both {f}.cert and {f}.key, or neither."),
                ));
            }
            for (name, value) in [("ca", &tls.ca), ("cert", &tls.cert), ("key", &tls.key)] {
                if let Some(value) = value {
                    validate_value(value, &format!("{f}.{name}"), true, &mut errors);
                }
            }
        }

        errors
    }
}

pub(crate) fn validate_value(
    value: &ValueType,
    field: &str,
    required: bool,
    errors: &mut Vec<SpecValidationError>,
) {
    let has_literal = value.value.as_deref().is_some_and(|v| !v.is_empty());
    let has_ref = value.value_from.is_some();

    if has_literal && has_ref {
        errors.push(SpecValidationError::new(
            field,
            "value and valueFrom are mutually exclusive",
            format!("Set either {field}.value or {field}.valueFrom."),
        ));
        return;
    }

    if let Some(from) = &value.value_from {
        match &from.secret_key_ref {
            Some(r) if !r.name.is_empty() && !r.namespace.is_empty() && !r.key.is_empty() => {}
            _ => errors.push(SpecValidationError::new(
                format!("{field}.valueFrom.secretKeyRef"),
                "secretKeyRef requires name, namespace and key",
                "Fill in name, namespace and key of the referenced Secret.",
            )),
        }
        return;
    }

    if required && !has_literal {
        errors.push(SpecValidationError::new(
            field,
            "a value is required",
            format!("Set {field}.value or {field}.valueFrom.secretKeyRef."),
        ));
    }
}

/// Namespace include/exclude selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl NamespaceSelector {
    pub fn validate(&self, field: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        if !self.include.is_empty() && !self.exclude.is_empty() {
            errors.push(SpecValidationError::new(
                field,
                "include and exclude are mutually exclusive",
                format!("Set either {field}.include or {field}.exclude."),
            ));
        }
        for ns in self.include.iter().chain(self.exclude.iter()) {
            if !is_dns_label(ns) {
                errors.push(SpecValidationError::new(
                    field,
                    format!("'{ns}' is not a valid namespace name"),
                    "Namespace names must be lowercase RFC 1123 labels.",
                ));
            }
        }
        errors
    }
}

/// Container include/exclude selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Push-based OTLP input
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OtlpInput {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceSelector>,
}

/// User-defined transformation statements
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransformSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statements: Vec<String>,
}

/// User-defined drop conditions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "ConfigurationGenerated", "GatewayHealthy")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Status shared by every pipeline kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

pub(crate) fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

pub(crate) fn validate_transforms(
    transforms: &[TransformSpec],
    filters: &[FilterSpec],
) -> Vec<SpecValidationError> {
    let mut errors = Vec::new();
    for (i, t) in transforms.iter().enumerate() {
        if t.statements.is_empty() {
            errors.push(SpecValidationError::new(
                format!("spec.transform[{i}].statements"),
                "a transform needs at least one statement",
                "Add a statement or remove the transform entry.",
            ));
        }
    }
    for (i, f) in filters.iter().enumerate() {
        if f.conditions.is_empty() {
            errors.push(SpecValidationError::new(
                format!("spec.filter[{i}].conditions"),
                "a filter needs at least one condition",
                "Add a condition or remove the filter entry.",
            ));
        }
    }
    errors
}
