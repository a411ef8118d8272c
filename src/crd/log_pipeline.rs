//! LogPipeline Custom Resource Definition
//!
//! A LogPipeline collects container logs from the nodes and, with an OTLP
//! output, OTLP logs pushed to the gateway. OTLP outputs run on the
//! OpenTelemetry collectors; HTTP and custom outputs run on Fluent Bit.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    validate_transforms, validate_value, Condition, ContainerSelector, FilterSpec,
    NamespaceSelector, OtlpInput, OtlpOutput, SpecValidationError, TransformSpec, ValueFromSource,
    ValueType,
};

/// Filter plugins a custom filter section may not use
pub const DENIED_FILTER_PLUGINS: &[&str] = &["kubernetes", "rewrite_tag"];

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "telemetry.kyma-project.io",
    version = "v1alpha1",
    kind = "LogPipeline",
    status = "LogPipelineStatus",
    shortname = "lp",
    printcolumn = r#"{"name":"Configuration Generated","type":"string","jsonPath":".status.conditions[?(@.type=='ConfigurationGenerated')].status"}"#,
    printcolumn = r#"{"name":"Gateway Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='GatewayHealthy')].status"}"#,
    printcolumn = r#"{"name":"Agent Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='AgentHealthy')].status"}"#,
    printcolumn = r#"{"name":"Flow Healthy","type":"string","jsonPath":".status.conditions[?(@.type=='FlowHealthy')].status"}"#,
    printcolumn = r#"{"name":"Unsupported Mode","type":"boolean","jsonPath":".status.unsupportedMode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LogPipelineSpec {
    #[serde(default)]
    pub input: LogInput,

    pub output: LogOutput,

    #[serde(default, rename = "transform", skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformSpec>,

    #[serde(default, rename = "filter", skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,

    /// Raw Fluent Bit filter sections, applied in order
    #[serde(default, rename = "filters", skip_serializing_if = "Vec::is_empty")]
    pub fluent_bit_filters: Vec<FluentBitFilter>,

    /// Files mounted into Fluent Bit, e.g. Lua scripts used by custom filters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileMount>,

    /// Secret values exposed to Fluent Bit as environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableReference>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogPipelineStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// True when the pipeline uses a custom filter or output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsupported_mode: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogInput {
    /// Container logs tailed from the node by the log agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<LogRuntimeInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpInput>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogRuntimeInput {
    /// Defaults to true when the runtime input is present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub namespaces: LogNamespaceSelector,
    #[serde(default)]
    pub containers: ContainerSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_original_body: Option<bool>,
    /// Fluent Bit only: keep pod annotations on the records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_annotations: Option<bool>,
    /// Fluent Bit only: drop pod labels from the records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_labels: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogNamespaceSelector {
    #[serde(flatten)]
    pub selector: NamespaceSelector,
    /// Collect logs from system namespaces as well
    #[serde(default)]
    pub system: bool,
}

/// Exactly one of the outputs must be set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpOutput>,
    /// Raw Fluent Bit output section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,
}

/// Fluent Bit `http` output
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpOutput {
    pub host: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub tls: HttpOutputTls,
    /// Replace dots in Kubernetes label and annotation keys
    #[serde(default)]
    pub dedot: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpOutputTls {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub skip_certificate_validation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ValueType>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FluentBitFilter {
    pub custom: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMount {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VariableReference {
    pub name: String,
    pub value_from: ValueFromSource,
}

/// Agent technology that runs a log pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEngine {
    OpenTelemetry,
    FluentBit,
}

impl LogOutput {
    pub fn engine(&self) -> LogEngine {
        if self.otlp.is_some() {
            LogEngine::OpenTelemetry
        } else {
            LogEngine::FluentBit
        }
    }

    fn defined_count(&self) -> usize {
        [
            self.otlp.is_some(),
            self.http.is_some(),
            self.custom.as_deref().is_some_and(|c| !c.trim().is_empty()),
        ]
        .into_iter()
        .filter(|d| *d)
        .count()
    }
}

/// One parsed `key value` line of a Fluent Bit section
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionEntry {
    /// Lower-cased
    pub key: String,
    pub value: String,
}

/// Parse the body of a custom Fluent Bit section.
///
/// Blank lines and `#` comments are skipped; every other line must be a
/// key followed by a value.
pub fn parse_section(content: &str) -> Result<Vec<SectionEntry>, String> {
    let mut entries = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| format!("line '{line}' has no value"))?;
        entries.push(SectionEntry {
            key: key.to_lowercase(),
            value: value.trim().to_string(),
        });
    }
    Ok(entries)
}

fn section_value<'a>(entries: &'a [SectionEntry], key: &str) -> Option<&'a str> {
    entries.iter().find(|e| e.key == key).map(|e| e.value.as_str())
}

/// Plugin name of a custom section, if it parses and names one
pub fn section_plugin(content: &str) -> Option<String> {
    parse_section(content)
        .ok()
        .and_then(|entries| section_value(&entries, "name").map(str::to_string))
}

fn validate_custom_section(
    content: &str,
    field: &str,
    denied: &[&str],
    is_output: bool,
    errors: &mut Vec<SpecValidationError>,
) {
    let entries = match parse_section(content) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(SpecValidationError::new(
                field,
                format!("invalid section: {e}"),
                "Write one 'key value' pair per line.",
            ));
            return;
        }
    };
    let Some(plugin) = section_value(&entries, "name") else {
        errors.push(SpecValidationError::new(
            field,
            "configuration section does not have a name attribute",
            "Add a 'name <plugin>' line.",
        ));
        return;
    };
    if denied.iter().any(|d| d.eq_ignore_ascii_case(plugin)) {
        errors.push(SpecValidationError::new(
            field,
            format!("plugin '{plugin}' is forbidden"),
            format!("Use a plugin other than {}.", denied.join(", ")),
        ));
    }
    if section_value(&entries, "match").is_some() {
        errors.push(SpecValidationError::new(
            field,
            format!("plugin '{plugin}' contains a match condition"),
            "Remove the match line; records are matched to the pipeline automatically.",
        ));
    }
    if is_output && section_value(&entries, "storage.total_limit_size").is_some() {
        errors.push(SpecValidationError::new(
            field,
            format!("plugin '{plugin}' sets storage.total_limit_size"),
            "Remove storage.total_limit_size; the buffer limit is managed by the operator.",
        ));
    }
}

/// RFC 1123 host name
fn is_hostname(host: &str) -> bool {
    let host = host.trim();
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

impl HttpOutput {
    pub fn validate(&self, field: &str) -> Vec<SpecValidationError> {
        let mut errors = Vec::new();
        validate_value(&self.host, &format!("{field}.host"), true, &mut errors);
        if let Some(host) = self.host.value.as_deref().filter(|h| !h.is_empty()) {
            if !is_hostname(host) {
                errors.push(SpecValidationError::new(
                    format!("{field}.host"),
                    format!("invalid hostname '{host}'"),
                    "Set a host name without scheme, port or path.",
                ));
            }
        }
        if let Some(uri) = self.uri.as_deref().filter(|u| !u.is_empty()) {
            if !uri.starts_with('/') {
                errors.push(SpecValidationError::new(
                    format!("{field}.uri"),
                    "uri has to start with /",
                    format!("Prefix {field}.uri with '/'."),
                ));
            }
        }
        for (name, value) in [("user", &self.user), ("password", &self.password)] {
            if let Some(value) = value {
                validate_value(value, &format!("{field}.{name}"), false, &mut errors);
            }
        }
        let tls = &self.tls;
        if tls.cert.is_some() != tls.key.is_some() {
            errors.push(SpecValidationError::new(
                format!("{field}.tls"),
                "cert and key must be provided together",
                format!("Set both {field}.tls.cert and {field}.tls.key, or neither."),
            ));
        }
        for (name, value) in [("ca", &tls.ca), ("cert", &tls.cert), ("key", &tls.key)] {
            if let Some(value) = value {
                validate_value(value, &format!("{field}.tls.{name}"), true, &mut errors);
            }
        }
        errors
    }
}

impl LogPipelineSpec {
    /// Whether container logs are collected on the nodes
    pub fn runtime_enabled(&self) -> bool {
        match &self.input.runtime {
            Some(runtime) => runtime.enabled.unwrap_or(true),
            None => true,
        }
    }

    pub fn otlp_enabled(&self) -> bool {
        !self.input.otlp.as_ref().is_some_and(|o| o.disabled)
    }

    pub fn engine(&self) -> LogEngine {
        self.output.engine()
    }

    /// Custom filters and outputs are not covered by support
    pub fn contains_custom_plugin(&self) -> bool {
        self.output.custom.as_deref().is_some_and(|c| !c.trim().is_empty())
            || self.fluent_bit_filters.iter().any(|f| !f.custom.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        match self.output.defined_count() {
            0 => errors.push(SpecValidationError::new(
                "spec.output",
                "no output is defined",
                "Define one of spec.output.otlp, spec.output.http or spec.output.custom.",
            )),
            1 => {}
            _ => errors.push(SpecValidationError::new(
                "spec.output",
                "multiple outputs are defined",
                "Define only one of spec.output.otlp, spec.output.http or spec.output.custom.",
            )),
        }
        if let Some(otlp) = &self.output.otlp {
            errors.extend(otlp.validate("spec.output.otlp"));
        }
        if let Some(http) = &self.output.http {
            errors.extend(http.validate("spec.output.http"));
        }
        if let Some(custom) = self.output.custom.as_deref().filter(|c| !c.trim().is_empty()) {
            validate_custom_section(custom, "spec.output.custom", &[], true, &mut errors);
        }

        if let Some(runtime) = &self.input.runtime {
            errors.extend(
                runtime
                    .namespaces
                    .selector
                    .validate("spec.input.runtime.namespaces"),
            );
            if !runtime.containers.include.is_empty() && !runtime.containers.exclude.is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.input.runtime.containers",
                    "include and exclude are mutually exclusive",
                    "Set either containers.include or containers.exclude.",
                ));
            }
        }
        if let Some(otlp) = self.input.otlp.as_ref().and_then(|o| o.namespaces.as_ref()) {
            errors.extend(otlp.validate("spec.input.otlp.namespaces"));
        }

        match self.engine() {
            LogEngine::OpenTelemetry => {
                errors.extend(validate_transforms(&self.transforms, &self.filters));
                for (field, used) in [
                    ("spec.filters", !self.fluent_bit_filters.is_empty()),
                    ("spec.files", !self.files.is_empty()),
                    ("spec.variables", !self.variables.is_empty()),
                ] {
                    if used {
                        errors.push(SpecValidationError::new(
                            field,
                            "only available with an http or custom output",
                            format!("Remove {field} or switch to an http or custom output."),
                        ));
                    }
                }
            }
            LogEngine::FluentBit => {
                if !self.transforms.is_empty() || !self.filters.is_empty() {
                    errors.push(SpecValidationError::new(
                        "spec.transform",
                        "transform and filter statements are only available with an otlp output",
                        "Remove spec.transform and spec.filter or switch to an otlp output.",
                    ));
                }
                for (i, filter) in self.fluent_bit_filters.iter().enumerate() {
                    validate_custom_section(
                        &filter.custom,
                        &format!("spec.filters[{i}].custom"),
                        DENIED_FILTER_PLUGINS,
                        false,
                        &mut errors,
                    );
                }
                self.validate_files(&mut errors);
                self.validate_variables(&mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_files(&self, errors: &mut Vec<SpecValidationError>) {
        let mut seen = std::collections::BTreeSet::new();
        for (i, file) in self.files.iter().enumerate() {
            let field = format!("spec.files[{i}].name");
            if file.name.is_empty() || file.name.contains('/') {
                errors.push(SpecValidationError::new(
                    field,
                    "file name must be non-empty and must not contain '/'",
                    "Give the file a plain name such as filter-script.lua.",
                ));
            } else if !seen.insert(file.name.as_str()) {
                errors.push(SpecValidationError::new(
                    field,
                    format!("file '{}' is defined more than once", file.name),
                    "Give every file a unique name.",
                ));
            }
        }
    }

    fn validate_variables(&self, errors: &mut Vec<SpecValidationError>) {
        for (i, variable) in self.variables.iter().enumerate() {
            let field = format!("spec.variables[{i}]");
            let valid_name = !variable.name.is_empty()
                && !variable.name.starts_with(|c: char| c.is_ascii_digit())
                && variable.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_name {
                errors.push(SpecValidationError::new(
                    format!("{field}.name"),
                    format!("'{}' is not a valid variable name", variable.name),
                    "Use letters, digits and underscores only.",
                ));
            }
            let value = ValueType {
                value: None,
                value_from: Some(variable.value_from.clone()),
            };
            validate_value(&value, &field, true, errors);
        }
    }
}
