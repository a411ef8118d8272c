//! Fluent Bit configuration rendering
//!
//! Every usable pipeline becomes one `<name>.conf` file in the sections
//! ConfigMap: a `tail` input, the enrichment filters, the user's custom
//! filters and one output. Secret-backed output values are referenced as
//! environment variables; TLS material is mounted as files.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::controller::config::sanitize_env_var_name;
use crate::controller::selector::SYSTEM_NAMESPACES;
use crate::crd::{section_plugin, parse_section, HttpOutput, LogPipelineSpec, ValueType};

/// Directory Fluent Bit tails container logs from
pub const CONTAINER_LOG_DIR: &str = "/var/log/containers";
/// Host directory holding tail offsets and the filesystem buffer
pub const DATA_DIR: &str = "/data";
pub const STORAGE_PATH: &str = "/data/flb-storage/";
pub const MAIN_CONFIG_KEY: &str = "fluent-bit.conf";
pub const LUA_SCRIPT_KEY: &str = "filter-script.lua";
pub const LUA_SCRIPT_PATH: &str = "/fluent-bit/scripts/filter-script.lua";
pub const TLS_CONFIG_DIR: &str = "/fluent-bit/etc/output-tls-config";
/// Directory the section files are included from
pub const SECTIONS_DIR: &str = "/fluent-bit/etc/dynamic";
/// Directory user files are mounted into
pub const FILES_DIR: &str = "/files";

const MEM_BUF_LIMIT: &str = "5MB";
const FS_BUFFER_LIMIT: &str = "1G";
const RETRY_LIMIT: &str = "300";
const DEFAULT_HTTP_PORT: &str = "443";
const DEFAULT_HTTP_FORMAT: &str = "json";

/// Main configuration; the per-pipeline sections are included from `dynamic/`
pub fn main_config(http_port: i32) -> String {
    format!(
        "[SERVICE]\n\
         \x20   Daemon Off\n\
         \x20   Flush 1\n\
         \x20   Log_Level warn\n\
         \x20   HTTP_Server On\n\
         \x20   HTTP_Listen 0.0.0.0\n\
         \x20   HTTP_Port {http_port}\n\
         \x20   storage.path {STORAGE_PATH}\n\
         \x20   storage.metrics on\n\
         \n\
         @INCLUDE dynamic/*.conf\n"
    )
}

/// Lua helpers called by the enrichment filters
pub const LUA_SCRIPT: &str = r#"function enrich_app_name(tag, timestamp, record)
  if record.kubernetes == nil then
    return 0
  end
  enrich_app_name_internal(record.kubernetes)
  return 2, timestamp, record
end
function kubernetes_map_keys(tag, timestamp, record)
  if record.kubernetes == nil then
    return 0
  end
  map_keys(record.kubernetes.annotations)
  map_keys(record.kubernetes.labels)
  return 2, timestamp, record
end
function enrich_app_name_internal(table)
  if table.labels == nil then
    return 0
  end
  table["app_name"] = table.labels["app.kubernetes.io/name"] or table.labels["app"]
end
function map_keys(table)
  if table == nil then
    return
  end
  local new_table = {}
  local changed_keys = {}
  for key, val in pairs(table) do
    local mapped_key = string.gsub(key, "[%/%.]", "_")
    if mapped_key ~= key then
      new_table[mapped_key] = val
      changed_keys[key] = true
    end
  end
  for key in pairs(changed_keys) do
    table[key] = nil
  end
  for key, val in pairs(new_table) do
    table[key] = val
  end
end
"#;

// ============================================================================
// Sections
// ============================================================================

/// One `[INPUT]`, `[FILTER]` or `[OUTPUT]` block.
///
/// Rendered with `name` first, `match` second and every other key sorted;
/// values are aligned one column after the longest key.
#[derive(Clone, Debug)]
pub struct Section {
    header: &'static str,
    name: String,
    matches: Option<String>,
    params: Vec<(String, String)>,
}

impl Section {
    pub fn input(name: &str) -> Self {
        Self::new("INPUT", name)
    }

    pub fn filter(name: &str) -> Self {
        Self::new("FILTER", name)
    }

    pub fn output(name: &str) -> Self {
        Self::new("OUTPUT", name)
    }

    fn new(header: &'static str, name: &str) -> Self {
        Self {
            header,
            name: name.to_string(),
            matches: None,
            params: Vec::new(),
        }
    }

    pub fn matching(mut self, tag: impl Into<String>) -> Self {
        self.matches = Some(tag.into());
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn render(&self) -> String {
        let mut params = self.params.clone();
        params.sort();

        let mut lines = vec![("name".to_string(), self.name.clone())];
        if let Some(tag) = &self.matches {
            lines.push(("match".to_string(), tag.clone()));
        }
        lines.extend(params);

        let width = lines.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        let mut out = format!("[{}]\n", self.header);
        for (key, value) in lines {
            out.push_str(&format!("    {key:<width$} {value}\n"));
        }
        out.push('\n');
        out
    }
}

/// Build a section from a user-written body; `name` and `match` are taken
/// over from the body and the pipeline respectively
fn custom_section(kind: fn(&str) -> Section, content: &str, tag: &str) -> Option<Section> {
    let entries = parse_section(content).ok()?;
    let mut section = kind(&section_plugin(content)?).matching(tag);
    for entry in entries.into_iter().filter(|e| e.key != "name" && e.key != "match") {
        section = section.param(&entry.key, entry.value);
    }
    Some(section)
}

fn tag_pattern(pipeline: &str) -> String {
    format!("{pipeline}.*")
}

// ============================================================================
// Tail input
// ============================================================================

fn log_file(namespace: &str, container: &str) -> String {
    format!("{CONTAINER_LOG_DIR}/*_{namespace}_{container}-*.log")
}

/// Files the pipeline tails: every selected namespace crossed with every
/// selected container
pub fn include_paths(spec: &LogPipelineSpec) -> Vec<String> {
    let runtime = spec.input.runtime.clone().unwrap_or_default();
    let namespaces: Vec<&str> = match runtime.namespaces.selector.include.as_slice() {
        [] => vec!["*"],
        include => include.iter().map(String::as_str).collect(),
    };
    let containers: Vec<&str> = match runtime.containers.include.as_slice() {
        [] => vec!["*"],
        include => include.iter().map(String::as_str).collect(),
    };

    namespaces
        .iter()
        .flat_map(|ns| containers.iter().map(move |c| log_file(ns, c)))
        .collect()
}

/// Files the pipeline skips. Fluent Bit's own logs and the log collectors'
/// logs are always skipped to avoid feedback loops.
pub fn exclude_paths(spec: &LogPipelineSpec, namespace: &str) -> Vec<String> {
    let runtime = spec.input.runtime.clone().unwrap_or_default();
    let mut paths = vec![
        format!("{CONTAINER_LOG_DIR}/telemetry-fluent-bit-*_{namespace}_fluent-bit-*.log"),
        format!("{CONTAINER_LOG_DIR}/telemetry-log-agent-*_{namespace}_collector-*.log"),
        format!("{CONTAINER_LOG_DIR}/telemetry-log-gateway-*_{namespace}_collector-*.log"),
    ];

    let selector = &runtime.namespaces.selector;
    if !runtime.namespaces.system && selector.include.is_empty() {
        paths.extend(SYSTEM_NAMESPACES.iter().map(|ns| log_file(ns, "*")));
    }
    paths.extend(selector.exclude.iter().map(|ns| log_file(ns, "*")));
    paths.extend(runtime.containers.exclude.iter().map(|c| log_file("*", c)));
    paths
}

fn input_section(pipeline: &str, spec: &LogPipelineSpec, namespace: &str) -> Section {
    Section::input("tail")
        .param("alias", pipeline)
        .param("db", format!("{DATA_DIR}/flb_{pipeline}.db"))
        .param("exclude_path", exclude_paths(spec, namespace).join(","))
        .param("mem_buf_limit", MEM_BUF_LIMIT)
        .param("multiline.parser", "cri")
        .param("path", include_paths(spec).join(","))
        .param("read_from_head", "true")
        .param("skip_long_lines", "on")
        .param("storage.type", "filesystem")
        .param("tag", tag_pattern(pipeline))
}

// ============================================================================
// Filters
// ============================================================================

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn kubernetes_filter(pipeline: &str, spec: &LogPipelineSpec) -> Section {
    let runtime = spec.input.runtime.clone().unwrap_or_default();
    Section::filter("kubernetes")
        .matching(tag_pattern(pipeline))
        .param("annotations", on_off(runtime.keep_annotations.unwrap_or(false)))
        .param("buffer_size", "1MB")
        .param("k8s-logging.exclude", "off")
        .param("k8s-logging.parser", "on")
        .param("keep_log", on_off(runtime.keep_original_body.unwrap_or(true)))
        .param("kube_tag_prefix", format!("{pipeline}.var.log.containers."))
        .param("labels", on_off(!runtime.drop_labels.unwrap_or(false)))
        .param("merge_log", "on")
}

fn lua_filter(pipeline: &str, call: &str) -> Section {
    Section::filter("lua")
        .matching(tag_pattern(pipeline))
        .param("call", call)
        .param("script", LUA_SCRIPT_PATH)
}

fn is_multiline(content: &str) -> bool {
    section_plugin(content).is_some_and(|p| p.eq_ignore_ascii_case("multiline"))
}

// ============================================================================
// Outputs
// ============================================================================

/// Environment variable carrying one Secret-backed output value
pub fn env_var_name(pipeline: &str, value: &ValueType) -> Option<String> {
    value.secret_key_ref().map(|r| {
        sanitize_env_var_name(&format!("{}_{}_{}_{}", pipeline, r.namespace, r.name, r.key))
    })
}

/// Literal values are written as is, Secret-backed ones as `${VAR}`
fn output_value(pipeline: &str, value: &ValueType) -> Option<String> {
    match value.value.as_deref().filter(|v| !v.is_empty()) {
        Some(literal) => Some(literal.to_string()),
        None => env_var_name(pipeline, value).map(|var| format!("${{{var}}}")),
    }
}

/// Key of one TLS file in the mounted TLS Secret
pub fn tls_file_key(pipeline: &str, kind: TlsFile) -> String {
    match kind {
        TlsFile::Ca => format!("{pipeline}-ca.crt"),
        TlsFile::Cert => format!("{pipeline}-cert.crt"),
        TlsFile::Key => format!("{pipeline}-key.key"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsFile {
    Ca,
    Cert,
    Key,
}

fn http_output_section(pipeline: &str, http: &HttpOutput) -> Section {
    let format = http.format.clone().filter(|f| !f.is_empty());
    let is_json = format.as_deref().unwrap_or(DEFAULT_HTTP_FORMAT) == DEFAULT_HTTP_FORMAT;
    let mut section = Section::output("http")
        .matching(tag_pattern(pipeline))
        .param("alias", pipeline)
        .param("allow_duplicated_headers", "true")
        .param("format", format.unwrap_or_else(|| DEFAULT_HTTP_FORMAT.to_string()))
        .param(
            "port",
            http.port.clone().filter(|p| !p.is_empty()).unwrap_or_else(|| DEFAULT_HTTP_PORT.to_string()),
        )
        .param("retry_limit", RETRY_LIMIT)
        .param("storage.total_limit_size", FS_BUFFER_LIMIT)
        .param("tls", on_off(!http.tls.disabled))
        .param("tls.verify", on_off(!http.tls.skip_certificate_validation));

    if is_json {
        section = section.param("json_date_format", "iso8601");
    }
    if let Some(host) = output_value(pipeline, &http.host) {
        section = section.param("host", host);
    }
    if let Some(user) = http.user.as_ref().and_then(|v| output_value(pipeline, v)) {
        section = section.param("http_user", user);
    }
    if let Some(password) = http.password.as_ref().and_then(|v| output_value(pipeline, v)) {
        section = section.param("http_passwd", password);
    }
    if let Some(uri) = http.uri.as_deref().filter(|u| !u.is_empty()) {
        section = section.param("uri", uri);
    }
    if let Some(compress) = http.compress.as_deref().filter(|c| !c.is_empty()) {
        section = section.param("compress", compress);
    }
    if http.tls.ca.as_ref().is_some_and(ValueType::is_set) {
        section = section.param("tls.ca_file", format!("{TLS_CONFIG_DIR}/{}", tls_file_key(pipeline, TlsFile::Ca)));
    }
    if http.tls.cert.as_ref().is_some_and(ValueType::is_set) && http.tls.key.as_ref().is_some_and(ValueType::is_set) {
        section = section
            .param("tls.crt_file", format!("{TLS_CONFIG_DIR}/{}", tls_file_key(pipeline, TlsFile::Cert)))
            .param("tls.key_file", format!("{TLS_CONFIG_DIR}/{}", tls_file_key(pipeline, TlsFile::Key)));
    }
    section
}

fn output_section(pipeline: &str, spec: &LogPipelineSpec) -> Option<Section> {
    if let Some(http) = &spec.output.http {
        return Some(http_output_section(pipeline, http));
    }
    let custom = spec.output.custom.as_deref()?;
    Some(
        custom_section(Section::output, custom, &tag_pattern(pipeline))?
            .param("alias", pipeline)
            .param("retry_limit", RETRY_LIMIT)
            .param("storage.total_limit_size", FS_BUFFER_LIMIT),
    )
}

/// Every section of one pipeline, in processing order.
///
/// `None` when the pipeline has neither an HTTP nor a parseable custom
/// output; admission rejects such pipelines before they get here.
pub fn pipeline_sections(pipeline: &str, spec: &LogPipelineSpec, namespace: &str) -> Option<String> {
    let output = output_section(pipeline, spec)?;
    let tag = tag_pattern(pipeline);
    let (multiline, custom): (Vec<_>, Vec<_>) = spec
        .fluent_bit_filters
        .iter()
        .map(|f| f.custom.as_str())
        .filter(|c| !c.trim().is_empty())
        .partition(|c| is_multiline(c));

    // multiline parsing has to see the raw lines before enrichment
    let mut sections = vec![input_section(pipeline, spec, namespace)];
    sections.extend(multiline.iter().filter_map(|c| custom_section(Section::filter, c, &tag)));
    sections.push(
        Section::filter("record_modifier")
            .matching(tag.clone())
            .param("record", "cluster_identifier ${KUBERNETES_SERVICE_HOST}"),
    );
    sections.push(kubernetes_filter(pipeline, spec));

    let http = spec.output.http.as_ref();
    if http.is_some() {
        sections.push(Section::filter("modify").matching(tag.clone()).param("copy", "time @timestamp"));
    }
    sections.extend(custom.iter().filter_map(|c| custom_section(Section::filter, c, &tag)));
    if let Some(http) = http {
        sections.push(lua_filter(pipeline, "enrich_app_name"));
        if http.dedot && http.host.is_set() {
            sections.push(lua_filter(pipeline, "kubernetes_map_keys"));
        }
    }
    sections.push(output);

    Some(sections.iter().map(Section::render).collect())
}

// ============================================================================
// Synthesis
// ============================================================================

/// A usable pipeline with its Secret-backed values already read
#[derive(Clone, Debug, Default)]
pub struct FluentBitPipeline {
    pub name: String,
    pub spec: LogPipelineSpec,
    /// Environment entries: output values by variable name and user variables
    pub env: BTreeMap<String, Vec<u8>>,
    /// TLS files by key in the TLS Secret
    pub tls_files: BTreeMap<String, Vec<u8>>,
}

/// Everything the Fluent Bit workload is configured with
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FluentBitConfig {
    /// `<pipeline>.conf` files included by the main configuration
    pub sections: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
    pub env: BTreeMap<String, Vec<u8>>,
    pub tls_files: BTreeMap<String, Vec<u8>>,
    pub pipelines: Vec<String>,
    pub checksum: String,
}

/// Render the configuration of every usable pipeline
pub fn synthesize(pipelines: &[FluentBitPipeline], namespace: &str) -> FluentBitConfig {
    let mut config = FluentBitConfig::default();
    for pipeline in pipelines {
        let Some(sections) = pipeline_sections(&pipeline.name, &pipeline.spec, namespace) else {
            continue;
        };
        config.sections.insert(format!("{}.conf", pipeline.name), sections);
        config.files.extend(
            pipeline
                .spec
                .files
                .iter()
                .map(|f| (f.name.clone(), f.content.clone())),
        );
        config.env.extend(pipeline.env.clone());
        config.tls_files.extend(pipeline.tls_files.clone());
        config.pipelines.push(pipeline.name.clone());
    }
    config.checksum = checksum(&config);
    config
}

/// Line breaks pasted as literal `\n` into a certificate or key are restored
pub fn unescape_pem(value: &str) -> Vec<u8> {
    value.replace("\\n", "\n").into_bytes()
}

/// SHA-256 over everything the workload reads
fn checksum(config: &FluentBitConfig) -> String {
    let mut hasher = Sha256::new();
    for map in [&config.sections, &config.files] {
        for (key, value) in map {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0u8]);
    }
    for map in [&config.env, &config.tls_files] {
        for (key, value) in map {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value);
            hasher.update([0u8]);
        }
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ContainerSelector, FileMount, FluentBitFilter, LogNamespaceSelector, LogOutput,
        LogRuntimeInput, NamespaceSelector,
    };

    fn http_spec(host: ValueType) -> LogPipelineSpec {
        LogPipelineSpec {
            output: LogOutput {
                http: Some(HttpOutput {
                    host,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn runtime(namespaces: LogNamespaceSelector, containers: ContainerSelector) -> LogPipelineSpec {
        LogPipelineSpec {
            input: crate::crd::LogInput {
                runtime: Some(LogRuntimeInput {
                    namespaces,
                    containers,
                    ..Default::default()
                }),
                otlp: None,
            },
            ..http_spec(ValueType::literal("localhost"))
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_section_is_aligned_and_sorted() {
        let rendered = Section::filter("record_modifier")
            .matching("foo.*")
            .param("record", "cluster_identifier ${KUBERNETES_SERVICE_HOST}")
            .render();
        assert_eq!(
            rendered,
            "[FILTER]\n\
             \x20   name   record_modifier\n\
             \x20   match  foo.*\n\
             \x20   record cluster_identifier ${KUBERNETES_SERVICE_HOST}\n\
             \n"
        );
    }

    #[test]
    fn test_http_output_section() {
        let http = HttpOutput {
            host: ValueType::literal("localhost"),
            user: Some(ValueType::literal("user")),
            password: Some(ValueType::literal("password")),
            uri: Some("/customindex/kyma".to_string()),
            port: Some("1234".to_string()),
            format: Some("yaml".to_string()),
            dedot: true,
            ..Default::default()
        };
        let expected = "[OUTPUT]\n\
             \x20   name                     http\n\
             \x20   match                    foo.*\n\
             \x20   alias                    foo\n\
             \x20   allow_duplicated_headers true\n\
             \x20   format                   yaml\n\
             \x20   host                     localhost\n\
             \x20   http_passwd              password\n\
             \x20   http_user                user\n\
             \x20   port                     1234\n\
             \x20   retry_limit              300\n\
             \x20   storage.total_limit_size 1G\n\
             \x20   tls                      on\n\
             \x20   tls.verify               on\n\
             \x20   uri                      /customindex/kyma\n\
             \n";
        assert_eq!(http_output_section("foo", &http).render(), expected);
    }

    #[test]
    fn test_secret_values_become_variables() {
        let mut spec = http_spec(ValueType::literal("localhost"));
        let http = spec.output.http.as_mut().unwrap();
        http.password = Some(ValueType::from_secret("test-name", "test-namespace", "test-key"));
        http.tls.ca = Some(ValueType::literal("ca-pem"));

        let rendered = output_section("pipeline", &spec).unwrap().render();
        assert!(rendered.contains("http_passwd              ${PIPELINE_TEST_NAMESPACE_TEST_NAME_TEST_KEY}\n"));
        assert!(rendered.contains("tls.ca_file              /fluent-bit/etc/output-tls-config/pipeline-ca.crt\n"));
        assert!(!rendered.contains("tls.crt_file"));
    }

    #[test]
    fn test_custom_output_keeps_user_keys() {
        let spec = LogPipelineSpec {
            output: LogOutput {
                custom: Some("\n    name null\n    Workers 2".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let expected = "[OUTPUT]\n\
             \x20   name                     null\n\
             \x20   match                    foo.*\n\
             \x20   alias                    foo\n\
             \x20   retry_limit              300\n\
             \x20   storage.total_limit_size 1G\n\
             \x20   workers                  2\n\
             \n";
        assert_eq!(output_section("foo", &spec).unwrap().render(), expected);
    }

    #[test]
    fn test_default_paths_skip_system_namespaces() {
        let spec = runtime(LogNamespaceSelector::default(), ContainerSelector::default());

        assert_eq!(include_paths(&spec), vec!["/var/log/containers/*_*_*-*.log"]);
        let excludes = exclude_paths(&spec, "kyma-system");
        assert_eq!(
            excludes[0],
            "/var/log/containers/telemetry-fluent-bit-*_kyma-system_fluent-bit-*.log"
        );
        assert!(excludes.contains(&"/var/log/containers/*_kube-system_*-*.log".to_string()));
        assert!(excludes.contains(&"/var/log/containers/*_kyma-system_*-*.log".to_string()));
    }

    #[test]
    fn test_included_namespaces_and_containers_are_crossed() {
        let spec = runtime(
            LogNamespaceSelector {
                selector: NamespaceSelector {
                    include: names(&["foo", "bar"]),
                    exclude: vec![],
                },
                system: false,
            },
            ContainerSelector {
                include: names(&["istio-proxy"]),
                exclude: vec![],
            },
        );

        assert_eq!(
            include_paths(&spec),
            vec![
                "/var/log/containers/*_foo_istio-proxy-*.log",
                "/var/log/containers/*_bar_istio-proxy-*.log",
            ]
        );
        assert!(!exclude_paths(&spec, "kyma-system")
            .iter()
            .any(|p| p.contains("kube-system")));
    }

    #[test]
    fn test_excluded_namespaces_and_containers() {
        let spec = runtime(
            LogNamespaceSelector {
                selector: NamespaceSelector {
                    include: vec![],
                    exclude: names(&["foo"]),
                },
                system: true,
            },
            ContainerSelector {
                include: vec![],
                exclude: names(&["bar"]),
            },
        );

        let excludes = exclude_paths(&spec, "kyma-system");
        assert!(!excludes.iter().any(|p| p.contains("kube-system")));
        assert!(excludes.ends_with(&[
            "/var/log/containers/*_foo_*-*.log".to_string(),
            "/var/log/containers/*_*_bar-*.log".to_string(),
        ]));
    }

    #[test]
    fn test_filter_order() {
        let mut spec = runtime(
            LogNamespaceSelector {
                system: true,
                ..Default::default()
            },
            ContainerSelector::default(),
        );
        spec.output.http.as_mut().unwrap().dedot = true;
        spec.fluent_bit_filters = vec![
            FluentBitFilter {
                custom: "name grep\nregex log aa".to_string(),
            },
            FluentBitFilter {
                custom: "name multiline\nmultiline.parser java".to_string(),
            },
        ];

        let rendered = pipeline_sections("foo", &spec, "kyma-system").unwrap();
        let order: Vec<&str> = rendered
            .lines()
            .filter(|l| l.trim_start().starts_with("name ") || l.trim_start().starts_with("call "))
            .map(|l| l.split_whitespace().nth(1).unwrap_or_default())
            .collect();
        assert_eq!(
            order,
            vec![
                "tail",
                "multiline",
                "record_modifier",
                "kubernetes",
                "modify",
                "grep",
                "lua",
                "enrich_app_name",
                "lua",
                "kubernetes_map_keys",
                "http",
            ]
        );
        assert!(rendered.contains("    kube_tag_prefix     foo.var.log.containers.\n"));
        assert!(rendered.contains("    regex log aa\n"));
    }

    #[test]
    fn test_custom_output_gets_no_http_filters() {
        let spec = LogPipelineSpec {
            output: LogOutput {
                custom: Some("name stdout".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let rendered = pipeline_sections("foo", &spec, "kyma-system").unwrap();
        assert!(!rendered.contains("modify"));
        assert!(!rendered.contains("lua"));
        assert!(rendered.ends_with("    storage.total_limit_size 1G\n\n"));
    }

    #[test]
    fn test_main_config_includes_sections() {
        let config = main_config(2020);
        assert!(config.starts_with("[SERVICE]\n    Daemon Off\n"));
        assert!(config.contains("    HTTP_Port 2020\n"));
        assert!(config.contains("    storage.path /data/flb-storage/\n"));
        assert!(config.ends_with("@INCLUDE dynamic/*.conf\n"));
        assert!(LUA_SCRIPT.contains("function kubernetes_map_keys"));
    }

    #[test]
    fn test_synthesis_merges_pipelines() {
        let a = FluentBitPipeline {
            name: "a".to_string(),
            spec: LogPipelineSpec {
                files: vec![FileMount {
                    name: "script.lua".to_string(),
                    content: "-- lua".to_string(),
                }],
                ..http_spec(ValueType::literal("a.example.com"))
            },
            env: BTreeMap::from([("A_DEFAULT_CREDS_PASSWORD".to_string(), b"one".to_vec())]),
            tls_files: BTreeMap::new(),
        };
        let b = FluentBitPipeline {
            name: "b".to_string(),
            spec: http_spec(ValueType::literal("b.example.com")),
            ..Default::default()
        };

        let config = synthesize(&[a.clone(), b.clone()], "kyma-system");
        assert_eq!(config.pipelines, vec!["a", "b"]);
        assert_eq!(config.sections.keys().collect::<Vec<_>>(), vec!["a.conf", "b.conf"]);
        assert_eq!(config.files.get("script.lua").map(String::as_str), Some("-- lua"));

        let mut rotated = a;
        rotated.env.insert("A_DEFAULT_CREDS_PASSWORD".to_string(), b"two".to_vec());
        let after = synthesize(&[rotated, b], "kyma-system");
        assert_eq!(config.sections, after.sections);
        assert_ne!(config.checksum, after.checksum);
    }

    #[test]
    fn test_escaped_line_breaks_are_restored() {
        assert_eq!(unescape_pem("-----BEGIN-----\\nabc\\n"), b"-----BEGIN-----\nabc\n".to_vec());
    }
}
