//! Kubernetes objects of the Fluent Bit log agent
//!
//! One DaemonSet serves every Fluent Bit pipeline. Its configuration is
//! split over four ConfigMaps (main file, Lua helpers, per-pipeline
//! sections, user files) and two Secrets (environment, TLS files) so each
//! part can be mounted where Fluent Bit expects it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EnvFromSource, HTTPGetAction,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, Secret, SecretEnvSource,
    SecretVolumeSource, SecurityContext, Service, ServiceAccount, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::Client;
use tracing::{info, instrument};

use super::config::{
    main_config, FluentBitConfig, DATA_DIR, FILES_DIR, LUA_SCRIPT, LUA_SCRIPT_KEY, LUA_SCRIPT_PATH,
    MAIN_CONFIG_KEY, SECTIONS_DIR, TLS_CONFIG_DIR,
};
use crate::controller::resources::{
    apply_cluster, apply_namespaced, build_cluster_role_binding, build_metrics_service,
    build_service_account, cluster_meta, container_port, delete_if_exists, host_path,
    network_policy, object_meta, resources, selector_labels, standard_labels, Component,
    WorkloadOptions, CHECKSUM_ANNOTATION, FLUENT_BIT_METRICS_PORT,
};
use crate::error::Result;

const CONTAINER_NAME: &str = "fluent-bit";
const HTTP_PORT_NAME: &str = "http";
/// Host directory keeping tail offsets and the buffer across restarts
const HOST_DATA_DIR: &str = "/var/telemetry-fluent-bit";

/// Names of the supporting objects, derived from the DaemonSet name
pub fn lua_config_map_name(component: &Component) -> String {
    format!("{}-luascripts", component.name)
}

pub fn sections_config_map_name(component: &Component) -> String {
    format!("{}-sections", component.name)
}

pub fn files_config_map_name(component: &Component) -> String {
    format!("{}-files", component.name)
}

pub fn env_secret_name(component: &Component) -> String {
    format!("{}-env", component.name)
}

pub fn tls_secret_name(component: &Component) -> String {
    format!("{}-output-tls-config", component.name)
}

// ============================================================================
// RBAC
// ============================================================================

/// The kubernetes filter reads pod and namespace metadata
pub fn build_cluster_role(component: &Component, owners: &[OwnerReference]) -> ClusterRole {
    ClusterRole {
        metadata: cluster_meta(component, owners),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["namespaces".to_string(), "pods".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    }
}

// ============================================================================
// ConfigMaps and Secrets
// ============================================================================

fn config_map(component: &Component, name: String, data: BTreeMap<String, String>, owners: &[OwnerReference]) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(component, name, owners),
        data: Some(data),
        ..Default::default()
    }
}

fn secret(component: &Component, name: String, data: &BTreeMap<String, Vec<u8>>, owners: &[OwnerReference]) -> Secret {
    Secret {
        metadata: object_meta(component, name, owners),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                .collect(),
        ),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

pub fn build_main_config_map(component: &Component, owners: &[OwnerReference]) -> ConfigMap {
    config_map(
        component,
        component.name.clone(),
        BTreeMap::from([(MAIN_CONFIG_KEY.to_string(), main_config(FLUENT_BIT_METRICS_PORT))]),
        owners,
    )
}

pub fn build_lua_config_map(component: &Component, owners: &[OwnerReference]) -> ConfigMap {
    config_map(
        component,
        lua_config_map_name(component),
        BTreeMap::from([(LUA_SCRIPT_KEY.to_string(), LUA_SCRIPT.to_string())]),
        owners,
    )
}

pub fn build_sections_config_map(component: &Component, config: &FluentBitConfig, owners: &[OwnerReference]) -> ConfigMap {
    config_map(component, sections_config_map_name(component), config.sections.clone(), owners)
}

pub fn build_files_config_map(component: &Component, config: &FluentBitConfig, owners: &[OwnerReference]) -> ConfigMap {
    config_map(component, files_config_map_name(component), config.files.clone(), owners)
}

/// Output credentials and user variables, exposed as environment variables
pub fn build_env_secret(component: &Component, config: &FluentBitConfig, owners: &[OwnerReference]) -> Secret {
    secret(component, env_secret_name(component), &config.env, owners)
}

/// TLS material is mounted as files; PEM blocks can exceed the size limit
/// of a single environment variable
pub fn build_tls_secret(component: &Component, config: &FluentBitConfig, owners: &[OwnerReference]) -> Secret {
    secret(component, tls_secret_name(component), &config.tls_files, owners)
}

// ============================================================================
// DaemonSet
// ============================================================================

fn http_check(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String(HTTP_PORT_NAME.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, sub_path: Option<&str>, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn config_map_volume(name: &str, config_map: String, optional: bool) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map),
            optional: optional.then_some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_container(component: &Component, image: &str) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        env_from: Some(vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: Some(env_secret_name(component)),
                optional: Some(true),
            }),
            ..Default::default()
        }]),
        ports: Some(vec![container_port(HTTP_PORT_NAME, FLUENT_BIT_METRICS_PORT)]),
        liveness_probe: Some(http_check("/")),
        readiness_probe: Some(http_check("/api/v1/health")),
        resources: Some(resources("100m", "50Mi", "1Gi")),
        volume_mounts: Some(vec![
            mount("config", &format!("/fluent-bit/etc/{MAIN_CONFIG_KEY}"), Some(MAIN_CONFIG_KEY), true),
            mount("dynamic", SECTIONS_DIR, None, true),
            mount("luascripts", LUA_SCRIPT_PATH, Some(LUA_SCRIPT_KEY), true),
            mount("varlog", "/var/log", None, true),
            mount("data", DATA_DIR, None, false),
            mount("files", FILES_DIR, None, true),
            mount("output-tls-config", TLS_CONFIG_DIR, None, true),
        ]),
        // reads root-owned host log files
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(false),
            run_as_user: Some(0),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_volumes(component: &Component) -> Vec<Volume> {
    vec![
        config_map_volume("config", component.name.clone(), false),
        config_map_volume("dynamic", sections_config_map_name(component), true),
        config_map_volume("luascripts", lua_config_map_name(component), false),
        config_map_volume("files", files_config_map_name(component), true),
        host_path("varlog", "/var/log", "Directory"),
        host_path("data", HOST_DATA_DIR, "DirectoryOrCreate"),
        Volume {
            name: "output-tls-config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls_secret_name(component)),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

pub fn build_daemonset(
    component: &Component,
    checksum: &str,
    options: &WorkloadOptions,
    owners: &[OwnerReference],
) -> DaemonSet {
    DaemonSet {
        metadata: object_meta(component, component.name.clone(), owners),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(component)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(component)),
                    annotations: Some(BTreeMap::from([(
                        CHECKSUM_ANNOTATION.to_string(),
                        checksum.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(component.name.clone()),
                    priority_class_name: options.priority_class_name.clone(),
                    containers: vec![build_container(component, &options.image)],
                    volumes: Some(build_volumes(component)),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    security_context: Some(PodSecurityContext {
                        seccomp_profile: Some(k8s_openapi::api::core::v1::SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Only the HTTP server is reachable; egress to the backends stays open
pub fn build_network_policy(component: &Component, owners: &[OwnerReference]) -> NetworkPolicy {
    network_policy(component, vec![FLUENT_BIT_METRICS_PORT], owners)
}

// ============================================================================
// Apply and teardown
// ============================================================================

/// Apply every Fluent Bit object to match the rendered configuration
#[instrument(skip(client, config, owners, options), fields(namespace = %namespace))]
pub async fn ensure_fluent_bit_resources(
    client: &Client,
    namespace: &str,
    config: &FluentBitConfig,
    owners: &[OwnerReference],
    options: &WorkloadOptions,
) -> Result<()> {
    let component = Component::fluent_bit(namespace);
    let c = &component;

    apply_namespaced(client, namespace, &build_service_account(c, owners)).await?;
    apply_cluster(client, &build_cluster_role(c, owners)).await?;
    apply_cluster(client, &build_cluster_role_binding(c, owners)).await?;
    apply_namespaced(client, namespace, &build_main_config_map(c, owners)).await?;
    apply_namespaced(client, namespace, &build_lua_config_map(c, owners)).await?;
    apply_namespaced(client, namespace, &build_sections_config_map(c, config, owners)).await?;
    apply_namespaced(client, namespace, &build_files_config_map(c, config, owners)).await?;
    apply_namespaced(client, namespace, &build_env_secret(c, config, owners)).await?;
    apply_namespaced(client, namespace, &build_tls_secret(c, config, owners)).await?;
    apply_namespaced(client, namespace, &build_metrics_service(c, owners)).await?;
    apply_namespaced(client, namespace, &build_network_policy(c, owners)).await?;
    apply_namespaced(client, namespace, &build_daemonset(c, &config.checksum, options, owners)).await?;

    info!(
        "Fluent Bit {} applied for {} pipelines",
        component.name,
        config.pipelines.len()
    );
    Ok(())
}

/// Delete every Fluent Bit object. All deletions are attempted; the first
/// failure is returned.
#[instrument(skip(client))]
pub async fn delete_fluent_bit_resources(client: &Client, namespace: &str) -> Result<()> {
    let component = Component::fluent_bit(namespace);
    let name = component.name.as_str();
    let config_maps = || Api::<ConfigMap>::namespaced(client.clone(), namespace);
    let secrets = || Api::<Secret>::namespaced(client.clone(), namespace);

    let results = vec![
        delete_if_exists(Api::<DaemonSet>::namespaced(client.clone(), namespace), name).await,
        delete_if_exists(config_maps(), name).await,
        delete_if_exists(config_maps(), &lua_config_map_name(&component)).await,
        delete_if_exists(config_maps(), &sections_config_map_name(&component)).await,
        delete_if_exists(config_maps(), &files_config_map_name(&component)).await,
        delete_if_exists(secrets(), &env_secret_name(&component)).await,
        delete_if_exists(secrets(), &tls_secret_name(&component)).await,
        delete_if_exists(
            Api::<Service>::namespaced(client.clone(), namespace),
            &component.metrics_service_name(),
        )
        .await,
        delete_if_exists(Api::<NetworkPolicy>::namespaced(client.clone(), namespace), name).await,
        delete_if_exists(Api::<ClusterRoleBinding>::all(client.clone()), name).await,
        delete_if_exists(Api::<ClusterRole>::all(client.clone()), name).await,
        delete_if_exists(Api::<ServiceAccount>::namespaced(client.clone(), namespace), name).await,
    ];
    info!("Removed Fluent Bit resources");
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::resources::managed_signal;
    use crate::controller::pipeline::SignalType;

    fn component() -> Component {
        Component::fluent_bit("kyma-system")
    }

    fn options() -> WorkloadOptions {
        WorkloadOptions {
            image: "fluent/fluent-bit:3.1.3".to_string(),
            priority_class_name: Some("telemetry-priority".to_string()),
        }
    }

    #[test]
    fn test_daemonset_mounts_every_config_part() {
        let ds = build_daemonset(&component(), "abc123", &options(), &[]);
        let template = ds.spec.unwrap().template;
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations.get(CHECKSUM_ANNOTATION).map(String::as_str), Some("abc123"));

        let pod = template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("telemetry-fluent-bit"));
        assert_eq!(pod.priority_class_name.as_deref(), Some("telemetry-priority"));

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("fluent/fluent-bit:3.1.3"));
        let env_from = container.env_from.as_ref().unwrap();
        assert_eq!(
            env_from[0].secret_ref.as_ref().and_then(|s| s.name.as_deref()),
            Some("telemetry-fluent-bit-env")
        );

        let mounts = container.volume_mounts.as_ref().unwrap();
        let script = mounts.iter().find(|m| m.name == "luascripts").unwrap();
        assert_eq!(script.mount_path, "/fluent-bit/scripts/filter-script.lua");
        assert_eq!(script.sub_path.as_deref(), Some("filter-script.lua"));
        assert!(mounts.iter().any(|m| m.mount_path == "/fluent-bit/etc/dynamic"));

        let volumes = pod.volumes.unwrap();
        let sections = volumes.iter().find(|v| v.name == "dynamic").unwrap();
        assert_eq!(
            sections.config_map.as_ref().and_then(|c| c.name.as_deref()),
            Some("telemetry-fluent-bit-sections")
        );
        let tls = volumes.iter().find(|v| v.name == "output-tls-config").unwrap();
        assert_eq!(tls.secret.as_ref().and_then(|s| s.optional), Some(true));
    }

    #[test]
    fn test_objects_are_labelled_as_log() {
        let cm = build_lua_config_map(&component(), &[]);
        assert_eq!(cm.metadata.name.as_deref(), Some("telemetry-fluent-bit-luascripts"));
        assert_eq!(managed_signal(&cm.metadata), Some(SignalType::Log));
    }

    #[test]
    fn test_config_objects_carry_rendered_data() {
        let config = FluentBitConfig {
            sections: BTreeMap::from([("a.conf".to_string(), "[INPUT]\n".to_string())]),
            env: BTreeMap::from([("A_DEFAULT_CREDS_PASSWORD".to_string(), b"secret".to_vec())]),
            ..Default::default()
        };

        let sections = build_sections_config_map(&component(), &config, &[]);
        assert_eq!(sections.data.unwrap().get("a.conf").map(String::as_str), Some("[INPUT]\n"));

        let env = build_env_secret(&component(), &config, &[]);
        assert_eq!(env.metadata.name.as_deref(), Some("telemetry-fluent-bit-env"));
        assert_eq!(
            env.data.unwrap().get("A_DEFAULT_CREDS_PASSWORD"),
            Some(&ByteString(b"secret".to_vec()))
        );

        let main = build_main_config_map(&component(), &[]);
        assert!(main.data.unwrap()[MAIN_CONFIG_KEY].contains("HTTP_Port 2020"));
    }

    #[test]
    fn test_metrics_are_served_on_the_http_port() {
        let service = build_metrics_service(&component(), &[]);
        assert_eq!(service.metadata.name.as_deref(), Some("telemetry-fluent-bit-metrics"));
        assert_eq!(service.spec.unwrap().ports.unwrap()[0].port, 2020);

        let policy = build_network_policy(&component(), &[]);
        let ingress = policy.spec.unwrap().ingress.unwrap();
        let ports = ingress[0].ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, Some(IntOrString::Int(2020)));
    }

    #[test]
    fn test_cluster_role_reads_pod_metadata() {
        let role = build_cluster_role(&component(), &[]);
        assert!(role.metadata.namespace.is_none());
        let rules = role.rules.unwrap();
        assert_eq!(rules[0].resources.as_deref(), Some(&["namespaces".to_string(), "pods".to_string()][..]));
    }
}
