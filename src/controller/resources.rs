//! Kubernetes resources generated for each signal
//!
//! Every signal gets a gateway (Deployment, OTLP Service, metrics Service,
//! ConfigMap, exporter Secret, NetworkPolicy, RBAC) and, for logs and metrics,
//! an optional node agent (DaemonSet plus the same supporting objects minus
//! the OTLP Service and Secret). Objects are rebuilt from scratch on every
//! pass and applied with server-side apply, so external drift is corrected.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvFromSource,
    EnvVar, EnvVarSource, HTTPGetAction, HostPathVolumeSource, ObjectFieldSelector,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Secret,
    SecretEnvSource, SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::{ByteString, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::controller::config::types::{
    ENV_VAR_NODE_NAME, ENV_VAR_POD_IP, HEALTH_CHECK_PORT, METRICS_PORT, OTLP_GRPC_PORT,
    OTLP_HTTP_PORT,
};
use crate::controller::config::{
    Permission, RenderedDocument, SynthesizedConfig, UsablePipeline, LOG_AGENT_STATE_DIR, LOG_ROOT,
};
use crate::controller::pipeline::SignalType;
use crate::crd::OtlpEndpoints;
use crate::error::{Error, Result};

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "telemetry-operator";
/// Value of `app.kubernetes.io/managed-by` on generated objects
pub const MANAGED_BY: &str = "telemetry-operator";
/// Label carrying the signal a generated object belongs to
pub const SIGNAL_LABEL: &str = "telemetry.kyma-project.io/signal";
/// Pod annotation that rolls the workload when configuration or secrets change
pub const CHECKSUM_ANNOTATION: &str = "checksum/config";

const NAME_LABEL: &str = "app.kubernetes.io/name";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Name of the Fluent Bit DaemonSet and its supporting objects
pub const FLUENT_BIT_NAME: &str = "telemetry-fluent-bit";
/// Fluent Bit HTTP server port serving health and metrics
pub const FLUENT_BIT_METRICS_PORT: i32 = 2020;
pub const FLUENT_BIT_METRICS_PATH: &str = "/api/v2/metrics/prometheus";
const COLLECTOR_METRICS_PATH: &str = "/metrics";

const CONFIG_KEY: &str = "relay.conf";
const CONFIG_MOUNT_PATH: &str = "/conf";
const CONTAINER_NAME: &str = "collector";
const COLLECTOR_USER: i64 = 10001;

/// Role a generated workload plays for its signal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Gateway,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Gateway => "gateway",
            Role::Agent => "agent",
        }
    }
}

/// Name and placement of one generated workload and its supporting objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Component {
    pub signal: SignalType,
    pub role: Role,
    pub name: String,
    pub namespace: String,
    /// Port and path of the workload's own Prometheus metrics
    pub metrics_port: i32,
    pub metrics_path: &'static str,
}

impl Component {
    pub fn gateway(signal: SignalType, namespace: &str) -> Self {
        Self {
            signal,
            role: Role::Gateway,
            name: signal.gateway_name(),
            namespace: namespace.to_string(),
            metrics_port: METRICS_PORT,
            metrics_path: COLLECTOR_METRICS_PATH,
        }
    }

    /// `None` for signals without node-local collection
    pub fn agent(signal: SignalType, namespace: &str) -> Option<Self> {
        signal.agent_name().map(|name| Self {
            signal,
            role: Role::Agent,
            name,
            namespace: namespace.to_string(),
            metrics_port: METRICS_PORT,
            metrics_path: COLLECTOR_METRICS_PATH,
        })
    }

    /// Fluent Bit log agent serving pipelines with HTTP or custom outputs
    pub fn fluent_bit(namespace: &str) -> Self {
        Self {
            signal: SignalType::Log,
            role: Role::Agent,
            name: FLUENT_BIT_NAME.to_string(),
            namespace: namespace.to_string(),
            metrics_port: FLUENT_BIT_METRICS_PORT,
            metrics_path: FLUENT_BIT_METRICS_PATH,
        }
    }

    /// Service tenants push OTLP data to
    pub fn otlp_service_name(&self) -> String {
        format!("telemetry-otlp-{}", self.signal.otel_signal())
    }

    pub fn metrics_service_name(&self) -> String {
        format!("{}-metrics", self.name)
    }

    /// Label selector matching the pods of this workload
    pub fn pod_selector(&self) -> String {
        format!("{}={}", NAME_LABEL, self.name)
    }

    /// Internal telemetry endpoint of one pod, scraped by the self-monitor
    pub fn pod_metrics_url(&self, pod_ip: &str) -> String {
        format!("http://{}:{}{}", pod_ip, self.metrics_port, self.metrics_path)
    }
}

/// Push endpoints published on the Telemetry status
pub fn otlp_endpoints(signal: SignalType, namespace: &str) -> OtlpEndpoints {
    let service = Component::gateway(signal, namespace).otlp_service_name();
    OtlpEndpoints {
        grpc: format!("http://{service}.{namespace}:{OTLP_GRPC_PORT}"),
        http: format!("http://{service}.{namespace}:{OTLP_HTTP_PORT}"),
    }
}

/// Workload settings that come from operator flags rather than pipelines
#[derive(Clone, Debug)]
pub struct WorkloadOptions {
    pub image: String,
    pub priority_class_name: Option<String>,
}

/// Get the standard labels for a generated object
pub fn standard_labels(component: &Component) -> BTreeMap<String, String> {
    let mut labels = selector_labels(component);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.insert(PART_OF_LABEL.to_string(), "telemetry".to_string());
    labels.insert(COMPONENT_LABEL.to_string(), component.role.as_str().to_string());
    labels.insert(SIGNAL_LABEL.to_string(), component.signal.as_str().to_string());
    labels
}

/// Labels selecting the pods of a workload; immutable once created
pub(crate) fn selector_labels(component: &Component) -> BTreeMap<String, String> {
    BTreeMap::from([(NAME_LABEL.to_string(), component.name.clone())])
}

/// Label selector matching every object generated by this operator
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}

/// Signal of a generated object, read back from its labels
pub fn managed_signal(meta: &ObjectMeta) -> Option<SignalType> {
    let labels = meta.labels.as_ref()?;
    if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGED_BY) {
        return None;
    }
    let value = labels.get(SIGNAL_LABEL)?;
    SignalType::ALL.into_iter().find(|s| s.as_str() == value)
}

/// Owner references to every contributing pipeline.
///
/// Generated objects are shared by all pipelines of a signal, so none of the
/// references is a controller reference and teardown is done explicitly.
pub fn owner_references(usable: &[UsablePipeline]) -> Vec<OwnerReference> {
    let mut owners: Vec<OwnerReference> = usable
        .iter()
        .map(|p| OwnerReference {
            api_version: p.view.signal().api_version(),
            kind: p.view.signal().pipeline_kind().to_string(),
            name: p.view.name.clone(),
            uid: p.view.uid.clone(),
            controller: Some(false),
            block_owner_deletion: Some(false),
        })
        .collect();
    owners.sort_by(|a, b| a.name.cmp(&b.name));
    owners
}

pub(crate) fn object_meta(component: &Component, name: String, owners: &[OwnerReference]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(component.namespace.clone()),
        labels: Some(standard_labels(component)),
        owner_references: if owners.is_empty() {
            None
        } else {
            Some(owners.to_vec())
        },
        ..Default::default()
    }
}

pub(crate) fn cluster_meta(component: &Component, owners: &[OwnerReference]) -> ObjectMeta {
    ObjectMeta {
        namespace: None,
        ..object_meta(component, component.name.clone(), owners)
    }
}

// ============================================================================
// RBAC
// ============================================================================

pub fn build_service_account(component: &Component, owners: &[OwnerReference]) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(component, component.name.clone(), owners),
        ..Default::default()
    }
}

/// Rules granting exactly the API access the rendered document needs
pub fn policy_rules(permissions: &BTreeSet<Permission>) -> Vec<PolicyRule> {
    let mut by_group: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut non_resource_urls = BTreeSet::new();

    for permission in permissions {
        let grants: &[(&str, &[&str])] = match permission {
            Permission::K8sMetadata => &[
                ("", &["namespaces", "nodes", "pods"]),
                ("apps", &["daemonsets", "deployments", "replicasets", "statefulsets"]),
                ("batch", &["jobs"]),
            ],
            Permission::KubeletStats => &[("", &["nodes", "nodes/proxy", "nodes/stats"])],
            Permission::ServiceDiscovery => {
                non_resource_urls.insert("/metrics");
                &[
                    ("", &["endpoints", "nodes", "pods", "services"]),
                    ("discovery.k8s.io", &["endpointslices"]),
                ]
            }
        };
        for (group, resources) in grants {
            by_group.entry(group).or_default().extend(resources.iter());
        }
    }

    let verbs = || vec!["get".to_string(), "list".to_string(), "watch".to_string()];
    let mut rules: Vec<PolicyRule> = by_group
        .into_iter()
        .map(|(group, resources)| PolicyRule {
            api_groups: Some(vec![group.to_string()]),
            resources: Some(resources.into_iter().map(String::from).collect()),
            verbs: verbs(),
            ..Default::default()
        })
        .collect();

    if !non_resource_urls.is_empty() {
        rules.push(PolicyRule {
            non_resource_urls: Some(non_resource_urls.into_iter().map(String::from).collect()),
            verbs: vec!["get".to_string()],
            ..Default::default()
        });
    }
    rules
}

pub fn build_cluster_role(
    component: &Component,
    permissions: &BTreeSet<Permission>,
    owners: &[OwnerReference],
) -> ClusterRole {
    ClusterRole {
        metadata: cluster_meta(component, owners),
        rules: Some(policy_rules(permissions)),
        ..Default::default()
    }
}

pub fn build_cluster_role_binding(component: &Component, owners: &[OwnerReference]) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: cluster_meta(component, owners),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: component.name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: component.name.clone(),
            namespace: Some(component.namespace.clone()),
            ..Default::default()
        }]),
    }
}

// ============================================================================
// ConfigMap and Secret
// ============================================================================

pub fn build_config_map(
    component: &Component,
    document: &RenderedDocument,
    owners: &[OwnerReference],
) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(component, component.name.clone(), owners),
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), document.yaml.clone())])),
        ..Default::default()
    }
}

/// Exporter credentials, exposed to the gateway as environment variables
pub fn build_env_secret(
    component: &Component,
    env: &BTreeMap<String, Vec<u8>>,
    owners: &[OwnerReference],
) -> Secret {
    Secret {
        metadata: object_meta(component, component.name.clone(), owners),
        data: Some(
            env.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                .collect(),
        ),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

// ============================================================================
// Workloads
// ============================================================================

pub(crate) fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(HEALTH_CHECK_PORT),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn resources(cpu_request: &str, memory_request: &str, memory_limit: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu_request.to_string())),
            ("memory".to_string(), Quantity(memory_request.to_string())),
        ])),
        limits: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(memory_limit.to_string()),
        )])),
        ..Default::default()
    }
}

/// The log agent reads host files owned by root
fn reads_host_logs(component: &Component) -> bool {
    component.role == Role::Agent && component.signal == SignalType::Log
}

fn build_container(component: &Component, image: &str) -> Container {
    let mut env = vec![field_env(ENV_VAR_POD_IP, "status.podIP")];
    let mut ports = vec![
        container_port("http-metrics", METRICS_PORT),
        container_port("health", HEALTH_CHECK_PORT),
    ];
    let mut volume_mounts = vec![VolumeMount {
        name: "config".to_string(),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];
    let mut env_from = None;

    match component.role {
        Role::Gateway => {
            ports.push(container_port("grpc-collector", OTLP_GRPC_PORT));
            ports.push(container_port("http-collector", OTLP_HTTP_PORT));
            env_from = Some(vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: Some(component.name.clone()),
                    optional: Some(true),
                }),
                ..Default::default()
            }]);
        }
        Role::Agent => {
            env.push(field_env(ENV_VAR_NODE_NAME, "spec.nodeName"));
        }
    }

    if reads_host_logs(component) {
        volume_mounts.push(VolumeMount {
            name: "varlogpods".to_string(),
            mount_path: LOG_ROOT.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "varlibstate".to_string(),
            mount_path: LOG_AGENT_STATE_DIR.to_string(),
            ..Default::default()
        });
    }

    let (cpu, memory, limit) = match component.role {
        Role::Gateway => ("25m", "32Mi", "2Gi"),
        Role::Agent => ("15m", "50Mi", "1Gi"),
    };

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        args: Some(vec![format!("--config={CONFIG_MOUNT_PATH}/{CONFIG_KEY}")]),
        env: Some(env),
        env_from,
        ports: Some(ports),
        volume_mounts: Some(volume_mounts),
        liveness_probe: Some(health_probe()),
        readiness_probe: Some(health_probe()),
        resources: Some(resources(cpu, memory, limit)),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(!reads_host_logs(component)),
            run_as_user: Some(if reads_host_logs(component) { 0 } else { COLLECTOR_USER }),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn host_path(name: &str, path: &str, kind: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(kind.to_string()),
        }),
        ..Default::default()
    }
}

fn build_pod_template(
    component: &Component,
    checksum: &str,
    options: &WorkloadOptions,
) -> PodTemplateSpec {
    let mut volumes = vec![Volume {
        name: "config".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(component.name.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if reads_host_logs(component) {
        volumes.push(host_path("varlogpods", LOG_ROOT, "Directory"));
        volumes.push(host_path("varlibstate", LOG_AGENT_STATE_DIR, "DirectoryOrCreate"));
    }

    let tolerations = match component.role {
        Role::Agent => Some(vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]),
        Role::Gateway => None,
    };

    PodTemplateSpec {
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
            volumes: Some(volumes),
            tolerations,
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(!reads_host_logs(component)),
                seccomp_profile: Some(k8s_openapi::api::core::v1::SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

pub fn build_gateway_deployment(
    component: &Component,
    replicas: i32,
    checksum: &str,
    options: &WorkloadOptions,
    owners: &[OwnerReference],
) -> Deployment {
    Deployment {
        metadata: object_meta(component, component.name.clone(), owners),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(component)),
                ..Default::default()
            },
            template: build_pod_template(component, checksum, options),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_agent_daemonset(
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
            template: build_pod_template(component, checksum, options),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Services
// ============================================================================

pub(crate) fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

/// ClusterIP Service tenants push OTLP data to
pub fn build_otlp_service(component: &Component, owners: &[OwnerReference]) -> Service {
    Service {
        metadata: object_meta(component, component.otlp_service_name(), owners),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(component)),
            ports: Some(vec![
                service_port("grpc-collector", OTLP_GRPC_PORT),
                service_port("http-collector", OTLP_HTTP_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service exposing the workload's own metrics to the self-monitor
pub fn build_metrics_service(component: &Component, owners: &[OwnerReference]) -> Service {
    Service {
        metadata: object_meta(component, component.metrics_service_name(), owners),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(component)),
            ports: Some(vec![service_port("http-metrics", component.metrics_port)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// NetworkPolicy
// ============================================================================

/// Allows ingress only on the ports the role serves; egress to backends stays open
pub fn build_network_policy(component: &Component, owners: &[OwnerReference]) -> NetworkPolicy {
    let mut ports = vec![METRICS_PORT, HEALTH_CHECK_PORT];
    if component.role == Role::Gateway {
        ports.extend([OTLP_GRPC_PORT, OTLP_HTTP_PORT]);
    }
    network_policy(component, ports, owners)
}

pub(crate) fn network_policy(component: &Component, ports: Vec<i32>, owners: &[OwnerReference]) -> NetworkPolicy {
    NetworkPolicy {
        metadata: object_meta(component, component.name.clone(), owners),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector_labels(component)),
                ..Default::default()
            },
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: None,
                ports: Some(
                    ports
                        .into_iter()
                        .map(|port| NetworkPolicyPort {
                            port: Some(IntOrString::Int(port)),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
            }]),
            egress: Some(vec![NetworkPolicyEgressRule::default()]),
        }),
    }
}

// ============================================================================
// Apply and teardown
// ============================================================================

pub(crate) async fn apply_namespaced<K>(client: &Client, namespace: &str, obj: &K) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize,
{
    let name = obj.meta().name.clone().ok_or(Error::MissingField("metadata.name"))?;
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
        .await?;
    debug!("Applied {} {}/{}", K::kind(&()), namespace, name);
    Ok(())
}

pub(crate) async fn apply_cluster<K>(client: &Client, obj: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
{
    let name = obj.meta().name.clone().ok_or(Error::MissingField("metadata.name"))?;
    let api: Api<K> = Api::all(client.clone());
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
        .await?;
    debug!("Applied {} {}", K::kind(&()), name);
    Ok(())
}

pub(crate) async fn delete_if_exists<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => info!("Deleted {} {}", K::kind(&()), name),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("{} {} not found, skipping delete", K::kind(&()), name);
        }
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}

/// Apply the RBAC, config and network objects shared by both roles
async fn apply_supporting(
    client: &Client,
    component: &Component,
    document: &RenderedDocument,
    owners: &[OwnerReference],
) -> Result<()> {
    let ns = &component.namespace;
    apply_namespaced(client, ns, &build_service_account(component, owners)).await?;
    apply_cluster(client, &build_cluster_role(component, &document.permissions, owners)).await?;
    apply_cluster(client, &build_cluster_role_binding(component, owners)).await?;
    apply_namespaced(client, ns, &build_config_map(component, document, owners)).await?;
    apply_namespaced(client, ns, &build_metrics_service(component, owners)).await?;
    apply_namespaced(client, ns, &build_network_policy(component, owners)).await?;
    Ok(())
}

/// Apply every object of one signal to match the synthesized configuration.
///
/// The agent set is removed when no usable pipeline needs node-local
/// collection.
#[instrument(skip(client, config, owners, options), fields(signal = %config.signal))]
pub async fn ensure_signal_resources(
    client: &Client,
    namespace: &str,
    config: &SynthesizedConfig,
    owners: &[OwnerReference],
    replicas: i32,
    options: &WorkloadOptions,
) -> Result<()> {
    let gateway = Component::gateway(config.signal, namespace);
    apply_supporting(client, &gateway, &config.gateway, owners).await?;
    apply_namespaced(client, namespace, &build_env_secret(&gateway, &config.env, owners)).await?;
    apply_namespaced(client, namespace, &build_otlp_service(&gateway, owners)).await?;
    apply_namespaced(
        client,
        namespace,
        &build_gateway_deployment(&gateway, replicas, &config.checksum, options, owners),
    )
    .await?;
    info!(
        "Gateway {} applied for {} pipelines",
        gateway.name,
        config.pipelines.len()
    );

    if let Some(agent) = Component::agent(config.signal, namespace) {
        match &config.agent {
            Some(document) => {
                apply_supporting(client, &agent, document, owners).await?;
                apply_namespaced(
                    client,
                    namespace,
                    &build_agent_daemonset(&agent, &config.checksum, options, owners),
                )
                .await?;
                info!("Agent {} applied", agent.name);
            }
            None => delete_component(client, &agent).await?,
        }
    }

    Ok(())
}

/// Delete every object of one component. All deletions are attempted; the
/// first failure is returned.
#[instrument(skip(client), fields(name = %component.name, namespace = %component.namespace))]
pub async fn delete_component(client: &Client, component: &Component) -> Result<()> {
    let ns = &component.namespace;
    let name = &component.name;
    let mut results = Vec::new();

    match component.role {
        Role::Gateway => {
            results.push(delete_if_exists(Api::<Deployment>::namespaced(client.clone(), ns), name).await);
            results.push(delete_if_exists(Api::<Secret>::namespaced(client.clone(), ns), name).await);
            results.push(
                delete_if_exists(
                    Api::<Service>::namespaced(client.clone(), ns),
                    &component.otlp_service_name(),
                )
                .await,
            );
        }
        Role::Agent => {
            results.push(delete_if_exists(Api::<DaemonSet>::namespaced(client.clone(), ns), name).await);
        }
    }

    results.push(
        delete_if_exists(
            Api::<Service>::namespaced(client.clone(), ns),
            &component.metrics_service_name(),
        )
        .await,
    );
    results.push(delete_if_exists(Api::<ConfigMap>::namespaced(client.clone(), ns), name).await);
    results.push(delete_if_exists(Api::<NetworkPolicy>::namespaced(client.clone(), ns), name).await);
    results.push(delete_if_exists(Api::<ClusterRoleBinding>::all(client.clone()), name).await);
    results.push(delete_if_exists(Api::<ClusterRole>::all(client.clone()), name).await);
    results.push(delete_if_exists(Api::<ServiceAccount>::namespaced(client.clone(), ns), name).await);

    results.into_iter().collect()
}

/// Delete the gateway and agent sets of a signal
#[instrument(skip(client))]
pub async fn delete_signal_resources(client: &Client, namespace: &str, signal: SignalType) -> Result<()> {
    let gateway = delete_component(client, &Component::gateway(signal, namespace)).await;
    let agent = match Component::agent(signal, namespace) {
        Some(agent) => delete_component(client, &agent).await,
        None => Ok(()),
    };
    info!("Removed generated {} resources", signal);
    gateway.and(agent)
}
