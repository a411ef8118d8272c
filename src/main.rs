#[cfg(feature = "rest-api")]
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use rand::Rng;
use telemetry_k8s::controller::overrides::load_overrides;
use telemetry_k8s::controller::validator::DEFAULT_MAX_PIPELINES;
use telemetry_k8s::controller::{
    self, ControllerState, OperatorSettings, SelfMonitor, SignalType, TelemetryPipeline,
};
use telemetry_k8s::crd::{LogPipeline, MetricPipeline, Telemetry, TracePipeline};
use telemetry_k8s::{scheduler, telemetry, Error};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the pipelines and Telemetry resources in the cluster
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace of the Telemetry resource and the generated collectors
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kyma-system")]
    namespace: String,

    /// OpenTelemetry Collector image for gateways and agents
    #[arg(
        long,
        env = "COLLECTOR_IMAGE",
        default_value = "otel/opentelemetry-collector-contrib:0.102.1"
    )]
    collector_image: String,

    /// Fluent Bit image for LogPipelines with an HTTP or custom output
    #[arg(long, env = "FLUENT_BIT_IMAGE", default_value = "fluent/fluent-bit:3.1.3")]
    fluent_bit_image: String,

    /// PriorityClass assigned to the generated workloads
    #[arg(long, env = "PRIORITY_CLASS_NAME")]
    priority_class_name: Option<String>,

    /// Cluster name used when the Telemetry resource does not set one
    #[arg(long, env = "CLUSTER_NAME", default_value = "kyma")]
    cluster_name: String,

    #[arg(long, env = "MAX_LOG_PIPELINES", default_value_t = DEFAULT_MAX_PIPELINES)]
    max_log_pipelines: usize,

    #[arg(long, env = "MAX_TRACE_PIPELINES", default_value_t = DEFAULT_MAX_PIPELINES)]
    max_trace_pipelines: usize,

    #[arg(long, env = "MAX_METRIC_PIPELINES", default_value_t = DEFAULT_MAX_PIPELINES)]
    max_metric_pipelines: usize,

    /// Days before expiry at which a client certificate is reported
    #[arg(
        long,
        env = "CERT_EXPIRY_LEAD_DAYS",
        default_value_t = controller::tls_cert::DEFAULT_CERT_EXPIRY_LEAD_TIME_DAYS
    )]
    cert_expiry_lead_days: i64,

    /// Timeout for resolving one Secret reference
    #[arg(long, env = "REFERENCE_TIMEOUT_SECS", default_value_t = 5)]
    reference_timeout_secs: u64,

    /// Bind address of the REST API
    #[cfg(feature = "rest-api")]
    #[arg(long, env = "API_BIND_ADDRESS", default_value = telemetry_k8s::rest_api::DEFAULT_BIND_ADDRESS)]
    api_bind_address: SocketAddr,

    /// Run in dry-run mode (calculate changes without applying them)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace of the Telemetry resource
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kyma-system")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Telemetry Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Package: {}", env!("CARGO_PKG_NAME"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn count_pipelines<K: TelemetryPipeline>(client: &kube::Client) -> Result<usize, Error> {
    let api: Api<K> = Api::all(client.clone());
    Ok(api.list(&Default::default()).await?.items.len())
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;

    for (signal, count) in [
        (SignalType::Log, count_pipelines::<LogPipeline>(&client).await?),
        (SignalType::Trace, count_pipelines::<TracePipeline>(&client).await?),
        (SignalType::Metric, count_pipelines::<MetricPipeline>(&client).await?),
    ] {
        println!("{}s: {}", signal.pipeline_kind(), count);
    }

    let api: Api<Telemetry> = Api::namespaced(client, &args.namespace);
    for telemetry in api.list(&Default::default()).await?.items {
        let state = telemetry
            .status
            .as_ref()
            .map(|s| s.state.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        println!(
            "Telemetry {}/{}: {}",
            args.namespace,
            telemetry.metadata.name.unwrap_or_default(),
            state
        );
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let log_level = telemetry::init_telemetry()?;

    info!("Starting Telemetry Operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let settings = OperatorSettings {
        namespace: args.namespace.clone(),
        collector_image: args.collector_image,
        fluent_bit_image: args.fluent_bit_image,
        priority_class_name: args.priority_class_name,
        cluster_name: args.cluster_name,
        max_log_pipelines: args.max_log_pipelines,
        max_trace_pipelines: args.max_trace_pipelines,
        max_metric_pipelines: args.max_metric_pipelines,
        cert_expiry_lead_time: chrono::Duration::days(args.cert_expiry_lead_days),
        reference_timeout: Duration::from_secs(args.reference_timeout_secs),
        dry_run: args.dry_run,
    };
    if settings.dry_run {
        info!("Running in dry-run mode, no changes will be written");
    }

    let overrides = load_overrides(&client, &settings.namespace).await?;
    if let Err(e) = log_level.apply(overrides.log_level()) {
        warn!("Failed to apply log level override: {}", e);
    }

    // Leader election configuration
    let leader_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));

    {
        let lease_client = client.clone();
        let is_leader_bg = Arc::clone(&is_leader);

        tokio::spawn(async move {
            run_leader_election(lease_client, &leader_namespace, &holder_identity, is_leader_bg)
                .await;
        });
    }

    let state = Arc::new(ControllerState::new(
        client.clone(),
        settings,
        Arc::clone(&is_leader),
        overrides,
        Some(log_level),
    ));

    let monitor = SelfMonitor::new(client.clone(), &args.namespace)?;
    {
        let monitor_state = state.clone();
        tokio::spawn(async move { monitor.run(monitor_state).await });
    }

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.api_bind_address;
        tokio::spawn(async move {
            if let Err(e) = telemetry_k8s::rest_api::run_server(api_state, addr).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    tokio::select! {
        _ = scheduler::run(state) => {
            error!("Scheduler stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    Ok(())
}

const LEASE_NAME: &str = "telemetry-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Retry delay with up to a second of jitter so standby replicas spread out
fn retry_delay() -> Duration {
    RETRY_INTERVAL + Duration::from_millis(rand::thread_rng().gen_range(0..1000))
}

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(retry_delay()).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(retry_delay()).await;
            }
        }
    }
}

fn lease_patch(identity: &str, now: chrono::DateTime<Utc>, acquire: bool) -> serde_json::Value {
    let mut spec = serde_json::json!({
        "holderIdentity": identity,
        "renewTime": MicroTime(now),
        "leaseDurationSeconds": LEASE_DURATION_SECS,
    });
    if acquire {
        spec["acquireTime"] = serde_json::json!(MicroTime(now));
    }
    serde_json::json!({ "spec": spec })
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        leases.create(&PostParams::default(), &lease).await?;
        info!("Created lease {} with holder {}", LEASE_NAME, identity);
        return Ok(true);
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        leases
            .patch(
                LEASE_NAME,
                &PatchParams::default(),
                &Patch::Merge(&lease_patch(identity, now, false)),
            )
            .await?;
        return Ok(true);
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true);

    if !expired {
        return Ok(false);
    }

    info!("Lease held by {:?} has expired, taking over", current_holder);
    leases
        .patch(
            LEASE_NAME,
            &PatchParams::default(),
            &Patch::Merge(&lease_patch(identity, now, true)),
        )
        .await?;
    Ok(true)
}
