use kube::CustomResourceExt;
use telemetry_k8s::crd::{LogPipeline, MetricPipeline, Telemetry, TracePipeline};
use telemetry_k8s::Error;

fn main() -> Result<(), Error> {
    let crds = [
        LogPipeline::crd(),
        TracePipeline::crd(),
        MetricPipeline::crd(),
        Telemetry::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
