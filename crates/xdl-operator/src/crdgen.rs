use kube::CustomResourceExt;

use xdl_operator::XDLJob;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let yaml = serde_yaml::to_string(&XDLJob::crd())?;
    std::fs::write("xdl_job_crd.yaml", yaml)?;
    Ok(())
}
