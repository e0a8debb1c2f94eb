//! XDL operator - defaults XDLJob resources

use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    core::CustomResourceExt,
    runtime::{
        wait::{await_condition, conditions},
        watcher, WatchStreamExt,
    },
    Client,
};
use tracing::{debug, info, warn};

use xdl_operator::{telemetry, Defaulter, Error, JobDefaults, Result, XDLJob};

const CRD_NAME: &str = "xdljobs.xdl.kubedl.io";
const FIELD_MANAGER: &str = "xdl-operator";
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "xdl-operator", version)]
#[command(about = "Fills in defaults for XDLJob resources")]
struct Args {
    /// TOML file overriding the built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Default an XDLJob manifest and print the result
    Default {
        /// Path to the XDLJob YAML manifest
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Install the CRD and default XDLJobs as they are applied
    Watch,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    telemetry::init_logging(args.json_logs)?;

    let defaults = match &args.config {
        Some(path) => JobDefaults::load(path)?,
        None => JobDefaults::default(),
    };
    info!(
        clean_pod_policy = %defaults.clean_pod_policy,
        restart_policy = %defaults.restart_policy,
        backoff_limit = defaults.backoff_limit,
        port = defaults.port,
        "loaded job defaults"
    );

    match args.command {
        Commands::Default { file } => default_manifest(&file, &defaults),
        Commands::Watch => watch(&defaults).await,
    }
}

fn default_manifest(path: &Path, defaults: &JobDefaults) -> Result<()> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::ReadManifest {
        path: path.to_path_buf(),
        source,
    })?;
    let mut job: XDLJob = serde_yaml::from_str(&content)?;
    job.set_defaults(defaults);
    print!("{}", serde_yaml::to_string(&job)?);
    Ok(())
}

async fn watch(defaults: &JobDefaults) -> Result<()> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    info!(crd = CRD_NAME, "installing CRD");
    crds.patch(
        CRD_NAME,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(XDLJob::crd()),
    )
    .await?;

    tokio::time::timeout(
        CRD_ESTABLISH_TIMEOUT,
        await_condition(crds, CRD_NAME, conditions::is_crd_established()),
    )
    .await
    .map_err(|_| Error::CrdNotEstablished(CRD_NAME.to_string()))??;
    info!(crd = CRD_NAME, "CRD established");

    let jobs: Api<XDLJob> = Api::default_namespaced(client);
    let apply_stream = watcher(jobs.clone(), watcher::Config::default())
        .default_backoff()
        .applied_objects()
        .boxed();
    let api = &jobs;
    drive_applied(apply_stream, move |job| async move {
        let name = job.name_any();
        if let Err(e) = patch_defaults(api, job, defaults).await {
            warn!(job = %name, error = %e, "failed to apply defaults");
        }
    })
    .await;

    Ok(())
}

/// Hand every applied job to `handle` until the stream ends.
///
/// Stream errors are logged and skipped; the backoff on the watcher takes
/// care of reconnecting.
async fn drive_applied<S, E, F, Fut>(mut stream: S, mut handle: F)
where
    S: Stream<Item = std::result::Result<XDLJob, E>> + Unpin,
    E: Display,
    F: FnMut(XDLJob) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(event) = stream.next().await {
        match event {
            Ok(job) => handle(job).await,
            Err(e) => warn!(error = %e, "watch stream error, retrying"),
        }
    }
}

/// Default `job` and merge-patch its spec back if anything changed
async fn patch_defaults(api: &Api<XDLJob>, mut job: XDLJob, defaults: &JobDefaults) -> Result<()> {
    let name = job.name_any();
    let before = job.spec.clone();
    job.set_defaults(defaults);

    if job.spec == before {
        debug!(job = %name, "job already defaulted");
        return Ok(());
    }

    let mut spec = serde_json::to_value(&job.spec)?;
    // Merge patches only add keys; renamed role keys must be nulled explicitly.
    if let Some(roles) = spec
        .get_mut("xdlReplicaSpecs")
        .and_then(serde_json::Value::as_object_mut)
    {
        for old in before.xdl_replica_specs.keys() {
            if !job.spec.xdl_replica_specs.contains_key(old) {
                roles.insert(old.to_string(), serde_json::Value::Null);
            }
        }
    }

    let patch = serde_json::json!({ "spec": spec });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!(job = %name, "applied defaults");
    Ok(())
}
