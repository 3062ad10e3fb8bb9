use std::sync::Arc;
use std::time::Duration;

use ccm_cloudstack::client::{CloudStackClient, CloudStackConfig};
use ccm_loadbalancer::reconcile::LoadBalancerReconciler;
use clap::{Parser, crate_description, crate_version};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{Event as Finalizer, finalizer};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

pub static SERVICE_FINALIZER: &str = "cloudstack-ccm.io/load-balancer";

// Node membership is converged on this cadence; rule changes are picked up
// through service watch events.
const REQUEUE_INTERVAL: Duration = Duration::from_secs(300);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
enum ReconcileError {
    #[error("{0}: {1}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error(transparent)]
    EngineError(#[from] ccm_loadbalancer::error::Error),

    #[error("failed on service finalizer: {0}")]
    // Boxing because finalizer::Error embeds this error type
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<ReconcileError>>),
}

#[derive(Parser, Debug)]
#[command(
    name = "cloudstack-ccm",
    about = crate_description!(),
    version = crate_version!(),
)]
struct Args {
    /// Base URL of the CloudStack management server API
    #[arg(long, env = "CLOUDSTACK_API_URL")]
    api_url: String,

    /// CloudStack API key
    #[arg(long, env = "CLOUDSTACK_API_KEY")]
    api_key: String,

    /// CloudStack secret key
    #[arg(long, env = "CLOUDSTACK_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    /// Skip TLS certificate verification towards the management server
    #[arg(long, env = "CLOUDSTACK_SSL_NO_VERIFY", default_value_t = false)]
    ssl_no_verify: bool,

    /// Scope every CloudStack operation to this project
    #[arg(long, env = "CLOUDSTACK_PROJECT_ID")]
    project_id: Option<String>,

    /// Default zone for public IP allocation
    #[arg(long, env = "CLOUDSTACK_ZONE")]
    zone: Option<String>,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    /// Example: "info,kube=debug,ccm_loadbalancer=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,
}

struct Context {
    client: Client,
    engine: LoadBalancerReconciler<CloudStackClient>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_filter))
        .init();
    info!(msg = "starting cloudstack-ccm", version = crate_version!());

    let cloud = CloudStackClient::new(CloudStackConfig {
        api_url: args.api_url,
        api_key: args.api_key,
        secret_key: args.secret_key,
        ssl_no_verify: args.ssl_no_verify,
        project_id: args.project_id,
        zone: args.zone,
    })?;
    let engine = LoadBalancerReconciler::new(cloud).await?;

    let client = Client::try_default().await?;
    let context = Arc::new(Context {
        client: client.clone(),
        engine,
    });

    info!(msg = "watching LoadBalancer services");
    Controller::new(Api::<Service>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_service, on_error, context)
        .for_each(|result| async move {
            if let Ok((service, _)) = result {
                debug!(msg = "reconciled service", name = service.name);
            }
        })
        .await;
    Ok(())
}

async fn reconcile_service(
    service: Arc<Service>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let service_type = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("ClusterIP");
    if service_type != "LoadBalancer" {
        return Ok(Action::await_change());
    }

    // safe unwrap: Service is namespace scoped
    let namespace = service.namespace().unwrap();
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, SERVICE_FINALIZER, service, |event| async {
        match event {
            Finalizer::Apply(service) => apply(&service, &ctx).await,
            Finalizer::Cleanup(service) => cleanup(&service, &ctx).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::FinalizerError(Box::new(e)))
}

async fn apply(service: &Service, ctx: &Context) -> Result<Action, ReconcileError> {
    let nodes = list_nodes(&ctx.client).await?;
    let status = ctx.engine.ensure_load_balancer(service, &nodes).await?;
    // existing rules converge their membership here; ensure only assigns
    // hosts to rules it creates
    ctx.engine.update_load_balancer(service, &nodes).await?;
    publish_status(service, ctx, status).await?;
    Ok(Action::requeue(REQUEUE_INTERVAL))
}

async fn cleanup(service: &Service, ctx: &Context) -> Result<Action, ReconcileError> {
    ctx.engine.delete_load_balancer(service).await?;
    Ok(Action::await_change())
}

async fn list_nodes(client: &Client) -> Result<Vec<Node>, ReconcileError> {
    let api = Api::<Node>::all(client.clone());
    let nodes = api.list(&ListParams::default()).await.map_err(|e| {
        ReconcileError::KubeError("failed to list nodes".to_string(), Box::new(e))
    })?;
    Ok(nodes.items)
}

async fn publish_status(
    service: &Service,
    ctx: &Context,
    status: k8s_openapi::api::core::v1::LoadBalancerStatus,
) -> Result<(), ReconcileError> {
    // safe unwrap: Service is namespace scoped
    let namespace = service.namespace().unwrap();
    let name = service.name_any();
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({
        "status": {
            "loadBalancer": status,
        }
    });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            ReconcileError::KubeError(
                format!("failed to patch status of {namespace}/{name}"),
                Box::new(e),
            )
        })?;
    Ok(())
}

#[allow(clippy::needless_pass_by_value)]
fn on_error(service: Arc<Service>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!(msg = "reconciliation failed", service = service.name_any(), %error);
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}
