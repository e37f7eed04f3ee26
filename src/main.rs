//! InstaSlice - MIG GPU slice scheduling for Kubernetes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use instaslice::controller::{error_policy, reconcile, Context};
use instaslice::crd::Instaslice;
use instaslice::engine::{self, EngineContext, NodeInventoryStore};
use instaslice::gpu::sim::SimulatedGpu;
use instaslice::placement::PlacementPolicy;
use instaslice::webhook::webhook_router;

/// InstaSlice - partitions MIG-capable GPUs across Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "instaslice", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the cluster-scope controller (planner, gate releaser, teardown)
    Controller(ControllerArgs),

    /// Run the per-node agent (inventory probe + realization engine)
    NodeAgent(NodeAgentArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Namespace where per-node inventory objects are stored
    #[arg(long, env = "INSTASLICE_NAMESPACE", default_value = instaslice::DEFAULT_INVENTORY_NAMESPACE)]
    inventory_namespace: String,

    /// Listen address for the mutating pod webhook; omit to disable
    #[arg(long)]
    webhook_addr: Option<SocketAddr>,

    /// Placement ordering policy: first-fit, left-to-right, right-to-left
    #[arg(long, default_value = "first-fit")]
    placement_policy: String,

    /// Seconds a deleted workload keeps its slice before hardware reclaim
    #[arg(long, default_value_t = instaslice::DEFAULT_TEARDOWN_GRACE_SECS)]
    teardown_grace_secs: u64,
}

/// Node agent mode arguments
#[derive(Parser, Debug)]
struct NodeAgentArgs {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Namespace where per-node inventory objects are stored
    #[arg(long, env = "INSTASLICE_NAMESPACE", default_value = instaslice::DEFAULT_INVENTORY_NAMESPACE)]
    inventory_namespace: String,

    /// Number of simulated GPUs to expose instead of real hardware
    #[arg(long, default_value_t = 1)]
    simulated_gpus: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Instaslice::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        Some(Commands::NodeAgent(args)) => run_node_agent(args).await,
        None => {
            run_controller(ControllerArgs {
                inventory_namespace: instaslice::DEFAULT_INVENTORY_NAMESPACE.to_string(),
                webhook_addr: None,
                placement_policy: "first-fit".to_string(),
                teardown_grace_secs: instaslice::DEFAULT_TEARDOWN_GRACE_SECS,
            })
            .await
        }
    }
}

/// Run the cluster-scope controller
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("InstaSlice controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let policy: PlacementPolicy = args
        .placement_policy
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut ctx = Context::new(client.clone(), &args.inventory_namespace);
    ctx.policy = policy;
    ctx.teardown_grace = Duration::from_secs(args.teardown_grace_secs);
    let ctx = Arc::new(ctx);

    // Mutating pod webhook, served alongside the controller when enabled.
    // TLS termination is expected in front of it (the webhook Service).
    let webhook_server = if let Some(addr) = args.webhook_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind webhook listener: {e}"))?;
        tracing::info!(%addr, "pod webhook listening");
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, webhook_router()).await {
                tracing::error!(error = %e, "webhook server error");
            }
        }))
    } else {
        tracing::info!("pod webhook disabled");
        None
    };

    let pods: Api<Pod> = Api::all(client.clone());
    let inventories: Api<Instaslice> = Api::namespaced(client, &args.inventory_namespace);

    tracing::info!(
        namespace = %args.inventory_namespace,
        policy = %policy,
        "starting pod controller"
    );

    // Inventory changes re-trigger the pods they carry allocations for, so
    // gate release and teardown progress without waiting on pod events.
    Controller::new(pods, WatcherConfig::default())
        .watches(inventories, WatcherConfig::default(), |inventory: Instaslice| {
            inventory
                .spec
                .allocations
                .values()
                .map(|allocation| {
                    ObjectRef::new(&allocation.workload_name).within(&allocation.namespace)
                })
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "reconciled"),
                Err(e) => tracing::debug!(error = %e, "reconciliation error"),
            }
        })
        .await;

    if let Some(server) = webhook_server {
        server.abort();
    }
    tracing::info!("InstaSlice controller shutting down");
    Ok(())
}

/// Run the per-node agent
async fn run_node_agent(args: NodeAgentArgs) -> anyhow::Result<()> {
    tracing::info!(node = %args.node_name, "InstaSlice node agent starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let store = Arc::new(NodeInventoryStore::new(
        client.clone(),
        &args.inventory_namespace,
        &args.node_name,
    ));
    let driver = Arc::new(SimulatedGpu::new(args.simulated_gpus));

    // Probe before serving: the planner only considers ready inventories
    engine::probe::ensure_inventory(&args.node_name, store.as_ref(), driver.clone())
        .await
        .map_err(|e| anyhow::anyhow!("inventory probe failed: {e}"))?;

    let ctx = Arc::new(EngineContext::new(
        args.node_name.clone(),
        store,
        Arc::new(engine::capacity::NodePatcher::new(client.clone())),
        Arc::new(engine::sidechannel::ConfigMapSideChannel::new(client.clone())),
        driver,
    ));

    let inventories: Api<Instaslice> = Api::namespaced(client, &args.inventory_namespace);
    let only_ours = WatcherConfig::default().fields(&format!("metadata.name={}", args.node_name));

    tracing::info!(node = %args.node_name, "starting realization engine");
    Controller::new(inventories, only_ours)
        .shutdown_on_signal()
        .run(engine::reconcile, engine::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => tracing::debug!(?obj, "reconciled"),
                Err(e) => tracing::debug!(error = %e, "reconciliation error"),
            }
        })
        .await;

    tracing::info!("InstaSlice node agent shutting down");
    Ok(())
}
