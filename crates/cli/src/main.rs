use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use ccop_controller::{Controller, ControllerConfig, QueueingEventHandler};
use ccop_core::{CustomConfig, WorkItem};
use ccop_handler::{ConfigMapHandler, DEFAULT_NAMESPACE};
use ccop_kubehub::{namespaced_api, Informer};
use ccop_queue::WorkQueue;
use ccop_store::ShadowCache;
use clap::{Args, Parser, Subcommand};
use kube::{runtime::watcher, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONTROLLER_NAME: &str = "custom-config-controller";

#[derive(Parser, Debug)]
#[command(name = "ccop", version, about = "CustomConfig operator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile CustomConfigs into ConfigMaps until SIGINT/SIGTERM
    Run(RunArgs),
    /// Print the CustomConfig CRD manifest
    Crd,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Concurrent worker loops
    #[arg(long, env = "CCOP_WORKERS", default_value_t = 1)]
    workers: usize,
    /// Lookup retries per key before giving up
    #[arg(long, env = "CCOP_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,
    /// Watch CustomConfigs in one namespace only (default: all namespaces)
    #[arg(long, env = "CCOP_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
    /// Namespace the ConfigMaps are written to
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    target_namespace: String,
}

fn init_tracing() {
    let env = std::env::var("CCOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CCOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CCOP_METRICS_ADDR; expected host:port");
        }
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; only SIGINT will stop the controller");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

async fn run(args: RunArgs) -> Result<()> {
    // kubeconfig first, then in-cluster config
    let client = Client::try_default().await.context("building kubernetes client")?;
    info!(watch_ns = ?args.watch_namespace, target_ns = %args.target_namespace, workers = args.workers, "kubernetes client ready");

    let api = namespaced_api::<CustomConfig>(client.clone(), args.watch_namespace.as_deref());
    let informer = Arc::new(Informer::new(api, watcher::Config::default()));
    let queue: WorkQueue<WorkItem> = WorkQueue::new();
    let shadow: Arc<ShadowCache<CustomConfig>> = Arc::new(ShadowCache::new());
    informer.add_event_handler(Arc::new(QueueingEventHandler::new(queue.clone(), Arc::clone(&shadow))));

    let handler = Arc::new(ConfigMapHandler::new(client, args.target_namespace));
    let config = ControllerConfig { workers: args.workers, max_retries: args.max_retries };
    let controller = Controller::new(CONTROLLER_NAME, informer, queue, handler, shadow, config).await?;

    let stop = CancellationToken::new();
    let mut task = tokio::spawn(Arc::new(controller).run(stop.clone()));
    tokio::select! {
        sig = shutdown_signal() => {
            info!(signal = sig, "shutting down");
            stop.cancel();
            task.await.context("controller task")??;
        }
        res = &mut task => res.context("controller task")??,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => print!("{}", serde_yaml::to_string(&CustomConfig::crd())?),
        Commands::Run(args) => {
            if let Err(e) = run(args).await {
                error!(error = ?e, "controller failed");
                eprintln!("ccop: {:#}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
