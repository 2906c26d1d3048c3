//! Canopy controller manager
//!
//! Runs every Canopy controller in one process. Prometheus metrics are served
//! on their own listener; a health listener answers `/healthz` as soon as the
//! process is up and `/readyz` once the Kubernetes client is connected.

use anyhow::{Context, Result};
use canopy_core::crd::{
    AppWorkload, BuildWorkload, CanopyApp, CanopyBuild, CanopyOrg, CanopyPackage,
    CanopyServiceBinding, CanopyServiceInstance, CanopySpace, CanopyTask, TaskWorkload,
};
use canopy_operator::app_controller::run_app_controller;
use canopy_operator::build_controller::run_build_controller;
use canopy_operator::config::ControllerConfig;
use canopy_operator::service_binding_controller::run_service_binding_controller;
use canopy_operator::task_controller::run_task_controller;
use canopy_operator::tenant_controller::{run_org_controller, run_space_controller};
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "canopy-operator", version)]
#[command(about = "Reconciliation controllers for the Canopy application platform")]
struct Args {
    /// Controller configuration (YAML, `${VAR}` references are expanded)
    #[arg(short, long, env = "CANOPY_CONFIG")]
    config: Option<PathBuf>,

    /// Restrict every controller to one namespace
    #[arg(long, env = "CANOPY_WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Prometheus listener
    #[arg(long, env = "CANOPY_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Liveness and readiness listener
    #[arg(long, env = "CANOPY_HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Log filter directives, e.g. `info,canopy_operator=debug`
    #[arg(long, env = "CANOPY_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "CANOPY_LOG_JSON")]
    log_json: bool,

    /// Write the CRD manifests to stdout and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_crd {
        return print_crds();
    }
    init_logging(&args.log_level, args.log_json)?;

    let config = Arc::new(match &args.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Loading {}", path.display()))?,
        None => ControllerConfig::default(),
    });
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = args.namespace.as_deref().unwrap_or("<all>"),
        root_namespace = %config.root_namespace,
        "Starting Canopy controller manager"
    );

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .context("Installing the Prometheus exporter")?;
    info!(address = %args.metrics_addr, "Serving metrics");

    let ready = Arc::new(AtomicBool::new(false));
    let health = TcpListener::bind(args.health_addr)
        .await
        .with_context(|| format!("Binding health listener on {}", args.health_addr))?;
    tokio::spawn(serve_health(health, ready.clone()));

    let client = Client::try_default()
        .await
        .context("Connecting to the Kubernetes API")?;
    ready.store(true, Ordering::Relaxed);

    let ns = args.namespace;
    tokio::try_join!(
        run_org_controller(client.clone(), config.clone(), ns.clone()),
        run_space_controller(client.clone(), config.clone(), ns.clone()),
        run_build_controller(client.clone(), config.clone(), ns.clone()),
        run_task_controller(client.clone(), config.clone(), ns.clone()),
        run_app_controller(client.clone(), config.clone(), ns.clone()),
        run_service_binding_controller(client, config, ns),
    )
    .context("Controller stopped")?;

    warn!("All controllers exited");
    Ok(())
}

fn init_logging(directives: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("Invalid log filter {directives:?}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn serve_health(listener: TcpListener, ready: Arc<AtomicBool>) {
    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                tokio::spawn(answer_health(socket, ready.clone()));
            }
            Err(e) => error!(error = %e, "Health listener failed to accept"),
        }
    }
}

async fn answer_health(mut socket: TcpStream, ready: Arc<AtomicBool>) {
    let mut buf = [0u8; 512];
    let Ok(n) = socket.read(&mut buf).await else {
        return;
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request.split_whitespace().nth(1).unwrap_or("/");

    let (status, body) = match path {
        "/healthz" => ("200 OK", "ok"),
        "/readyz" if ready.load(Ordering::Relaxed) => ("200 OK", "ready"),
        "/readyz" => ("503 Service Unavailable", "starting"),
        _ => ("404 Not Found", "not found"),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
}

fn print_crds() -> Result<()> {
    use kube::CustomResourceExt;

    for crd in [
        CanopyOrg::crd(),
        CanopySpace::crd(),
        CanopyApp::crd(),
        AppWorkload::crd(),
        CanopyPackage::crd(),
        CanopyBuild::crd(),
        BuildWorkload::crd(),
        CanopyTask::crd(),
        TaskWorkload::crd(),
        CanopyServiceInstance::crd(),
        CanopyServiceBinding::crd(),
    ] {
        println!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
