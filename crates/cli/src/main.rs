use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use portico_kubehub::{CapabilityQuery, ClusterApi, KubeCluster};
use portico_ops::HttpProbeTransport;
use portico_rollout::{Orchestrator, RolloutReport};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod output;

#[derive(Parser, Debug)]
#[command(name = "porticoctl", version, about = "Render, validate, roll out and verify gateway environments")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding environments/, base/ and overlays/
    #[arg(long = "config-dir", env = "PORTICO_CONFIG_DIR", global = true, default_value = "deploy")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline against the environment's cluster
    Rollout {
        /// Environment name (environments/<env>.yaml)
        env: String,
    },
    /// Print the rendered document as multi-document YAML
    Render { env: String },
    /// Structural validation and posture audit, without contacting a cluster
    Validate { env: String },
    /// Verify, probe and smoke-check what is currently deployed
    Verify { env: String },
}

fn init_tracing() {
    let env = std::env::var("PORTICO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PORTICO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PORTICO_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling rollout");
            token.cancel();
        }
    });
}

/// Connection failures do not abort: the orchestrator runs the offline stages
/// and reports the cluster as unreachable at the first stage that needs it.
async fn orchestrator(context: Option<&str>) -> Result<Orchestrator> {
    match KubeCluster::connect(context).await {
        Ok(cluster) => {
            let cluster = Arc::new(cluster);
            let transport = HttpProbeTransport::new(Some(cluster.clone()))?;
            let api: Arc<dyn ClusterApi> = cluster.clone();
            let caps: Arc<dyn CapabilityQuery> = cluster;
            Ok(Orchestrator::new(api, caps, Arc::new(transport)))
        }
        Err(e) => {
            warn!(context = ?context, error = %format!("{:#}", e), "cluster connection failed");
            Ok(Orchestrator::unreachable(format!("{:#}", e), Arc::new(HttpProbeTransport::new(None)?)))
        }
    }
}

fn emit(report: &RolloutReport, out: Output) -> Result<()> {
    match out {
        Output::Human => output::print_report(report),
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Rollout { env } => {
            let (target, source) = config::load(&cli.config_dir, &env)?;
            info!(env = %env, cluster = ?target.cluster, "rollout invoked");
            let orch = orchestrator(target.cluster.as_deref()).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let report = orch.rollout(&target, &source, &cancel).await;
            emit(&report, cli.output)?;
            std::process::exit(report.exit_code());
        }
        Commands::Render { env } => {
            let (target, source) = config::load(&cli.config_dir, &env)?;
            let doc = portico_render::render(&target, &source)?;
            match cli.output {
                Output::Human => print!("{}", portico_render::to_yaml(&doc)?),
                Output::Json => {
                    let manifests: Vec<_> = doc.iter().map(|r| r.to_manifest()).collect();
                    println!("{}", serde_json::to_string_pretty(&manifests)?);
                }
            }
        }
        Commands::Validate { env } => {
            let (target, source) = config::load(&cli.config_dir, &env)?;
            let doc = portico_render::render(&target, &source)?;
            let validation = portico_schema::validate(&doc, &target);
            let posture = portico_schema::audit_posture(&doc, &target);
            match cli.output {
                Output::Human => {
                    output::print_findings("structural", &validation);
                    output::print_findings("posture", &posture);
                }
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "structural": validation, "posture": posture }))?
                ),
            }
            if validation.is_blocking() {
                std::process::exit(1);
            }
        }
        Commands::Verify { env } => {
            let (target, source) = config::load(&cli.config_dir, &env)?;
            let orch = orchestrator(target.cluster.as_deref()).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let report = orch.verify(&target, &source, &cancel).await;
            emit(&report, cli.output)?;
            std::process::exit(report.exit_code());
        }
    }
    Ok(())
}
