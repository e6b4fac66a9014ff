use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sigma_dispatch::auth::Credentials;
use sigma_dispatch::config::ServerConfig;
use sigma_dispatch::connection::DEFAULT_QUEUE_CAPACITY;
use sigma_dispatch::control_plane::ControlPlane;
use sigma_dispatch::shutdown::install_shutdown_handler;
use sigma_dispatch::spec::FunctionSpec;
use sigma_dispatch::worker::WorkerClient;

#[derive(Parser, Debug)]
#[command(name = "sigma-dispatch")]
#[command(version)]
#[command(about = "Connection registry and streaming dispatch server for function nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatch server
    Server(ServerArgs),

    /// Run an echo worker node against a dispatch server
    Worker(WorkerArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the gRPC server to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50061")]
    port: u16,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// JSON manifest of nodes to prepare at startup
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Capacity of each per-stream request and result queue
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Dispatch server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50061")]
    addr: String,

    /// Node URN presented in the node-urn header
    #[arg(long)]
    urn: String,

    /// Shared secret presented in the node-secret header
    #[arg(long, env = "SIGMA_NODE_SECRET")]
    secret: String,

    /// Node type sent with the registration
    #[arg(long, default_value = "echo")]
    node_type: String,

    /// Output format for the registration summary
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct RegistrationOutput {
    urn: String,
    content: String,
    parameters: Vec<ParameterOutput>,
}

#[derive(Serialize)]
struct ParameterOutput {
    name: String,
    value: String,
}

fn registration_output(urn: &str, spec: &FunctionSpec) -> RegistrationOutput {
    RegistrationOutput {
        urn: urn.to_string(),
        content: String::from_utf8_lossy(&spec.content).to_string(),
        parameters: spec
            .parameters
            .iter()
            .map(|p| ParameterOutput {
                name: p.name.clone(),
                value: p.value.to_string(),
            })
            .collect(),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr = SocketAddr::new(args.bind, args.port);
    let mut config = ServerConfig::new(listen_addr).with_queue_capacity(args.queue_capacity);
    if let Some(port) = args.dashboard_port {
        config = config.with_dashboard(SocketAddr::new(args.bind, port));
    }
    if let Some(path) = args.manifest {
        config = config.with_manifest(path);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        manifest = ?config.manifest_path,
        queue_capacity = config.dispatch.queue_capacity,
        "Starting sigma-dispatch server"
    );

    let shutdown = install_shutdown_handler();
    ControlPlane::new(config).run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = Credentials::new(args.urn, args.secret);
    let mut client = WorkerClient::connect(args.addr.clone(), credentials).await?;

    let spec = client.register(&args.node_type).await?;
    let output = registration_output(&client.credentials().urn, &spec);
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("Registered {} with {}", output.urn, args.addr);
            println!("Content: {} bytes", spec.content.len());
            for param in &output.parameters {
                println!("  {} = {}", param.name, param.value);
            }
        }
    }

    let handled = client.run_echo().await?;
    tracing::info!(handled, "Dispatch stream ended");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
    }

    Ok(())
}
