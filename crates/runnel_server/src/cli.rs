use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use runnel_store::kv::KvConfig;
use runnel_store::{transfer, KvStore, MessageStore, SqlStore, SubscriptionBus};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::server;
use crate::state::AppState;

/// Runnel - multi-tenant append-only event store
#[derive(Parser, Debug)]
#[command(name = "runnel-server", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Log levels
    #[clap(
        long,
        env,
        global = true,
        default_value = "runnel_server=info,runnel_store=info,warn"
    )]
    log: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server
    Run(RunArgs),
    /// Export a namespace as NDJSON
    Export(TransferArgs),
    /// Import NDJSON records into a namespace
    Import(TransferArgs),
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Data directory
    #[clap(short = 'd', long, default_value = "runnel-data")]
    data_dir: PathBuf,
    /// Storage backend
    #[clap(long, value_enum, default_value = "kv")]
    backend: Backend,
    /// KV cache size in bytes
    #[clap(long, default_value = "67108864")]
    cache_capacity: u64,
    /// KV WAL flush interval in milliseconds
    #[clap(long, default_value = "1000")]
    flush_every_ms: u64,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[clap(flatten)]
    store: StoreArgs,
    /// Address to listen on
    #[clap(long, default_value = "127.0.0.1:7717")]
    addr: SocketAddr,
    /// Bearer token accepted for ns.* administrative methods
    #[clap(long, env = "RUNNEL_ADMIN_TOKEN")]
    admin_token: Option<String>,
    /// Auto-create namespaces for unknown well-formed tokens (test
    /// deployments only)
    #[clap(long)]
    unsafe_auto_create_namespaces: bool,
}

#[derive(Args, Debug)]
struct TransferArgs {
    #[clap(flatten)]
    store: StoreArgs,
    /// Namespace to transfer
    #[clap(short = 'n', long)]
    namespace: String,
    /// File path; stdout/stdin when omitted
    #[clap(short = 'f', long)]
    file: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Kv,
    Sqlite,
}

pub async fn start() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_env_filter(EnvFilter::builder().parse_lossy(cli.log))
        .init();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Export(args) => export(args).await,
        Command::Import(args) => import(args).await,
    }
}

async fn open_store(args: &StoreArgs, bus: SubscriptionBus) -> Result<Arc<dyn MessageStore>> {
    Ok(match args.backend {
        Backend::Kv => {
            let config = KvConfig {
                cache_capacity: args.cache_capacity,
                flush_every_ms: Some(args.flush_every_ms),
            };
            Arc::new(KvStore::open(&args.data_dir, bus, config)?)
        }
        Backend::Sqlite => Arc::new(SqlStore::open(&args.data_dir, bus).await?),
    })
}

async fn run(args: RunArgs) -> Result<()> {
    let bus = SubscriptionBus::new();
    let store = open_store(&args.store, bus.clone()).await?;

    if args.unsafe_auto_create_namespaces {
        warn!("unsafe namespace auto-creation is enabled; do not use in production");
    }

    let state = AppState {
        store: store.clone(),
        bus: bus.clone(),
        admin_token: args.admin_token,
        auto_create_namespaces: args.unsafe_auto_create_namespaces,
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "listening");

    // Closing the bus ends every live SSE stream, letting the server drain.
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        bus.shutdown();
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    store.flush().await?;

    Ok(())
}

async fn export(args: TransferArgs) -> Result<()> {
    let store = open_store(&args.store, SubscriptionBus::new()).await?;

    let exported = match &args.file {
        Some(path) => {
            let mut out = tokio::fs::File::create(path).await?;
            transfer::export(store.as_ref(), &args.namespace, &mut out).await?
        }
        None => {
            let mut out = tokio::io::stdout();
            transfer::export(store.as_ref(), &args.namespace, &mut out).await?
        }
    };

    info!(namespace = %args.namespace, exported, "export complete");

    Ok(())
}

async fn import(args: TransferArgs) -> Result<()> {
    let store = open_store(&args.store, SubscriptionBus::new()).await?;

    let summary = match &args.file {
        Some(path) => {
            let input = BufReader::new(tokio::fs::File::open(path).await?);
            transfer::import(store.as_ref(), &args.namespace, input).await?
        }
        None => {
            let input = BufReader::new(tokio::io::stdin());
            transfer::import(store.as_ref(), &args.namespace, input).await?
        }
    };

    info!(
        namespace = %args.namespace,
        imported = summary.imported,
        skipped = summary.skipped,
        "import complete"
    );
    store.flush().await?;

    Ok(())
}
