use anyhow::{Context, Result};
use chunkswarm::config::Config;
use chunkswarm::db;
use chunkswarm::directory::DirectoryService;
use chunkswarm::node::PeerNode;
use chunkswarm::routers::{peer_routes, tracker_routes};
use clap::{Parser, Subcommand};
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "chunkswarm", about = "Chunked file sharing between peers via a central tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tracker (chunk directory service).
    Tracker {
        #[arg(short, long, default_value_t = 5000)]
        port: u16,
    },
    /// Run a peer serving its chunk store and the share/download API.
    Peer {
        #[arg(short, long)]
        port: u16,
        /// Address other peers use to reach this one.
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Publish a file from this machine's chunk directory.
    Share {
        path: PathBuf,
        /// Endpoint of the peer process serving CHUNK_DIR.
        #[arg(long)]
        endpoint: String,
    },
    /// Download a file from the swarm and wait for it to finish.
    Fetch {
        file_id: i64,
        output: PathBuf,
        /// Endpoint announced for downloaded chunks, if any.
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    if let Some(port) = cfg.prometheus_port {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("install prometheus exporter")?;
        info!("Prometheus metrics on port {}", port);
    }

    match cli.command {
        Commands::Tracker { port } => run_tracker(&cfg, port).await,
        Commands::Peer { port, endpoint } => {
            let endpoint = endpoint.unwrap_or_else(|| format!("http://localhost:{}", port));
            run_peer(&cfg, port, endpoint).await
        }
        Commands::Share { path, endpoint } => {
            let node = PeerNode::connect(&cfg, endpoint).await?;
            let published = node
                .publisher
                .share_file(&path)
                .await
                .with_context(|| format!("share {}", path.display()))?;
            println!(
                "Shared {} as file {} ({} chunks, {} unannounced)",
                published.filename,
                published.file_id,
                published.total_chunks,
                published.announce_failures.len()
            );
            Ok(())
        }
        Commands::Fetch {
            file_id,
            output,
            endpoint,
        } => {
            let mut cfg = cfg;
            if endpoint.is_none() {
                cfg.announce_downloads = false;
            }
            let endpoint = endpoint.unwrap_or_default();
            let node = PeerNode::connect(&cfg, endpoint).await?;
            let done = node
                .retriever
                .retrieve(file_id, &output)
                .await
                .with_context(|| format!("download file {}", file_id))?;
            println!("Downloaded {} ({} bytes) to {}", done.filename, done.bytes_written, output.display());
            Ok(())
        }
    }
}

async fn run_tracker(cfg: &Config, port: u16) -> Result<()> {
    info!("Starting tracker with DB: {}", cfg.database_url);
    let pool = db::init_pool(&cfg.database_url).await.context("open tracker database")?;
    let directory = DirectoryService::new(pool).with_peer_ttl(cfg.peer_ttl);

    let (addr, server) = warp::serve(tracker_routes(directory))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), shutdown_signal())
        .context("bind tracker port")?;
    info!("Tracker listening on {}", addr);
    server.await;
    Ok(())
}

async fn run_peer(cfg: &Config, port: u16, endpoint: String) -> Result<()> {
    info!("Starting peer {} (tracker {}, chunks in {})", endpoint, cfg.tracker_url, cfg.chunk_dir);
    let node = PeerNode::connect(cfg, endpoint).await.context("initialise peer")?;

    let (addr, server) = warp::serve(peer_routes(node))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), shutdown_signal())
        .context("bind peer port")?;
    info!("Peer listening on {}", addr);
    server.await;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}
