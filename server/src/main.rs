use clap::Parser;
use log::{error, info, warn};
use server::config::ServerConfig;
use server::map::MapDescriptor;
use server::network::{AppContext, Server};
use server::persistence::{FilePersistence, MemoryPersistence, Persistence};
use server::session::GameSetup;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Hosts one Warcraft III game for LAN and GProxy clients
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind the game port to
    #[clap(short = 'H', long)]
    bind: Option<String>,
    /// Game port clients connect to
    #[clap(short, long)]
    port: Option<u16>,
    /// JSON server configuration
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// JSON map descriptor
    #[clap(short, long)]
    map: PathBuf,
    /// Game name shown in the LAN list
    #[clap(short, long, default_value = "Aura Game")]
    name: String,
    /// Log at debug level
    #[clap(short, long)]
    verbose: bool,
}

/// Loads the server configuration and applies the CLI overrides on top
fn load_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let ip = match &args.bind {
        Some(bind) => bind.parse()?,
        None => config.bind_address.ip(),
    };
    let port = args.port.unwrap_or_else(|| config.bind_address.port());
    config.bind_address = SocketAddr::new(ip, port);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(&args)?;
    let map = MapDescriptor::load(&args.map)?;

    let context = Arc::new(AppContext::new());
    let mut setup = GameSetup::new(args.name.clone(), map);
    if let Some(local_path) = setup.map.local_path.clone() {
        match context.load_map(&local_path) {
            Ok(data) => setup.map_data = Some(data),
            Err(e) => warn!("Map file {} unavailable, downloads disabled: {}", local_path, e),
        }
    }

    let persistence: Box<dyn Persistence + Send> = match &config.records_path {
        Some(path) => {
            let store = FilePersistence::open(path)?;
            if let Some(last) = store.records().games.iter().map(|g| g.game_id).max() {
                setup.game_id = last + 1;
            }
            Box::new(store)
        }
        None => Box::new(MemoryPersistence::new()),
    };

    {
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down gracefully...");
                    context.request_exit();
                }
                Err(e) => error!("Could not listen for Ctrl+C: {}", e),
            }
        });
    }

    let mut server = Server::new(config, setup, persistence, context).await?;
    if let Err(e) = server.run().await {
        error!("Server stopped: {}", e);
        return Err(e.into());
    }

    Ok(())
}
