//! CLI for PopCast
//!
//! Subcommands:
//! - `server`: run the broker socket, the transfer socket and the change bridge
//! - `export`: write a stored attachment to a file
//! - `token`: sign a session token for a user (useful for smoke tests)

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use popcast::broker::{Broker, Conversations, VideoRooms};
use popcast::bridge::{self, reactions::Reactor};
use popcast::config::{Settings, load_config};
use popcast::persistence::DocumentStore;
use popcast::transfer::{TransferContext, Uploads, start_transfer_server};
use popcast::transport::{JwtResolver, ServerContext, start_websocket_server};
use popcast::utils::ids::ObjectId;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popcast")]
enum Command {
    /// Start the servers
    Server,
    /// Reassemble an attachment from its chunk chain
    Export {
        /// Attachment id (24 hex characters)
        id: ObjectId,
        /// Output file
        path: std::path::PathBuf,
    },
    /// Print a signed session token for a user
    Token {
        uid: String,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    popcast::utils::logging::init("info");

    let cmd = Command::parse();
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    match cmd {
        Command::Server => {
            if let Err(e) = run_server(config).await {
                error!("Server failed: {}", e);
            }
        }
        Command::Export { id, path } => {
            if let Err(e) = export(&config, id, &path) {
                error!("Export failed: {}", e);
            }
        }
        Command::Token { uid, hours } => {
            let resolver = JwtResolver::new(&config.server.jwt_secret);
            match resolver.issue(&uid, chrono::Duration::hours(hours)) {
                Ok(token) => println!("{token}"),
                Err(e) => error!("Could not sign token: {}", e),
            }
        }
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = DocumentStore::open(&config.storage.path)?;
    let chunks = store.chunk_store()?;
    let depth = config.broker.queue_depth;

    let broker = Broker::new(config.broker.max_connections).spawn(depth);
    let uploads = Uploads::new().spawn(depth);

    let reactor = Reactor::new(store.clone(), chunks.clone(), broker.clone());
    let streams = bridge::spawn(&store, reactor, config.bridge.poll_interval());
    info!(streams = streams.len(), "Change bridge started");

    let ws_ctx = ServerContext {
        broker: broker.clone(),
        conversations: Conversations::new().spawn(depth),
        video: VideoRooms::new().spawn(depth),
        uploads: uploads.clone(),
        store: store.clone(),
        resolver: Arc::new(JwtResolver::new(&config.server.jwt_secret)),
        outbound_buffer: config.broker.outbound_buffer,
    };
    let transfer_ctx = TransferContext {
        store: store.clone(),
        chunks,
        uploads,
        broker,
        settings: config.transfer.clone(),
    };

    let host = &config.server.host;
    let ws_listener = TcpListener::bind((host.as_str(), config.server.port)).await?;
    let transfer_listener = TcpListener::bind((host.as_str(), config.server.transfer_port)).await?;

    tokio::select! {
        _ = start_websocket_server(ws_listener, ws_ctx) => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = start_transfer_server(transfer_listener, transfer_ctx) => {
            error!("Transfer server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    store.run_blocking(|store| store.flush()).await?;
    Ok(())
}

fn export(config: &Settings, id: ObjectId, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = DocumentStore::open(&config.storage.path)?;
    let chunks = store.chunk_store()?;

    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    let mut written = 0usize;
    for chunk in chunks.read_chain(id) {
        let chunk = chunk?;
        out.write_all(&chunk)?;
        written += chunk.len();
    }
    out.flush()?;

    info!(attachment = %id, bytes = written, path = %path.display(), "Attachment exported");
    Ok(())
}
