use clap::Parser;
use server::events::{event_channel, spawn_event_sink, LogNotifier};
use server::handlers::NetplayService;
use server::network;
use server::storage::{FileStore, GhostDir};
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, wires the collaborators together and runs
/// the HTTP front end until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Directory where finished races are archived
        #[clap(short, long, default_value = "races")]
        data_dir: String,
        /// Directory holding the per-circuit default result blobs
        #[clap(short, long, default_value = "ghosts")]
        ghost_dir: String,
    }

    env_logger::init();
    let args = Args::parse();

    let (bus, rx) = event_channel();
    let storage = Arc::new(FileStore::new(&args.data_dir));
    let notifier = Arc::new(LogNotifier);
    let sink_handle = spawn_event_sink(rx, storage, notifier);

    let defaults = Arc::new(GhostDir::new(&args.ghost_dir));
    let service = NetplayService::new(bus, defaults);

    let address = format!("{}:{}", args.host, args.port);
    tokio::select! {
        result = network::run(&address, service) => {
            if let Err(e) = result {
                eprintln!("Server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    sink_handle.abort();
    Ok(())
}
