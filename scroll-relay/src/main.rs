//! Scroll relay: WebSocket fan-out for collaborative document channels.
//!
//! Clients subscribe to `document:{id}` and `presence:{id}` channels and
//! publish content and cursor updates through this process. Documents
//! themselves are persisted by the clients' store, not here.

use clap::Parser;
use env_logger::Env;
use scroll_collab::server::{RelayServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "scroll-relay", about = "Relay server for collaborative document channels")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "SCROLL_RELAY_ADDR", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Buffered messages per channel before slow subscribers drop messages
    #[arg(long, env = "SCROLL_CHANNEL_CAPACITY", default_value_t = 256)]
    channel_capacity: usize,

    /// Seconds without a heartbeat before a presence entry expires
    #[arg(long, env = "SCROLL_PRESENCE_TIMEOUT", default_value_t = 60)]
    presence_idle_timeout_secs: u64,

    /// Seconds between idle presence sweeps
    #[arg(long, env = "SCROLL_SWEEP_INTERVAL", default_value_t = 15)]
    sweep_interval_secs: u64,

    /// Channel subscriptions allowed per connection
    #[arg(long, env = "SCROLL_MAX_SUBSCRIPTIONS", default_value_t = 64)]
    max_subscriptions: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            channel_capacity: args.channel_capacity,
            presence_idle_timeout_secs: args.presence_idle_timeout_secs,
            sweep_interval_secs: args.sweep_interval_secs,
            max_subscriptions: args.max_subscriptions,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    log::debug!("{args:?}");

    let server = RelayServer::new(args.into());
    log::info!("Starting scroll relay on {}", server.config().bind_addr);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Relay server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            server.shutdown().await;
        }
    }
}
