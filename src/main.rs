use anyhow::Result;
use clap::Parser;
use tracing::Level;
use ws_tunnel::{
    client::run_client,
    config::{connect_timeout_from_secs, ClientConfig, ServerConfig},
    server::run_server,
};

// --- Command Line Argument Parsing ---

#[derive(Parser, Debug)]
#[command(author, version, about = "TCP over WebSocket tunnel with fallback egress", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    /// e.g., server 0.0.0.0:8080 --fallback egress.example.net:443
    Server {
        /// Address to listen for WebSocket connections (e.g., 0.0.0.0:8080)
        listen_addr: String,
        /// Fallback egress endpoint, tried in order when the direct dial is blocked
        #[arg(long = "fallback", value_name = "HOST[:PORT]")]
        fallbacks: Vec<String>,
        /// Require clients to present this token as Sec-WebSocket-Protocol
        #[arg(long, env = "WS_TUNNEL_TOKEN")]
        token: Option<String>,
        /// Per-attempt dial timeout in seconds, 0 to wait forever
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
    /// Run in client mode
    /// e.g., client ws://your-server.com:8080 127.0.0.1:2222 10.0.0.5:22
    Client {
        /// WebSocket server URL (e.g., ws://example.com:8080)
        server_url: String,
        /// Local address to listen on (e.g., 127.0.0.1:2222)
        local_addr: String,
        /// Destination the server should connect to (e.g., 10.0.0.5:22)
        target: String,
        #[arg(long, env = "WS_TUNNEL_TOKEN")]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            listen_addr,
            fallbacks,
            token,
            connect_timeout,
        } => {
            let config = ServerConfig {
                fallbacks,
                token,
                connect_timeout: connect_timeout_from_secs(connect_timeout),
                ..ServerConfig::new(listen_addr)
            };
            run_server(config).await
        }
        Commands::Client {
            server_url,
            local_addr,
            target,
            token,
        } => {
            run_client(ClientConfig {
                server_url,
                local_addr,
                target,
                token,
            })
            .await
        }
    }
}
