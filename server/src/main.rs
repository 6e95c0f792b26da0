use clap::Parser;
use log::{error, info};
use server::config::NetConfig;
use server::engine::{EngineContext, NetworkEngine};
use server::session::EchoAuth;
use std::sync::Arc;

/// Exit status when the engine fails to start in either I/O mode.
const NETWORK_START_FAILED: i32 = 2;

/// Main-method of the application.
/// Parses command-line arguments, starts the network engine in the
/// requested mode and runs until interrupted.
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
        #[clap(short, long, default_value = "8085")]
        port: u16,
        /// Number of network worker threads
        #[clap(short, long, default_value = "1")]
        threads: usize,
        /// Use the readiness-mode engine instead of completion mode
        #[clap(long)]
        old_engine: bool,
        /// Ceiling on in-flight I/O operations per worker (0 = unlimited)
        #[clap(long, default_value = "0")]
        op_limit: u32,
        /// Disable TCP_NODELAY on accepted sockets
        #[clap(long)]
        no_nodelay: bool,
        /// SO_SNDBUF for accepted sockets in bytes (unset keeps OS default)
        #[clap(long)]
        sock_out_kbuff: Option<usize>,
        /// Per-connection outbound buffer size in bytes
        #[clap(long, default_value = "65536")]
        sock_out_ubuff: usize,
        /// Over-speed pings tolerated before kicking (0 disables)
        #[clap(long, default_value = "2")]
        max_overspeed_pings: u32,
        /// Close connections that send undecodable packets
        #[clap(long)]
        kick_on_bad_packet: bool,
    }

    env_logger::init();
    let args = Args::parse();

    let cfg = NetConfig {
        threads: args.threads,
        prefer_completion: !args.old_engine,
        op_limit: args.op_limit,
        tcp_nodelay: !args.no_nodelay,
        send_buffer_os: args.sock_out_kbuff,
        send_buffer: args.sock_out_ubuff,
        max_overspeed_pings: args.max_overspeed_pings,
        kick_on_bad_packet: args.kick_on_bad_packet,
        ..NetConfig::default()
    };

    let ctx = EngineContext {
        cfg,
        auth: Arc::new(EchoAuth),
    };

    let engine = match NetworkEngine::start(ctx, &args.host, args.port) {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to start the network engine in any mode: {}", e);
            std::process::exit(NETWORK_START_FAILED);
        }
    };

    info!(
        "world server listening on {} ({} mode)",
        engine.local_addr(),
        engine.mode()
    );

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down");

    engine.stop();
    engine.wait();

    Ok(())
}
