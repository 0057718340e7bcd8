use clap::Parser;
use log::info;
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Authoritative asteroids game server")]
struct Args {
    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Simulation ticks per second
    #[arg(short, long, default_value_t = shared::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Maximum concurrent client sessions
    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let addr = format!("{}:{}", args.host, args.port);
    let tick_duration = Duration::from_secs_f64(1.0 / args.tick_rate as f64);

    let server = Server::new(&addr, tick_duration, args.max_clients).await?;
    let shutdown = server.shutdown_handle();
    let run_handle = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    shutdown.signal();
    run_handle.await??;

    Ok(())
}
