use std::{error::Error, net::SocketAddr, thread, time::Duration};

use clap::Parser;
use rpcmux::{Server, install_signal_handler, shutdown::process_token};

#[derive(Debug, Parser)]
#[command(version, about = "Echo reply server for rpcmux clients", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Milliseconds to wait before answering each request
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
    /// Number of connection handler threads
    #[arg(long, default_value_t = 16)]
    pool: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    install_signal_handler()?;

    let delay = Duration::from_millis(cli.delay_ms);
    let server = Server::bind(cli.address, cli.pool, move |payload| {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Some(payload)
    })?;

    server.serve(process_token().clone())?;
    Ok(())
}
