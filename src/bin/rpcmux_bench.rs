use std::{error::Error, thread, time::Instant};

use clap::Parser;
use log::info;
use rpcmux::{
    AllPending, Connection, ConnectionManager, ManagerConfig, RemoteResponse, SendError, Status,
    install_signal_handler,
};

#[derive(Debug, Parser)]
#[command(version, about = "Drives request load through a shared connection manager", long_about = None)]
struct Cli {
    /// Endpoint to send requests to, e.g. tcp://127.0.0.1:5555
    endpoint: String,
    /// Number of I/O worker threads in the manager
    #[arg(long, default_value_t = 2)]
    threads: usize,
    /// Number of application threads sending requests
    #[arg(long, default_value_t = 4)]
    clients: usize,
    /// Requests sent by each application thread
    #[arg(long, default_value_t = 1000)]
    requests: u64,
    /// Per-request deadline in milliseconds; negative waits forever
    #[arg(long, default_value_t = 1000, allow_negative_numbers = true)]
    deadline_ms: i64,
}

#[derive(Debug, Default)]
struct Tally {
    done: u64,
    deadline_exceeded: u64,
    cancelled: u64,
    mismatched: u64,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.done += other.done;
        self.deadline_exceeded += other.deadline_exceeded;
        self.cancelled += other.cancelled;
        self.mismatched += other.mismatched;
    }
}

fn run_client(
    connection: &Connection,
    client: u64,
    requests: u64,
    deadline_ms: i64,
) -> Result<Tally, SendError> {
    let mut sent = Vec::with_capacity(requests as usize);
    for i in 0..requests {
        let payload = (client * requests + i).to_be_bytes().to_vec();
        let response = RemoteResponse::new();
        connection.send_request(vec![payload.clone()], &response, deadline_ms, None)?;
        sent.push((payload, response));
    }

    connection.wait_until(&mut AllPending);

    let mut tally = Tally::default();
    for (payload, response) in sent {
        match response.status() {
            Status::Done => {
                tally.done += 1;
                if response.reply() != vec![payload] {
                    tally.mismatched += 1;
                }
            }
            Status::DeadlineExceeded => tally.deadline_exceeded += 1,
            _ => tally.cancelled += 1,
        }
    }
    Ok(tally)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    install_signal_handler()?;

    let manager = ConnectionManager::with_config(ManagerConfig::default().with_threads(cli.threads))?;
    let connection = manager.connect(&cli.endpoint)?;
    info!("sending {} requests from {} threads", cli.requests, cli.clients);

    let started = Instant::now();
    let results = thread::scope(|s| {
        let handles = (0..cli.clients as u64)
            .map(|client| {
                let connection = &connection;
                s.spawn(move || run_client(connection, client, cli.requests, cli.deadline_ms))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("client thread panicked"))
            .collect::<Vec<_>>()
    });
    let elapsed = started.elapsed();

    let mut tally = Tally::default();
    for result in results {
        tally.merge(result?);
    }

    let total = tally.done + tally.deadline_exceeded + tally.cancelled;
    println!(
        "{total} requests in {:.3}s ({:.0} req/s)",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("done:              {}", tally.done);
    println!("deadline exceeded: {}", tally.deadline_exceeded);
    println!("cancelled:         {}", tally.cancelled);
    println!("mismatched:        {}", tally.mismatched);
    Ok(())
}
