use std::{net::SocketAddrV4, path::PathBuf, time::Instant};

use mainline_node::{rpc::Config, Dht};

use clap::Parser;

use tracing::Level;
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address of the node to ping
    address: SocketAddrV4,
    /// Snapshot file to restore from and save to
    #[arg(long, default_value = "dht.snapshot")]
    snapshot: PathBuf,
    /// Address to bind to, defaults to 0.0.0.0:6881 or a random port
    #[arg(long)]
    bind: Option<SocketAddrV4>,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let cli = Cli::parse();

    let config = Config {
        address: cli.bind,
        ..Default::default()
    };

    let dht = Dht::load(config, &cli.snapshot).expect("failed to bind");
    dht.start().expect("failed to start");

    println!("Node {} listening on {}", dht.id(), dht.local_addr());

    let responded = dht.bootstrap();
    println!("{responded} restored nodes responded");

    let start = Instant::now();

    match dht.ping(cli.address) {
        Ok(id) => println!(
            "{} has id {} ({:?})",
            cli.address,
            id,
            start.elapsed()
        ),
        Err(error) => println!("{} did not respond: {}", cli.address, error),
    }

    dht.save(&cli.snapshot).expect("failed to save snapshot");
    dht.stop();
}
