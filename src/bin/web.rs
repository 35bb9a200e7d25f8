#![cfg(not(tarpaulin_include))]

use lazygrid::{GridConfig, server};
use std::env;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Optional port argument
    let args: Vec<String> = env::args().collect();
    let mut port = 3000;

    if args.len() >= 2 {
        port = args[1].parse().unwrap_or(3000);
    }

    let config = GridConfig::load()?;
    println!(
        "Starting simulated backend with {} objects of {} rows x {} columns",
        config.simulated_object_count, config.simulated_row_count, config.simulated_column_count
    );
    server::run(SocketAddr::from(([127, 0, 0, 1], port)), config).await
}
