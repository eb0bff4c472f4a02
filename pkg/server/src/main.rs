mod app;
mod background;
mod bootstrap;
mod client;
mod config;
mod error_map;
mod grpc;
mod mapping;

use clap::Parser;

use config::{Cli, ResolvedConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match ResolvedConfig::load(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warren: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app::run(config).await {
        eprintln!("warren: {e}");
        std::process::exit(1);
    }
}
