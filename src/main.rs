use tracing_subscriber::EnvFilter;

mod annotations;
mod cli;
mod config;
mod download;
mod filter;
mod net;
mod posts;

#[tokio::main]
async fn main() {
    initialize_tracing();
    let exit_code = cli::run().await;
    std::process::exit(exit_code);
}

/// Initializes tracing with env-filter support; `RUST_LOG` overrides the
/// default info level for this crate.
fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("redharvest=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
