mod app_status;
mod network_client;
mod pipeline;
mod server;
mod session;
mod utils;

use clap::Parser;
use log::info;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use url::Url;

use network_client::DEFAULT_UPSTREAM_BASE;
use pipeline::{PipelineOptions, ALREADY_CLAIMED_RET_CODE};
use server::RelaySettings;

// Custom Application Error Type
#[derive(Debug)]
enum AppError {
    Io(std::io::Error),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Io(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Relays the reward-claim handshake and returns the verification URL", long_about = None)]
struct Args {
    #[clap(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    #[clap(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Base URL of the reward platform.
    #[clap(long, default_value = DEFAULT_UPSTREAM_BASE)]
    upstream: Url,

    /// Run the risk components check before the face token call.
    #[clap(long)]
    probe_components: bool,

    /// Claim return code that still comes with a usable risk token.
    #[clap(long, default_value_t = ALREADY_CLAIMED_RET_CODE, allow_negative_numbers = true)]
    benign_ret_code: i64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = Args::parse();
    env_logger::init();

    info!("Upstream: {}", args.upstream);
    info!("Components probe: {}", if args.probe_components { "enabled" } else { "disabled" });
    info!("Benign claim ret_code: {}", args.benign_ret_code);

    let settings = RelaySettings {
        upstream_base: args.upstream,
        options: PipelineOptions {
            probe_components: args.probe_components,
            benign_ret_code: args.benign_ret_code,
        },
    };

    let addr = SocketAddr::new(args.bind, args.port);
    server::start(addr, Arc::new(settings)).await?;
    Ok(())
}
