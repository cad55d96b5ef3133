use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use args::Args;
use axum::Router;
use clap::Parser;
use config::Config;
use http::StatusCode;
use server::ServeConfig;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args);

    let config = args.config()?;
    let _telemetry = telemetry::init(&config.telemetry).await?;

    if let Err(e) = server::serve(serve_config(&args, config)).await {
        log::error!("Server failed to start: {e}");
        std::process::exit(1);
    }

    Ok(())
}

fn serve_config(args: &Args, config: Config) -> ServeConfig {
    let listen_address = args
        .listen_address
        .or(config.server.listen_address)
        .unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8000)));

    let config_path = args.config.exists().then(|| args.config.clone());

    ServeConfig {
        listen_address,
        config,
        config_path,
        app: forward_auth_app(),
    }
}

/// Answers every request that passes the rate limiter with `204 No Content`, so an edge
/// proxy can ask tollgate whether to forward a request before doing so.
fn forward_auth_app() -> Router {
    Router::new().fallback(|| async { StatusCode::NO_CONTENT })
}
