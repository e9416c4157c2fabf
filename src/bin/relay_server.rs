//! Development backend for callcapture: signaling relay plus chunk sink.
//!
//! Usage: relay_server [ADDR]   (default 0.0.0.0:8000)

use anyhow::Result;
use callcapture::relay::{self, RelayState};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let addr: SocketAddr = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => SocketAddr::from(([0, 0, 0, 0], 8000)),
    };

    log::info!("Starting callcapture relay");
    log::info!("Signaling endpoint: ws://{}/ws/<session_id>", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    relay::serve(listener, RelayState::default()).await?;

    Ok(())
}
