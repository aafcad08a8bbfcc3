//! `roomdrop relay`: bind and serve the signaling relay.

use crate::core::relay;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use tokio::net::TcpListener;

pub async fn run(host: &str, port: u16, sos: SignalOfStop) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind relay on {host}:{port}"))?;
    relay::serve(listener, sos).await
}
