//! WebSocket API walkthrough against the futures testnet.
//!
//! This example:
//! 1. Connects to the USDⓈ-margined futures WebSocket API
//! 2. Sends a synchronous `time` request and prints the decoded result
//! 3. Fires a few asynchronous `ping` requests and reads their responses off the message stream
//! 4. Waits for the pending-request registry to drain, then shuts down
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug cargo run --example ws_api --features tracing
//! ```

use std::time::Duration;

use exchange_ws_sdk::ws::{Client, Config, Endpoint, Request};
use futures::StreamExt as _;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = Endpoint::UsdMarginedFutures;
    let client = Client::connect(endpoint.url(true), Config::default()).await?;
    info!(endpoint = endpoint.url(true), state = ?client.state(), "Connected");

    // Surface background errors (transport faults, unparsable frames)
    let errors = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut errors = Box::pin(client.errors());
            while let Some(e) = errors.next().await {
                warn!(error = %e, reconnects = client.reconnect_count());
            }
        })
    };

    let time = Request::builder().method("time").build();
    match client.call(&time, Duration::from_secs(5)).await {
        Ok(response) => match response.into_result() {
            Ok(result) => info!(method = "time", result = %result),
            Err(e) => warn!(method = "time", error = %e),
        },
        Err(e) => warn!(method = "time", error = %e),
    }

    for _ in 0..3 {
        let ping = Request::builder().method("ping").build();
        client.send(&ping).await?;
        debug!(method = "ping", id = %ping.id, "Sent");
    }

    let mut messages = Box::pin(client.messages());
    let mut received = 0;
    while let Ok(Some(frame)) = timeout(Duration::from_secs(5), messages.next()).await {
        info!(frame = %String::from_utf8_lossy(&frame));
        received += 1;
        if received >= 3 {
            break;
        }
    }

    let drained = client.wait(Duration::from_secs(5)).await;
    info!(
        received,
        drained,
        pending = client.pending_requests(),
        "Finished"
    );

    client.shutdown().await;
    errors.abort();

    Ok(())
}
