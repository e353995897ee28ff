//! Resilient WebSocket API client.
//!
//! # Architecture
//!
//! - [`Connection`]: framed duplex transport with optional PING/PONG keepalive, able to redial
//!   itself. [`WsConnection`] is the `tokio-tungstenite` implementation.
//! - [`RequestRegistry`]: ids of requests written but not yet answered.
//! - [`Client`]: owns a connection and a registry, pumps inbound frames to the application,
//!   correlates synchronous calls with their responses and reconnects with exponential backoff.
//! - [`Request`] / [`Response`]: the `{"id", "method", "params"}` request envelope and its
//!   response counterpart.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use exchange_ws_sdk::ws::{Client, Config, Endpoint, Request};
//!
//! # async fn example() -> exchange_ws_sdk::Result<()> {
//! let client = Client::connect(Endpoint::UsdMarginedFutures.url(true), Config::default()).await?;
//!
//! let request = Request::builder().method("time").build();
//! let response = client.call(&request, Duration::from_secs(5)).await?;
//! println!("{:?}", response.into_result()?);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod request;
pub mod response;

pub use client::{Client, ClientState};
pub use config::{Config, ReconnectConfig};
pub use connection::{Connection, Dial, MessageType, WsConnection};
pub use endpoint::Endpoint;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use registry::RequestRegistry;
pub use request::Request;
pub use response::{ApiError, Response};
