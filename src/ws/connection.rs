#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, interval_at, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::Config;
use super::error::WsError;
use crate::Result;
use crate::error::Error;

/// Raw WebSocket stream produced by a [`Dial`] closure.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Closure that opens a fresh WebSocket stream on every call.
///
/// Saved inside [`WsConnection`] so that [`Connection::redial`] needs no outside state.
pub type Dial = Arc<dyn Fn() -> BoxFuture<'static, Result<WsStream>> + Send + Sync>;

/// Deadline for writing a keepalive PING (and the closing handshake).
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// RFC 6455 frame opcodes.
#[non_exhaustive]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl MessageType {
    fn into_message(self, payload: Vec<u8>) -> Result<Message> {
        let message = match self {
            Self::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|e| Error::validation(format!("text frame is not UTF-8: {e}")))?;
                Message::Text(text.into())
            }
            Self::Binary => Message::Binary(payload.into()),
            Self::Ping => Message::Ping(payload.into()),
            Self::Pong => Message::Pong(payload.into()),
            Self::Close => Message::Close(None),
        };

        Ok(message)
    }
}

/// A duplex, framed transport to one endpoint.
///
/// This is the seam between [`Client`](super::Client) and the socket: the production
/// implementation is [`WsConnection`], tests substitute in-memory fakes.
#[async_trait]
pub trait Connection: Send + Sync + Sized + 'static {
    /// Write one frame. Concurrent writers are serialized.
    async fn write_message(&self, message_type: MessageType, payload: Vec<u8>) -> Result<()>;

    /// Wait for the next data frame (text or binary).
    ///
    /// Control frames are handled internally. A close frame from the peer, or a locally closed
    /// socket, is reported as [`WsError::ConnectionClosed`].
    async fn read_message(&self) -> Result<(MessageType, Vec<u8>)>;

    /// Open a new connection with the same dial and keepalive settings.
    ///
    /// The current connection is left untouched; the caller decides when to [`close`](Self::close) it.
    async fn redial(&self) -> Result<Self>;

    /// Close the socket. Pending and later reads fail, and keepalive stops.
    async fn close(&self);
}

/// [`Connection`] over a `tokio-tungstenite` stream.
///
/// Writes are serialized by a mutex over the sink half. Reads use the stream half and never
/// touch the write mutex, so a blocked read does not stall writers.
pub struct WsConnection {
    shared: Arc<Shared>,
    dial: Dial,
    keepalive: bool,
    keepalive_period: Duration,
}

struct Shared {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
    last_pong: StdMutex<Instant>,
    closed: CancellationToken,
}

impl WsConnection {
    /// Dial once and wrap the resulting stream.
    ///
    /// When `keepalive` is set a background task pings the peer every `keepalive_period`
    /// and closes the socket once the last PONG is older than that period.
    pub async fn new(dial: Dial, keepalive: bool, keepalive_period: Duration) -> Result<Self> {
        let stream = dial().await?;
        let (sink, source) = stream.split();

        let shared = Arc::new(Shared {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            last_pong: StdMutex::new(Instant::now()),
            closed: CancellationToken::new(),
        });

        if keepalive {
            let keepalive_shared = Arc::clone(&shared);
            tokio::spawn(async move {
                keepalive_loop(keepalive_shared, keepalive_period).await;
            });
        }

        Ok(Self {
            shared,
            dial,
            keepalive,
            keepalive_period,
        })
    }

    /// Connect to `endpoint` (a `ws://` or `wss://` URL) using the keepalive settings in `config`.
    pub async fn connect(endpoint: &str, config: &Config) -> Result<Self> {
        let url = Url::parse(endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported WebSocket scheme: {}",
                url.scheme()
            )));
        }

        let endpoint = url.to_string();
        let dial: Dial = Arc::new(move || {
            let endpoint = endpoint.clone();
            Box::pin(async move {
                #[cfg(feature = "tracing")]
                tracing::debug!(%endpoint, "Dialing WebSocket endpoint");

                let (stream, _) = connect_async(endpoint).await?;
                Ok(stream)
            })
        });

        Self::new(dial, config.keepalive, config.keepalive_period).await
    }

    /// When the most recent PONG (or the connection itself) was observed.
    #[must_use]
    pub fn last_pong(&self) -> Instant {
        self.shared.last_pong()
    }
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("keepalive", &self.keepalive)
            .field("keepalive_period", &self.keepalive_period)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        // Stops the keepalive task, which holds the last other reference to the socket
        self.shared.closed.cancel();
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn write_message(&self, message_type: MessageType, payload: Vec<u8>) -> Result<()> {
        let message = message_type.into_message(payload)?;
        if self.shared.closed.is_cancelled() {
            return Err(WsError::ConnectionClosed.into());
        }

        let mut sink = self.shared.sink.lock().await;
        sink.send(message).await?;
        Ok(())
    }

    async fn read_message(&self) -> Result<(MessageType, Vec<u8>)> {
        let mut source = self.shared.source.lock().await;

        loop {
            let next = tokio::select! {
                () = self.shared.closed.cancelled() => {
                    return Err(WsError::ConnectionClosed.into());
                }
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    return Ok((MessageType::Text, text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok((MessageType::Binary, bytes.to_vec()));
                }
                Some(Ok(Message::Pong(_))) => {
                    self.shared.touch_pong();
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.shared.closed.cancel();
                    return Err(WsError::ConnectionClosed.into());
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {
                    // PING replies are queued by tungstenite and flushed on the next read or write
                }
            }
        }
    }

    async fn redial(&self) -> Result<Self> {
        Self::new(
            Arc::clone(&self.dial),
            self.keepalive,
            self.keepalive_period,
        )
        .await
    }

    async fn close(&self) {
        self.shared.close().await;
    }
}

impl Shared {
    fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    async fn ping(&self) -> Result<()> {
        let ping = async {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Ping(Vec::new().into())).await
        };

        match timeout(WRITE_DEADLINE, ping).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Err(WsError::PingTimeout.into()),
        }
    }

    async fn close(&self) {
        self.closed.cancel();

        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        // The peer may already be gone, so failures here carry no information
        _ = timeout(WRITE_DEADLINE, close).await;
    }
}

/// PING every `period`; close the socket once the last PONG is older than `period`.
async fn keepalive_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = interval_at(time::Instant::now() + period, period);

    loop {
        if let Err(e) = shared.ping().await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to send keepalive PING");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return;
        }

        let tick = tokio::select! {
            () = shared.closed.cancelled() => return,
            tick = ticker.tick() => tick.into_std(),
        };

        // Measured at the scheduled tick, so a late wakeup does not age a fresh PONG
        let since_pong = tick.saturating_duration_since(shared.last_pong());
        if since_pong > period {
            #[cfg(feature = "tracing")]
            tracing::warn!(?since_pong, "No PONG within keepalive period, closing connection");
            shared.close().await;
            return;
        }
    }
}
