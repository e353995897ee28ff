#![expect(
    clippy::module_name_repetitions,
    reason = "ClientState names the lifecycle of the Client it belongs to"
)]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_stream::stream;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::{FutureExt as _, Stream};
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio::time::{self, interval, sleep};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::connection::{Connection, MessageType, WsConnection};
use super::error::WsError;
use super::registry::RequestRegistry;
use super::request::Request;
use super::response::{Response, frame_id};
use crate::Result;
use crate::error::Error;

/// How often [`Client::wait`] checks the registry.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of a [`Client`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// The read pump is reading from a live connection
    Live,
    /// A read failed; the read pump is waiting for the reconnect supervisor
    AwaitingReconnect,
    /// [`Client::shutdown`] was called or every handle was dropped
    Terminated,
}

/// A self-healing WebSocket session with request/response correlation.
///
/// Two background tasks run for the lifetime of the client:
///
/// - the *read pump* reads every inbound frame, forwards it to the message channel and clears
///   its `id` from the pending-request registry. On a read error it reports the error, asks for
///   a reconnect, waits until one is established and wipes the registry.
/// - the *reconnect supervisor* redials with exponential backoff whenever asked and installs
///   the new connection under the write lock.
///
/// Writes are serialized by a single write lock. [`write`](Self::write) is fire-and-forget: the
/// response shows up on [`recv_message`](Self::recv_message). [`write_sync`](Self::write_sync)
/// holds the write lock until the matching response arrives, so at most one synchronous call is
/// in flight and every other writer waits behind it.
///
/// Inbound frames go to exactly one consumer. While a `write_sync` is in progress it takes every
/// frame and every read pump error: the frame with its id is returned, other frames are
/// discarded, and an error ends the call. Message and error consumers see nothing meanwhile.
///
/// Cloning is cheap; all clones share one session. Dropping the last clone shuts it down.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use exchange_ws_sdk::ws::{Client, Config};
///
/// # async fn example() -> exchange_ws_sdk::Result<()> {
/// let client = Client::connect("wss://ws-fapi.binance.com/ws-fapi/v1", Config::default()).await?;
///
/// let request = br#"{"id":"r1","method":"time","params":{}}"#.to_vec();
/// let response = client.write_sync("r1", request, Duration::from_secs(5)).await?;
/// println!("{}", String::from_utf8_lossy(&response));
/// # Ok(())
/// # }
/// ```
pub struct Client<C: Connection = WsConnection> {
    inner: Arc<ClientInner<C>>,
    guard: Arc<ShutdownOnDrop>,
}

impl<C: Connection> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<C: Connection> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct ClientInner<C> {
    /// Current connection. Only replaced while `write_lock` is held.
    connection: RwLock<Arc<C>>,
    /// Serializes writers, and connection replacement against writers
    write_lock: Mutex<()>,
    requests: RequestRegistry,
    /// The in-flight `write_sync` call. Installed under `write_lock`, taken by the read pump.
    sync_waiter: StdMutex<Option<SyncWaiter>>,
    /// Wakes a read pump blocked on a full channel once a sync waiter is installed
    waiter_installed: Notify,
    messages: Mutex<mpsc::Receiver<Vec<u8>>>,
    errors: Mutex<mpsc::Receiver<Error>>,
    reconnect_count: AtomicU64,
    state_tx: watch::Sender<ClientState>,
    shutdown: CancellationToken,
}

/// The `write_sync` call waiting for the frame whose id is `id`.
struct SyncWaiter {
    id: String,
    response_tx: oneshot::Sender<Result<Vec<u8>>>,
}

/// Uninstalls the sync waiter however the `write_sync` call ends.
struct WaiterGuard<'a, C> {
    inner: &'a ClientInner<C>,
}

impl<C> Drop for WaiterGuard<'_, C> {
    fn drop(&mut self) {
        drop(self.inner.take_waiter());
    }
}

/// Cancels the session when the last [`Client`] handle goes away.
///
/// The background tasks hold only [`ClientInner`], so this guard is the sole owner-side signal.
struct ShutdownOnDrop(CancellationToken);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Client<WsConnection> {
    /// Dial `endpoint` and start a session over it.
    pub async fn connect(endpoint: &str, config: Config) -> Result<Self> {
        let connection = WsConnection::connect(endpoint, &config).await?;
        Ok(Self::new(connection, &config))
    }
}

impl<C: Connection> Client<C> {
    /// Start a session over an already established `connection`.
    ///
    /// Spawns the read pump and the reconnect supervisor, so this must be called from within a
    /// Tokio runtime.
    #[must_use]
    pub fn new(connection: C, config: &Config) -> Self {
        // A zero-capacity channel does not exist in tokio, one slot is the closest rendezvous
        let (message_tx, message_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (established_tx, established_rx) = mpsc::channel(1);
        let (state_tx, _) = watch::channel(ClientState::Live);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(ClientInner {
            connection: RwLock::new(Arc::new(connection)),
            write_lock: Mutex::new(()),
            requests: RequestRegistry::new(),
            sync_waiter: StdMutex::new(None),
            waiter_installed: Notify::new(),
            messages: Mutex::new(message_rx),
            errors: Mutex::new(error_rx),
            reconnect_count: AtomicU64::new(0),
            state_tx,
            shutdown: shutdown.clone(),
        });

        let pump = ReadPump {
            inner: Arc::clone(&inner),
            message_tx,
            error_tx,
            reconnect_tx,
            established_rx,
        };
        tokio::spawn(pump.run());

        let supervisor = ReconnectSupervisor {
            inner: Arc::clone(&inner),
            reconnect_rx,
            established_tx,
            backoff: config.reconnect.clone().into(),
            max_backoff: config.reconnect.max_backoff,
        };
        tokio::spawn(supervisor.run());

        Self {
            inner,
            guard: Arc::new(ShutdownOnDrop(shutdown)),
        }
    }

    /// Send `payload` without waiting for its response.
    ///
    /// `id` is recorded as pending until a frame carrying it is read, or until the next
    /// reconnect. Writing an id that is still pending fails with
    /// [`WsError::DuplicateRequestId`] and sends nothing. On a transport error the id is not
    /// recorded; the read pump, not the writer, notices the broken socket and reconnects.
    pub async fn write(&self, id: &str, payload: Vec<u8>) -> Result<()> {
        if self.inner.requests.contains(id) {
            return Err(duplicate(id));
        }

        let _guard = self.inner.write_lock.lock().await;
        self.ensure_running()?;

        // Registered before sending: a fast response must find the id to clear it
        if !self.inner.requests.try_add(id) {
            return Err(duplicate(id));
        }

        if let Err(e) = self
            .inner
            .current()
            .write_message(MessageType::Text, payload)
            .await
        {
            self.inner.requests.remove(id);
            return Err(e);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(%id, "Sent WebSocket request");

        Ok(())
    }

    /// Send `payload` and wait up to `timeout` for the frame whose `id` matches.
    ///
    /// The write lock is held for the whole call. The read pump hands every frame to this call
    /// directly, so it makes progress whatever other consumers of [`messages`](Self::messages)
    /// or [`errors`](Self::errors) are doing. Frames with other ids that arrive meanwhile are
    /// discarded. An error seen by the read pump ends the call with that error, and an expired
    /// deadline ends it with [`WsError::ReadTimeout`]; a response arriving after that is
    /// delivered to ordinary message consumers.
    ///
    /// The pending-request registry is not touched.
    pub async fn write_sync(
        &self,
        id: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_running()?;

        // Installed before sending: the response may be read before the write returns
        let (response_tx, response_rx) = oneshot::channel();
        let _waiter = self.inner.install_waiter(id, response_tx);

        self.inner
            .current()
            .write_message(MessageType::Text, payload)
            .await?;

        match time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            // The read pump stopped and dropped the waiter
            Ok(Err(_closed)) => Err(WsError::ConnectionClosed.into()),
            Err(_elapsed) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%id, ?timeout, "Timed out waiting for WebSocket response");
                Err(WsError::ReadTimeout.into())
            }
        }
    }

    /// Serialize `request` and [`write`](Self::write) it under its own id.
    pub async fn send(&self, request: &Request) -> Result<()> {
        self.write(&request.id, request.to_bytes()?).await
    }

    /// Serialize `request`, [`write_sync`](Self::write_sync) it and decode the response envelope.
    pub async fn call(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let frame = self
            .write_sync(&request.id, request.to_bytes()?, timeout)
            .await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Receive the next inbound frame. Returns `None` once the session has terminated.
    pub async fn recv_message(&self) -> Option<Vec<u8>> {
        self.inner.messages.lock().await.recv().await
    }

    /// Inbound frames as a stream; see [`recv_message`](Self::recv_message).
    ///
    /// While the stream waits for a frame it holds the receiver, so concurrent
    /// [`recv_message`](Self::recv_message) callers queue behind it even if the stream is no
    /// longer polled. [`write_sync`](Self::write_sync) is not affected.
    pub fn messages(&self) -> impl Stream<Item = Vec<u8>> + use<C> {
        let inner = Arc::clone(&self.inner);
        stream! {
            loop {
                // Bound first so the receiver lock is released before yielding
                let message = inner.messages.lock().await.recv().await;
                let Some(message) = message else { break };
                yield message;
            }
        }
    }

    /// Receive the next error seen by the read pump: transport failures (each followed by a
    /// reconnect) and frames that could not be parsed.
    ///
    /// The channel holds a single error. While it is full the read pump waits, so a session
    /// whose errors are never read stalls at its second error.
    ///
    /// An error seen while a [`write_sync`](Self::write_sync) call is in flight ends that call
    /// instead and is not published here.
    pub async fn recv_error(&self) -> Option<Error> {
        self.inner.errors.lock().await.recv().await
    }

    /// Read pump errors as a stream; see [`recv_error`](Self::recv_error), including how it
    /// competes with [`write_sync`](Self::write_sync).
    pub fn errors(&self) -> impl Stream<Item = Error> + use<C> {
        let inner = Arc::clone(&self.inner);
        stream! {
            loop {
                let error = inner.errors.lock().await.recv().await;
                let Some(error) = error else { break };
                yield error;
            }
        }
    }

    /// Number of redial attempts so far, successful or not.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnect_count.load(Ordering::SeqCst)
    }

    /// Number of ids written with [`write`](Self::write) whose responses are outstanding.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state changes, e.g. to re-send subscriptions after a reconnect.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until no [`write`](Self::write) is pending or `timeout` elapses.
    ///
    /// Returns `true` if the registry drained in time.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let token = CancellationToken::new();
        // Stops the polling task however this future ends, including being dropped
        let _cancel = token.clone().drop_guard();
        let (done_tx, done_rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval(WAIT_POLL_INTERVAL);
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if inner.requests.is_empty() {
                            _ = done_tx.send(());
                            return;
                        }
                    }
                }
            }
        });

        matches!(time::timeout(timeout, done_rx).await, Ok(Ok(())))
    }

    /// Stop the background tasks and close the current connection.
    ///
    /// Later writes fail with [`WsError::ConnectionClosed`], and the message and error
    /// channels end once both tasks have exited.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Shutting down WebSocket client");

        self.inner.shutdown.cancel();
        self.inner.state_tx.send_replace(ClientState::Terminated);
        drop(self.inner.take_waiter());
        self.inner.current().close().await;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WsError::ConnectionClosed.into());
        }
        Ok(())
    }
}

impl<C> ClientInner<C> {
    fn current(&self) -> Arc<C> {
        Arc::clone(&self.connection.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install `connection`, returning the one it replaces. Callers hold `write_lock`.
    fn replace(&self, connection: C) -> Arc<C> {
        let mut slot = self.connection.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, Arc::new(connection))
    }

    /// Route inbound frames and errors to a `write_sync` call waiting for `id`.
    fn install_waiter(
        &self,
        id: &str,
        response_tx: oneshot::Sender<Result<Vec<u8>>>,
    ) -> WaiterGuard<'_, C> {
        *self.waiter_slot() = Some(SyncWaiter {
            id: id.to_owned(),
            response_tx,
        });
        self.waiter_installed.notify_one();
        WaiterGuard { inner: self }
    }

    fn waiter_slot(&self) -> MutexGuard<'_, Option<SyncWaiter>> {
        self.sync_waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_waiter(&self) -> Option<SyncWaiter> {
        self.waiter_slot().take()
    }
}

fn duplicate(id: &str) -> Error {
    WsError::DuplicateRequestId { id: id.to_owned() }.into()
}

/// Ask for a reconnect unless one is already pending. Returns whether the request was queued.
fn request_reconnect(reconnect_tx: &mpsc::Sender<()>) -> bool {
    reconnect_tx.try_send(()).is_ok()
}

struct ReadPump<C> {
    inner: Arc<ClientInner<C>>,
    message_tx: mpsc::Sender<Vec<u8>>,
    error_tx: mpsc::Sender<Error>,
    reconnect_tx: mpsc::Sender<()>,
    established_rx: mpsc::Receiver<()>,
}

impl<C: Connection> ReadPump<C> {
    async fn run(mut self) {
        let shutdown = self.inner.shutdown.clone();

        loop {
            let connection = self.inner.current();
            // A read racing a close must not take the session down with it
            let read = AssertUnwindSafe(connection.read_message()).catch_unwind();

            let result = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                result = read => result.unwrap_or_else(|_panic| Err(WsError::ConnectionClosed.into())),
            };

            let keep_going = match result {
                Ok((_, frame)) => self.deliver(frame).await,
                Err(e) => self.recover(e).await,
            };
            if !keep_going {
                break;
            }
        }

        self.inner.state_tx.send_replace(ClientState::Terminated);
        // Fails a `write_sync` still waiting with `ConnectionClosed`
        drop(self.inner.take_waiter());

        #[cfg(feature = "tracing")]
        tracing::debug!("Read pump stopped");
    }

    /// Forward a frame and clear its id. Returns `false` on shutdown.
    async fn deliver(&self, frame: Vec<u8>) -> bool {
        let id = match frame_id(&frame) {
            Ok(id) => id,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    frame = %String::from_utf8_lossy(&frame),
                    error = %e,
                    "Failed to parse WebSocket message"
                );
                return self.publish(WsError::MessageParse(e).into()).await;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(id = ?id, "Received WebSocket message");

        if !self.forward(id.as_deref(), frame).await {
            return false;
        }

        if let Some(id) = id {
            self.inner.requests.remove(&id);
        }
        true
    }

    /// Hand `frame` to the in-flight `write_sync` call if there is one, otherwise to the
    /// message channel. Returns `false` on shutdown.
    async fn forward(&self, id: Option<&str>, frame: Vec<u8>) -> bool {
        loop {
            {
                let mut slot = self.inner.waiter_slot();
                let matches = slot.as_ref().map(|waiter| id == Some(waiter.id.as_str()));
                match matches {
                    Some(true) => {
                        if let Some(waiter) = slot.take() {
                            _ = waiter.response_tx.send(Ok(frame));
                        }
                        return true;
                    }
                    Some(false) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(id = ?id, "Discarding frame while waiting for response");
                        return true;
                    }
                    None => {}
                }
            }

            // A waiter installed while the channel is full takes this frame instead
            tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => return false,
                () = self.inner.waiter_installed.notified() => {}
                permit = self.message_tx.reserve() => {
                    let Ok(permit) = permit else {
                        return false;
                    };
                    permit.send(frame);
                    return true;
                }
            }
        }
    }

    /// Report a read error and wait for a fresh connection. Returns `false` on shutdown.
    async fn recover(&mut self, error: Error) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(%error, "WebSocket read failed, reconnecting");

        self.inner
            .state_tx
            .send_replace(ClientState::AwaitingReconnect);
        request_reconnect(&self.reconnect_tx);

        if !self.publish(error).await {
            return false;
        }

        tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => return false,
            established = self.established_rx.recv() => {
                if established.is_none() {
                    return false;
                }
            }
        }

        self.inner.requests.reset();
        self.inner.state_tx.send_replace(ClientState::Live);
        true
    }

    /// Hand `error` to the in-flight `write_sync` call if there is one, otherwise to the error
    /// channel. Returns `false` on shutdown.
    async fn publish(&self, error: Error) -> bool {
        loop {
            if let Some(waiter) = self.inner.take_waiter() {
                _ = waiter.response_tx.send(Err(error));
                return true;
            }

            tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => return false,
                () = self.inner.waiter_installed.notified() => {}
                permit = self.error_tx.reserve() => {
                    let Ok(permit) = permit else {
                        return false;
                    };
                    permit.send(error);
                    return true;
                }
            }
        }
    }
}

struct ReconnectSupervisor<C> {
    inner: Arc<ClientInner<C>>,
    reconnect_rx: mpsc::Receiver<()>,
    established_tx: mpsc::Sender<()>,
    backoff: ExponentialBackoff,
    max_backoff: Duration,
}

impl<C: Connection> ReconnectSupervisor<C> {
    async fn run(mut self) {
        let shutdown = self.inner.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                signal = self.reconnect_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            let Some(connection) = self.redial(&shutdown).await else {
                break;
            };
            self.backoff.reset();

            let previous = {
                let _guard = self.inner.write_lock.lock().await;
                self.inner.replace(connection)
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(
                attempts = self.inner.reconnect_count.load(Ordering::SeqCst),
                "WebSocket reconnected"
            );

            _ = self.established_tx.send(()).await;
            // The old socket already failed; closing it only releases its resources
            previous.close().await;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Reconnect supervisor stopped");
    }

    /// Redial until it succeeds. Returns `None` on shutdown.
    async fn redial(&mut self, shutdown: &CancellationToken) -> Option<C> {
        let current = self.inner.current();

        loop {
            self.inner.reconnect_count.fetch_add(1, Ordering::SeqCst);

            let attempt = tokio::select! {
                biased;
                () = shutdown.cancelled() => return None,
                attempt = current.redial() => attempt,
            };

            match attempt {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    let delay = self.backoff.next_backoff().unwrap_or(self.max_backoff);

                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, ?delay, "Unable to reconnect");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;

                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => return None,
                        () = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
