#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use exchange_ws_sdk::error::Kind;
use exchange_ws_sdk::ws::{Client, ClientState, Config, Request, WsError};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// How the mock server treats inbound text frames.
#[derive(Clone, Copy)]
enum Behavior {
    /// Echo every frame back, except `params.timeout == "true"`; honour `params.delay_ms`
    Echo,
    /// Accept the handshake, then never read or write
    Silent,
}

/// Mock WebSocket API server.
struct MockWsServer {
    addr: SocketAddr,
    /// Raw text frames in the order the server read them, across all connections
    received: Arc<std::sync::Mutex<Vec<String>>>,
    stop: CancellationToken,
    accept_loop: JoinHandle<()>,
}

impl MockWsServer {
    /// Start an echoing server on a random port.
    async fn start() -> Self {
        Self::bind("127.0.0.1:0".parse().unwrap(), Behavior::Echo).await
    }

    async fn bind(addr: SocketAddr, behavior: Behavior) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));

        let accept_stop = stop.clone();
        let accept_received = Arc::clone(&received);
        let accept_loop = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    () = accept_stop.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, _)) = accepted else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let connection_stop = accept_stop.clone();
                let connection_received = Arc::clone(&accept_received);
                tokio::spawn(async move {
                    match behavior {
                        Behavior::Echo => {
                            serve_echo(ws_stream, connection_received, connection_stop).await;
                        }
                        Behavior::Silent => {
                            connection_stop.cancelled().await;
                            drop(ws_stream);
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            stop,
            accept_loop,
        }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws-fapi/v1", self.addr)
    }

    /// Drop every connection and stop listening, freeing the port.
    async fn stop(self) {
        self.stop.cancel();
        _ = self.accept_loop.await;
    }
}

async fn serve_echo(
    ws_stream: WebSocketStream<TcpStream>,
    received: Arc<std::sync::Mutex<Vec<String>>>,
    stop: CancellationToken,
) {
    let (write, mut read) = ws_stream.split();
    let write = Arc::new(Mutex::new(write));

    loop {
        let msg = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                received.lock().unwrap().push(text.as_str().to_owned());
                let request: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                if request.pointer("/params/timeout") == Some(&json!("true")) {
                    continue;
                }
                let delay = request
                    .pointer("/params/delay_ms")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis);

                let write = Arc::clone(&write);
                tokio::spawn(async move {
                    if let Some(delay) = delay {
                        sleep(delay).await;
                    }
                    _ = write.lock().await.send(Message::Text(text)).await;
                });
            }
            // PINGs are answered by tungstenite itself
            Some(Ok(_)) => {}
            _ => break,
        }
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.reconnect.initial_backoff = Duration::from_millis(20);
    config.reconnect.max_backoff = Duration::from_millis(200);
    config
}

fn request(id: &str) -> Vec<u8> {
    json!({ "id": id, "method": "some-method", "params": {} })
        .to_string()
        .into_bytes()
}

fn delayed_request(id: &str, delay_ms: u64) -> Vec<u8> {
    json!({ "id": id, "method": "some-method", "params": { "delay_ms": delay_ms } })
        .to_string()
        .into_bytes()
}

fn swallowed_request(id: &str) -> Vec<u8> {
    json!({ "id": id, "method": "some-method", "params": { "timeout": "true" } })
        .to_string()
        .into_bytes()
}

fn id_of(frame: &[u8]) -> String {
    let value: Value = serde_json::from_slice(frame).unwrap();
    value["id"].as_str().unwrap().to_owned()
}

async fn next_message(client: &Client) -> Vec<u8> {
    timeout(Duration::from_secs(5), client.recv_message())
        .await
        .expect("timed out waiting for message")
        .expect("message channel closed")
}

async fn wait_until_reconnected(client: &Client) {
    let mut state = client.state_receiver();
    timeout(Duration::from_secs(10), async {
        while !(client.reconnect_count() >= 1
            && *state.borrow_and_update() == ClientState::Live)
        {
            _ = timeout(Duration::from_millis(50), state.changed()).await;
        }
    })
    .await
    .expect("client did not reconnect");
}

mod request_response {
    use super::*;

    #[tokio::test]
    async fn write_sync_echo_round_trip() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        let response = client
            .write_sync("r1", request("r1"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response, request("r1"));
        assert_eq!(client.reconnect_count(), 0);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn async_write_response_arrives_on_message_channel() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        client.write("a1", request("a1")).await.unwrap();
        let frame = next_message(&client).await;

        assert_eq!(id_of(&frame), "a1");
        assert!(client.wait(Duration::from_secs(2)).await);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn interleaved_async_and_sync_writes() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        // The async response is held back so that it lands after the sync call returned
        client
            .write("async-1", delayed_request("async-1", 300))
            .await
            .unwrap();
        let response = client
            .write_sync("sync-1", request("sync-1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(id_of(&response), "sync-1");

        let frame = next_message(&client).await;
        assert_eq!(id_of(&frame), "async-1");
        assert!(client.wait(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn write_sync_times_out_when_server_stays_silent() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        let error = client
            .write_sync("t1", swallowed_request("t1"), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::ReadTimeout)
        ));
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_pending_id_is_rejected() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        client.write("dup", swallowed_request("dup")).await.unwrap();
        let error = client.write("dup", request("dup")).await.unwrap_err();

        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::DuplicateRequestId { id }) if id == "dup"
        ));
        assert_eq!(client.pending_requests(), 1);
        assert!(!client.wait(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn concurrent_writers_each_get_their_response() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    let id = format!("c{i}");
                    client.write(&id, request(&id)).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let frame = next_message(&client).await;
            assert!(seen.insert(id_of(&frame)), "every response is delivered once");
        }

        let expected: HashSet<_> = (0..20).map(|i| format!("c{i}")).collect();
        assert_eq!(seen, expected);
        assert!(client.wait(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn concurrent_writers_reach_server_in_one_total_order() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        client.write("before", swallowed_request("before")).await.unwrap();
        let writers: Vec<_> = (0..20)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    let id = format!("c{i}");
                    client.write(&id, swallowed_request(&id)).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        client.write("after", swallowed_request("after")).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while server.received().len() < 22 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let received = server.received();
        let ids: Vec<String> = received.iter().map(|frame| id_of(frame.as_bytes())).collect();
        for (frame, id) in received.iter().zip(&ids) {
            assert_eq!(
                frame.as_bytes(),
                swallowed_request(id).as_slice(),
                "each frame arrives whole"
            );
        }

        assert_eq!(ids.len(), 22);
        assert_eq!(ids.first().map(String::as_str), Some("before"));
        assert_eq!(ids.last().map(String::as_str), Some("after"));
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len(), "each write is seen exactly once");
    }

    #[tokio::test]
    async fn call_and_send_use_request_envelope() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        let request = Request::builder()
            .method("time")
            .params(json!({ "recvWindow": 5000 }))
            .build();
        let response = client.call(&request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.id.as_deref(), Some(request.id.as_str()));

        let request = Request::builder().id("env-2").method("ping").build();
        client.send(&request).await.unwrap();
        let frame = next_message(&client).await;
        assert_eq!(id_of(&frame), "env-2");
    }
}

mod reconnect {
    use super::*;

    #[tokio::test]
    async fn reconnects_after_server_restart() {
        let server = MockWsServer::start().await;
        let addr = server.addr;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();

        client
            .write_sync("r1", request("r1"), Duration::from_secs(5))
            .await
            .unwrap();
        client.write("lost", swallowed_request("lost")).await.unwrap();
        assert_eq!(client.pending_requests(), 1);

        server.stop().await;

        let error = timeout(Duration::from_secs(5), client.recv_error())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.kind(), Kind::WebSocket);

        // Let a few redials fail against the closed port
        sleep(Duration::from_millis(300)).await;
        let _server = MockWsServer::bind(addr, Behavior::Echo).await;

        wait_until_reconnected(&client).await;
        assert!(client.reconnect_count() >= 1);
        assert_eq!(client.pending_requests(), 0, "registry is wiped on reconnect");

        client
            .write("after-reconnect", request("after-reconnect"))
            .await
            .unwrap();
        let response = client
            .write_sync("r2", request("r2"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(id_of(&response), "r2");
    }

    #[tokio::test]
    async fn healthy_keepalive_does_not_reconnect() {
        let server = MockWsServer::start().await;
        let mut config = config();
        config.keepalive_period = Duration::from_millis(100);
        let client = Client::connect(&server.ws_url(), config).await.unwrap();

        sleep(Duration::from_millis(700)).await;

        assert_eq!(client.reconnect_count(), 0);
        assert_eq!(client.state(), ClientState::Live);
        let response = client
            .write_sync("k1", request("k1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(id_of(&response), "k1");
    }

    #[tokio::test]
    async fn unanswered_keepalive_forces_reconnect() {
        let server = MockWsServer::bind("127.0.0.1:0".parse().unwrap(), Behavior::Silent).await;
        let mut config = config();
        config.keepalive_period = Duration::from_millis(100);
        let client = Client::connect(&server.ws_url(), config).await.unwrap();

        let error = timeout(Duration::from_secs(5), client.recv_error())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.kind(), Kind::WebSocket);

        timeout(Duration::from_secs(5), async {
            while client.reconnect_count() == 0 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn connect_fails_without_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = Client::connect(&format!("ws://{addr}"), config())
            .await
            .unwrap_err();

        assert_eq!(error.kind(), Kind::WebSocket);
    }

    #[tokio::test]
    async fn shutdown_terminates_session() {
        let server = MockWsServer::start().await;
        let client = Client::connect(&server.ws_url(), config()).await.unwrap();
        let mut state = client.state_receiver();

        client.shutdown().await;

        assert_eq!(*state.borrow_and_update(), ClientState::Terminated);
        let error = client.write("w1", request("w1")).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::ConnectionClosed)
        ));

        let end = timeout(Duration::from_secs(5), client.recv_message())
            .await
            .unwrap();
        assert!(end.is_none(), "message channel ends after shutdown");
        assert_eq!(client.reconnect_count(), 0);
    }
}
