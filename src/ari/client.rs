//! # Event Stream Client
//!
//! Maintains the websocket to the PBX's ARI event channel and turns it into a
//! lazy, infinite sequence of `AriEvent`s.
//!
//! ## Connection Management:
//! - `connect` registers the application by name and returns one live
//!   connection. At most one attempt is in flight at a time; a concurrent
//!   call fails fast instead of opening a second socket. The handshake is
//!   bounded by `ari.connect_timeout_ms`
//! - An open connection pings every `ari.ping_interval_ms`; two intervals
//!   without any traffic (events or pongs) mean the socket is half-open and
//!   the connection is treated as lost
//! - `events` consumes the client and spawns the long-lived reader task. On
//!   connection loss it reconnects with exponential backoff (1s → 30s by
//!   default) until cancelled
//!
//! ## Event Loss:
//! The PBX does not replay events. Anything emitted while the socket is down
//! is lost, and nothing buffered before the drop is re-delivered. Every
//! reconnect logs this at `warn` so gaps can be correlated with missed calls;
//! stale sessions from a gap are reclaimed by the registry sweep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::ari::backoff::Backoff;
use crate::ari::event::{self, AriEvent};
use crate::config::{AriConfig, ReconnectConfig};
use crate::error::BridgeError;

const EVENT_QUEUE: usize = 256;

/// Shared view of the client's connection health, for the ops API.
#[derive(Debug, Clone, Default)]
pub struct StreamStatus {
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU64>,
}

impl StreamStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Successful reconnects after the first connection.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

pub struct EventStreamClient {
    ari: AriConfig,
    reconnect: ReconnectConfig,
    connecting: AtomicBool,
    status: StreamStatus,
}

/// Clears the in-flight flag when an attempt finishes, however it finishes.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EventStreamClient {
    pub fn new(ari: AriConfig, reconnect: ReconnectConfig) -> Self {
        Self {
            ari,
            reconnect,
            connecting: AtomicBool::new(false),
            status: StreamStatus::default(),
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status.clone()
    }

    /// Websocket URL registering `app_name`, credentials in `api_key`.
    pub fn events_url(&self) -> Result<String, BridgeError> {
        let base = self.ari.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        let mut url = reqwest::Url::parse(&format!("{}/ari/events", ws_base))
            .map_err(|e| BridgeError::Network(format!("invalid ARI base URL {}: {}", self.ari.base_url, e)))?;
        url.query_pairs_mut()
            .append_pair("app", &self.ari.app_name)
            .append_pair("api_key", &format!("{}:{}", self.ari.username, self.ari.password));
        Ok(url.to_string())
    }

    /// Open one connection to the event channel.
    ///
    /// ## Returns:
    /// - **Err(Auth)**: the PBX rejected the credentials (HTTP 401/403)
    /// - **Err(Network)**: unreachable, or another attempt is already in flight
    /// - **Err(Timeout)**: the handshake did not finish within `connect_timeout`
    pub async fn connect(&self) -> Result<AriConnection, BridgeError> {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::Network("connection attempt already in flight".to_string()));
        }
        let _in_flight = InFlight(&self.connecting);

        let url = self.events_url()?;
        debug!(app = %self.ari.app_name, "Connecting to ARI event stream");
        let timeout = self.ari.connect_timeout();
        let (ws, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| BridgeError::Timeout(format!("ARI websocket handshake exceeded {:?}", timeout)))??;

        Ok(AriConnection::new(ws, self.ari.ping_interval()))
    }

    /// Start the reader task and return its event sequence.
    ///
    /// The sequence never ends on its own; it stops only when `cancel` fires
    /// or the receiver is dropped. It cannot be restarted: build a new client
    /// for a fresh sequence.
    pub fn events(self, cancel: CancellationToken) -> ReceiverStream<AriEvent> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(async move {
            self.run(tx, cancel).await;
        });
        ReceiverStream::new(rx)
    }

    async fn run(self, tx: mpsc::Sender<AriEvent>, cancel: CancellationToken) {
        let mut backoff = Backoff::from(&self.reconnect);
        let mut connected_before = false;

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(mut connection) => {
                    backoff.reset();
                    self.status.connected.store(true, Ordering::Release);
                    if connected_before {
                        self.status.reconnects.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            app = %self.ari.app_name,
                            "Reconnected to ARI event stream; events emitted while disconnected are not replayed"
                        );
                    } else {
                        info!(app = %self.ari.app_name, "Connected to ARI event stream");
                    }
                    connected_before = true;

                    let keep_going = loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                connection.close().await;
                                break false;
                            }
                            next = connection.next_event() => match next {
                                Some(event) => {
                                    if tx.send(event).await.is_err() {
                                        debug!("Event consumer gone, stopping event stream");
                                        break false;
                                    }
                                }
                                None => break true,
                            },
                        }
                    };

                    self.status.connected.store(false, Ordering::Release);
                    if !keep_going {
                        break;
                    }
                    warn!("ARI event stream disconnected");
                }
                Err(BridgeError::Auth(detail)) => {
                    error!(error = %detail, "ARI rejected the credentials");
                }
                Err(e) => {
                    warn!(error = %e, "ARI event stream connection failed");
                }
            }

            let delay = backoff.next_delay();
            warn!(
                attempt = backoff.attempt(),
                backoff_ms = delay.as_millis() as u64,
                "Reconnecting to ARI event stream"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.connected.store(false, Ordering::Release);
        info!("ARI event stream stopped");
    }
}

/// One live event channel connection.
pub struct AriConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    keepalive: Interval,
    ping_interval: Duration,
    last_seen: Instant,
}

impl AriConnection {
    fn new(ws: WebSocketStream<MaybeTlsStream<TcpStream>>, ping_interval: Duration) -> Self {
        let mut keepalive = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ws,
            keepalive,
            ping_interval,
            last_seen: Instant::now(),
        }
    }

    /// Next decoded event, or `None` once the connection has ended.
    ///
    /// Incoming pings are answered by the websocket layer; outgoing keepalive
    /// pings detect a silent peer. Undecodable payloads come back as
    /// `AriEvent::Unknown` and unhandled types as `AriEvent::Ignored`.
    pub async fn next_event(&mut self) -> Option<AriEvent> {
        loop {
            let message = tokio::select! {
                message = self.ws.next() => message?,
                _ = self.keepalive.tick() => {
                    if !self.keep_alive().await {
                        return None;
                    }
                    continue;
                }
            };
            self.last_seen = Instant::now();

            match message {
                Ok(Message::Text(text)) => {
                    trace!(len = text.len(), "ARI event received");
                    return Some(event::decode(&text));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "ARI closed the event stream");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "ARI event stream read failed");
                    return None;
                }
            }
        }
    }

    /// Ping the PBX unless it has been silent too long. `false` ends the connection.
    async fn keep_alive(&mut self) -> bool {
        let silent_for = self.last_seen.elapsed();
        if silent_for > self.ping_interval * 2 {
            warn!(silent_ms = silent_for.as_millis() as u64, "ARI event stream went silent");
            return false;
        }

        match tokio::time::timeout(self.ping_interval, self.ws.send(Message::Ping(Vec::new()))).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "ARI keepalive ping failed");
                false
            }
            Err(_) => {
                warn!("ARI keepalive ping stalled");
                false
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(self.ping_interval, self.ws.close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http;

    fn client_for(addr: std::net::SocketAddr) -> EventStreamClient {
        let mut config = AppConfig::default();
        config.ari.base_url = format!("http://{}", addr);
        config.reconnect.initial_backoff_ms = 10;
        config.reconnect.max_backoff_ms = 40;
        config.ari.connect_timeout_ms = 200;
        EventStreamClient::new(config.ari, config.reconnect)
    }

    fn stasis_start(channel: &str) -> Message {
        Message::Text(format!(
            r#"{{"type":"StasisStart","args":[],"channel":{{"id":"{}","name":"PJSIP/1001-1","caller":{{"number":"1001"}}}}}}"#,
            channel
        ))
    }

    #[test]
    fn test_events_url_registers_app() {
        let mut config = AppConfig::default();
        config.ari.base_url = "https://pbx.example.com:8089/".to_string();
        config.ari.username = "bridge".to_string();
        config.ari.password = "s3cret".to_string();
        let client = EventStreamClient::new(config.ari, config.reconnect);

        assert_eq!(
            client.events_url().unwrap(),
            "wss://pbx.example.com:8089/ari/events?app=voice-bridge&api_key=bridge%3As3cret"
        );
    }

    #[tokio::test]
    async fn test_resumes_dispatch_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for n in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                ws.send(Message::Text("garbage".to_string())).await.unwrap();
                ws.send(stasis_start(&format!("c{}", n))).await.unwrap();
                if n == 0 {
                    let _ = ws.close(None).await;
                } else {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            }
        });

        let client = client_for(addr);
        let status = client.status();
        let cancel = CancellationToken::new();
        let mut events = client.events(cancel.clone());

        let mut started = Vec::new();
        while started.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.next())
                .await
                .unwrap()
                .unwrap();
            if let AriEvent::CallStarted { channel, .. } = event {
                started.push(channel);
            } else {
                assert_eq!(event.kind(), "unknown");
            }
        }

        assert_eq!(started, vec!["c0".to_string(), "c1".to_string()]);
        assert_eq!(status.reconnects(), 1);
        assert!(status.is_connected());

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), events.next()).await.unwrap();
        assert!(end.is_none());
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_deduplicated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = client_for(addr);
        let (first, second) = tokio::join!(client.connect(), client.connect());
        assert!(first.is_ok());
        assert!(matches!(second, Err(BridgeError::Network(_))));

        // The flag is released once the attempt completes.
        assert!(!client.connecting.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_auth_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let reject = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
                Err(http::Response::builder()
                    .status(http::StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap())
            };
            let _ = tokio_tungstenite::accept_hdr_async(socket, reject).await;
        });

        let client = client_for(addr);
        let result = client.connect().await;
        assert!(matches!(result, Err(BridgeError::Auth(_))));
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept the TCP connection and never answer the upgrade.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = client_for(addr);
        let result = tokio::time::timeout(Duration::from_secs(3), client.connect())
            .await
            .expect("connect must be bounded");
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
        assert!(!client.connecting.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_stalled_handshake_feeds_reconnect_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            for n in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                if n == 0 {
                    held.push(socket);
                    continue;
                }
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                ws.send(stasis_start("c1")).await.unwrap();
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });

        let cancel = CancellationToken::new();
        let mut events = client_for(addr).events(cancel.clone());
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, AriEvent::CallStarted { ref channel, .. } if channel == "c1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_silent_peer_ends_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Upgrade, then never read again: pings go unanswered.
            let _ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = AppConfig::default();
        config.ari.base_url = format!("http://{}", addr);
        config.ari.ping_interval_ms = 50;
        let client = EventStreamClient::new(config.ari, config.reconnect);

        let mut connection = client.connect().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(3), connection.next_event())
            .await
            .expect("a silent peer must be detected");
        assert!(next.is_none());
    }
}
