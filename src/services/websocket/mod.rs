//! Push channel: a WebSocket server relaying engine events to clients
//! subscribed to the `conditions` channel for a session and symbol.
//!
//! Clients send
//! `{"action":"subscribe","channel":"conditions","session_id":"...","symbol":"..."}`
//! and receive an acknowledgement, one `condition_update` per matching
//! instance, then every `condition_update` / `state_change` for that pair.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::core::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use crate::models::events::{ConditionUpdate, EngineEvent, CONDITIONS_CHANNEL};
use crate::services::publisher::BroadcastPublisher;

#[derive(Debug, Clone)]
pub struct PushServerConfig {
    pub port: u16,
    pub max_clients: usize,
    /// Events queued per client before new ones are dropped.
    pub client_buffer: usize,
    /// Consecutive dropped events after which a client is disconnected.
    pub max_overflows: u32,
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for PushServerConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            max_clients: 256,
            client_buffer: 256,
            max_overflows: 32,
            handshake_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
pub struct PushServerStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub messages_sent: AtomicU64,
    /// Events lost to a lagging fan-out or a full client queue.
    pub lagged_events: AtomicU64,
    pub evicted_clients: AtomicU64,
}

impl PushServerStats {
    pub fn snapshot(&self) -> PushServerStatsSnapshot {
        PushServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            lagged_events: self.lagged_events.load(Ordering::Relaxed),
            evicted_clients: self.evicted_clients.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushServerStatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub messages_sent: u64,
    pub lagged_events: u64,
    pub evicted_clients: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub session_id: String,
    pub symbol: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionRequest {
    channel: String,
    session_id: String,
    symbol: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe(SubscriptionRequest),
    Unsubscribe(SubscriptionRequest),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    Subscribed {
        channel: &'a str,
        session_id: &'a str,
        symbol: &'a str,
    },
    Unsubscribed {
        channel: &'a str,
        session_id: &'a str,
        symbol: &'a str,
    },
    Error {
        message: String,
    },
}

impl ServerMessage<'_> {
    fn into_message(self) -> Option<Message> {
        match serde_json::to_string(&self) {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                error!(error = %e, "Failed to encode push channel reply");
                None
            }
        }
    }
}

type ClientId = u64;

struct ClientHandle {
    tx: mpsc::Sender<Message>,
    subscriptions: HashSet<Subscription>,
    /// Events dropped in a row because the queue was full.
    overflows: AtomicU32,
}

impl ClientHandle {
    fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx,
            subscriptions: HashSet::new(),
            overflows: AtomicU32::new(0),
        }
    }
}

type ClientMap = Arc<RwLock<HashMap<ClientId, ClientHandle>>>;

pub struct PushServer {
    config: PushServerConfig,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<BroadcastPublisher>,
    metrics: Arc<Metrics>,
    stats: Arc<PushServerStats>,
    clients: ClientMap,
    next_client_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl PushServer {
    pub fn new(
        config: PushServerConfig,
        dispatcher: Arc<Dispatcher>,
        publisher: Arc<BroadcastPublisher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher,
            publisher,
            metrics,
            stats: Arc::new(PushServerStats::default()),
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_client_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    pub fn stats(&self) -> &Arc<PushServerStats> {
        &self.stats
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured port and serve until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.config.port)).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn run_on(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Push channel server started");

        let fanout = self.spawn_fanout_task();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.handle_new_connection(stream, addr),
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Push channel server shutting down");
                    break;
                }
            }
        }

        fanout.abort();
        let clients = self.clients.read().await;
        for client in clients.values() {
            let _ = client.tx.try_send(Message::Close(None));
        }
        info!("Push channel server stopped");
        Ok(())
    }

    fn spawn_fanout_task(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.publisher.subscribe();
        let clients = self.clients.clone();
        let stats = self.stats.clone();
        let max_overflows = self.config.max_overflows;

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => Self::fan_out(&clients, &stats, &event, max_overflows).await,
                    Err(RecvError::Lagged(skipped)) => {
                        stats.lagged_events.fetch_add(skipped, Ordering::Relaxed);
                        warn!(skipped = skipped, "Push channel lagging, oldest events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Queue `event` for every subscribed client without waiting on any of
    /// them. A client whose queue stays full for `max_overflows` events in a
    /// row is dropped from the map, which ends its session.
    async fn fan_out(clients: &ClientMap, stats: &PushServerStats, event: &EngineEvent, max_overflows: u32) {
        let key = Subscription {
            session_id: event.session_id().to_string(),
            symbol: event.symbol().to_string(),
        };
        let mut evicted = Vec::new();
        {
            let clients = clients.read().await;
            let targets: Vec<(&ClientId, &ClientHandle)> = clients
                .iter()
                .filter(|(_, client)| client.subscriptions.contains(&key))
                .collect();
            if targets.is_empty() {
                return;
            }

            let payload = match serde_json::to_string(event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(event = event.kind(), error = %e, "Failed to encode event");
                    return;
                }
            };
            for (&client_id, client) in targets {
                match client.tx.try_send(Message::Text(payload.clone())) {
                    Ok(()) => {
                        client.overflows.store(0, Ordering::Relaxed);
                        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        stats.lagged_events.fetch_add(1, Ordering::Relaxed);
                        let overflows = client.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            client_id,
                            event = event.kind(),
                            overflows = overflows,
                            "Push client queue full, event dropped"
                        );
                        if overflows >= max_overflows {
                            evicted.push(client_id);
                        }
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        if evicted.is_empty() {
            return;
        }
        let mut clients = clients.write().await;
        for client_id in evicted {
            if clients.remove(&client_id).is_some() {
                stats.evicted_clients.fetch_add(1, Ordering::Relaxed);
                warn!(client_id, "Disconnecting push client that stopped reading");
            }
        }
    }

    /// Hand the connection to its own task. The WebSocket handshake runs
    /// there so a slow peer never holds up the accept loop.
    fn handle_new_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let current = self.stats.active_connections.load(Ordering::Relaxed);
        if current >= self.config.max_clients as u64 {
            warn!(
                addr = %addr,
                current = current,
                max = self.config.max_clients,
                "Rejecting connection: max clients reached"
            );
            return;
        }

        let session = ClientSession {
            client_id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            clients: self.clients.clone(),
            dispatcher: self.dispatcher.clone(),
            stats: self.stats.clone(),
            metrics: self.metrics.clone(),
            send_timeout: self.config.send_timeout,
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handshake_timeout = self.config.handshake_timeout;
        let client_buffer = self.config.client_buffer;

        tokio::spawn(async move {
            let ws_stream = match tokio::time::timeout(handshake_timeout, accept_async(stream)).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    warn!(addr = %addr, error = %e, "WebSocket handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(addr = %addr, "WebSocket handshake timed out");
                    return;
                }
            };
            let rx = session.register(addr, client_buffer).await;
            session.run(ws_stream, rx, shutdown_rx).await;
        });
    }
}

/// State owned by one connected client's task
struct ClientSession {
    client_id: ClientId,
    clients: ClientMap,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PushServerStats>,
    metrics: Arc<Metrics>,
    send_timeout: Duration,
}

impl ClientSession {
    async fn register(&self, addr: SocketAddr, buffer: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.clients
            .write()
            .await
            .insert(self.client_id, ClientHandle::new(tx));
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        self.metrics.push_clients_connected.inc();
        info!(client_id = self.client_id, addr = %addr, "Push client connected");
        rx
    }

    async fn run(
        self,
        ws_stream: WebSocketStream<TcpStream>,
        mut rx: mpsc::Receiver<Message>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let client_id = self.client_id;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        'session: loop {
            tokio::select! {
                queued = rx.recv() => {
                    let Some(msg) = queued else {
                        // Dropped from the client map by the fan-out.
                        let _ = tokio::time::timeout(self.send_timeout, ws_tx.send(Message::Close(None))).await;
                        break;
                    };
                    match tokio::time::timeout(self.send_timeout, ws_tx.send(msg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(client_id, error = %e, "Failed to send message");
                            break;
                        }
                        Err(_) => {
                            warn!(client_id, "Push client stopped reading, closing session");
                            break;
                        }
                    }
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            for reply in self.handle_text(&text).await {
                                if let Err(e) = ws_tx.send(reply).await {
                                    debug!(client_id, error = %e, "Failed to send reply");
                                    break 'session;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                                debug!(client_id, error = %e, "Failed to send pong");
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(client_id, "Client closed connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(client_id, error = %e, "WebSocket error");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        {
            let mut clients = self.clients.write().await;
            clients.remove(&client_id);
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.metrics.push_clients_connected.dec();
        info!(client_id, "Push client disconnected");
    }

    async fn handle_text(&self, text: &str) -> Vec<Message> {
        let request: ClientMessage = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(client_id = self.client_id, error = %e, "Invalid client message");
                return ServerMessage::Error {
                    message: format!("invalid message: {}", e),
                }
                .into_message()
                .into_iter()
                .collect();
            }
        };

        let (subscribe, request) = match request {
            ClientMessage::Subscribe(request) => (true, request),
            ClientMessage::Unsubscribe(request) => (false, request),
        };
        if request.channel != CONDITIONS_CHANNEL {
            return ServerMessage::Error {
                message: format!("unknown channel '{}'", request.channel),
            }
            .into_message()
            .into_iter()
            .collect();
        }

        let subscription = Subscription {
            session_id: request.session_id.clone(),
            symbol: request.symbol.clone(),
        };
        {
            let mut clients = self.clients.write().await;
            if let Some(client) = clients.get_mut(&self.client_id) {
                if subscribe {
                    client.subscriptions.insert(subscription);
                } else {
                    client.subscriptions.remove(&subscription);
                }
            }
        }

        if !subscribe {
            debug!(client_id = self.client_id, session_id = %request.session_id, symbol = %request.symbol, "Unsubscribed");
            return ServerMessage::Unsubscribed {
                channel: CONDITIONS_CHANNEL,
                session_id: &request.session_id,
                symbol: &request.symbol,
            }
            .into_message()
            .into_iter()
            .collect();
        }

        debug!(client_id = self.client_id, session_id = %request.session_id, symbol = %request.symbol, "Subscribed");
        let mut replies: Vec<Message> = ServerMessage::Subscribed {
            channel: CONDITIONS_CHANNEL,
            session_id: &request.session_id,
            symbol: &request.symbol,
        }
        .into_message()
        .into_iter()
        .collect();

        // Current state of every matching instance, so the client starts in sync.
        for instance in self.dispatcher.list(Some(&request.symbol)).await {
            if instance.session_id != request.session_id {
                continue;
            }
            let event = EngineEvent::ConditionUpdate(ConditionUpdate::from(&instance));
            match serde_json::to_string(&event) {
                Ok(json) => replies.push(Message::Text(json)),
                Err(e) => error!(error = %e, "Failed to encode initial condition update"),
            }
        }
        replies
    }
}
