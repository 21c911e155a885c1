//! Connection handlers for Herald server.
//!
//! This module wires the server together and runs the WebSocket session of
//! each client: subscriptions, presence, client events and delivery.

use crate::api;
use crate::config::{Config, DatabaseKind};
use crate::dispatch::ServerDispatcher;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::store::RedisMemberStore;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use herald_core::channel::CLIENT_EVENT_PREFIX;
use herald_core::{
    ChannelKind, ConnectionOracle, MemberStore, MemoryMemberStore, PresenceDirectory,
    PresenceError, PresenceNotifier, Router as HeraldRouter, RouterConfig,
};
use herald_ingest::{HttpAdapter, IngestAdapter, RedisAdapter, RedisAdapterConfig};
use herald_protocol::{codec, codes, ChannelData, Encoding, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// Connection registry and rooms.
    pub router: Arc<HeraldRouter>,
    /// Presence member lists.
    pub presence: Arc<PresenceDirectory>,
    /// Server configuration.
    pub config: Config,
    /// When the server started.
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Create new app state over a member store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn MemberStore>) -> Self {
        let router = Arc::new(HeraldRouter::with_config(RouterConfig {
            max_channels: config.limits.max_channels,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            outbox_capacity: config.limits.outbox_capacity,
        }));

        let oracle: Arc<dyn ConnectionOracle> = router.clone();
        let notifier: Arc<dyn PresenceNotifier> = router.clone();

        Self {
            presence: Arc::new(PresenceDirectory::new(store, oracle, notifier)),
            router,
            config,
            started_at: std::time::Instant::now(),
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the member store or an enabled adapter cannot be
/// started, or the server fails to bind.
pub async fn run_server(config: Config) -> Result<()> {
    let store: Arc<dyn MemberStore> = match config.database {
        DatabaseKind::Memory => Arc::new(MemoryMemberStore::new()),
        DatabaseKind::Redis => Arc::new(
            RedisMemberStore::connect(&config.redis.url, config.redis.key_prefix.clone())
                .await
                .context("Failed to connect the redis member store")?,
        ),
    };
    let state = Arc::new(AppState::new(config.clone(), store));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let mut api_routes = api::routes().with_state(Arc::clone(&state));
    let mut adapters: Vec<Box<dyn IngestAdapter>> = Vec::new();

    if config.subscribers.http {
        let http = HttpAdapter::new(config.dev_mode);
        subscribe_adapter(&http, &state).await?;
        api_routes = api_routes.merge(http.routes());
        adapters.push(Box::new(http));
    }

    if config.subscribers.redis {
        let redis = RedisAdapter::new(RedisAdapterConfig {
            url: config.redis.url.clone(),
            key_prefix: config.redis.key_prefix.clone(),
            reconnect_delay: Duration::from_millis(config.redis.reconnect_delay_ms),
            dev_mode: config.dev_mode,
        });
        subscribe_adapter(&redis, &state).await?;
        adapters.push(Box::new(redis));
    }

    let protected =
        api_routes.route_layer(from_fn_with_state(Arc::clone(&state), api::require_app_key));
    let headers = Arc::new(api::response_headers(&config.headers));

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state))
        .merge(protected)
        .layer(from_fn_with_state(headers, api::add_headers));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Herald server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for adapter in &adapters {
        if let Err(e) = adapter.unsubscribe().await {
            warn!(adapter = adapter.name(), error = %e, "Adapter did not stop cleanly");
        }
    }

    info!("Herald server stopped");
    Ok(())
}

async fn subscribe_adapter(adapter: &dyn IngestAdapter, state: &AppState) -> Result<()> {
    let dispatcher = Arc::new(ServerDispatcher::new(
        Arc::clone(&state.router),
        adapter.name(),
    ));
    adapter
        .subscribe(dispatcher)
        .await
        .with_context(|| format!("Failed to start the {} subscriber", adapter.name()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

fn next_connection_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);

    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{epoch:x}.{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = next_connection_id();
    let mut outbox = state.router.register(&connection_id);
    let session = Session::new(Arc::clone(&state), connection_id.clone());

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies and deliveries follow the encoding of the client's last frame.
    let mut encoding = Encoding::Json;

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(&connection_id, heartbeat);
    if send_frame(&mut sender, &connected, encoding).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        session.close().await;
        return;
    }

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut deadline = Instant::now() + idle_timeout;
    let mut read_buffer = BytesMut::with_capacity(4096);

    'session: loop {
        tokio::select! {
            biased;

            Some(delivery) = outbox.recv() => {
                let frame = Frame::event(&delivery.channel, &delivery.event, delivery.data.clone());
                if send_frame(&mut sender, &frame, encoding).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                deadline = Instant::now() + idle_timeout;

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = std::time::Instant::now();
                        encoding = Encoding::Json;
                        metrics::record_message(text.len(), "inbound");

                        let reply = match codec::decode(text.as_bytes(), Encoding::Json) {
                            Ok(frame) => session.handle_frame(frame).await,
                            Err(e) => Some(malformed(&connection_id, &e)),
                        };
                        if let Some(reply) = reply {
                            if send_frame(&mut sender, &reply, encoding).await.is_err() {
                                break;
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = std::time::Instant::now();
                        encoding = Encoding::MessagePack;
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            let reply = match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => session.handle_frame(frame).await,
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    Some(malformed(&connection_id, &e))
                                }
                            };
                            if let Some(reply) = reply {
                                if send_frame(&mut sender, &reply, encoding).await.is_err() {
                                    break 'session;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            () = tokio::time::sleep_until(deadline) => {
                debug!(connection = %connection_id, "Connection idle, closing");
                break;
            }
        }
    }

    session.close().await;
    debug!(connection = %connection_id, "WebSocket disconnected");
}

fn malformed(connection_id: &str, error: &codec::ProtocolError) -> Frame {
    warn!(connection = %connection_id, error = %error, "Malformed frame");
    metrics::record_error("protocol");
    Frame::error(0, codes::MALFORMED_FRAME, error.to_string())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSink, frame: &Frame, encoding: Encoding) -> Result<()> {
    let data = codec::encode(frame, encoding)?;
    metrics::record_message(data.len(), "outbound");

    let message = match encoding {
        Encoding::Json => Message::Text(String::from_utf8(data.to_vec())?),
        Encoding::MessagePack => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

/// One client's view of the server.
struct Session {
    state: Arc<AppState>,
    connection_id: String,
}

impl Session {
    fn new(state: Arc<AppState>, connection_id: String) -> Self {
        Self {
            state,
            connection_id,
        }
    }

    /// Handle a decoded frame and return the direct reply, if any.
    async fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Subscribe {
                id,
                channel,
                channel_data,
            } => Some(self.subscribe(id, &channel, channel_data).await),

            Frame::Unsubscribe { id, channel } => Some(self.unsubscribe(id, &channel).await),

            Frame::ClientEvent {
                channel,
                event,
                data,
            } => self.client_event(&channel, &event, data),

            Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

            other => {
                warn!(connection = %self.connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
                Some(Frame::error(
                    0,
                    codes::MALFORMED_FRAME,
                    "Unexpected frame type",
                ))
            }
        }
    }

    async fn subscribe(&self, id: u64, channel: &str, channel_data: Option<ChannelData>) -> Frame {
        debug!(connection = %self.connection_id, channel = %channel, "Subscribe request");

        if let Err(e) = self.state.router.subscribe(&self.connection_id, channel) {
            warn!(connection = %self.connection_id, channel = %channel, error = %e, "Subscribe failed");
            metrics::record_error("subscribe");
            return Frame::error(id, codes::SUBSCRIBE_REJECTED, e.to_string());
        }
        metrics::record_subscription();
        metrics::set_active_channels(self.state.router.stats().channel_count);

        if !ChannelKind::of(channel).is_presence() {
            return Frame::ack(id);
        }

        let (user_id, user_info) = channel_data
            .map(|data| (data.user_id, data.user_info))
            .unwrap_or_default();

        match self
            .state
            .presence
            .join(channel, &self.connection_id, user_id, user_info)
            .await
        {
            Ok(_) => {
                metrics::record_presence("join");
                Frame::ack(id)
            }
            Err(e) => {
                // No connection stays in a presence room without a member record.
                let _ = self.state.router.unsubscribe(&self.connection_id, channel);
                metrics::set_active_channels(self.state.router.stats().channel_count);
                metrics::record_error("presence");

                let code = match e {
                    PresenceError::MissingMemberData => codes::MISSING_CHANNEL_DATA,
                    _ => {
                        error!(connection = %self.connection_id, channel = %channel, error = %e, "Presence join failed");
                        codes::PRESENCE_UNAVAILABLE
                    }
                };
                Frame::error(id, code, e.to_string())
            }
        }
    }

    async fn unsubscribe(&self, id: u64, channel: &str) -> Frame {
        debug!(connection = %self.connection_id, channel = %channel, "Unsubscribe request");

        if !self.state.router.is_subscribed(&self.connection_id, channel) {
            return Frame::error(
                id,
                codes::NOT_SUBSCRIBED,
                format!("Not subscribed to channel: {channel}"),
            );
        }

        if ChannelKind::of(channel).is_presence() {
            self.leave_presence(channel).await;
        }

        match self.state.router.unsubscribe(&self.connection_id, channel) {
            Ok(()) => {
                metrics::set_active_channels(self.state.router.stats().channel_count);
                Frame::ack(id)
            }
            Err(e) => Frame::error(id, codes::NOT_SUBSCRIBED, e.to_string()),
        }
    }

    fn client_event(&self, channel: &str, event: &str, data: serde_json::Value) -> Option<Frame> {
        let allowed = event.starts_with(CLIENT_EVENT_PREFIX)
            && ChannelKind::of(channel).allows_client_events()
            && self.state.router.is_subscribed(&self.connection_id, channel);

        if !allowed {
            debug!(connection = %self.connection_id, channel = %channel, event = %event, "Client event rejected");
            return Some(Frame::error(
                0,
                codes::CLIENT_EVENT_REJECTED,
                format!("Client event {event} not allowed on {channel}"),
            ));
        }

        let recipients =
            self.state
                .router
                .emit_except(channel, Some(&self.connection_id), event, data);
        metrics::record_dispatch("client");
        metrics::set_dropped_deliveries(self.state.router.dropped_deliveries());
        debug!(connection = %self.connection_id, channel = %channel, event = %event, recipients, "Client event");
        None
    }

    async fn leave_presence(&self, channel: &str) {
        match self.state.presence.leave(channel, &self.connection_id).await {
            Ok(Some(_)) => metrics::record_presence("leave"),
            Ok(None) => {}
            Err(e) => {
                error!(connection = %self.connection_id, channel = %channel, error = %e, "Presence leave failed");
                metrics::record_error("presence");
            }
        }
    }

    /// Leave every presence channel, then drop the connection.
    async fn close(&self) {
        for channel in self.state.router.connection_channels(&self.connection_id) {
            if ChannelKind::of(&channel).is_presence() {
                self.leave_presence(&channel).await;
            }
        }

        self.state.router.unregister(&self.connection_id);
        metrics::set_active_channels(self.state.router.stats().channel_count);
    }
}
