//! Echo demo server.
//!
//! A small application wired on top of the channelhub node: every upgrade
//! request is authenticated as the same test user, client subscriptions are
//! checked against a static allow-list, publishes are re-stamped with the
//! server time, and two background producers publish into a personal and a
//! broadcast channel once a minute.

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::{FromRef, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use channelhub::{
    attach_credentials, ws_handler, Client, ConnectEvent, ConnectReply, Credentials,
    DisconnectEvent, Error, EventHandler, HistoryOptions, MessageEvent, Node, NodeConfig,
    PresenceEvent, PresenceReply, PublishEvent, PublishOptions, PublishReply, RefreshEvent,
    RefreshReply, RpcEvent, RpcReply, SendError, SubscribeEvent, SubscribeOptions, SubscribeReply,
    UnsubscribeEvent, WebSocketConfig, WebsocketService,
};
use chrono::{Datelike, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Every connection is authenticated as this user.
const USER_ID: &str = "42";

/// Session lifetime granted at connect and on every refresh.
const SESSION_TTL_SECONDS: i64 = 25;

/// Channels clients may subscribe to themselves.
const ALLOWED_CHANNELS: [&str; 2] = ["public:index", "chat:index"];

/// Channel that receives the periodic broadcast publications.
const NOTIFICATION_CHANNEL: &str = "notification:index";

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);
const PUBLISH_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "channelhub", about = "Real-time pub/sub demo server")]
struct Args {
    /// Port to bind app to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Serialize, Deserialize, Debug)]
struct ClientMessage {
    timestamp: i64,
    input: String,
}

fn raw_json(value: String) -> Box<RawValue> {
    RawValue::from_string(value).expect("valid JSON")
}

/// History retention used for everything the demo publishes.
fn retention() -> HistoryOptions {
    HistoryOptions {
        size: 300,
        ttl: Duration::from_secs(60),
    }
}

/// Session event handler of the demo.
///
/// The heartbeat period (60 s) exceeds the session TTL (25 s) on purpose:
/// it is the node-driven refresh, not the heartbeat, that keeps sessions
/// alive.
struct EchoHandler {
    node: Node,
    allowed: HashSet<&'static str>,
}

impl EchoHandler {
    fn new(node: Node) -> Self {
        EchoHandler {
            node,
            allowed: HashSet::from(ALLOWED_CHANNELS),
        }
    }

    fn channel_subscribe_allowed(&self, channel: &str) -> bool {
        self.allowed.contains(channel)
    }
}

#[async_trait]
impl EventHandler for EchoHandler {
    async fn on_connecting(&self, event: ConnectEvent) -> Result<ConnectReply, Error> {
        let server_side = || SubscribeOptions {
            enable_recovery: true,
            ..SubscribeOptions::default()
        };
        let mut subscriptions = HashMap::new();
        // Personal server-side channel of the connecting user.
        subscriptions.insert(format!("#{}", event.credentials.user_id), server_side());
        subscriptions.insert(NOTIFICATION_CHANNEL.to_string(), server_side());
        Ok(ConnectReply {
            data: Some(raw_json("{}".to_string())),
            client_side_refresh: false,
            subscriptions,
        })
    }

    async fn on_connect(&self, client: Arc<Client>) {
        let transport = client.transport();
        info!(
            "[user {}] connected via {} with protocol: {}",
            client.user_id(),
            transport.name(),
            transport.protocol()
        );
        spawn_heartbeat(client);
    }

    async fn on_refresh(
        &self,
        client: &Client,
        _event: RefreshEvent,
    ) -> Result<RefreshReply, Error> {
        info!("[user {}] refresh connection", client.user_id());
        Ok(RefreshReply {
            expire_at: Utc::now().timestamp() + SESSION_TTL_SECONDS,
        })
    }

    async fn on_subscribe(
        &self,
        client: &Client,
        event: SubscribeEvent,
    ) -> Result<SubscribeReply, Error> {
        info!("[user {}] subscribes on {}", client.user_id(), event.channel);
        if !self.channel_subscribe_allowed(&event.channel) {
            return Err(Error::permission_denied());
        }
        Ok(SubscribeReply {
            options: SubscribeOptions {
                enable_recovery: true,
                emit_presence: true,
                emit_join_leave: true,
                push_join_leave: true,
                data: Some(raw_json(r#"{"msg": "welcome"}"#.to_string())),
            },
        })
    }

    async fn on_message(&self, client: &Client, event: MessageEvent) {
        info!(
            "[user {}] async message: {}",
            client.user_id(),
            event.data.get()
        );
        // Echo back.
        if let Err(err) = client.send(event.data).await {
            debug!("[user {}] echo not delivered: {err}", client.user_id());
        }
    }

    async fn on_publish(
        &self,
        client: &Client,
        event: PublishEvent,
    ) -> Result<PublishReply, Error> {
        info!(
            "[user {}] publishes into channel {}: {}",
            client.user_id(),
            event.channel,
            event.data.get()
        );
        if !client.is_subscribed(&event.channel).await {
            return Err(Error::permission_denied());
        }
        let mut message: ClientMessage = match serde_json::from_str(event.data.get()) {
            Ok(message) => message,
            Err(_) => return Err(Error::bad_request()),
        };
        // The server time always wins over whatever the client sent.
        message.timestamp = Utc::now().timestamp();
        let data = serde_json::value::to_raw_value(&message).expect("valid JSON");
        match self
            .node
            .publish(
                &event.channel,
                data,
                PublishOptions {
                    history: Some(retention()),
                    client_info: Some(event.client_info),
                },
            )
            .await
        {
            Ok(result) => Ok(PublishReply {
                result: Some(result),
            }),
            Err(err) => {
                warn!("error publishing into {}: {err}", event.channel);
                Err(Error::internal())
            }
        }
    }

    async fn on_rpc(&self, client: &Client, event: RpcEvent) -> Result<RpcReply, Error> {
        info!(
            "[user {}] sent RPC, method: {}, data: {}",
            client.user_id(),
            event.method,
            event.data.as_deref().map(RawValue::get).unwrap_or("null")
        );
        match event.method.as_str() {
            "getCurrentYear" => Ok(RpcReply {
                data: Some(raw_json(format!(r#"{{"year": {}}}"#, Utc::now().year()))),
            }),
            "echo" => Ok(RpcReply { data: event.data }),
            _ => Err(Error::method_not_found()),
        }
    }

    async fn on_presence(
        &self,
        client: &Client,
        event: PresenceEvent,
    ) -> Result<PresenceReply, Error> {
        info!(
            "[user {}] calls presence on {}",
            client.user_id(),
            event.channel
        );
        if !client.is_subscribed(&event.channel).await {
            return Err(Error::permission_denied());
        }
        Ok(PresenceReply::default())
    }

    async fn on_unsubscribe(&self, client: &Client, event: UnsubscribeEvent) {
        info!(
            "[user {}] unsubscribed from {}",
            client.user_id(),
            event.channel
        );
    }

    async fn on_alive(&self, client: &Client) {
        info!("[user {}] connection is still active", client.user_id());
    }

    async fn on_disconnect(&self, client: &Client, event: DisconnectEvent) {
        info!(
            "[user {}] disconnected: {}",
            client.user_id(),
            event.reason
        );
    }
}

/// Periodically pushes the current server time to one session. Stops as
/// soon as the session's cancellation fires or the transport reports
/// end-of-stream; a missed tick is skipped, never compensated.
fn spawn_heartbeat(client: Arc<Client>) {
    tokio::spawn(async move {
        let cancel = client.cancellation();
        let mut ticker = interval_at(Instant::now() + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let frame = raw_json(format!(r#"{{"time": "{}"}}"#, Utc::now().timestamp()));
            match client.send(frame).await {
                Ok(()) => {}
                Err(SendError::Closed) => return,
                Err(err) => {
                    warn!(
                        "[user {}] error sending heartbeat: {err}",
                        client.user_id()
                    );
                }
            }
        }
    });
}

/// Publishes personal notifications for the test user once a minute.
fn spawn_personal_publisher(node: Node) {
    tokio::spawn(async move {
        let mut counter: u64 = 1;
        loop {
            let payload = raw_json(format!(r#"{{"personal": "{counter}"}}"#));
            let options = PublishOptions {
                history: Some(retention()),
                client_info: None,
            };
            if let Err(err) = node.publish(&format!("#{USER_ID}"), payload, options).await {
                warn!("error publishing to personal channel: {err}");
            }
            counter += 1;
            sleep(PUBLISH_PERIOD).await;
        }
    });
}

/// Publishes into the broadcast notification channel once a minute.
fn spawn_notification_publisher(node: Node) {
    tokio::spawn(async move {
        let mut counter: u64 = 1;
        loop {
            let payload = raw_json(format!(r#"{{"input": "Publish from server {counter}"}}"#));
            let options = PublishOptions {
                history: Some(retention()),
                client_info: None,
            };
            if let Err(err) = node.publish(NOTIFICATION_CHANNEL, payload, options).await {
                warn!("error publishing to channel: {err}");
            }
            counter += 1;
            sleep(PUBLISH_PERIOD).await;
        }
    });
}

/// Attaches the fixed test-user credentials to every upgrade request.
async fn auth_middleware(mut request: Request, next: Next) -> Response {
    attach_credentials(
        &mut request,
        Credentials {
            user_id: USER_ID.to_string(),
            expire_at: Utc::now().timestamp() + SESSION_TTL_SECONDS,
            info: Some(raw_json(r#"{"name": "Test User"}"#.to_string())),
        },
    );
    next.run(request).await
}

#[derive(Clone)]
struct AppState {
    websocket: WebsocketService,
    shutdown: mpsc::Sender<()>,
}

impl FromRef<AppState> for WebsocketService {
    fn from_ref(state: &AppState) -> Self {
        state.websocket.clone()
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Requests shutdown shortly after responding, so the reply still reaches
/// the caller.
async fn exit(State(state): State<AppState>) -> &'static str {
    let shutdown = state.shutdown;
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        let _ = shutdown.try_send(());
    });
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let node = Node::new(NodeConfig {
        name: "echo".to_string(),
        version: "0.0.0".to_string(),
        history_meta_ttl: Duration::from_secs(24 * 3600),
    })
    .context("node init")?;
    node.set_event_handler(Arc::new(EchoHandler::new(node.clone())));
    node.run().await.context("node run")?;

    spawn_personal_publisher(node.clone());
    spawn_notification_publisher(node.clone());

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let websocket = WebsocketService::new(
        node.clone(),
        WebSocketConfig {
            write_buffer_size: 1024,
            ..WebSocketConfig::default()
        },
    );
    let app = Router::new()
        .route(
            "/connection/websocket",
            get(ws_handler).layer(middleware::from_fn(auth_middleware)),
        )
        .route("/health", get(health))
        .route("/exit", get(exit))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .with_state(AppState {
            websocket,
            shutdown: shutdown_tx.clone(),
        });

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let signals = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = signals.try_send(());
    });

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .context("http bind")?;
    info!(
        "server is running, http://localhost:{}/connection/websocket",
        args.port
    );

    let http_shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let shutdown = http_shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    let _ = shutdown_rx.recv().await;
    info!("shutdown signal received");
    // Best effort: node and HTTP server both wind down under one deadline.
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        node.shutdown().await;
        http_shutdown.cancel();
        let _ = server.await;
    })
    .await;
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
#[path = "tests/test_echo.rs"]
mod test_echo;
