//! WebSocket upgrade handling and the per-session event loop.
//!
//! This module owns the session lifecycle: negotiate the connect command,
//! install server-side subscriptions, then dispatch every inbound command
//! to the application's [`EventHandler`] and serialize exactly one reply
//! per command. Background pushes go through the session's [`Client`]
//! handle and may interleave with replies.

use crate::client::{Client, TransportInfo};
use crate::config::WebSocketConfig;
use crate::errors::{Error, DISCONNECT_EXPIRED, DISCONNECT_NORMAL};
use crate::events::{
    ConnectEvent, DisconnectEvent, EventHandler, MessageEvent, PresenceEvent, PublishEvent,
    RefreshEvent, RpcEvent, SubscribeEvent, UnsubscribeEvent,
};
use crate::middleware::Credentials;
use crate::models::{
    Command, ConnectResult, PingResult, PresenceRequest, PresenceResult, PublishRequest,
    RefreshRequest, RefreshResult, Reply, Request, RpcRequest, SendRequest, SubscribeRequest,
    SubscribeResult, UnsubscribeRequest, UnsubscribeResult,
};
use crate::node::Node;
use crate::utils::unix_now;
use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum_extra::TypedHeader;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Subprotocol offered during the WebSocket handshake.
pub const JSON_SUBPROTOCOL: &str = "channelhub-json";

/// Trait for sending WebSocket messages.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Sends a WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns an `axum::Error` if sending fails.
    async fn send(&mut self, message: AxumMessage) -> Result<(), axum::Error>;
}

/// Trait for receiving WebSocket messages.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Receives the next WebSocket message.
    ///
    /// Returns `None` when the connection is closed.
    async fn next(&mut self) -> Option<Result<AxumMessage, axum::Error>>;
}

/// Implements the `Sender` trait for the WebSocket sink.
pub struct WebSocketSender(futures::stream::SplitSink<WebSocket, AxumMessage>);

/// Implements the `Receiver` trait for the WebSocket stream.
pub struct WebSocketReceiver(futures::stream::SplitStream<WebSocket>);

#[async_trait]
impl Sender for WebSocketSender {
    async fn send(&mut self, message: AxumMessage) -> Result<(), axum::Error> {
        self.0.send(message).await
    }
}

#[async_trait]
impl Receiver for WebSocketReceiver {
    async fn next(&mut self) -> Option<Result<AxumMessage, axum::Error>> {
        self.0.next().await
    }
}

/// Axum state for the node's WebSocket endpoint.
#[derive(Clone)]
pub struct WebsocketService {
    node: Node,
    config: WebSocketConfig,
}

impl WebsocketService {
    pub fn new(node: Node, config: WebSocketConfig) -> Self {
        WebsocketService { node, config }
    }
}

/// Handles incoming WebSocket connection requests.
///
/// Upgrade requests must carry [`Credentials`] in their extensions,
/// attached by application middleware; requests without them, or with
/// credentials that already expired, are refused before the upgrade.
pub async fn ws_handler(
    State(service): State<WebsocketService>,
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    credentials: Option<Extension<Credentials>>,
) -> Response {
    let Some(Extension(credentials)) = credentials else {
        warn!("refusing upgrade without credentials");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if credentials.expire_at != 0 && credentials.expire_at <= unix_now() {
        warn!(
            "refusing upgrade with expired credentials for user {}",
            credentials.user_id
        );
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let user_agent = if let Some(TypedHeader(user_agent)) = user_agent {
        user_agent.to_string()
    } else {
        String::from("Unknown browser")
    };
    info!(
        "new WebSocket connection: `{user_agent}` for user {}",
        credentials.user_id
    );
    let node = service.node.clone();
    let handshake_timeout = service.config.handshake_timeout;
    ws.write_buffer_size(service.config.write_buffer_size)
        .max_message_size(service.config.max_message_size)
        .protocols([JSON_SUBPROTOCOL])
        .on_upgrade(move |socket| async move {
            let (sender, receiver) = socket.split();
            accept_transport(
                node,
                Box::new(WebSocketSender(sender)),
                WebSocketReceiver(receiver),
                credentials,
                TransportInfo::websocket(),
                handshake_timeout,
            )
            .await;
        })
}

/// Runs one session over an arbitrary transport until it disconnects.
///
/// The first frame must be a connect command arriving within
/// `handshake_timeout`; everything after it is dispatched to the node's
/// event handler. This is the entry point for non-WebSocket transports
/// and for tests driving mock connections.
pub async fn accept_transport<R: Receiver>(
    node: Node,
    mut sender: Box<dyn Sender>,
    mut receiver: R,
    credentials: Credentials,
    transport: TransportInfo,
    handshake_timeout: Duration,
) {
    if !node.is_running() {
        warn!("refusing transport: node is not running");
        return;
    }
    let Some(handler) = node.handler() else {
        warn!("refusing transport: no event handler");
        return;
    };

    // Connect negotiation.
    let first = match timeout(handshake_timeout, receiver.next()).await {
        Ok(Some(Ok(AxumMessage::Text(text)))) => serde_json::from_str::<Command>(&text).ok(),
        Ok(_) => None,
        Err(_) => {
            debug!("no connect command within handshake deadline");
            None
        }
    };
    let Some((id, Request::Connect(connect))) = first.and_then(Command::into_request) else {
        warn!("invalid connect frame, dropping transport");
        return;
    };
    if credentials.expire_at != 0 && credentials.expire_at <= unix_now() {
        send_to(&mut sender, &Reply::error(id, Error::expired())).await;
        return;
    }

    let connect_reply = match handler
        .on_connecting(ConnectEvent {
            credentials: credentials.clone(),
            data: connect.data,
        })
        .await
    {
        Ok(reply) => reply,
        Err(err) => {
            send_to(&mut sender, &Reply::error(id, err)).await;
            return;
        }
    };

    let state = node.state();
    let mut session_id = Uuid::new_v4().to_string();
    // Check that the session id does not exist yet, and regenerate if it does
    while state.sessions.read().await.contains_key(&session_id) {
        session_id = Uuid::new_v4().to_string();
    }
    let client = Arc::new(Client::new(
        session_id,
        &credentials,
        connect_reply.client_side_refresh,
        transport,
        sender,
        node.shutdown_token().child_token(),
        state.clone(),
    ));
    state.add_session(client.clone()).await;

    // Server-side subscriptions enrolled before the connect reply.
    let mut subs = HashMap::new();
    for (channel, options) in connect_reply.subscriptions {
        if !state.subscribe(&channel, client.id(), options.clone()).await {
            continue;
        }
        if options.emit_presence {
            state
                .join_presence(&channel, client.id(), client.to_client_info())
                .await;
        }
        let result = SubscribeResult {
            recoverable: options.enable_recovery,
            offset: state.latest_offset(&channel).await,
            publications: Vec::new(),
            recovered: false,
            data: options.data.clone(),
        };
        if options.emit_join_leave {
            node.broadcast_join(&channel, client.to_client_info()).await;
        }
        subs.insert(channel, result);
    }

    let expire_at = client.expire_at();
    let connected = Reply {
        id,
        connect: Some(ConnectResult {
            client: client.id().to_string(),
            version: node.config().version.clone(),
            data: connect_reply.data,
            subs,
            expires: expire_at > 0,
            ttl: (expire_at - unix_now()).max(0) as u64,
        }),
        ..Default::default()
    };
    if client.write_frame(&connected).await.is_err() {
        terminate_session(&node, handler.as_ref(), &client).await;
        return;
    }

    handler.on_connect(client.clone()).await;
    spawn_expiry_timer(node.clone(), client.clone());

    // Main command loop.
    let cancel = client.cancellation();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(AxumMessage::Text(text))) => {
                    let command = match serde_json::from_str::<Command>(&text) {
                        Ok(command) => command,
                        Err(err) => {
                            warn!("[user {}] undecodable command: {err}", client.user_id());
                            break;
                        }
                    };
                    if !dispatch_command(&node, handler.as_ref(), &client, command).await {
                        break;
                    }
                }
                Some(Ok(AxumMessage::Ping(payload))) => {
                    if client.write_message(AxumMessage::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(AxumMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("[user {}] transport read failed: {err}", client.user_id());
                    break;
                }
            }
        }
    }

    terminate_session(&node, handler.as_ref(), &client).await;
}

/// Routes one command to its event handler and writes the reply.
///
/// Returns false when the session must be closed (protocol violation or a
/// dead transport).
async fn dispatch_command(
    node: &Node,
    handler: &dyn EventHandler,
    client: &Arc<Client>,
    command: Command,
) -> bool {
    let Some((id, request)) = command.into_request() else {
        warn!(
            "[user {}] protocol violation: not exactly one request per command",
            client.user_id()
        );
        return false;
    };
    let reply = match request {
        Request::Connect(_) => Reply::error(id, Error::bad_request()),
        Request::Subscribe(request) => {
            let channel = request.channel.clone();
            let (reply, announce_join) =
                handle_subscribe(node, handler, client, id, request).await;
            let delivered = client.write_frame(&reply).await.is_ok();
            if announce_join {
                node.broadcast_join(&channel, client.to_client_info()).await;
            }
            return delivered;
        }
        Request::Unsubscribe(request) => {
            let channel = request.channel.clone();
            let (reply, announce_leave) =
                handle_unsubscribe(node, handler, client, id, request).await;
            let delivered = client.write_frame(&reply).await.is_ok();
            if announce_leave {
                node.broadcast_leave(&channel, client.to_client_info()).await;
            }
            return delivered;
        }
        Request::Publish(request) => handle_publish(handler, client, id, request).await,
        Request::Rpc(request) => handle_rpc(handler, client, id, request).await,
        Request::Presence(request) => handle_presence(node, handler, client, id, request).await,
        Request::Refresh(request) => handle_refresh(handler, client, id, request).await,
        Request::Send(request) => {
            handle_send(handler, client, request).await;
            return true;
        }
        Request::Ping => {
            handler.on_alive(client).await;
            Reply {
                id,
                ping: Some(PingResult {}),
                ..Default::default()
            }
        }
    };
    client.write_frame(&reply).await.is_ok()
}

async fn handle_subscribe(
    node: &Node,
    handler: &dyn EventHandler,
    client: &Arc<Client>,
    id: Option<u64>,
    request: SubscribeRequest,
) -> (Reply, bool) {
    if client.is_subscribed(&request.channel).await {
        return (Reply::error(id, Error::already_subscribed()), false);
    }
    let event = SubscribeEvent {
        channel: request.channel.clone(),
    };
    let options = match handler.on_subscribe(client, event).await {
        Ok(reply) => reply.options,
        Err(err) => return (Reply::error(id, err), false),
    };
    let state = node.state();
    state
        .subscribe(&request.channel, client.id(), options.clone())
        .await;
    if options.emit_presence {
        state
            .join_presence(&request.channel, client.id(), client.to_client_info())
            .await;
    }
    let (publications, recovered, latest) = if request.recover && options.enable_recovery {
        state.history_since(&request.channel, request.offset).await
    } else {
        (Vec::new(), false, state.latest_offset(&request.channel).await)
    };
    let reply = Reply {
        id,
        subscribe: Some(SubscribeResult {
            recoverable: options.enable_recovery,
            offset: latest,
            publications,
            recovered,
            data: options.data,
        }),
        ..Default::default()
    };
    (reply, options.emit_join_leave)
}

async fn handle_unsubscribe(
    node: &Node,
    handler: &dyn EventHandler,
    client: &Arc<Client>,
    id: Option<u64>,
    request: UnsubscribeRequest,
) -> (Reply, bool) {
    let mut announce_leave = false;
    if let Some(options) = node.state().unsubscribe(&request.channel, client.id()).await {
        if options.emit_presence {
            node.state()
                .leave_presence(&request.channel, client.id())
                .await;
        }
        handler
            .on_unsubscribe(
                client,
                UnsubscribeEvent {
                    channel: request.channel.clone(),
                },
            )
            .await;
        announce_leave = options.emit_join_leave;
    }
    let reply = Reply {
        id,
        unsubscribe: Some(UnsubscribeResult {}),
        ..Default::default()
    };
    (reply, announce_leave)
}

async fn handle_publish(
    handler: &dyn EventHandler,
    client: &Arc<Client>,
    id: Option<u64>,
    request: PublishRequest,
) -> Reply {
    let event = PublishEvent {
        channel: request.channel,
        data: request.data,
        client_info: client.to_client_info(),
    };
    match handler.on_publish(client, event).await {
        Ok(reply) => Reply {
            id,
            publish: Some(reply.result.unwrap_or_default()),
            ..Default::default()
        },
        Err(err) => Reply::error(id, err),
    }
}

async fn handle_rpc(
    handler: &dyn EventHandler,
    client: &Arc<Client>,
    id: Option<u64>,
    request: RpcRequest,
) -> Reply {
    let event = RpcEvent {
        method: request.method,
        data: request.data,
    };
    match handler.on_rpc(client, event).await {
        Ok(reply) => Reply {
            id,
            rpc: Some(crate::models::RpcResult { data: reply.data }),
            ..Default::default()
        },
        Err(err) => Reply::error(id, err),
    }
}

async fn handle_presence(
    node: &Node,
    handler: &dyn EventHandler,
    client: &Arc<Client>,
    id: Option<u64>,
    request: PresenceRequest,
) -> Reply {
    let event = PresenceEvent {
        channel: request.channel.clone(),
    };
    match handler.on_presence(client, event).await {
        Ok(_) => Reply {
            id,
            presence: Some(PresenceResult {
                presence: node.state().presence(&request.channel).await,
            }),
            ..Default::default()
        },
        Err(err) => Reply::error(id, err),
    }
}

async fn handle_refresh(
    handler: &dyn EventHandler,
    client: &Arc<Client>,
    id: Option<u64>,
    request: RefreshRequest,
) -> Reply {
    if !client.client_side_refresh() {
        return Reply::error(id, Error::bad_request());
    }
    let event = RefreshEvent {
        client_side: true,
        token: request.token,
    };
    match handler.on_refresh(client, event).await {
        Ok(reply) => {
            client.set_expire_at(reply.expire_at);
            Reply {
                id,
                refresh: Some(RefreshResult {
                    expires: reply.expire_at > 0,
                    ttl: (reply.expire_at - unix_now()).max(0) as u64,
                }),
                ..Default::default()
            }
        }
        Err(err) => Reply::error(id, err),
    }
}

async fn handle_send(handler: &dyn EventHandler, client: &Arc<Client>, request: SendRequest) {
    handler
        .on_message(client, MessageEvent { data: request.data })
        .await;
}

/// Drives node-initiated refresh for an expiring session. The handler
/// either extends the session or it is disconnected as expired.
fn spawn_expiry_timer(node: Node, client: Arc<Client>) {
    tokio::spawn(async move {
        let cancel = client.cancellation();
        loop {
            let expire_at = client.expire_at();
            if expire_at == 0 {
                return;
            }
            let wait = Duration::from_secs((expire_at - unix_now()).max(0) as u64);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            let expire_at = client.expire_at();
            if expire_at == 0 {
                return;
            }
            if expire_at > unix_now() {
                // Extended meanwhile, sleep again.
                continue;
            }
            let Some(handler) = node.handler() else {
                return;
            };
            let event = RefreshEvent {
                client_side: false,
                token: None,
            };
            match handler.on_refresh(&client, event).await {
                Ok(reply) if reply.expire_at == 0 => {
                    client.set_expire_at(0);
                    return;
                }
                Ok(reply) if reply.expire_at > unix_now() => {
                    client.set_expire_at(reply.expire_at);
                }
                _ => {
                    client.disconnect(DISCONNECT_EXPIRED).await;
                    return;
                }
            }
        }
    });
}

/// Removes every trace of a session and fires the final disconnect event.
async fn terminate_session(node: &Node, handler: &dyn EventHandler, client: &Arc<Client>) {
    let state = node.state();
    state.remove_session(client.id()).await;
    let left = state.unsubscribe_all(client.id()).await;
    for (channel, options) in &left {
        if options.emit_presence {
            state.leave_presence(channel, client.id()).await;
        }
    }
    client.cancellation().cancel();
    for (channel, options) in left {
        if options.emit_join_leave {
            node.broadcast_leave(&channel, client.to_client_info()).await;
        }
    }
    let close = client.close_info().await.unwrap_or(DISCONNECT_NORMAL);
    debug!(
        "[user {}] session {} terminated: {}",
        client.user_id(),
        client.id(),
        close.reason
    );
    handler
        .on_disconnect(
            client,
            DisconnectEvent {
                code: close.code,
                reason: close.reason.to_string(),
            },
        )
        .await;
}

async fn send_to(sender: &mut Box<dyn Sender>, reply: &Reply) {
    let text = serde_json::to_string(reply).expect("reply serialization");
    if let Err(err) = sender.send(AxumMessage::Text(text)).await {
        debug!("pre-session reply not delivered: {err}");
    }
}
