//! Per-session handle given to application event handlers.

use crate::errors::{Disconnect, SendError};
use crate::handlers::Sender;
use crate::middleware::Credentials;
use crate::models::{ClientInfo, DisconnectPush, MessagePush, Push, Reply};
use crate::state::EngineState;
use axum::extract::ws::Message as AxumMessage;
use serde_json::value::RawValue;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Name and protocol of the transport a session arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportInfo {
    name: &'static str,
    protocol: &'static str,
}

impl TransportInfo {
    pub const fn new(name: &'static str, protocol: &'static str) -> Self {
        TransportInfo { name, protocol }
    }

    pub const fn websocket() -> Self {
        TransportInfo::new("websocket", "json")
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }
}

/// One authenticated client session.
///
/// The node owns the session registry; a `Client` is a view over one entry
/// plus the write half of its transport. All sends are serialized through
/// an internal lock, so pushes from background tasks may interleave with
/// replies but never corrupt framing.
pub struct Client {
    id: String,
    user_id: String,
    info: Option<Box<RawValue>>,
    transport: TransportInfo,
    expire_at: AtomicI64,
    client_side_refresh: bool,
    sender: TokioMutex<Box<dyn Sender>>,
    cancel: CancellationToken,
    close: TokioMutex<Option<Disconnect>>,
    state: Arc<EngineState>,
}

impl Client {
    pub(crate) fn new(
        id: String,
        credentials: &Credentials,
        client_side_refresh: bool,
        transport: TransportInfo,
        sender: Box<dyn Sender>,
        cancel: CancellationToken,
        state: Arc<EngineState>,
    ) -> Self {
        Client {
            id,
            user_id: credentials.user_id.clone(),
            info: credentials.info.clone(),
            transport,
            expire_at: AtomicI64::new(credentials.expire_at),
            client_side_refresh,
            sender: TokioMutex::new(sender),
            cancel,
            close: TokioMutex::new(None),
            state,
        }
    }

    /// Session id assigned by the node.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Connection info blob from the session credentials.
    pub fn info(&self) -> Option<&RawValue> {
        self.info.as_deref()
    }

    pub fn transport(&self) -> TransportInfo {
        self.transport
    }

    /// Unix seconds after which the session expires; zero means never.
    pub fn expire_at(&self) -> i64 {
        self.expire_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_expire_at(&self, expire_at: i64) {
        self.expire_at.store(expire_at, Ordering::Release);
    }

    pub(crate) fn client_side_refresh(&self) -> bool {
        self.client_side_refresh
    }

    /// Cancellation signal for per-session background tasks. Fires on
    /// disconnect, node-initiated termination, and node shutdown.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the session currently holds a subscription to `channel`,
    /// queried from the node's own view.
    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.state.is_subscribed(channel, &self.id).await
    }

    /// Pushes an async message frame to this session.
    pub async fn send(&self, data: Box<RawValue>) -> Result<(), SendError> {
        self.write_frame(&Reply::push(Push {
            message: Some(MessagePush { data }),
            ..Default::default()
        }))
        .await
    }

    /// Terminates the session: pushes the disconnect frame and cancels the
    /// session token so its tasks and read loop wind down.
    pub async fn disconnect(&self, disconnect: Disconnect) {
        {
            let mut close = self.close.lock().await;
            if close.is_some() {
                return;
            }
            *close = Some(disconnect);
        }
        let push = Reply::push(Push {
            disconnect: Some(DisconnectPush {
                code: disconnect.code,
                reason: disconnect.reason.to_string(),
            }),
            ..Default::default()
        });
        if let Err(err) = self.write_frame(&push).await {
            debug!("[user {}] disconnect push not delivered: {}", self.user_id, err);
        }
        self.cancel.cancel();
    }

    pub(crate) async fn close_info(&self) -> Option<Disconnect> {
        *self.close.lock().await
    }

    /// Identity of this session as seen by other channel members.
    pub(crate) fn to_client_info(&self) -> ClientInfo {
        ClientInfo {
            client: self.id.clone(),
            user: self.user_id.clone(),
            conn_info: self.info.clone(),
            chan_info: None,
        }
    }

    pub(crate) async fn write_frame(&self, reply: &Reply) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        let text = serde_json::to_string(reply).expect("reply serialization");
        let mut sender = self.sender.lock().await;
        sender.send(AxumMessage::Text(text)).await?;
        Ok(())
    }

    pub(crate) async fn write_message(&self, message: AxumMessage) -> Result<(), SendError> {
        let mut sender = self.sender.lock().await;
        sender.send(message).await?;
        Ok(())
    }
}
