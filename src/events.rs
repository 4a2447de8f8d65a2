//! Session event contract between the node and the application.
//!
//! The application implements [`EventHandler`] and registers it on the node
//! before running it. The node invokes one method per event kind; request
//! events return `Result<Reply, Error>` and the node serializes exactly one
//! wire reply per command from that result. Default implementations refuse
//! the optional capabilities, so an application only opts into what it
//! actually serves.

use crate::client::Client;
use crate::errors::Error;
use crate::middleware::Credentials;
use crate::models::{ClientInfo, PublishResult};
use async_trait::async_trait;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-subscription behavior, chosen by the application for each accepted
/// subscribe and for server-side subscriptions installed at connect time.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Keep the subscription recoverable through channel history.
    pub enable_recovery: bool,
    /// Track this subscriber in the channel presence set.
    pub emit_presence: bool,
    /// Announce this subscriber's join/leave to the channel.
    pub emit_join_leave: bool,
    /// Deliver other members' join/leave announcements to this subscriber.
    pub push_join_leave: bool,
    /// Initial payload delivered to this subscriber in the subscribe reply.
    pub data: Option<Box<RawValue>>,
}

/// Connection negotiation, before a session exists.
#[derive(Debug)]
pub struct ConnectEvent {
    pub credentials: Credentials,
    pub data: Option<Box<RawValue>>,
}

/// Initial reply to a connecting session.
#[derive(Debug, Default)]
pub struct ConnectReply {
    pub data: Option<Box<RawValue>>,
    /// Allow the client to drive refresh with its own tokens. When false,
    /// only node-initiated refresh extends the session.
    pub client_side_refresh: bool,
    /// Server-side subscriptions enrolled before the connect reply.
    pub subscriptions: HashMap<String, SubscribeOptions>,
}

#[derive(Debug)]
pub struct RefreshEvent {
    /// True when triggered by a client refresh command rather than the
    /// node's expiration timer.
    pub client_side: bool,
    pub token: Option<String>,
}

#[derive(Debug)]
pub struct RefreshReply {
    /// New expiration in unix seconds. Zero turns expiration off.
    pub expire_at: i64,
}

#[derive(Debug)]
pub struct SubscribeEvent {
    pub channel: String,
}

#[derive(Debug, Default)]
pub struct SubscribeReply {
    pub options: SubscribeOptions,
}

#[derive(Debug)]
pub struct UnsubscribeEvent {
    pub channel: String,
}

/// Async message from the client. No reply is produced.
#[derive(Debug)]
pub struct MessageEvent {
    pub data: Box<RawValue>,
}

#[derive(Debug)]
pub struct PublishEvent {
    pub channel: String,
    pub data: Box<RawValue>,
    /// Attribution of the publishing session, for the application to
    /// preserve when it republishes through the node.
    pub client_info: ClientInfo,
}

#[derive(Debug, Default)]
pub struct PublishReply {
    /// Publish outcome surfaced to the client, normally the result of
    /// [`crate::Node::publish`].
    pub result: Option<PublishResult>,
}

#[derive(Debug)]
pub struct RpcEvent {
    pub method: String,
    pub data: Option<Box<RawValue>>,
}

#[derive(Debug, Default)]
pub struct RpcReply {
    pub data: Option<Box<RawValue>>,
}

#[derive(Debug)]
pub struct PresenceEvent {
    pub channel: String,
}

/// Acceptance of a presence request. The node fills the actual presence
/// data from its own store.
#[derive(Debug, Default)]
pub struct PresenceReply {}

#[derive(Debug)]
pub struct DisconnectEvent {
    pub code: u16,
    pub reason: String,
}

/// Application-side session event handler.
///
/// One trait object serves every session; per-session state belongs on the
/// [`Client`] handed to each method, not in the handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Connection negotiation with request credentials. The returned reply
    /// may enroll server-side subscriptions for the new session.
    async fn on_connecting(&self, _event: ConnectEvent) -> Result<ConnectReply, Error> {
        Ok(ConnectReply::default())
    }

    /// Session established. A good place to spawn per-session background
    /// tasks tied to [`Client::cancellation`].
    async fn on_connect(&self, _client: Arc<Client>) {}

    /// Session expiry driving. The default keeps sessions alive forever.
    async fn on_refresh(
        &self,
        _client: &Client,
        _event: RefreshEvent,
    ) -> Result<RefreshReply, Error> {
        Ok(RefreshReply { expire_at: 0 })
    }

    async fn on_subscribe(
        &self,
        _client: &Client,
        _event: SubscribeEvent,
    ) -> Result<SubscribeReply, Error> {
        Err(Error::not_available())
    }

    async fn on_unsubscribe(&self, _client: &Client, _event: UnsubscribeEvent) {}

    /// Async message from the client. No reply is sent.
    async fn on_message(&self, _client: &Client, _event: MessageEvent) {}

    async fn on_publish(
        &self,
        _client: &Client,
        _event: PublishEvent,
    ) -> Result<PublishReply, Error> {
        Err(Error::not_available())
    }

    async fn on_rpc(&self, _client: &Client, _event: RpcEvent) -> Result<RpcReply, Error> {
        Err(Error::not_available())
    }

    async fn on_presence(
        &self,
        _client: &Client,
        _event: PresenceEvent,
    ) -> Result<PresenceReply, Error> {
        Err(Error::not_available())
    }

    /// Keep-alive observed for the session (one per client ping).
    async fn on_alive(&self, _client: &Client) {}

    /// Session is gone. Always the last event for a session.
    async fn on_disconnect(&self, _client: &Client, _event: DisconnectEvent) {}
}
