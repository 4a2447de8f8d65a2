//! Wire protocol data model.
//!
//! All frames are JSON text. A client sends `Command` frames carrying exactly
//! one request kind; the server answers with a `Reply` mirroring the command
//! id, and delivers server-initiated data as id-less `Push` frames. Payloads
//! (`data` fields) are opaque raw JSON and pass through the node unparsed.

use crate::errors::Error;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

/// A frame received from a client.
///
/// Exactly one of the request fields must be present. `send` and `ping`
/// carry no id and get no reply (`send`) or an empty reply (`ping`).
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<RpcRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<SendRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingRequest>,
}

/// One decoded request kind extracted from a `Command`.
#[derive(Debug)]
pub(crate) enum Request {
    Connect(ConnectRequest),
    Refresh(RefreshRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    Rpc(RpcRequest),
    Presence(PresenceRequest),
    Send(SendRequest),
    Ping,
}

impl Command {
    /// Splits the command into its id and single request kind.
    ///
    /// Returns `None` when the frame carries zero or more than one request
    /// field, which is a protocol violation and closes the connection.
    pub(crate) fn into_request(self) -> Option<(Option<u64>, Request)> {
        let Command {
            id,
            connect,
            refresh,
            subscribe,
            unsubscribe,
            publish,
            rpc,
            presence,
            send,
            ping,
        } = self;
        let mut requests: Vec<Request> = Vec::with_capacity(1);
        if let Some(r) = connect {
            requests.push(Request::Connect(r));
        }
        if let Some(r) = refresh {
            requests.push(Request::Refresh(r));
        }
        if let Some(r) = subscribe {
            requests.push(Request::Subscribe(r));
        }
        if let Some(r) = unsubscribe {
            requests.push(Request::Unsubscribe(r));
        }
        if let Some(r) = publish {
            requests.push(Request::Publish(r));
        }
        if let Some(r) = rpc {
            requests.push(Request::Rpc(r));
        }
        if let Some(r) = presence {
            requests.push(Request::Presence(r));
        }
        if let Some(r) = send {
            requests.push(Request::Send(r));
        }
        if ping.is_some() {
            requests.push(Request::Ping);
        }
        if requests.len() != 1 {
            return None;
        }
        Some((id, requests.remove(0)))
    }
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct RefreshRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct SubscribeRequest {
    pub channel: String,
    /// Ask the node to replay missed publications after `offset`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recover: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct PublishRequest {
    pub channel: String,
    pub data: Box<RawValue>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct PresenceRequest {
    pub channel: String,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct SendRequest {
    pub data: Box<RawValue>,
}

#[derive(Deserialize, Serialize, Debug, Default)]
pub struct PingRequest {}

/// A frame sent to a client: either a reply to one command or a push.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<RpcResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<Push>,
}

impl Reply {
    pub(crate) fn error(id: Option<u64>, error: Error) -> Self {
        Reply {
            id,
            error: Some(error),
            ..Default::default()
        }
    }

    pub(crate) fn push(push: Push) -> Self {
        Reply {
            push: Some(push),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ConnectResult {
    /// Session id assigned by the node.
    pub client: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
    /// Server-side subscriptions installed for this session.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeResult>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expires: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ttl: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct RefreshResult {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expires: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ttl: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct SubscribeResult {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recoverable: bool,
    /// Latest publication offset in the channel at subscribe time.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// Publications replayed for a recovering subscriber.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    /// Whether the retained history fully covered the requested offset.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct UnsubscribeResult {}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy)]
pub struct PublishResult {
    /// Offset assigned to the publication when history retention applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct RpcResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PresenceResult {
    /// Session id to client info for every presence-enabled subscriber.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub presence: HashMap<String, ClientInfo>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PingResult {}

/// Server-initiated frame kinds.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Push {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(
        rename = "pub",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub publication: Option<Publication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinPush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave: Option<LeavePush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<DisconnectPush>,
}

/// One message published into a channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Publication {
    pub data: Box<RawValue>,
    /// Attribution of the publishing session, when preserved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Identity of a session as seen by other channel members.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientInfo {
    pub client: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan_info: Option<Box<RawValue>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JoinPush {
    pub info: ClientInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LeavePush {
    pub info: ClientInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessagePush {
    pub data: Box<RawValue>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DisconnectPush {
    pub code: u16,
    pub reason: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}
