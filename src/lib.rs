//! # Channelhub
//!
//! A real-time messaging node for Rust: pub/sub channels, RPC, presence,
//! per-channel history with recovery, and session lifecycle management over
//! a WebSocket transport. It's built on top of Axum and Tokio; applications
//! configure behavior by implementing a single event-handler trait.
//!
//! ## Features
//!
//! - WebSocket transport with a JSON command/reply/push protocol
//! - Publish/Subscribe with per-channel history retention and recovery
//! - Presence tracking with join/leave notifications
//! - RPC and async message events dispatched to the application
//! - Credential-based session expiration with node-driven refresh
//! - Per-session cancellation tokens for background tasks
//!
//! ## Main Components
//!
//! - `Node`: the messaging node; owns sessions, channels, history, presence.
//! - `EventHandler`: the application's per-event contract (connect,
//!   subscribe, publish, RPC, presence, refresh, disconnect, ...).
//! - `Client`: per-session handle passed to event handlers.
//! - `Credentials`: identity attached to upgrade requests by application
//!   middleware and enforced by the node.
//! - `WebsocketService` / `ws_handler`: the Axum endpoint for upgrades.
//!
//! ## Getting Started
//!
//! ```no_run
//! use channelhub::{
//!     attach_credentials, ws_handler, Credentials, Node, NodeConfig, WebSocketConfig,
//!     WebsocketService,
//! };
//! use axum::{middleware, routing::get, Router};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let node = Node::new(NodeConfig::default()).unwrap();
//!     node.set_event_handler(Arc::new(MyHandler));
//!     node.run().await.unwrap();
//!
//!     let service = WebsocketService::new(node.clone(), WebSocketConfig::default());
//!     let app = Router::new()
//!         .route(
//!             "/connection/websocket",
//!             get(ws_handler).layer(middleware::from_fn(|mut req, next: middleware::Next| async {
//!                 attach_credentials(
//!                     &mut req,
//!                     Credentials {
//!                         user_id: "1".into(),
//!                         expire_at: 0,
//!                         info: None,
//!                     },
//!                 );
//!                 next.run(req).await
//!             })),
//!         )
//!         .with_state(service);
//!
//!     let listener = TcpListener::bind("127.0.0.1:8000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! The handler decides what each session may do; everything defaults to
//! refused or inert until the application opts in:
//!
//! ```rust
//! use channelhub::{Error, EventHandler, SubscribeEvent, SubscribeReply, Client};
//! use async_trait::async_trait;
//!
//! struct MyHandler;
//!
//! #[async_trait]
//! impl EventHandler for MyHandler {
//!     async fn on_subscribe(
//!         &self,
//!         _client: &Client,
//!         event: SubscribeEvent,
//!     ) -> Result<SubscribeReply, Error> {
//!         if event.channel.starts_with("public:") {
//!             Ok(SubscribeReply::default())
//!         } else {
//!             Err(Error::permission_denied())
//!         }
//!     }
//! }
//! ```

mod client;
mod config;
mod errors;
mod events;
mod handlers;
mod middleware;
mod models;
mod node;
mod state;
mod utils;

pub use client::*;
pub use config::*;
pub use errors::*;
pub use events::*;
pub use handlers::*;
pub use middleware::*;
pub use models::*;
pub use node::*;
pub use state::{Channel, SessionId};

#[cfg(test)]
#[path = "tests/test_session.rs"]
mod test_session;
