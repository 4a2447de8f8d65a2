//! Connection credentials and their attachment to upgrade requests.
//!
//! The node never authenticates clients itself. Applications wrap the
//! WebSocket route in middleware of their own and attach [`Credentials`]
//! to the request before it reaches [`crate::ws_handler`]; an upgrade
//! request arriving without credentials (or with already-expired ones) is
//! refused with `401 Unauthorized`.

use axum::extract::Request;
use serde_json::value::RawValue;

/// Identity of a connecting client, valid for the session's lifetime and
/// extended by refresh events.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Application-level user identifier.
    pub user_id: String,
    /// Unix seconds after which the session expires. Zero disables
    /// expiration.
    pub expire_at: i64,
    /// Opaque JSON blob describing the user, shown to other channel
    /// members through presence and publication attribution.
    pub info: Option<Box<RawValue>>,
}

/// Attaches credentials to an upgrade request on its way to the node's
/// WebSocket handler.
pub fn attach_credentials(request: &mut Request, credentials: Credentials) {
    request.extensions_mut().insert(credentials);
}
