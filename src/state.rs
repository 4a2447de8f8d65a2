//! Node state: session registry, channel subscriptions, history, presence.
//!
//! All channel routing state lives here behind its own locks. Locks are
//! never held across an await into transport writes; callers snapshot what
//! they need and release.

use crate::client::Client;
use crate::events::SubscribeOptions;
use crate::models::{ClientInfo, Publication};
use crate::node::HistoryOptions;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Type alias for session identifiers.
pub type SessionId = String;

/// Type alias for channel names.
pub type Channel = String;

pub(crate) struct HistoryEntry {
    publication: Publication,
    expires_at: Instant,
}

/// Retained publications and the offset counter for one channel.
#[derive(Default)]
pub(crate) struct ChannelHistory {
    last_offset: u64,
    entries: VecDeque<HistoryEntry>,
    last_publish: Option<Instant>,
}

impl ChannelHistory {
    fn drop_expired(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if front.expires_at <= now {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

pub(crate) struct EngineState {
    pub(crate) sessions: RwLock<HashMap<SessionId, Arc<Client>>>,
    subscriptions: RwLock<HashMap<Channel, HashMap<SessionId, SubscribeOptions>>>,
    history: RwLock<HashMap<Channel, ChannelHistory>>,
    presence: RwLock<HashMap<Channel, HashMap<SessionId, ClientInfo>>>,
}

impl EngineState {
    pub(crate) fn new() -> Self {
        EngineState {
            sessions: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn add_session(&self, client: Arc<Client>) {
        self.sessions
            .write()
            .await
            .insert(client.id().to_string(), client);
    }

    pub(crate) async fn remove_session(&self, session: &str) -> Option<Arc<Client>> {
        self.sessions.write().await.remove(session)
    }

    /// Adds a subscription. Returns false when the session already holds one
    /// for this channel.
    pub(crate) async fn subscribe(
        &self,
        channel: &str,
        session: &str,
        options: SubscribeOptions,
    ) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let members = subscriptions.entry(channel.to_string()).or_default();
        if members.contains_key(session) {
            return false;
        }
        members.insert(session.to_string(), options);
        true
    }

    pub(crate) async fn unsubscribe(
        &self,
        channel: &str,
        session: &str,
    ) -> Option<SubscribeOptions> {
        let mut subscriptions = self.subscriptions.write().await;
        let members = subscriptions.get_mut(channel)?;
        let options = members.remove(session);
        if members.is_empty() {
            subscriptions.remove(channel);
        }
        options
    }

    /// Drops every subscription held by a session, returning the channels
    /// left behind with the options they were subscribed under.
    pub(crate) async fn unsubscribe_all(&self, session: &str) -> Vec<(Channel, SubscribeOptions)> {
        let mut subscriptions = self.subscriptions.write().await;
        let mut left = Vec::new();
        subscriptions.retain(|channel, members| {
            if let Some(options) = members.remove(session) {
                left.push((channel.clone(), options));
            }
            !members.is_empty()
        });
        left
    }

    pub(crate) async fn is_subscribed(&self, channel: &str, session: &str) -> bool {
        self.subscriptions
            .read()
            .await
            .get(channel)
            .is_some_and(|members| members.contains_key(session))
    }

    /// Snapshot of a channel's subscribers with their subscription options.
    pub(crate) async fn subscribers(
        &self,
        channel: &str,
    ) -> Vec<(Arc<Client>, SubscribeOptions)> {
        let members: Vec<(SessionId, SubscribeOptions)> = match self
            .subscriptions
            .read()
            .await
            .get(channel)
        {
            Some(members) => members
                .iter()
                .map(|(id, options)| (id.clone(), options.clone()))
                .collect(),
            None => return Vec::new(),
        };
        let sessions = self.sessions.read().await;
        members
            .into_iter()
            .filter_map(|(id, options)| sessions.get(&id).map(|c| (c.clone(), options)))
            .collect()
    }

    /// Appends a publication to channel history and stamps its offset.
    pub(crate) async fn append_history(
        &self,
        channel: &str,
        publication: &mut Publication,
        options: HistoryOptions,
    ) -> u64 {
        let now = Instant::now();
        let mut history = self.history.write().await;
        let entry = history.entry(channel.to_string()).or_default();
        entry.drop_expired(now);
        entry.last_offset += 1;
        let offset = entry.last_offset;
        publication.offset = Some(offset);
        entry.entries.push_back(HistoryEntry {
            publication: publication.clone(),
            expires_at: now + options.ttl,
        });
        while entry.entries.len() > options.size {
            entry.entries.pop_front();
        }
        entry.last_publish = Some(now);
        offset
    }

    /// Retained publications newer than `offset`, plus whether the window
    /// still covered everything after it and the channel's latest offset.
    pub(crate) async fn history_since(
        &self,
        channel: &str,
        offset: u64,
    ) -> (Vec<Publication>, bool, u64) {
        let now = Instant::now();
        let mut history = self.history.write().await;
        let Some(entry) = history.get_mut(channel) else {
            return (Vec::new(), true, 0);
        };
        entry.drop_expired(now);
        let latest = entry.last_offset;
        let oldest_retained = entry
            .entries
            .front()
            .and_then(|e| e.publication.offset);
        let recovered = match oldest_retained {
            Some(oldest) => offset + 1 >= oldest,
            None => offset >= latest,
        };
        let publications = entry
            .entries
            .iter()
            .filter(|e| e.publication.offset.is_some_and(|o| o > offset))
            .map(|e| e.publication.clone())
            .collect();
        (publications, recovered, latest)
    }

    pub(crate) async fn latest_offset(&self, channel: &str) -> u64 {
        self.history
            .read()
            .await
            .get(channel)
            .map(|entry| entry.last_offset)
            .unwrap_or(0)
    }

    pub(crate) async fn join_presence(&self, channel: &str, session: &str, info: ClientInfo) {
        self.presence
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(session.to_string(), info);
    }

    pub(crate) async fn leave_presence(&self, channel: &str, session: &str) {
        let mut presence = self.presence.write().await;
        if let Some(members) = presence.get_mut(channel) {
            members.remove(session);
            if members.is_empty() {
                presence.remove(channel);
            }
        }
    }

    pub(crate) async fn presence(&self, channel: &str) -> HashMap<String, ClientInfo> {
        self.presence
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops expired history entries and forgets channels whose metadata
    /// outlived `meta_ttl` without a new publication.
    pub(crate) async fn sweep_history(&self, meta_ttl: std::time::Duration) {
        let now = Instant::now();
        let mut history = self.history.write().await;
        history.retain(|_, entry| {
            entry.drop_expired(now);
            match entry.last_publish {
                Some(last) => now.duration_since(last) < meta_ttl,
                None => false,
            }
        });
    }
}
