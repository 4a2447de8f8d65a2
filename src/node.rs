//! The node: entry point tying config, state, and the event handler together.

use crate::config::NodeConfig;
use crate::errors::{NodeError, DISCONNECT_SHUTDOWN};
use crate::events::EventHandler;
use crate::models::{ClientInfo, JoinPush, LeavePush, Publication, PublishResult, Push, Reply};
use crate::state::EngineState;
use serde_json::value::RawValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// History retention requested for one publication.
#[derive(Debug, Clone, Copy)]
pub struct HistoryOptions {
    /// Maximum number of retained publications per channel.
    pub size: usize,
    /// How long each retained publication stays replayable.
    pub ttl: Duration,
}

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Retain the publication in channel history for recovery.
    pub history: Option<HistoryOptions>,
    /// Attribution delivered to subscribers along with the data.
    pub client_info: Option<ClientInfo>,
}

struct NodeInner {
    config: NodeConfig,
    state: Arc<EngineState>,
    handler: StdRwLock<Option<Arc<dyn EventHandler>>>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to the messaging node. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.config.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Node, NodeError> {
        if config.name.is_empty() {
            return Err(NodeError::Config("node name must not be empty".into()));
        }
        if config.history_meta_ttl.is_zero() {
            return Err(NodeError::Config(
                "history_meta_ttl must be positive".into(),
            ));
        }
        Ok(Node {
            inner: Arc::new(NodeInner {
                config,
                state: Arc::new(EngineState::new()),
                handler: StdRwLock::new(None),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Registers the application event handler. Must happen before `run`.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.inner.handler.write().expect("handler lock") = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.inner.handler.read().expect("handler lock").clone()
    }

    pub(crate) fn state(&self) -> Arc<EngineState> {
        self.inner.state.clone()
    }

    pub(crate) fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Marks the node serving and starts the history sweeper.
    pub async fn run(&self) -> Result<(), NodeError> {
        if self.handler().is_none() {
            return Err(NodeError::NoHandler);
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NodeError::AlreadyRunning);
        }
        let state = self.state();
        let meta_ttl = self.inner.config.history_meta_ttl;
        let stop = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = sweep.tick() => state.sweep_history(meta_ttl).await,
                }
            }
        });
        info!(
            "node {} (version {}) is running",
            self.inner.config.name, self.inner.config.version
        );
        Ok(())
    }

    /// Publishes data into a channel, retaining it in history when asked,
    /// and fans it out to every current subscriber.
    pub async fn publish(
        &self,
        channel: &str,
        data: Box<RawValue>,
        options: PublishOptions,
    ) -> Result<PublishResult, NodeError> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        let mut publication = Publication {
            data,
            info: options.client_info,
            offset: None,
        };
        let offset = match options.history {
            Some(history) => Some(
                self.inner
                    .state
                    .append_history(channel, &mut publication, history)
                    .await,
            ),
            None => None,
        };
        let frame = Reply::push(Push {
            channel: Some(channel.to_string()),
            publication: Some(publication),
            ..Default::default()
        });
        for (subscriber, _) in self.inner.state.subscribers(channel).await {
            if let Err(err) = subscriber.write_frame(&frame).await {
                debug!(
                    "publication to [user {}] on {} not delivered: {}",
                    subscriber.user_id(),
                    channel,
                    err
                );
            }
        }
        Ok(PublishResult { offset })
    }

    pub(crate) async fn broadcast_join(&self, channel: &str, info: ClientInfo) {
        let frame = Reply::push(Push {
            channel: Some(channel.to_string()),
            join: Some(JoinPush { info }),
            ..Default::default()
        });
        self.broadcast_membership(channel, &frame).await;
    }

    pub(crate) async fn broadcast_leave(&self, channel: &str, info: ClientInfo) {
        let frame = Reply::push(Push {
            channel: Some(channel.to_string()),
            leave: Some(LeavePush { info }),
            ..Default::default()
        });
        self.broadcast_membership(channel, &frame).await;
    }

    async fn broadcast_membership(&self, channel: &str, frame: &Reply) {
        for (subscriber, options) in self.inner.state.subscribers(channel).await {
            if !options.push_join_leave {
                continue;
            }
            if let Err(err) = subscriber.write_frame(frame).await {
                debug!(
                    "membership push to [user {}] on {} not delivered: {}",
                    subscriber.user_id(),
                    channel,
                    err
                );
            }
        }
    }

    /// Stops the node: refuses new publishes, disconnects every session,
    /// and cancels node-wide background tasks.
    pub async fn shutdown(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("node {} shutting down", self.inner.config.name);
        let sessions: Vec<_> = self
            .inner
            .state
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for session in sessions {
            session.disconnect(DISCONNECT_SHUTDOWN).await;
        }
        self.inner.shutdown.cancel();
    }
}
