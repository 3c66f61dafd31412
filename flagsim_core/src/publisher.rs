//! Live status publisher.
//!
//! Fans session state out to subscribers without coupling the engine to any
//! transport: callers get a pair of receivers per subscription and the
//! server layer turns them into wire frames. Status updates go through a
//! `watch` channel, so the latest snapshot supersedes anything a slow
//! consumer has not read yet - there is no per-connection backlog. Log
//! lines go through a bounded `broadcast` channel; a consumer that falls
//! behind skips ahead instead of buffering without limit.

use crate::session::{LogEntry, SessionSnapshot};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::{broadcast, watch};

/// Bounded log fan-out capacity per session.
pub const DEFAULT_LOG_BUFFER: usize = 256;

struct SessionChannel {
    status_tx: watch::Sender<Option<SessionSnapshot>>,
    log_tx: broadcast::Sender<LogEntry>,
}

/// A live view onto one session, handed to a connection at handshake time.
///
/// Dropping the subscription deregisters it; nothing else is required on
/// disconnect.
pub struct SessionSubscription {
    /// Latest status snapshot; `None` until the first publish
    pub status: watch::Receiver<Option<SessionSnapshot>>,

    /// Log line stream; lagging consumers observe `RecvError::Lagged`
    pub logs: broadcast::Receiver<LogEntry>,
}

/// Publishes status and log deltas to every connection subscribed to a
/// session.
pub struct StatusPublisher {
    log_buffer: usize,
    channels: RwLock<HashMap<String, SessionChannel>>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::with_log_buffer(DEFAULT_LOG_BUFFER)
    }

    pub fn with_log_buffer(log_buffer: usize) -> Self {
        Self {
            log_buffer,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to a session, creating its channels if this is the first
    /// subscriber. A reconnecting client simply subscribes again with the
    /// same session id.
    pub fn subscribe(&self, session_id: &str) -> SessionSubscription {
        let mut channels = self.channels.write().unwrap();
        let channel = channels
            .entry(session_id.to_string())
            .or_insert_with(|| SessionChannel {
                status_tx: watch::channel(None).0,
                log_tx: broadcast::channel(self.log_buffer).0,
            });
        SessionSubscription {
            status: channel.status_tx.subscribe(),
            logs: channel.log_tx.subscribe(),
        }
    }

    /// Publishes a status snapshot. Cheap no-op when nobody ever
    /// subscribed to the session.
    pub fn publish_status(&self, session_id: &str, snapshot: SessionSnapshot) {
        if let Some(channel) = self.channels.read().unwrap().get(session_id) {
            channel.status_tx.send_replace(Some(snapshot));
        }
    }

    /// Publishes a log line. Send errors (no live receivers) are ignored.
    pub fn publish_log(&self, session_id: &str, entry: LogEntry) {
        if let Some(channel) = self.channels.read().unwrap().get(session_id) {
            let _ = channel.log_tx.send(entry);
        }
    }

    /// Number of live subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .read()
            .unwrap()
            .get(session_id)
            .map(|c| c.status_tx.receiver_count())
            .unwrap_or(0)
    }
}
