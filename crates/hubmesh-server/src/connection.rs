//! Client connection state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use hubmesh_core::ids::ConnectionId;

/// A client connected to this node.
pub struct ClientConnection {
    pub id: ConnectionId,
    /// Authenticated user, if any. Several connections may share one user.
    user_id: Option<String>,
    /// Groups this connection has joined.
    groups: Mutex<Vec<String>>,
    /// Outbound channel to the client's write task.
    tx: mpsc::Sender<Arc<String>>,
    pub connected_at: Instant,
    /// Count of frames dropped due to a full channel.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, user_id: Option<String>, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            user_id,
            groups: Mutex::new(Vec::new()),
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Send a serialized frame to the client.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Whether the client's write task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.lock().clone()
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.lock().iter().any(|g| g == group)
    }

    /// Returns `false` if already a member.
    pub(crate) fn join(&self, group: &str) -> bool {
        let mut groups = self.groups.lock();
        if groups.iter().any(|g| g == group) {
            return false;
        }
        groups.push(group.to_string());
        true
    }

    /// Returns `false` if not a member.
    pub(crate) fn leave(&self, group: &str) -> bool {
        let mut groups = self.groups.lock();
        let before = groups.len();
        groups.retain(|g| g != group);
        groups.len() != before
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
