//! Publishers hosted by this node, keyed by stream id (`mid`).
//!
//! Removing an entry closes its [`Pub`]. Removals the signaling side did not
//! ask for (dead publishers, shutdown) also queue a [`RemovedPub`] on the
//! cleanup channel, which the stream cleanup task turns into a broadcast to
//! the signaling nodes. Entries whose Pub has died are swept by
//! [`PubRegistry::reap_once`]; a Pub that only lost its connection for a
//! moment is left to recover.

use super::publisher::Pub;
use crate::observability::metrics;
use common::protocol::RemovedPub;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Capacity of the cleanup notification channel.
pub const CLEANUP_BUFFER: usize = 256;

/// How long a removal waits for room in a full cleanup channel.
const CLEANUP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a publisher left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// The connection failed or closed, or a track ended.
    Dead,
    /// The client asked for it.
    Unpublish,
    /// The node is shutting down.
    Shutdown,
}

impl RemoveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoveReason::Dead => "dead",
            RemoveReason::Unpublish => "unpublish",
            RemoveReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PubEntry {
    pub rid: String,
    pub uid: String,
    pub mid: String,
    pub publisher: Arc<Pub>,
}

impl PubEntry {
    fn removed(&self) -> RemovedPub {
        RemovedPub {
            rid: self.rid.clone(),
            uid: self.uid.clone(),
            mid: self.mid.clone(),
        }
    }
}

pub struct PubRegistry {
    entries: Mutex<HashMap<String, PubEntry>>,
    count: AtomicUsize,
    cleanup_tx: mpsc::Sender<RemovedPub>,
}

impl PubRegistry {
    /// Create an empty registry and the receiving end of its cleanup channel.
    pub fn new() -> (Self, mpsc::Receiver<RemovedPub>) {
        Self::with_cleanup_capacity(CLEANUP_BUFFER)
    }

    pub fn with_cleanup_capacity(capacity: usize) -> (Self, mpsc::Receiver<RemovedPub>) {
        let (cleanup_tx, cleanup_rx) = mpsc::channel(capacity);
        (
            Self {
                entries: Mutex::new(HashMap::new()),
                count: AtomicUsize::new(0),
                cleanup_tx,
            },
            cleanup_rx,
        )
    }

    /// Number of hosted publishers. Used as the node's reported load.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn insert(&self, entry: PubEntry) {
        let mut entries = self.entries.lock().await;
        let mid = entry.mid.clone();
        if let Some(previous) = entries.insert(mid.clone(), entry) {
            // Stream ids are generated per publish, so this only happens on misuse
            warn!(target: "sfu.rtc.registry", mid = %mid, "Replacing existing publisher");
            previous.publisher.close().await;
        } else {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub async fn get(&self, mid: &str) -> Option<PubEntry> {
        self.entries.lock().await.get(mid).cloned()
    }

    /// Remove, close and announce one publisher. Returns `None` when `mid`
    /// is unknown.
    pub async fn remove(&self, mid: &str, reason: RemoveReason) -> Option<RemovedPub> {
        let entry = self.entries.lock().await.remove(mid)?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(self.retire(entry, reason).await)
    }

    /// Close and remove every publisher that is [dead](Pub::is_dead).
    /// Soft-disconnected publishers stay.
    ///
    /// Returns the number removed.
    pub async fn reap_once(&self) -> usize {
        let dead: Vec<PubEntry> = {
            let mut entries = self.entries.lock().await;
            let mids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.publisher.is_dead())
                .map(|(mid, _)| mid.clone())
                .collect();
            mids.iter().filter_map(|mid| entries.remove(mid)).collect()
        };

        let removed = dead.len();
        self.count.fetch_sub(removed, Ordering::AcqRel);
        for entry in dead {
            self.retire(entry, RemoveReason::Dead).await;
        }
        if removed > 0 {
            info!(target: "sfu.rtc.registry", removed, remaining = self.len(), "Reaped dead publishers");
        }
        removed
    }

    /// Close every publisher. Used on shutdown.
    pub async fn close_all(&self) {
        let all: Vec<PubEntry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        self.count.fetch_sub(all.len(), Ordering::AcqRel);
        for entry in all {
            self.retire(entry, RemoveReason::Shutdown).await;
        }
    }

    async fn retire(&self, entry: PubEntry, reason: RemoveReason) -> RemovedPub {
        entry.publisher.close().await;
        metrics::record_pub_closed(reason.as_str());
        let removed = entry.removed();
        debug!(
            target: "sfu.rtc.registry",
            rid = %removed.rid,
            uid = %removed.uid,
            mid = %removed.mid,
            reason = reason.as_str(),
            "Publisher removed"
        );
        if reason == RemoveReason::Unpublish {
            return removed;
        }
        if let Err(e) = self
            .cleanup_tx
            .send_timeout(removed.clone(), CLEANUP_SEND_TIMEOUT)
            .await
        {
            metrics::record_stream_remove_dropped();
            warn!(target: "sfu.rtc.registry", mid = %removed.mid, error = %e, "Removal not announced");
        }
        removed
    }
}
