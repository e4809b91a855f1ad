//! Background deduplication fed by committed attribute indices

use super::{Deduplicator, KeyspaceIndexPair, MergeReport};
use crate::config::DedupConfig;
use crate::session::SessionFactory;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Command {
    Merge(KeyspaceIndexPair),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable sender of merge requests
#[derive(Debug, Clone)]
pub struct DedupHandle {
    sender: mpsc::UnboundedSender<Command>,
}

impl DedupHandle {
    /// Queue an index for merging. Dropped with a warning once the daemon
    /// has stopped.
    pub fn submit(&self, pair: KeyspaceIndexPair) {
        if self.sender.send(Command::Merge(pair)).is_err() {
            warn!("dedup.daemon.stopped");
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merge(pair) => write!(f, "Merge({})", pair),
            Self::Flush(_) => f.write_str("Flush"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A tokio task merging queued indices in batches on the blocking pool
pub struct DeduplicatorDaemon {
    handle: DedupHandle,
    task: JoinHandle<Vec<MergeReport>>,
}

impl DeduplicatorDaemon {
    /// Start the daemon and attach it to the factory, so every later commit
    /// queues its new attribute indices. Must be called within a tokio runtime.
    pub fn spawn(factory: Arc<SessionFactory>, config: DedupConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = DedupHandle { sender };
        if config.enabled {
            factory.attach_deduplicator(handle.clone());
        }
        let task = tokio::spawn(run(factory, receiver, config.batch_size.max(1)));
        info!(enabled = config.enabled, batch_size = config.batch_size, "dedup.daemon.started");
        Self { handle, task }
    }

    pub fn handle(&self) -> DedupHandle {
        self.handle.clone()
    }

    /// Wait until everything queued so far has been merged
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.handle.sender.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Merge what is still queued, then stop. Returns every merge the
    /// daemon performed.
    pub async fn shutdown(self) -> Vec<MergeReport> {
        let _ = self.handle.sender.send(Command::Shutdown);
        match self.task.await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(error = %e, "dedup.daemon.join_failed");
                Vec::new()
            }
        }
    }
}

async fn run(factory: Arc<SessionFactory>, mut receiver: mpsc::UnboundedReceiver<Command>, batch_size: usize) -> Vec<MergeReport> {
    let mut reports = Vec::new();
    let mut pending: BTreeSet<KeyspaceIndexPair> = BTreeSet::new();
    let mut stopping = false;

    while !stopping {
        let Some(first) = receiver.recv().await else {
            break;
        };
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(command) = next.take() {
            match command {
                Command::Merge(pair) => {
                    pending.insert(pair);
                }
                Command::Flush(done) => waiters.push(done),
                Command::Shutdown => stopping = true,
            }
            next = receiver.try_recv().ok();
        }

        while !pending.is_empty() {
            let batch: Vec<KeyspaceIndexPair> = pending.iter().take(batch_size).cloned().collect();
            for pair in &batch {
                pending.remove(pair);
            }
            reports.extend(merge_batch(factory.clone(), batch).await);
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
    info!(merges = reports.len(), "dedup.daemon.stopped");
    reports
}

async fn merge_batch(factory: Arc<SessionFactory>, batch: Vec<KeyspaceIndexPair>) -> Vec<MergeReport> {
    debug!(size = batch.len(), "dedup.batch.started");
    let result = tokio::task::spawn_blocking(move || {
        let mut reports = Vec::new();
        for pair in batch {
            match Deduplicator::deduplicate(&factory, &pair) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(%pair, error = %e, "dedup.merge.failed"),
            }
        }
        reports
    })
    .await;
    match result {
        Ok(reports) => reports,
        Err(e) => {
            warn!(error = %e, "dedup.batch.panicked");
            Vec::new()
        }
    }
}
