use std::collections::BTreeSet;
use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::index::{
    EntryInput, EntryRecord, IndexError, IndexStore, ItemType, StatusPolicy, SyncedState,
    derive_status, now_unix_ms,
};
use super::local_watcher::{RenamePair, WatchBatch};
use super::paths::{PathError, TreeRoots, ancestors, entry_path_for};
use super::queue::{Action, ActionKind, QueueError, WorkItem, WorkQueue, WorkQueueHandle, WorkReason};
use super::reconciler::{PathSnapshot, Plan, ReconcileError, Reconciler, StoreEffect, decide};
use super::transfer::{
    RemoveOutcome, SafeCopy, TransferConfig, TransferError, stat, walk_tree,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("entry not found: {0}")]
    MissingEntry(String),
    #[error("desired state changed before commit")]
    Superseded,
}

impl EngineError {
    /// Store contention; retrying the same call is safe.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Index(err) | EngineError::Reconcile(ReconcileError::Index(err)) => {
                err.is_transient()
            }
            _ => false,
        }
    }

    /// The world moved under the operation; decide again instead of failing.
    pub fn needs_reevaluation(&self) -> bool {
        matches!(
            self,
            EngineError::Superseded
                | EngineError::Transfer(TransferError::Cancelled | TransferError::SourceModified)
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub transfer: TransferConfig,
    pub retry: RetryPolicy,
    pub stuck_after: Duration,
}

impl EngineSettings {
    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy {
            stuck_after: self.stuck_after,
            max_attempts: self.retry.max_attempts(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            retry: RetryPolicy::default(),
            stuck_after: Duration::from_secs(900),
        }
    }
}

/// Request to reconcile one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub path: String,
    pub reason: WorkReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryView {
    pub inode: Option<u64>,
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub selected: bool,
    pub status: String,
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub parent_inode: Option<u64>,
}

/// Receiving ends handed to whoever runs the engine's tasks.
pub struct EngineChannels {
    pub worker: Worker,
    pub triggers: mpsc::UnboundedReceiver<Trigger>,
}

#[derive(Debug, Clone)]
pub struct SyncEngine {
    index: IndexStore,
    reconciler: Reconciler,
    roots: TreeRoots,
    copier: SafeCopy,
    queue: WorkQueueHandle,
    triggers: mpsc::UnboundedSender<Trigger>,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        index: IndexStore,
        roots: TreeRoots,
        settings: EngineSettings,
    ) -> (Self, EngineChannels) {
        let (queue_handle, queue) = WorkQueue::new();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let engine = Self {
            reconciler: Reconciler::new(
                index.clone(),
                roots.clone(),
                settings.retry.max_attempts(),
            ),
            index,
            roots,
            copier: SafeCopy::new(settings.transfer),
            queue: queue_handle,
            triggers: trigger_tx,
            settings,
        };
        let worker = Worker {
            engine: engine.clone(),
            queue,
        };
        (
            engine,
            EngineChannels {
                worker,
                triggers: trigger_rx,
            },
        )
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn trigger(&self, path: impl Into<String>, reason: WorkReason) {
        let trigger = Trigger {
            path: path.into(),
            reason,
        };
        if self.triggers.send(trigger).is_err() {
            tracing::debug!("reconciler is gone; trigger dropped");
        }
    }

    fn trigger_later(&self, path: &str, reason: WorkReason, delay: Duration) {
        let triggers = self.triggers.clone();
        let trigger = Trigger {
            path: path.to_string(),
            reason,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = triggers.send(trigger);
        });
    }

    /// Marks entries (and their current descendants) selected. Returns how
    /// many of the given identities were known.
    pub async fn select(&self, inodes: &[u64]) -> Result<usize, EngineError> {
        let mut known = 0;
        for &ino in inodes {
            let paths = self.index.set_selected(ino as i64, true).await?;
            let Some(root) = paths.first() else {
                tracing::debug!(ino, "select: unknown identity skipped");
                continue;
            };
            known += 1;
            tracing::info!(ino, path = %root, entries = paths.len(), "select");
            for ancestor in ancestors(root).into_iter().rev() {
                self.trigger(ancestor, WorkReason::Select);
            }
            for path in &paths {
                self.trigger(path.as_str(), WorkReason::Select);
            }
        }
        Ok(known)
    }

    pub async fn deselect(&self, inodes: &[u64]) -> Result<usize, EngineError> {
        let mut known = 0;
        for &ino in inodes {
            let paths = self.index.set_selected(ino as i64, false).await?;
            let Some(root) = paths.first().cloned() else {
                tracing::debug!(ino, "deselect: unknown identity skipped");
                continue;
            };
            known += 1;
            tracing::info!(ino, path = %root, entries = paths.len(), "deselect");
            // Children first so directories are empty by the time they go.
            for path in paths.iter().rev() {
                self.trigger(path.as_str(), WorkReason::Deselect);
            }
            for ancestor in ancestors(&root) {
                self.trigger(ancestor, WorkReason::Deselect);
            }
        }
        Ok(known)
    }

    /// `None` lists every entry; `Some(parent)` lists its direct children.
    pub async fn list_entries(&self, parent: Option<u64>) -> Result<Vec<EntryView>, EngineError> {
        let records = match parent {
            None => self.index.list_all().await?,
            Some(ino) => {
                let parent = self
                    .index
                    .get_entry_by_ino(ino as i64)
                    .await?
                    .ok_or_else(|| EngineError::MissingEntry(format!("inode {ino}")))?;
                self.index.list_children(&parent.path).await?
            }
        };
        let now = now_unix_ms();
        Ok(records
            .iter()
            .map(|record| self.view_of(record, now))
            .collect())
    }

    pub async fn entry_status(&self, ino: u64) -> Result<EntryView, EngineError> {
        let record = self
            .index
            .get_entry_by_ino(ino as i64)
            .await?
            .ok_or_else(|| EngineError::MissingEntry(format!("inode {ino}")))?;
        Ok(self.view_of(&record, now_unix_ms()))
    }

    fn view_of(&self, record: &EntryRecord, now_ms: i64) -> EntryView {
        let status = derive_status(record, now_ms, &self.settings.status_policy());
        EntryView {
            inode: record.ino.map(|ino| ino as u64),
            path: record.path.clone(),
            name: record.name.clone(),
            item_type: record.item_type.as_str().to_string(),
            selected: record.selected,
            status: status.as_str().to_string(),
            size: record.size.or(record.mirror_size),
            mtime: record
                .source_mtime
                .or(record.mirror_mtime)
                .map(|ns| ns / 1_000_000),
            parent_inode: record.parent_ino.map(|ino| ino as u64),
        }
    }

    /// Re-keys records for source renames reported as linked pairs, then
    /// triggers every path in the batch.
    pub async fn apply_watch_batch(&self, batch: WatchBatch) -> Result<(), EngineError> {
        for rename in &batch.renames {
            self.apply_rename(rename).await?;
        }
        for path in batch.paths {
            self.trigger(path, WorkReason::Watch);
        }
        Ok(())
    }

    async fn apply_rename(&self, rename: &RenamePair) -> Result<(), EngineError> {
        let mirror_from = stat(&self.roots.mirror_path(&rename.from)?).await?;
        let mirror_to = stat(&self.roots.mirror_path(&rename.to)?).await?;
        let mirror_follows = mirror_from.is_some() && mirror_to.is_none();
        if self
            .index
            .rename_entry(&rename.from, &rename.to, mirror_follows)
            .await?
        {
            tracing::info!(from = %rename.from, to = %rename.to, mirror_follows, "entry renamed");
        }
        Ok(())
    }

    /// Runs the passes for one path and queues the resulting action.
    pub async fn reconcile_path(
        &self,
        path: &str,
        reason: WorkReason,
    ) -> Result<Option<Action>, EngineError> {
        let mut snapshot = self.reconciler.snapshot(path, reason).await?;
        if self.reconciler.adopt_moved_identity(&snapshot).await? {
            snapshot = self.reconciler.snapshot(path, reason).await?;
        }
        let plan = decide(&snapshot);
        self.apply_plan(&snapshot, &plan).await?;

        let Some(action) = plan.action else {
            // The user changed their mind about a path that is being worked on.
            if matches!(reason, WorkReason::Select | WorkReason::Deselect)
                && self.queue.cancel_active(path)
            {
                tracing::debug!(path, "cancelled in-flight op");
            }
            let stale = snapshot.record.as_ref().is_some_and(|record| {
                record.pending_action.is_some() && record.active_since.is_none()
            });
            if stale && !self.queue.is_queued(path) {
                self.index.clear_queued_pending(path).await?;
                tracing::debug!(path, "cleared stale pending action");
                // The passes held back while the action was recorded.
                self.trigger(path, WorkReason::Followup);
            }
            return Ok(None);
        };
        self.index.set_pending(path, Some(action.kind())).await?;
        self.queue.enqueue(WorkItem {
            path: path.to_string(),
            reason,
            intent: action.clone(),
        })?;
        tracing::debug!(path, action = ?action, reason = ?reason, "queued");
        Ok(Some(action))
    }

    async fn apply_plan(&self, snapshot: &PathSnapshot, plan: &Plan) -> Result<(), EngineError> {
        let path = snapshot.path.as_str();
        for effect in &plan.effects {
            match effect {
                StoreEffect::Register {
                    item_type,
                    selected,
                    observed,
                } => {
                    self.index
                        .insert_entry(&EntryInput {
                            path: path.to_string(),
                            item_type: *item_type,
                            selected: *selected,
                            observed: *observed,
                        })
                        .await?;
                    tracing::debug!(path, selected, "registered");
                }
                StoreEffect::Refresh {
                    item_type,
                    observed,
                } => {
                    self.index.update_observed(path, *item_type, observed).await?;
                }
                StoreEffect::AdoptBaseline {
                    item_type,
                    observed,
                } => {
                    self.index
                        .record_synced(&SyncedState {
                            path: path.to_string(),
                            item_type: *item_type,
                            ino: observed.ino,
                            size: observed.size,
                            source_mtime: observed.source_mtime,
                            mirror_mtime: observed.mirror_mtime,
                            selected_if_new: true,
                        })
                        .await?;
                }
                StoreEffect::Forget => {
                    self.index.delete_entry(path).await?;
                    tracing::debug!(path, "forgotten");
                }
                StoreEffect::MarkMirrorOrigin => {
                    self.index.mark_mirror_origin(path, now_unix_ms()).await?;
                }
                StoreEffect::ClearMirrorOrigin => {
                    self.index.clear_mirror_origin(path).await?;
                }
            }
        }

        if plan.retrigger {
            self.trigger(path, WorkReason::Followup);
        }
        if plan.retrigger_descendants {
            for descendant in self.index.list_descendant_paths(path).await? {
                self.trigger(descendant, WorkReason::Followup);
            }
        }
        Ok(())
    }

    /// Triggers every path found on disk in either tree or in the store.
    pub async fn full_scan(&self, reason: WorkReason) -> Result<usize, EngineError> {
        let roots = self.roots.clone();
        let on_disk = tokio::task::spawn_blocking(move || -> io::Result<BTreeSet<String>> {
            let mut paths = BTreeSet::new();
            for root in [&roots.source, &roots.mirror] {
                for path in walk_tree(root)? {
                    if let Some(entry) = entry_path_for(root, &path) {
                        paths.insert(entry);
                    }
                }
            }
            Ok(paths)
        })
        .await
        .map_err(io::Error::other)??;

        let mut paths = on_disk;
        paths.extend(self.index.list_all_paths().await?);
        paths.extend(self.index.list_mirror_origins().await?);
        let count = paths.len();
        for path in paths {
            self.trigger(path, reason);
        }
        Ok(count)
    }

    /// Consumes triggers and watch batches until `shutdown` fires.
    pub async fn run_reconciler(
        &self,
        mut triggers: mpsc::UnboundedReceiver<Trigger>,
        mut batches: Option<mpsc::UnboundedReceiver<WatchBatch>>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = next_batch(&mut batches) => match batch {
                    Some(batch) => {
                        if let Err(err) = self.apply_watch_batch(batch).await {
                            tracing::warn!(error = %err, "watch batch failed");
                        }
                    }
                    None => {
                        tracing::warn!("watcher stopped; relying on periodic rescans");
                        batches = None;
                    }
                },
                trigger = triggers.recv() => {
                    let Some(trigger) = trigger else { break };
                    self.handle_trigger(trigger).await;
                }
            }
        }
    }

    async fn handle_trigger(&self, trigger: Trigger) {
        match self.reconcile_path(&trigger.path, trigger.reason).await {
            Ok(_) => {}
            Err(err) if err.is_transient() => {
                tracing::debug!(path = %trigger.path, error = %err, "store busy; reconcile retried");
                let delay = self.settings.retry.next_delay(1).unwrap_or_default();
                self.trigger_later(&trigger.path, trigger.reason, delay);
            }
            Err(err) => {
                tracing::warn!(path = %trigger.path, error = %err, "reconcile failed");
            }
        }
    }

    /// Periodic full rescan until `shutdown` fires.
    pub async fn run_rescans(&self, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.full_scan(WorkReason::Rescan).await {
                        Ok(count) => tracing::debug!(paths = count, "rescan"),
                        Err(err) => tracing::warn!(error = %err, "rescan failed"),
                    }
                }
            }
        }
    }
}

async fn next_batch(batches: &mut Option<mpsc::UnboundedReceiver<WatchBatch>>) -> Option<WatchBatch> {
    match batches.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

include!("engine_worker.rs");

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
