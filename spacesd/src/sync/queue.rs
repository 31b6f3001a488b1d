use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    CopyToMirror,
    CopyToSource,
    RemoveMirror,
    MoveMirror,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CopyToMirror => "copy_to_mirror",
            ActionKind::CopyToSource => "copy_to_source",
            ActionKind::RemoveMirror => "remove_mirror",
            ActionKind::MoveMirror => "move_mirror",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "copy_to_mirror" => Some(ActionKind::CopyToMirror),
            "copy_to_source" => Some(ActionKind::CopyToSource),
            "remove_mirror" => Some(ActionKind::RemoveMirror),
            "move_mirror" => Some(ActionKind::MoveMirror),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CopyToMirror,
    CopyToSource,
    RemoveMirror,
    /// Rename an existing mirror copy from `from` to the item's path.
    MoveMirror { from: String },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::CopyToMirror => ActionKind::CopyToMirror,
            Action::CopyToSource => ActionKind::CopyToSource,
            Action::RemoveMirror => ActionKind::RemoveMirror,
            Action::MoveMirror { .. } => ActionKind::MoveMirror,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkReason {
    Watch,
    Select,
    Deselect,
    Rescan,
    Retry,
    Followup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: String,
    pub reason: WorkReason,
    pub intent: Action,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue is closed")]
    Closed,
}

#[derive(Debug)]
struct ActiveOp {
    path: String,
    kind: ActionKind,
    token: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveOp>>>;
/// Paths with an item sent but not yet handed to the worker.
type QueuedPaths = Arc<Mutex<HashSet<String>>>;

/// Enqueue side of the work queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkQueueHandle {
    mailbox: mpsc::UnboundedSender<WorkItem>,
    active: ActiveSlot,
    queued: QueuedPaths,
}

impl WorkQueueHandle {
    pub fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(op) = active.as_ref() {
                if op.path == item.path && op.kind != item.intent.kind() {
                    tracing::debug!(path = %item.path, active = ?op.kind, next = ?item.intent, "cancelling in-flight op");
                    op.token.cancel();
                }
            }
        }
        let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
        let path = item.path.clone();
        self.mailbox.send(item).map_err(|_| QueueError::Closed)?;
        queued.insert(path);
        Ok(())
    }

    /// True while an item for `path` waits for the worker.
    pub fn is_queued(&self, path: &str) -> bool {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    /// Aborts the in-flight op on `path`, if there is one.
    pub fn cancel_active(&self, path: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(op) if op.path == path => {
                op.token.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Worker side: owns the pending map; exactly one consumer.
#[derive(Debug)]
pub struct WorkQueue {
    mailbox: mpsc::UnboundedReceiver<WorkItem>,
    order: VecDeque<String>,
    pending: HashMap<String, WorkItem>,
    active: ActiveSlot,
    queued: QueuedPaths,
}

impl WorkQueue {
    pub fn new() -> (WorkQueueHandle, WorkQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let active: ActiveSlot = Arc::new(Mutex::new(None));
        let queued: QueuedPaths = Arc::new(Mutex::new(HashSet::new()));
        let handle = WorkQueueHandle {
            mailbox: tx,
            active: Arc::clone(&active),
            queued: Arc::clone(&queued),
        };
        let queue = WorkQueue {
            mailbox: rx,
            order: VecDeque::new(),
            pending: HashMap::new(),
            active,
            queued,
        };
        (handle, queue)
    }

    fn push(&mut self, item: WorkItem) {
        // Last decision wins; the path keeps its place in line.
        if !self.pending.contains_key(&item.path) {
            self.order.push_back(item.path.clone());
        }
        self.pending.insert(item.path.clone(), item);
    }

    fn drain_mailbox(&mut self) {
        while let Ok(item) = self.mailbox.try_recv() {
            self.push(item);
        }
    }

    fn pop(&mut self) -> Option<WorkItem> {
        while let Some(path) = self.order.pop_front() {
            if let Some(item) = self.pending.remove(&path) {
                return Some(item);
            }
        }
        None
    }

    pub fn try_next(&mut self) -> Option<WorkItem> {
        // Held across drain and pop so a concurrent enqueue is either merged
        // into the popped item or stays marked as queued.
        let queued = Arc::clone(&self.queued);
        let mut queued = queued.lock().unwrap_or_else(PoisonError::into_inner);
        self.drain_mailbox();
        let item = self.pop()?;
        queued.remove(&item.path);
        Some(item)
    }

    /// Waits for the next item; `None` once every handle is gone and the
    /// queue is empty.
    pub async fn next(&mut self) -> Option<WorkItem> {
        if let Some(item) = self.try_next() {
            return Some(item);
        }
        let item = self.mailbox.recv().await?;
        self.push(item);
        self.try_next()
    }

    pub fn pending_kind(&mut self, path: &str) -> Option<ActionKind> {
        self.drain_mailbox();
        self.pending.get(path).map(|item| item.intent.kind())
    }

    pub fn len(&mut self) -> usize {
        self.drain_mailbox();
        self.pending.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Registers the in-flight op so enqueuers can cancel it.
    pub fn begin(&self, path: &str, kind: ActionKind) -> CancellationToken {
        let token = CancellationToken::new();
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = Some(ActiveOp {
            path: path.to_string(),
            kind,
            token: token.clone(),
        });
        token
    }

    pub fn finish(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = None;
    }
}
