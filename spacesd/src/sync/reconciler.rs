use thiserror::Error;

use super::conflict::{ConflictDecision, FileMetadata, resolve_conflict};
use super::index::{EntryRecord, IndexError, IndexStore, ItemType, ObservedState};
use super::paths::{PathError, TreeRoots};
use super::queue::{Action, WorkReason};
use super::transfer::{FileStamp, stat};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything one decision looks at, loaded fresh for every cycle.
#[derive(Debug, Clone)]
pub struct PathSnapshot {
    pub path: String,
    pub reason: WorkReason,
    pub record: Option<EntryRecord>,
    pub source: Option<FileStamp>,
    pub mirror: Option<FileStamp>,
    pub mirror_origin: bool,
    pub has_selected_descendant: bool,
    pub move_pending: bool,
    /// Failed too often; waits for a select or deselect to reset it.
    pub retry_exhausted: bool,
    /// A symlink sits at this path in one of the trees.
    pub symlink: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEffect {
    Register {
        item_type: ItemType,
        selected: bool,
        observed: ObservedState,
    },
    Refresh {
        item_type: ItemType,
        observed: ObservedState,
    },
    /// Both copies already match; record them as synced without copying.
    AdoptBaseline {
        item_type: ItemType,
        observed: ObservedState,
    },
    Forget,
    MarkMirrorOrigin,
    ClearMirrorOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub effects: Vec<StoreEffect>,
    pub action: Option<Action>,
    /// Look at this path again on the next cycle.
    pub retrigger: bool,
    /// Look at every recorded descendant again (forgotten directory).
    pub retrigger_descendants: bool,
}

impl Plan {
    fn with_effect(mut self, effect: StoreEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

pub fn observe(source: Option<&FileStamp>, mirror: Option<&FileStamp>) -> ObservedState {
    let file_size = |stamp: &FileStamp| (!stamp.is_dir).then(|| stamp.size as i64);
    let file_mtime = |stamp: &FileStamp| (!stamp.is_dir).then_some(stamp.modified_ns);
    ObservedState {
        ino: source.map(|stamp| stamp.ino as i64),
        source_present: source.is_some(),
        mirror_present: mirror.is_some(),
        size: source.and_then(file_size),
        mirror_size: mirror.and_then(file_size),
        source_mtime: source.and_then(file_mtime),
        mirror_mtime: mirror.and_then(file_mtime),
    }
}

fn stored_observed(record: &EntryRecord, fresh: &ObservedState) -> ObservedState {
    ObservedState {
        // Identity only comes from the source tree.
        ino: if fresh.ino.is_some() { record.ino } else { None },
        source_present: record.source_present,
        mirror_present: record.mirror_present,
        size: record.size,
        mirror_size: record.mirror_size,
        source_mtime: record.source_mtime,
        mirror_mtime: record.mirror_mtime,
    }
}

fn item_type_of(snapshot: &PathSnapshot) -> ItemType {
    let stamp = snapshot.source.as_ref().or(snapshot.mirror.as_ref());
    match (stamp, &snapshot.record) {
        (Some(stamp), _) if stamp.is_dir => ItemType::Dir,
        (Some(_), _) => ItemType::File,
        (None, Some(record)) => record.item_type,
        (None, None) => ItemType::File,
    }
}

fn meta(stamp: &FileStamp) -> FileMetadata {
    FileMetadata {
        modified: stamp.modified_ns,
        size: stamp.size as i64,
    }
}

/// Runs the ordered passes over one path and returns at most one action.
pub fn decide(snapshot: &PathSnapshot) -> Plan {
    // Symlinks are never followed, copied, removed or registered.
    if snapshot.symlink {
        return Plan::default();
    }
    let mut plan = run_passes(snapshot);
    if snapshot.retry_exhausted {
        plan.action = None;
    }
    plan
}

fn run_passes(snapshot: &PathSnapshot) -> Plan {
    let observed = observe(snapshot.source.as_ref(), snapshot.mirror.as_ref());
    let item_type = item_type_of(snapshot);
    let mut plan = Plan::default();

    if let Some(record) = &snapshot.record {
        if stored_observed(record, &observed) != observed || record.item_type != item_type {
            plan = plan.with_effect(StoreEffect::Refresh {
                item_type,
                observed,
            });
        }
        if let Some(from) = &record.moved_from {
            plan.action = Some(Action::MoveMirror { from: from.clone() });
            return plan;
        }
    }
    if snapshot.move_pending {
        return plan;
    }

    match (&snapshot.source, &snapshot.mirror) {
        (None, None) => forget(snapshot, plan),
        (None, Some(_)) => recover(snapshot, plan),
        (Some(source), mirror) => {
            let selected = match &snapshot.record {
                Some(record) => record.selected,
                None => {
                    // P1: a copy already in the mirror means the user wants it.
                    let selected = mirror.is_some();
                    plan = plan.with_effect(StoreEffect::Register {
                        item_type,
                        selected,
                        observed,
                    });
                    selected
                }
            };
            if snapshot.mirror_origin {
                plan = plan.with_effect(StoreEffect::ClearMirrorOrigin);
            }
            enforce(snapshot, plan, item_type, selected, source, mirror.as_ref(), observed)
        }
    }
}

fn forget(snapshot: &PathSnapshot, mut plan: Plan) -> Plan {
    if snapshot.mirror_origin {
        plan = plan.with_effect(StoreEffect::ClearMirrorOrigin);
    }
    let Some(record) = &snapshot.record else {
        return plan;
    };
    if record.pending_action.is_some() {
        return plan;
    }
    plan.retrigger_descendants = record.item_type == ItemType::Dir;
    plan.effects.retain(|effect| !matches!(effect, StoreEffect::Refresh { .. }));
    plan.with_effect(StoreEffect::Forget)
}

fn recover(snapshot: &PathSnapshot, mut plan: Plan) -> Plan {
    if snapshot.record.is_some() || snapshot.mirror_origin {
        // P0: the mirror holds the only copy left.
        plan.action = Some(Action::CopyToSource);
        return plan;
    }
    // P4: remember the path, act on it next cycle.
    plan.retrigger = true;
    plan.with_effect(StoreEffect::MarkMirrorOrigin)
}

fn enforce(
    snapshot: &PathSnapshot,
    mut plan: Plan,
    item_type: ItemType,
    selected: bool,
    source: &FileStamp,
    mirror: Option<&FileStamp>,
    observed: ObservedState,
) -> Plan {
    if item_type == ItemType::Dir {
        let wanted = selected || snapshot.has_selected_descendant;
        plan.action = match (wanted, mirror.is_some()) {
            (true, false) => Some(Action::CopyToMirror),
            (false, true) => Some(Action::RemoveMirror),
            _ => None,
        };
        return plan;
    }

    let Some(mirror) = mirror else {
        if selected {
            plan.action = Some(Action::CopyToMirror);
        }
        return plan;
    };

    let baseline = snapshot.record.as_ref().and_then(EntryRecord::baseline);
    let decision = resolve_conflict(baseline.as_ref(), &meta(source), &meta(mirror));
    plan.action = match decision {
        ConflictDecision::NoOp => (!selected).then_some(Action::RemoveMirror),
        ConflictDecision::AdoptBaseline => {
            plan = plan.with_effect(StoreEffect::AdoptBaseline {
                item_type,
                observed,
            });
            (!selected).then_some(Action::RemoveMirror)
        }
        ConflictDecision::CopyToMirror if selected => Some(Action::CopyToMirror),
        ConflictDecision::CopyToMirror => Some(Action::RemoveMirror),
        ConflictDecision::CopyToSource => Some(Action::CopyToSource),
        ConflictDecision::Conflict if !selected => Some(Action::RemoveMirror),
        ConflictDecision::Conflict if snapshot.reason == WorkReason::Select => {
            Some(Action::CopyToMirror)
        }
        ConflictDecision::Conflict => None,
    };
    plan
}

/// Loads snapshots and resolves identities against the store.
#[derive(Debug, Clone)]
pub struct Reconciler {
    index: IndexStore,
    roots: TreeRoots,
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(index: IndexStore, roots: TreeRoots, max_attempts: u32) -> Self {
        Self {
            index,
            roots,
            max_attempts,
        }
    }

    pub async fn snapshot(
        &self,
        path: &str,
        reason: WorkReason,
    ) -> Result<PathSnapshot, ReconcileError> {
        let source = stat(&self.roots.source_path(path)?).await?;
        let mirror = stat(&self.roots.mirror_path(path)?).await?;
        let record = self.index.get_entry_by_path(path).await?;
        let mirror_origin = self.index.is_mirror_origin(path).await?;
        let has_selected_descendant = self.index.has_selected_descendant(path).await?;
        let move_pending = self.index.is_move_pending(path).await?;
        let retry_exhausted = record.as_ref().is_some_and(|record| {
            record.last_error.is_some() && record.attempts >= self.max_attempts
        });
        let symlink = [source, mirror]
            .iter()
            .flatten()
            .any(|stamp| stamp.is_symlink);
        Ok(PathSnapshot {
            path: path.to_string(),
            reason,
            record,
            source,
            mirror,
            mirror_origin,
            has_selected_descendant,
            move_pending,
            retry_exhausted,
            symlink,
        })
    }

    /// A source path with no record whose inode belongs to a record at a
    /// path that no longer exists was renamed behind our back. Adopts that
    /// record when nothing else depends on the old path. Returns true when
    /// the store changed and the snapshot must be reloaded.
    pub async fn adopt_moved_identity(
        &self,
        snapshot: &PathSnapshot,
    ) -> Result<bool, ReconcileError> {
        if snapshot.record.is_some() || snapshot.symlink {
            return Ok(false);
        }
        let Some(source) = snapshot.source else {
            return Ok(false);
        };
        let Some(previous) = self.index.get_entry_by_ino(source.ino as i64).await? else {
            return Ok(false);
        };
        if previous.path == snapshot.path {
            return Ok(false);
        }
        if stat(&self.roots.source_path(&previous.path)?).await?.is_some() {
            return Ok(false);
        }
        if stat(&self.roots.mirror_path(&previous.path)?).await?.is_some() {
            // The old mirror copy stays recoverable under its old path.
            self.index.release_identity(&previous.path).await?;
            tracing::info!(old = %previous.path, new = %snapshot.path, "identity released, old mirror copy kept");
            return Ok(true);
        }
        self.index
            .rename_entry(&previous.path, &snapshot.path, false)
            .await?;
        tracing::info!(old = %previous.path, new = %snapshot.path, "identity adopted after rename");
        Ok(true)
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
