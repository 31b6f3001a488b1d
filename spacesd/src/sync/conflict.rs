#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub modified: i64,
    pub size: i64,
}

impl FileMetadata {
    pub fn is_same_as(&self, other: &Self) -> bool {
        self.modified == other.modified && self.size == other.size
    }
}

/// Both sides as they were right after the last successful copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBaseline {
    pub source: FileMetadata,
    pub mirror: FileMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    NoOp,
    /// Both copies match but nothing was recorded yet.
    AdoptBaseline,
    CopyToMirror,
    CopyToSource,
    Conflict,
}

pub fn resolve_conflict(
    base: Option<&SyncBaseline>,
    source: &FileMetadata,
    mirror: &FileMetadata,
) -> ConflictDecision {
    if let Some(base) = base {
        let source_changed = !source.is_same_as(&base.source);
        let mirror_changed = !mirror.is_same_as(&base.mirror);
        return match (source_changed, mirror_changed) {
            (false, false) => ConflictDecision::NoOp,
            (true, false) => ConflictDecision::CopyToMirror,
            (false, true) => ConflictDecision::CopyToSource,
            (true, true) => ConflictDecision::Conflict,
        };
    }

    if source.is_same_as(mirror) {
        ConflictDecision::AdoptBaseline
    } else if source.modified >= mirror.modified {
        ConflictDecision::CopyToMirror
    } else {
        ConflictDecision::CopyToSource
    }
}
