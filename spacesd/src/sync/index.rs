use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use sqlx::{
    Row, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use thiserror::Error;

pub use spaces_integrations::EntryStatusLabel as EntryStatus;

use super::conflict::{ConflictDecision, FileMetadata, SyncBaseline, resolve_conflict};
use super::paths::{file_name, parent_path};
use super::queue::ActionKind;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid item type: {0}")]
    InvalidItemType(String),
    #[error("invalid action kind: {0}")]
    InvalidActionKind(String),
    #[error("entry not found after write: {0}")]
    MissingEntry(String),
}

impl IndexError {
    /// Lock contention on the database; the same call is safe to retry.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Sqlx(sqlx::Error::PoolTimedOut) => true,
            IndexError::Sqlx(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Dir,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Dir => "dir",
        }
    }

    fn parse(value: &str) -> Result<Self, IndexError> {
        match value {
            "file" => Ok(ItemType::File),
            "dir" => Ok(ItemType::Dir),
            other => Err(IndexError::InvalidItemType(other.to_string())),
        }
    }
}

fn parse_action_kind(value: &str) -> Result<ActionKind, IndexError> {
    ActionKind::parse(value).ok_or_else(|| IndexError::InvalidActionKind(value.to_string()))
}

/// What the last stat of both trees saw for one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedState {
    pub ino: Option<i64>,
    pub source_present: bool,
    pub mirror_present: bool,
    pub size: Option<i64>,
    pub mirror_size: Option<i64>,
    pub source_mtime: Option<i64>,
    pub mirror_mtime: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct EntryInput {
    pub path: String,
    pub item_type: ItemType,
    pub selected: bool,
    pub observed: ObservedState,
}

/// Both trees right after a committed copy; becomes the new baseline.
#[derive(Debug, Clone)]
pub struct SyncedState {
    pub path: String,
    pub item_type: ItemType,
    pub ino: Option<i64>,
    pub size: Option<i64>,
    pub source_mtime: Option<i64>,
    pub mirror_mtime: Option<i64>,
    pub selected_if_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub id: i64,
    pub ino: Option<i64>,
    pub path: String,
    pub parent_path: Option<String>,
    pub parent_ino: Option<i64>,
    pub name: String,
    pub item_type: ItemType,
    pub selected: bool,
    pub source_present: bool,
    pub mirror_present: bool,
    pub size: Option<i64>,
    pub mirror_size: Option<i64>,
    pub source_mtime: Option<i64>,
    pub mirror_mtime: Option<i64>,
    pub synced_mtime: Option<i64>,
    pub synced_mirror_mtime: Option<i64>,
    pub synced_size: Option<i64>,
    pub pending_action: Option<ActionKind>,
    pub active_since: Option<i64>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Old path of a mirror copy still waiting to follow a source rename.
    pub moved_from: Option<String>,
}

impl EntryRecord {
    pub fn baseline(&self) -> Option<SyncBaseline> {
        let size = self.synced_size?;
        Some(SyncBaseline {
            source: FileMetadata {
                modified: self.synced_mtime?,
                size,
            },
            mirror: FileMetadata {
                modified: self.synced_mirror_mtime?,
                size,
            },
        })
    }

    pub fn source_meta(&self) -> Option<FileMetadata> {
        if !self.source_present {
            return None;
        }
        Some(FileMetadata {
            modified: self.source_mtime?,
            size: self.size?,
        })
    }

    pub fn mirror_meta(&self) -> Option<FileMetadata> {
        if !self.mirror_present {
            return None;
        }
        Some(FileMetadata {
            modified: self.mirror_mtime?,
            size: self.mirror_size?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusPolicy {
    pub stuck_after: Duration,
    pub max_attempts: u32,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            stuck_after: Duration::from_secs(900),
            max_attempts: 5,
        }
    }
}

/// Derives the user-facing status from stored fields only.
pub fn derive_status(record: &EntryRecord, now_ms: i64, policy: &StatusPolicy) -> EntryStatus {
    if record.last_error.is_some() && record.attempts >= policy.max_attempts {
        return EntryStatus::Conflict;
    }
    let stuck_ms = i64::try_from(policy.stuck_after.as_millis()).unwrap_or(i64::MAX);
    if record
        .active_since
        .is_some_and(|since| now_ms.saturating_sub(since) > stuck_ms)
    {
        return EntryStatus::Conflict;
    }

    if record.moved_from.is_some() {
        return EntryStatus::Copying;
    }
    if let Some(kind) = record.pending_action {
        return match kind {
            ActionKind::CopyToMirror | ActionKind::MoveMirror => EntryStatus::Copying,
            ActionKind::CopyToSource => EntryStatus::Updating,
            ActionKind::RemoveMirror => EntryStatus::Removing,
        };
    }

    if !record.source_present {
        return if record.mirror_present {
            EntryStatus::Updating
        } else {
            EntryStatus::Archived
        };
    }

    match record.item_type {
        ItemType::Dir => match (record.selected, record.mirror_present) {
            (true, true) => EntryStatus::Synced,
            (false, true) => EntryStatus::Partial,
            (_, false) => EntryStatus::Archived,
        },
        ItemType::File => {
            if !record.mirror_present {
                return EntryStatus::Archived;
            }
            let (Some(source), Some(mirror)) = (record.source_meta(), record.mirror_meta()) else {
                return EntryStatus::Updating;
            };
            match resolve_conflict(record.baseline().as_ref(), &source, &mirror) {
                ConflictDecision::Conflict => EntryStatus::Conflict,
                ConflictDecision::CopyToSource => EntryStatus::Updating,
                _ if !record.selected => EntryStatus::Removing,
                ConflictDecision::NoOp | ConflictDecision::AdoptBaseline => EntryStatus::Synced,
                ConflictDecision::CopyToMirror => EntryStatus::Copying,
            }
        }
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

include!("index_store_impl.rs");

fn entry_from_row(row: &SqliteRow) -> Result<EntryRecord, IndexError> {
    let item_type: String = row.try_get("item_type")?;
    let pending_action: Option<String> = row.try_get("pending_action")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(EntryRecord {
        id: row.try_get("id")?,
        ino: row.try_get("ino")?,
        path: row.try_get("path")?,
        parent_path: row.try_get("parent_path")?,
        parent_ino: row.try_get("parent_ino")?,
        name: row.try_get("name")?,
        item_type: ItemType::parse(&item_type)?,
        selected: row.try_get::<i64, _>("selected")? != 0,
        source_present: row.try_get::<i64, _>("source_present")? != 0,
        mirror_present: row.try_get::<i64, _>("mirror_present")? != 0,
        size: row.try_get("size")?,
        mirror_size: row.try_get("mirror_size")?,
        source_mtime: row.try_get("source_mtime")?,
        mirror_mtime: row.try_get("mirror_mtime")?,
        synced_mtime: row.try_get("synced_mtime")?,
        synced_mirror_mtime: row.try_get("synced_mirror_mtime")?,
        synced_size: row.try_get("synced_size")?,
        pending_action: pending_action.as_deref().map(parse_action_kind).transpose()?,
        active_since: row.try_get("active_since")?,
        attempts: u32::try_from(attempts.max(0)).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        moved_from: row.try_get("moved_from")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("spacesd");
    path.push("index.sqlite3");
    Ok(path)
}

fn ensure_parent_dir(path: &Path) -> Result<(), IndexError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn split_path(path: &str) -> (Option<String>, String) {
    (parent_path(path), file_name(path))
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
