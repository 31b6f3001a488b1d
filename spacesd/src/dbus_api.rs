use spaces_integrations::ids::{DBUS_ERROR_BUSY, DBUS_ERROR_FAILED, DBUS_ERROR_NOT_FOUND};
use thiserror::Error;
use zbus::{interface, object_server::SignalEmitter};

use crate::sync::engine::{EngineError, SyncEngine};

#[derive(Debug, Error)]
pub enum DbusServiceError {
    #[error("entry does not exist")]
    NotFound,
    #[error("store is busy, retry")]
    Busy,
    #[error("operation failed")]
    Failed,
}

pub fn dbus_error_name(err: &DbusServiceError) -> &'static str {
    match err {
        DbusServiceError::NotFound => DBUS_ERROR_NOT_FOUND,
        DbusServiceError::Busy => DBUS_ERROR_BUSY,
        DbusServiceError::Failed => DBUS_ERROR_FAILED,
    }
}

fn map_to_fdo(err: DbusServiceError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}: {}", dbus_error_name(&err), err))
}

fn map_engine_error(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::MissingEntry(_) => map_to_fdo(DbusServiceError::NotFound),
        err if err.is_transient() => map_to_fdo(DbusServiceError::Busy),
        err => {
            tracing::warn!(error = %err, "dbus call failed");
            map_to_fdo(DbusServiceError::Failed)
        }
    }
}

fn count(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Session-bus front for the selection API.
pub struct SyncDbusService {
    engine: SyncEngine,
}

impl SyncDbusService {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }
}

#[interface(name = "io.spaces.Sync1")]
impl SyncDbusService {
    async fn select(&self, inodes: Vec<u64>) -> zbus::fdo::Result<u32> {
        tracing::debug!(count = inodes.len(), "dbus Select");
        let known = self.engine.select(&inodes).await.map_err(map_engine_error)?;
        Ok(count(known))
    }

    async fn deselect(&self, inodes: Vec<u64>) -> zbus::fdo::Result<u32> {
        tracing::debug!(count = inodes.len(), "dbus Deselect");
        let known = self
            .engine
            .deselect(&inodes)
            .await
            .map_err(map_engine_error)?;
        Ok(count(known))
    }

    /// `parent == 0` lists every entry.
    async fn list_entries(&self, parent: u64) -> zbus::fdo::Result<String> {
        let parent = (parent != 0).then_some(parent);
        let views = self
            .engine
            .list_entries(parent)
            .await
            .map_err(map_engine_error)?;
        serde_json::to_string(&views).map_err(|err| {
            tracing::warn!(error = %err, "failed to encode entries");
            map_to_fdo(DbusServiceError::Failed)
        })
    }

    async fn get_status(&self, inode: u64) -> zbus::fdo::Result<String> {
        let view = self
            .engine
            .entry_status(inode)
            .await
            .map_err(map_engine_error)?;
        Ok(view.status)
    }

    #[zbus(signal)]
    pub async fn status_changed(
        ctxt: &SignalEmitter<'_>,
        path: &str,
        status: &str,
    ) -> zbus::Result<()>;
}
