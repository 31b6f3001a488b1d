const ENTRY_SELECT: &str = "SELECT e.id, e.ino, e.path, e.parent_path, e.name, e.item_type, e.selected,
        e.source_present, e.mirror_present, e.size, e.mirror_size, e.source_mtime, e.mirror_mtime,
        e.synced_mtime, e.synced_mirror_mtime, e.synced_size, e.pending_action, e.active_since,
        e.attempts, e.last_error, e.moved_from, p.ino AS parent_ino
     FROM entries e
     LEFT JOIN entries p ON p.path = e.parent_path";

// Matches `?1` itself and everything below it without LIKE wildcards.
const SUBTREE_FILTER: &str = "(path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/')";
const DESCENDANT_FILTER: &str = "substr(path, 1, length(?1) + 1) = ?1 || '/'";

impl IndexStore {
    /// Opens (creating if needed) a WAL-mode database file.
    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        ensure_parent_dir(db_path)?;
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, IndexError> {
        Self::open(&default_db_path()?).await
    }

    #[cfg(test)]
    pub(crate) async fn in_memory() -> Result<Self, IndexError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_entry_by_path(&self, path: &str) -> Result<Option<EntryRecord>, IndexError> {
        let sql = format!("{ENTRY_SELECT} WHERE e.path = ?1");
        let row = sqlx::query(&sql)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn get_entry_by_ino(&self, ino: i64) -> Result<Option<EntryRecord>, IndexError> {
        let sql = format!("{ENTRY_SELECT} WHERE e.ino = ?1");
        let row = sqlx::query(&sql)
            .bind(ino)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn list_all(&self) -> Result<Vec<EntryRecord>, IndexError> {
        let sql = format!("{ENTRY_SELECT} ORDER BY e.path ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn list_children(&self, parent: &str) -> Result<Vec<EntryRecord>, IndexError> {
        let sql = format!("{ENTRY_SELECT} WHERE e.parent_path = ?1 ORDER BY e.path ASC");
        let rows = sqlx::query(&sql)
            .bind(parent)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn list_descendant_paths(&self, path: &str) -> Result<Vec<String>, IndexError> {
        let sql = format!("SELECT path FROM entries WHERE {DESCENDANT_FILTER} ORDER BY path ASC");
        let rows = sqlx::query(&sql).bind(path).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("path").map_err(IndexError::from))
            .collect()
    }

    pub async fn list_all_paths(&self) -> Result<Vec<String>, IndexError> {
        let rows = sqlx::query("SELECT path FROM entries ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("path").map_err(IndexError::from))
            .collect()
    }

    pub async fn has_selected_descendant(&self, path: &str) -> Result<bool, IndexError> {
        let sql = format!("SELECT 1 FROM entries WHERE selected = 1 AND {DESCENDANT_FILTER} LIMIT 1");
        let row = sqlx::query(&sql).bind(path).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    pub async fn insert_entry(&self, entry: &EntryInput) -> Result<EntryRecord, IndexError> {
        let (parent, name) = split_path(&entry.path);
        let observed = &entry.observed;
        let mut tx = self.pool.begin().await?;
        if let Some(ino) = observed.ino {
            // An inode can be reused after its previous owner vanished.
            sqlx::query("UPDATE entries SET ino = NULL WHERE ino = ?1 AND path <> ?2")
                .bind(ino)
                .bind(&entry.path)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO entries (
                ino, path, parent_path, name, item_type, selected, source_present, mirror_present,
                size, mirror_size, source_mtime, mirror_mtime
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(path) DO UPDATE SET
                ino = excluded.ino,
                item_type = excluded.item_type,
                source_present = excluded.source_present,
                mirror_present = excluded.mirror_present,
                size = excluded.size,
                mirror_size = excluded.mirror_size,
                source_mtime = excluded.source_mtime,
                mirror_mtime = excluded.mirror_mtime",
        )
        .bind(observed.ino)
        .bind(&entry.path)
        .bind(&parent)
        .bind(&name)
        .bind(entry.item_type.as_str())
        .bind(entry.selected)
        .bind(observed.source_present)
        .bind(observed.mirror_present)
        .bind(observed.size)
        .bind(observed.mirror_size)
        .bind(observed.source_mtime)
        .bind(observed.mirror_mtime)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_entry_by_path(&entry.path)
            .await?
            .ok_or_else(|| IndexError::MissingEntry(entry.path.clone()))
    }

    pub async fn update_observed(
        &self,
        path: &str,
        item_type: ItemType,
        observed: &ObservedState,
    ) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;
        if let Some(ino) = observed.ino {
            sqlx::query("UPDATE entries SET ino = NULL WHERE ino = ?1 AND path <> ?2")
                .bind(ino)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "UPDATE entries SET
                ino = COALESCE(?2, ino),
                item_type = ?3,
                source_present = ?4,
                mirror_present = ?5,
                size = ?6,
                mirror_size = ?7,
                source_mtime = ?8,
                mirror_mtime = ?9
             WHERE path = ?1",
        )
        .bind(path)
        .bind(observed.ino)
        .bind(item_type.as_str())
        .bind(observed.source_present)
        .bind(observed.mirror_present)
        .bind(observed.size)
        .bind(observed.mirror_size)
        .bind(observed.source_mtime)
        .bind(observed.mirror_mtime)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Sets `selected` on the entry and all of its recorded descendants in one
    /// transaction. Returns the affected paths ordered parent-first, or an
    /// empty list when the identity is unknown.
    pub async fn set_selected(&self, ino: i64, selected: bool) -> Result<Vec<String>, IndexError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT path FROM entries WHERE ino = ?1")
            .bind(ino)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(Vec::new());
        };
        let path: String = row.try_get("path")?;

        let update = format!(
            "UPDATE entries SET selected = ?2, attempts = 0, last_error = NULL WHERE {SUBTREE_FILTER}"
        );
        sqlx::query(&update)
            .bind(&path)
            .bind(selected)
            .execute(&mut *tx)
            .await?;

        let select = format!("SELECT path FROM entries WHERE {SUBTREE_FILTER} ORDER BY path ASC");
        let rows = sqlx::query(&select).bind(&path).fetch_all(&mut *tx).await?;
        tx.commit().await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("path").map_err(IndexError::from))
            .collect()
    }

    pub async fn set_pending(&self, path: &str, kind: Option<ActionKind>) -> Result<(), IndexError> {
        sqlx::query(
            "UPDATE entries SET
                pending_action = ?2,
                active_since = CASE WHEN ?2 IS NULL THEN NULL ELSE active_since END
             WHERE path = ?1",
        )
        .bind(path)
        .bind(kind.map(|kind| kind.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clears a pending action that no op has picked up yet.
    pub async fn clear_queued_pending(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query(
            "UPDATE entries SET pending_action = NULL
             WHERE path = ?1 AND active_since IS NULL",
        )
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_active(
        &self,
        path: &str,
        kind: ActionKind,
        now_ms: i64,
    ) -> Result<(), IndexError> {
        sqlx::query("UPDATE entries SET pending_action = ?2, active_since = ?3 WHERE path = ?1")
            .bind(path)
            .bind(kind.as_str())
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops in-flight bookkeeping; `next` is the still-queued action, if any.
    pub async fn finish_action(
        &self,
        path: &str,
        next: Option<ActionKind>,
    ) -> Result<(), IndexError> {
        sqlx::query("UPDATE entries SET pending_action = ?2, active_since = NULL WHERE path = ?1")
            .bind(path)
            .bind(next.map(|kind| kind.as_str()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_synced(&self, state: &SyncedState) -> Result<(), IndexError> {
        let (parent, name) = split_path(&state.path);
        let mut tx = self.pool.begin().await?;
        if let Some(ino) = state.ino {
            sqlx::query("UPDATE entries SET ino = NULL WHERE ino = ?1 AND path <> ?2")
                .bind(ino)
                .bind(&state.path)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO entries (
                ino, path, parent_path, name, item_type, selected, source_present, mirror_present,
                size, mirror_size, source_mtime, mirror_mtime,
                synced_mtime, synced_mirror_mtime, synced_size, attempts
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 1, ?7, ?7, ?8, ?9, ?8, ?9, ?7, 0)
            ON CONFLICT(path) DO UPDATE SET
                ino = COALESCE(excluded.ino, entries.ino),
                item_type = excluded.item_type,
                source_present = 1,
                mirror_present = 1,
                size = excluded.size,
                mirror_size = excluded.mirror_size,
                source_mtime = excluded.source_mtime,
                mirror_mtime = excluded.mirror_mtime,
                synced_mtime = excluded.synced_mtime,
                synced_mirror_mtime = excluded.synced_mirror_mtime,
                synced_size = excluded.synced_size,
                active_since = NULL,
                attempts = 0,
                last_error = NULL",
        )
        .bind(state.ino)
        .bind(&state.path)
        .bind(&parent)
        .bind(&name)
        .bind(state.item_type.as_str())
        .bind(state.selected_if_new)
        .bind(state.size)
        .bind(state.source_mtime)
        .bind(state.mirror_mtime)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_mirror_removed(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query(
            "UPDATE entries SET
                mirror_present = 0,
                mirror_size = NULL,
                mirror_mtime = NULL,
                synced_mtime = NULL,
                synced_mirror_mtime = NULL,
                synced_size = NULL,
                active_since = NULL,
                attempts = 0,
                last_error = NULL
             WHERE path = ?1",
        )
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bumps the failure counter and returns the new attempt count.
    pub async fn record_failure(&self, path: &str, error: &str) -> Result<u32, IndexError> {
        let row = sqlx::query(
            "UPDATE entries SET attempts = attempts + 1, last_error = ?2, active_since = NULL
             WHERE path = ?1
             RETURNING attempts",
        )
        .bind(path)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        let attempts = match row {
            Some(row) => row.try_get::<i64, _>("attempts")?,
            None => 0,
        };
        Ok(u32::try_from(attempts.max(0)).unwrap_or(u32::MAX))
    }

    /// Re-keys `from` and its descendants under `to`, keeping identity,
    /// selection and baselines. With `mirror_follows` the record remembers
    /// `from` until the mirror copy is moved too. Returns false when `from`
    /// is unknown.
    pub async fn rename_entry(
        &self,
        from: &str,
        to: &str,
        mirror_follows: bool,
    ) -> Result<bool, IndexError> {
        let (parent, name) = split_path(to);
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM entries WHERE path = ?1")
            .bind(from)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            tx.commit().await?;
            return Ok(false);
        }

        let clear_target = format!(
            "DELETE FROM entries WHERE {SUBTREE_FILTER}
                AND NOT (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')"
        );
        sqlx::query(&clear_target)
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE entries SET path = ?2, parent_path = ?3, name = ?4, moved_from = ?5 WHERE path = ?1",
        )
        .bind(from)
        .bind(to)
        .bind(&parent)
        .bind(&name)
        .bind(mirror_follows.then_some(from))
        .execute(&mut *tx)
        .await?;

        let move_children = format!(
            "UPDATE entries SET
                path = ?2 || substr(path, length(?1) + 1),
                parent_path = ?2 || substr(parent_path, length(?1) + 1)
             WHERE {DESCENDANT_FILTER}"
        );
        sqlx::query(&move_children)
            .bind(from)
            .bind(to)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn clear_moved_from(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query("UPDATE entries SET moved_from = NULL WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// True when `path` lies inside a mirror copy that is about to be moved
    /// away, or below a record whose mirror copy has not arrived yet.
    pub async fn is_move_pending(&self, path: &str) -> Result<bool, IndexError> {
        let row = sqlx::query(
            "SELECT 1 FROM entries
             WHERE moved_from IS NOT NULL
               AND (
                    moved_from = ?1
                    OR substr(?1, 1, length(moved_from) + 1) = moved_from || '/'
                    OR substr(?1, 1, length(path) + 1) = path || '/'
               )
             LIMIT 1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn release_identity(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query("UPDATE entries SET ino = NULL WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_entry(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM entries WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_mirror_origin(&self, path: &str, now_ms: i64) -> Result<(), IndexError> {
        sqlx::query("INSERT OR IGNORE INTO mirror_origins (path, seen_at) VALUES (?1, ?2)")
            .bind(path)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_mirror_origin(&self, path: &str) -> Result<bool, IndexError> {
        let row = sqlx::query("SELECT 1 FROM mirror_origins WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn clear_mirror_origin(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM mirror_origins WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_mirror_origins(&self) -> Result<Vec<String>, IndexError> {
        let rows = sqlx::query("SELECT path FROM mirror_origins ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("path").map_err(IndexError::from))
            .collect()
    }

    /// Forgets queued and in-flight bookkeeping left by a previous run.
    pub async fn clear_transient(&self) -> Result<u64, IndexError> {
        let result = sqlx::query(
            "UPDATE entries SET pending_action = NULL, active_since = NULL
             WHERE pending_action IS NOT NULL OR active_since IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
