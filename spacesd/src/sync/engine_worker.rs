#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpOutcome {
    Done,
    /// Nothing changed yet; something else has to finish first.
    Deferred,
}

/// Executes queued actions one at a time.
pub struct Worker {
    engine: SyncEngine,
    queue: WorkQueue,
}

impl Worker {
    /// Processes one queued item. Returns false when the queue was empty.
    pub async fn run_once(&mut self) -> Result<bool, EngineError> {
        let Some(item) = self.queue.try_next() else {
            return Ok(false);
        };
        self.process(item).await?;
        Ok(true)
    }

    /// Works the queue until `shutdown` fires or every handle is gone. An op
    /// interrupted by shutdown leaves only its temp file behind.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = self.queue.next() => item,
            };
            let Some(item) = item else { break };
            let path = item.path.clone();
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.process(item) => result,
            };
            if let Err(err) = result {
                tracing::warn!(path = %path, error = %err, "work item failed");
                if err.is_transient() {
                    let delay = self.engine.settings.retry.next_delay(1).unwrap_or_default();
                    self.engine.trigger_later(&path, WorkReason::Retry, delay);
                }
            }
        }
        tracing::debug!("worker stopped");
    }

    async fn process(&mut self, item: WorkItem) -> Result<(), EngineError> {
        let engine = self.engine.clone();
        let path = item.path.as_str();

        // The queued intent may be stale; decide again against fresh state.
        let queued = self.queue.pending_kind(path);
        let plan = match engine.replan(path, item.reason, queued).await {
            Ok(plan) => plan,
            Err(err) => {
                self.release(path).await;
                return Err(err);
            }
        };
        let Some(action) = plan.action else {
            let next = self.queue.pending_kind(path);
            engine.index.finish_action(path, next).await?;
            return Ok(());
        };

        let kind = action.kind();
        let token = self.queue.begin(path, kind);
        if let Err(err) = engine.index.mark_active(path, kind, now_unix_ms()).await {
            self.queue.finish();
            self.release(path).await;
            return Err(err.into());
        }
        tracing::info!(path, action = kind.as_str(), reason = ?item.reason, "op start");
        let result = engine.execute(path, item.reason, &action, &token).await;
        self.queue.finish();

        let mut look_again = true;
        match result {
            Ok(OpOutcome::Done) => {
                tracing::info!(path, action = kind.as_str(), "op done");
            }
            Ok(OpOutcome::Deferred) => {
                // Children finishing retrigger their ancestors.
                tracing::debug!(path, action = kind.as_str(), "op deferred");
                look_again = false;
            }
            Err(err) if err.needs_reevaluation() => {
                tracing::info!(path, action = kind.as_str(), reason = %err, "op requeued");
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(path, action = kind.as_str(), error = %err, "store busy; op retried");
                let delay = engine.settings.retry.next_delay(1).unwrap_or_default();
                engine.trigger_later(path, WorkReason::Retry, delay);
                look_again = false;
            }
            Err(err) => {
                look_again = false;
                let attempts = engine.index.record_failure(path, &err.to_string()).await?;
                if attempts == 0 {
                    // No record to count against; the next rescan retries it.
                    tracing::warn!(path, action = kind.as_str(), error = %err, "op failed");
                } else if let Some(delay) = engine.settings.retry.next_delay(attempts) {
                    tracing::warn!(
                        path,
                        action = kind.as_str(),
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "op failed"
                    );
                    engine.trigger_later(path, WorkReason::Retry, delay);
                } else {
                    tracing::error!(
                        path,
                        action = kind.as_str(),
                        attempts,
                        error = %err,
                        "op failed permanently after retries"
                    );
                }
            }
        }

        let next = self.queue.pending_kind(path);
        engine.index.finish_action(path, next).await?;
        if look_again {
            engine.trigger(path, WorkReason::Followup);
        }
        for ancestor in ancestors(path) {
            engine.trigger(ancestor, WorkReason::Followup);
        }
        Ok(())
    }

    /// Drops the bookkeeping of an item that never got to run, so its
    /// status does not stay pending.
    async fn release(&mut self, path: &str) {
        let next = self.queue.pending_kind(path);
        if let Err(err) = self.engine.index.finish_action(path, next).await {
            tracing::debug!(path, error = %err, "failed to release pending action");
        }
    }
}

impl SyncEngine {
    /// Decides again for an item the worker just took off the queue. The
    /// stored pending action belongs to that item, or to a newer `queued` one.
    async fn replan(
        &self,
        path: &str,
        reason: WorkReason,
        queued: Option<ActionKind>,
    ) -> Result<Plan, EngineError> {
        let mut snapshot = self.reconciler.snapshot(path, reason).await?;
        if let Some(record) = snapshot.record.as_mut()
            && record.active_since.is_none()
        {
            record.pending_action = queued;
        }
        let plan = decide(&snapshot);
        self.apply_plan(&snapshot, &plan).await?;
        Ok(plan)
    }

    async fn execute(
        &self,
        path: &str,
        reason: WorkReason,
        action: &Action,
        token: &CancellationToken,
    ) -> Result<OpOutcome, EngineError> {
        match action {
            Action::CopyToMirror => self.copy_to_mirror(path, reason, token).await,
            Action::CopyToSource => self.copy_to_source(path, reason, token).await,
            Action::RemoveMirror => self.remove_mirror(path, reason).await,
            Action::MoveMirror { from } => self.move_mirror(from, path).await,
        }
    }

    /// Re-runs the decision right before an op becomes visible.
    async fn still_wanted(
        &self,
        path: &str,
        reason: WorkReason,
        kind: ActionKind,
    ) -> Result<bool, EngineError> {
        let snapshot = self.reconciler.snapshot(path, reason).await?;
        Ok(decide(&snapshot).action.map(|action| action.kind()) == Some(kind))
    }

    async fn copy_to_mirror(
        &self,
        path: &str,
        reason: WorkReason,
        token: &CancellationToken,
    ) -> Result<OpOutcome, EngineError> {
        let source_path = self.roots.source_path(path)?;
        let mirror_path = self.roots.mirror_path(path)?;
        let Some(source) = stat(&source_path).await? else {
            return Err(EngineError::Superseded);
        };

        if source.is_dir {
            self.copier.ensure_dir(&mirror_path).await?;
            self.index
                .record_synced(&dir_synced(path, source.ino, false))
                .await?;
            return Ok(OpOutcome::Done);
        }

        let staged = self.copier.stage(&source_path, &mirror_path, token).await?;
        if !self.still_wanted(path, reason, ActionKind::CopyToMirror).await? {
            staged.discard().await;
            return Err(EngineError::Superseded);
        }
        if token.is_cancelled() {
            staged.discard().await;
            return Err(TransferError::Cancelled.into());
        }
        let source = staged.source_stamp();
        let mirror = self.copier.commit(staged).await?;
        self.index
            .record_synced(&SyncedState {
                path: path.to_string(),
                item_type: ItemType::File,
                ino: Some(source.ino as i64),
                size: Some(source.size as i64),
                source_mtime: Some(source.modified_ns),
                mirror_mtime: Some(mirror.modified_ns),
                selected_if_new: false,
            })
            .await?;
        Ok(OpOutcome::Done)
    }

    async fn copy_to_source(
        &self,
        path: &str,
        reason: WorkReason,
        token: &CancellationToken,
    ) -> Result<OpOutcome, EngineError> {
        let source_path = self.roots.source_path(path)?;
        let mirror_path = self.roots.mirror_path(path)?;
        let Some(mirror) = stat(&mirror_path).await? else {
            return Err(EngineError::Superseded);
        };

        if mirror.is_dir {
            let source = self.copier.ensure_dir(&source_path).await?;
            self.index
                .record_synced(&dir_synced(path, source.ino, true))
                .await?;
            self.index.clear_mirror_origin(path).await?;
            return Ok(OpOutcome::Done);
        }

        let staged = self.copier.stage(&mirror_path, &source_path, token).await?;
        if !self.still_wanted(path, reason, ActionKind::CopyToSource).await? {
            staged.discard().await;
            return Err(EngineError::Superseded);
        }
        if token.is_cancelled() {
            staged.discard().await;
            return Err(TransferError::Cancelled.into());
        }
        let mirror = staged.source_stamp();
        let source = self.copier.commit(staged).await?;
        self.index
            .record_synced(&SyncedState {
                path: path.to_string(),
                item_type: ItemType::File,
                ino: Some(source.ino as i64),
                size: Some(source.size as i64),
                source_mtime: Some(source.modified_ns),
                mirror_mtime: Some(mirror.modified_ns),
                selected_if_new: true,
            })
            .await?;
        self.index.clear_mirror_origin(path).await?;
        Ok(OpOutcome::Done)
    }

    async fn remove_mirror(&self, path: &str, reason: WorkReason) -> Result<OpOutcome, EngineError> {
        if !self.still_wanted(path, reason, ActionKind::RemoveMirror).await? {
            return Err(EngineError::Superseded);
        }
        let mirror_path = self.roots.mirror_path(path)?;
        match self.copier.remove(&mirror_path).await? {
            RemoveOutcome::Removed | RemoveOutcome::AlreadyAbsent => {
                self.index.record_mirror_removed(path).await?;
                Ok(OpOutcome::Done)
            }
            RemoveOutcome::Deferred => Ok(OpOutcome::Deferred),
        }
    }

    async fn move_mirror(&self, from: &str, to: &str) -> Result<OpOutcome, EngineError> {
        let from_path = self.roots.mirror_path(from)?;
        let to_path = self.roots.mirror_path(to)?;
        if stat(&to_path).await?.is_none() && self.copier.rename(&from_path, &to_path).await? {
            tracing::debug!(from, to, "mirror copy moved");
        }
        self.index.clear_moved_from(to).await?;
        self.trigger(from, WorkReason::Followup);
        for descendant in self.index.list_descendant_paths(to).await? {
            self.trigger(descendant, WorkReason::Followup);
        }
        Ok(OpOutcome::Done)
    }
}

fn dir_synced(path: &str, source_ino: u64, selected_if_new: bool) -> SyncedState {
    SyncedState {
        path: path.to_string(),
        item_type: ItemType::Dir,
        ino: Some(source_ino as i64),
        size: None,
        source_mtime: None,
        mirror_mtime: None,
        selected_if_new,
    }
}
