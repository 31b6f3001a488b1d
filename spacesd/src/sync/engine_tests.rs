use super::*;
use crate::sync::local_watcher::RenamePair;
use spaces_integrations::ids::TRANSFER_TMP_SUFFIX;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::{TempDir, tempdir};

struct Fixture {
    _dir: TempDir,
    roots: TreeRoots,
    engine: SyncEngine,
    worker: Worker,
    triggers: mpsc::UnboundedReceiver<Trigger>,
}

async fn fixture() -> Fixture {
    fixture_with(EngineSettings::default()).await
}

async fn fixture_with(settings: EngineSettings) -> Fixture {
    let dir = tempdir().unwrap();
    let roots = TreeRoots::new(dir.path().join("Archives"), dir.path().join("Spaces"));
    std::fs::create_dir_all(&roots.source).unwrap();
    std::fs::create_dir_all(&roots.mirror).unwrap();
    let index = IndexStore::in_memory().await.unwrap();
    let (engine, channels) = SyncEngine::new(index, roots.clone(), settings);
    Fixture {
        _dir: dir,
        roots,
        engine,
        worker: channels.worker,
        triggers: channels.triggers,
    }
}

impl Fixture {
    /// Feeds triggers to the reconciler and runs the worker until both are idle.
    async fn settle(&mut self) {
        for _ in 0..10_000 {
            let mut progressed = false;
            while let Ok(trigger) = self.triggers.try_recv() {
                self.engine
                    .reconcile_path(&trigger.path, trigger.reason)
                    .await
                    .unwrap();
                progressed = true;
            }
            if self.worker.run_once().await.unwrap() {
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
        panic!("engine never went idle");
    }

    async fn scan(&mut self) {
        self.engine.full_scan(WorkReason::Rescan).await.unwrap();
        self.settle().await;
    }

    async fn touch(&mut self, path: &str) {
        self.engine.trigger(path, WorkReason::Watch);
        self.settle().await;
    }

    fn source(&self, path: &str) -> PathBuf {
        self.roots.source_path(path).unwrap()
    }

    fn mirror(&self, path: &str) -> PathBuf {
        self.roots.mirror_path(path).unwrap()
    }

    async fn ino(&self, path: &str) -> u64 {
        let record = self.engine.index().get_entry_by_path(path).await.unwrap();
        record.unwrap().ino.unwrap() as u64
    }

    async fn view(&self, path: &str) -> EntryView {
        self.engine
            .list_entries(None)
            .await
            .unwrap()
            .into_iter()
            .find(|view| view.path == path)
            .unwrap_or_else(|| panic!("no entry for {path}"))
    }

    async fn status(&self, path: &str) -> String {
        self.view(path).await.status
    }
}

fn write_with_mtime(path: &Path, bytes: &[u8], modified: SystemTime) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(modified).unwrap();
}

fn later(secs: u64) -> SystemTime {
    SystemTime::now() + Duration::from_secs(secs)
}

fn assert_no_tmp_files(root: &Path) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(!name.ends_with(TRANSFER_TMP_SUFFIX), "leftover temp file {name}");
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path());
            }
        }
    }
}

#[tokio::test]
async fn new_source_file_is_listed_as_archived() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"hello").unwrap();
    fx.scan().await;

    let view = fx.view("/a.txt").await;
    assert_eq!(view.status, "archived");
    assert!(!view.selected);
    assert_eq!(view.item_type, "file");
    assert_eq!(view.size, Some(5));
    assert!(!fx.mirror("/a.txt").exists());
}

#[tokio::test]
async fn select_copies_file_byte_identical() {
    let mut fx = fixture().await;
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(fx.source("/a.bin"), &payload).unwrap();
    fx.scan().await;

    let ino = fx.ino("/a.bin").await;
    assert_eq!(fx.engine.select(&[ino]).await.unwrap(), 1);
    fx.settle().await;

    assert_eq!(std::fs::read(fx.mirror("/a.bin")).unwrap(), payload);
    let view = fx.engine.entry_status(ino).await.unwrap();
    assert_eq!(view.status, "synced");
    assert!(view.selected);
    assert_no_tmp_files(&fx.roots.mirror);
}

#[tokio::test]
async fn unknown_identities_are_ignored_by_select() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"x").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;

    assert_eq!(fx.engine.select(&[ino, 987_654_321]).await.unwrap(), 1);
    assert_eq!(fx.engine.deselect(&[987_654_321]).await.unwrap(), 0);
}

#[tokio::test]
async fn source_overwrite_propagates_to_mirror() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"first").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;

    write_with_mtime(&fx.source("/a.txt"), b"second version", later(5));
    fx.touch("/a.txt").await;

    assert_eq!(std::fs::read(fx.mirror("/a.txt")).unwrap(), b"second version");
    assert_eq!(fx.status("/a.txt").await, "synced");
}

#[tokio::test]
async fn deselect_removes_mirror_copy_and_keeps_source() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"keep me").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;
    assert!(fx.mirror("/a.txt").exists());

    assert_eq!(fx.engine.deselect(&[ino]).await.unwrap(), 1);
    fx.settle().await;

    assert!(!fx.mirror("/a.txt").exists());
    assert_eq!(std::fs::read(fx.source("/a.txt")).unwrap(), b"keep me");
    assert_eq!(fx.status("/a.txt").await, "archived");
}

#[tokio::test]
async fn deleted_source_is_recovered_from_mirror() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"precious").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;

    std::fs::remove_file(fx.source("/a.txt")).unwrap();
    fx.touch("/a.txt").await;

    assert_eq!(std::fs::read(fx.source("/a.txt")).unwrap(), b"precious");
    let view = fx.view("/a.txt").await;
    assert_eq!(view.status, "synced");
    assert!(view.selected);
}

#[tokio::test]
async fn deleted_unselected_source_is_forgotten() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"gone soon").unwrap();
    fx.scan().await;
    assert_eq!(fx.engine.list_entries(None).await.unwrap().len(), 1);

    std::fs::remove_file(fx.source("/a.txt")).unwrap();
    fx.touch("/a.txt").await;

    assert!(fx.engine.list_entries(None).await.unwrap().is_empty());
    assert!(!fx.source("/a.txt").exists());
}

#[tokio::test]
async fn selecting_directory_copies_whole_subtree() {
    let mut fx = fixture().await;
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::create_dir_all(fx.source("/docs")).unwrap();
        std::fs::write(fx.source(&format!("/docs/{name}")), name.as_bytes()).unwrap();
    }
    std::fs::create_dir_all(fx.source("/docs/sub")).unwrap();
    std::fs::write(fx.source("/docs/sub/x.txt"), b"deep").unwrap();
    fx.scan().await;

    let docs = fx.ino("/docs").await;
    assert_eq!(fx.engine.select(&[docs]).await.unwrap(), 1);
    fx.settle().await;

    for name in ["a.txt", "b.txt", "c.txt"] {
        let path = format!("/docs/{name}");
        assert_eq!(std::fs::read(fx.mirror(&path)).unwrap(), name.as_bytes());
        assert_eq!(fx.status(&path).await, "synced");
    }
    assert_eq!(std::fs::read(fx.mirror("/docs/sub/x.txt")).unwrap(), b"deep");
    assert_eq!(fx.status("/docs").await, "synced");

    fx.engine.deselect(&[docs]).await.unwrap();
    fx.settle().await;
    assert!(!fx.mirror("/docs").exists());
    assert!(fx.source("/docs/sub/x.txt").exists());
    assert_eq!(fx.status("/docs").await, "archived");
}

#[tokio::test]
async fn selected_descendant_materializes_parent_as_partial() {
    let mut fx = fixture().await;
    std::fs::create_dir_all(fx.source("/docs/sub")).unwrap();
    std::fs::write(fx.source("/docs/sub/x.txt"), b"deep").unwrap();
    std::fs::write(fx.source("/docs/other.txt"), b"stays").unwrap();
    fx.scan().await;

    let ino = fx.ino("/docs/sub/x.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;

    assert!(fx.mirror("/docs/sub/x.txt").exists());
    assert!(!fx.mirror("/docs/other.txt").exists());
    assert_eq!(fx.status("/docs").await, "partial");
    assert_eq!(fx.status("/docs/other.txt").await, "archived");

    fx.engine.deselect(&[ino]).await.unwrap();
    fx.settle().await;
    assert!(!fx.mirror("/docs").exists());
}

#[tokio::test]
async fn rapid_toggles_settle_on_the_last_choice() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"toggle").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;

    for round in 0..20 {
        if round % 2 == 0 {
            fx.engine.select(&[ino]).await.unwrap();
        } else {
            fx.engine.deselect(&[ino]).await.unwrap();
        }
    }
    fx.settle().await;
    assert!(!fx.mirror("/a.txt").exists());
    assert_eq!(fx.status("/a.txt").await, "archived");

    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;
    assert_eq!(std::fs::read(fx.mirror("/a.txt")).unwrap(), b"toggle");
    assert_eq!(fx.status("/a.txt").await, "synced");
    assert_no_tmp_files(&fx.roots.mirror);
}

#[tokio::test]
async fn rescanning_a_synced_tree_writes_nothing() {
    let mut fx = fixture().await;
    std::fs::create_dir_all(fx.source("/docs")).unwrap();
    std::fs::write(fx.source("/docs/a.txt"), b"steady").unwrap();
    fx.scan().await;
    let docs = fx.ino("/docs").await;
    fx.engine.select(&[docs]).await.unwrap();
    fx.settle().await;

    let before = stat(&fx.mirror("/docs/a.txt")).await.unwrap().unwrap();
    let records = fx.engine.index().list_all().await.unwrap();

    fx.engine.full_scan(WorkReason::Rescan).await.unwrap();
    while let Ok(trigger) = fx.triggers.try_recv() {
        let action = fx
            .engine
            .reconcile_path(&trigger.path, trigger.reason)
            .await
            .unwrap();
        assert_eq!(action, None, "unexpected action for {}", trigger.path);
    }
    assert!(!fx.worker.run_once().await.unwrap());

    let after = stat(&fx.mirror("/docs/a.txt")).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(fx.engine.index().list_all().await.unwrap(), records);
}

#[tokio::test]
async fn mirror_only_file_is_adopted_into_source() {
    let mut fx = fixture().await;
    std::fs::write(fx.mirror("/found.txt"), b"from the mirror").unwrap();
    fx.scan().await;

    assert_eq!(std::fs::read(fx.source("/found.txt")).unwrap(), b"from the mirror");
    let view = fx.view("/found.txt").await;
    assert!(view.selected);
    assert_eq!(view.status, "synced");
    assert!(view.inode.is_some());
    assert!(
        fx.engine
            .index()
            .list_mirror_origins()
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn identical_copies_are_adopted_without_copying() {
    let mut fx = fixture().await;
    let stamp = later(1);
    write_with_mtime(&fx.source("/same.txt"), b"twins", stamp);
    write_with_mtime(&fx.mirror("/same.txt"), b"twins", stamp);
    let mirror_before = stat(&fx.mirror("/same.txt")).await.unwrap().unwrap();
    fx.scan().await;

    let view = fx.view("/same.txt").await;
    assert!(view.selected);
    assert_eq!(view.status, "synced");
    let mirror_after = stat(&fx.mirror("/same.txt")).await.unwrap().unwrap();
    assert_eq!(mirror_before.ino, mirror_after.ino);
}

#[tokio::test]
async fn mirror_edit_flows_back_to_source() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"v1").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;

    write_with_mtime(&fx.mirror("/a.txt"), b"edited in mirror", later(10));
    fx.touch("/a.txt").await;

    assert_eq!(std::fs::read(fx.source("/a.txt")).unwrap(), b"edited in mirror");
    assert_eq!(fx.status("/a.txt").await, "synced");
}

#[tokio::test]
async fn conflicting_edits_wait_until_reselected() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"base").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;

    write_with_mtime(&fx.source("/a.txt"), b"source side", later(10));
    write_with_mtime(&fx.mirror("/a.txt"), b"mirror side edit", later(20));
    fx.touch("/a.txt").await;

    assert_eq!(fx.status("/a.txt").await, "conflict");
    assert_eq!(std::fs::read(fx.source("/a.txt")).unwrap(), b"source side");
    assert_eq!(std::fs::read(fx.mirror("/a.txt")).unwrap(), b"mirror side edit");

    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;
    assert_eq!(std::fs::read(fx.mirror("/a.txt")).unwrap(), b"source side");
    assert_eq!(fx.status("/a.txt").await, "synced");
}

#[tokio::test]
async fn linked_rename_moves_mirror_copy() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/old.txt"), b"moving").unwrap();
    fx.scan().await;
    let ino = fx.ino("/old.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;
    let mirror_ino = stat(&fx.mirror("/old.txt")).await.unwrap().unwrap().ino;

    std::fs::rename(fx.source("/old.txt"), fx.source("/new.txt")).unwrap();
    fx.engine
        .apply_watch_batch(WatchBatch {
            paths: vec!["/old.txt".into(), "/new.txt".into()],
            renames: vec![RenamePair {
                from: "/old.txt".into(),
                to: "/new.txt".into(),
            }],
        })
        .await
        .unwrap();
    fx.settle().await;

    assert!(!fx.source("/old.txt").exists());
    assert!(!fx.mirror("/old.txt").exists());
    let moved = stat(&fx.mirror("/new.txt")).await.unwrap().unwrap();
    assert_eq!(moved.ino, mirror_ino);

    let view = fx.view("/new.txt").await;
    assert_eq!(view.inode, Some(ino));
    assert!(view.selected);
    assert_eq!(view.status, "synced");
    assert!(
        fx.engine
            .index()
            .get_entry_by_path("/old.txt")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn unlinked_rename_keeps_identity() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/old.txt"), b"quiet move").unwrap();
    fx.scan().await;
    let ino = fx.ino("/old.txt").await;

    std::fs::rename(fx.source("/old.txt"), fx.source("/new.txt")).unwrap();
    fx.engine.trigger("/new.txt", WorkReason::Watch);
    fx.engine.trigger("/old.txt", WorkReason::Watch);
    fx.settle().await;

    let views = fx.engine.list_entries(None).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].path, "/new.txt");
    assert_eq!(views[0].inode, Some(ino));
}

#[tokio::test]
async fn list_entries_by_parent_and_missing_parent() {
    let mut fx = fixture().await;
    std::fs::create_dir_all(fx.source("/docs/sub")).unwrap();
    std::fs::write(fx.source("/docs/a.txt"), b"a").unwrap();
    std::fs::write(fx.source("/docs/sub/b.txt"), b"b").unwrap();
    fx.scan().await;

    let docs = fx.ino("/docs").await;
    let children = fx.engine.list_entries(Some(docs)).await.unwrap();
    let mut paths: Vec<_> = children.iter().map(|view| view.path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["/docs/a.txt", "/docs/sub"]);
    assert!(children.iter().all(|view| view.parent_inode == Some(docs)));

    let err = fx.engine.list_entries(Some(987_654_321)).await.unwrap_err();
    assert!(matches!(err, EngineError::MissingEntry(_)));
}

#[tokio::test]
async fn entry_view_serializes_type_field() {
    let mut fx = fixture().await;
    std::fs::create_dir_all(fx.source("/docs")).unwrap();
    fx.scan().await;

    let view = fx.view("/docs").await;
    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["type"], "dir");
    assert_eq!(json["name"], "docs");
    assert_eq!(json["status"], "archived");
}

#[test]
fn reevaluation_and_transient_errors_are_classified() {
    assert!(EngineError::Superseded.needs_reevaluation());
    assert!(EngineError::Transfer(TransferError::Cancelled).needs_reevaluation());
    assert!(EngineError::Transfer(TransferError::SourceModified).needs_reevaluation());
    assert!(!EngineError::MissingEntry("x".into()).needs_reevaluation());
    assert!(EngineError::Index(IndexError::Sqlx(sqlx::Error::PoolTimedOut)).is_transient());
    assert!(!EngineError::Superseded.is_transient());
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_tasks_converge_under_interleaved_requests() {
    let Fixture {
        _dir,
        roots,
        engine,
        worker,
        triggers,
    } = fixture().await;
    for i in 0..10 {
        std::fs::write(roots.source.join(format!("f{i}.txt")), format!("file {i}")).unwrap();
    }

    let shutdown = CancellationToken::new();
    let reconciler = engine.clone();
    let reconciler_shutdown = shutdown.clone();
    let reconciler_task = tokio::spawn(async move {
        reconciler
            .run_reconciler(triggers, None, reconciler_shutdown)
            .await;
    });
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    let engine_ref = &engine;
    engine.full_scan(WorkReason::Rescan).await.unwrap();
    wait_for("registration", || async move {
        engine_ref.list_entries(None).await.unwrap().len() == 10
    })
    .await;

    let mut inodes = Vec::new();
    for i in 0..10 {
        let record = engine
            .index()
            .get_entry_by_path(&format!("/f{i}.txt"))
            .await
            .unwrap()
            .unwrap();
        inodes.push(record.ino.unwrap() as u64);
    }
    for round in 0..5 {
        engine.select(&inodes).await.unwrap();
        if round < 4 {
            engine.deselect(&inodes).await.unwrap();
        }
    }
    let odd: Vec<u64> = inodes.iter().skip(1).step_by(2).copied().collect();
    engine.deselect(&odd).await.unwrap();

    let mirror = roots.mirror.clone();
    let mirror_ref = &mirror;
    wait_for("convergence", || async move {
        let views = engine_ref.list_entries(None).await.unwrap();
        views.iter().all(|view| {
            let index: usize = view.path[2..view.path.len() - 4].parse().unwrap();
            let present = mirror_ref.join(&view.path[1..]).exists();
            if index % 2 == 0 {
                view.status == "synced" && present
            } else {
                view.status == "archived" && !present
            }
        })
    })
    .await;

    shutdown.cancel();
    reconciler_task.await.unwrap();
    worker_task.await.unwrap();
    assert_no_tmp_files(&roots.mirror);
    for i in (0..10).step_by(2) {
        assert_eq!(
            std::fs::read(roots.mirror.join(format!("f{i}.txt"))).unwrap(),
            format!("file {i}").into_bytes()
        );
    }
}

#[tokio::test]
async fn deselect_during_copy_leaves_no_partial_file() {
    let settings = EngineSettings {
        transfer: TransferConfig { chunk_bytes: 16 },
        ..EngineSettings::default()
    };
    let mut fx = fixture_with(settings).await;
    std::fs::write(fx.source("/big.bin"), vec![7u8; 256 * 1024]).unwrap();
    fx.scan().await;
    let ino = fx.ino("/big.bin").await;
    fx.engine.select(&[ino]).await.unwrap();
    while let Ok(trigger) = fx.triggers.try_recv() {
        fx.engine
            .reconcile_path(&trigger.path, trigger.reason)
            .await
            .unwrap();
    }

    let tmp = crate::sync::paths::transfer_tmp_path(&fx.mirror("/big.bin"));
    let Fixture {
        _dir,
        roots,
        engine,
        mut worker,
        mut triggers,
    } = fx;
    let interrupt = async {
        for _ in 0..5_000 {
            if tmp.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        engine.deselect(&[ino]).await.unwrap();
        while let Ok(trigger) = triggers.try_recv() {
            engine
                .reconcile_path(&trigger.path, trigger.reason)
                .await
                .unwrap();
        }
    };
    let (processed, ()) = tokio::join!(worker.run_once(), interrupt);
    assert!(processed.unwrap());

    let mut fx = Fixture {
        _dir,
        roots,
        engine,
        worker,
        triggers,
    };
    fx.settle().await;
    assert!(!fx.mirror("/big.bin").exists());
    assert_no_tmp_files(&fx.roots.mirror);
    assert_eq!(fx.status("/big.bin").await, "archived");
}

#[tokio::test]
async fn source_edit_during_copy_converges_to_new_content() {
    let settings = EngineSettings {
        transfer: TransferConfig { chunk_bytes: 16 },
        ..EngineSettings::default()
    };
    let mut fx = fixture_with(settings).await;
    std::fs::write(fx.source("/big.bin"), vec![7u8; 256 * 1024]).unwrap();
    fx.scan().await;
    let ino = fx.ino("/big.bin").await;
    fx.engine.select(&[ino]).await.unwrap();
    while let Ok(trigger) = fx.triggers.try_recv() {
        fx.engine
            .reconcile_path(&trigger.path, trigger.reason)
            .await
            .unwrap();
    }

    let tmp = crate::sync::paths::transfer_tmp_path(&fx.mirror("/big.bin"));
    let source = fx.source("/big.bin");
    let edit = async {
        for _ in 0..5_000 {
            if tmp.exists() {
                std::fs::write(&source, b"edited while copying").unwrap();
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    };
    let (processed, saw_tmp) = tokio::join!(fx.worker.run_once(), edit);
    assert!(processed.unwrap());
    assert!(saw_tmp, "copy finished before the edit");

    // The watcher reports the edit as well.
    fx.touch("/big.bin").await;
    assert_eq!(
        std::fs::read(fx.mirror("/big.bin")).unwrap(),
        b"edited while copying"
    );
    assert_eq!(fx.status("/big.bin").await, "synced");
    assert_no_tmp_files(&fx.roots.mirror);
}

#[tokio::test]
async fn failed_planning_does_not_leave_entry_pending() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"data").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    while let Ok(trigger) = fx.triggers.try_recv() {
        fx.engine
            .reconcile_path(&trigger.path, trigger.reason)
            .await
            .unwrap();
    }
    assert_eq!(fx.status("/a.txt").await, "copying");

    // A mirror root that loops onto itself makes every lookup below it fail.
    std::fs::remove_dir(&fx.roots.mirror).unwrap();
    std::os::unix::fs::symlink(&fx.roots.mirror, &fx.roots.mirror).unwrap();
    assert!(fx.worker.run_once().await.is_err());

    let record = fx.engine.index().get_entry_by_path("/a.txt").await.unwrap().unwrap();
    assert_eq!(record.pending_action, None);
    assert_eq!(record.active_since, None);
    assert_ne!(fx.status("/a.txt").await, "copying");

    std::fs::remove_file(&fx.roots.mirror).unwrap();
    std::fs::create_dir(&fx.roots.mirror).unwrap();
    std::fs::remove_file(fx.source("/a.txt")).unwrap();
    fx.touch("/a.txt").await;
    assert!(fx.engine.list_entries(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn reconcile_clears_pending_action_nobody_will_run() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"data").unwrap();
    fx.scan().await;
    fx.engine
        .index()
        .set_pending("/a.txt", Some(ActionKind::CopyToMirror))
        .await
        .unwrap();
    assert_eq!(fx.status("/a.txt").await, "copying");

    fx.touch("/a.txt").await;
    assert_eq!(fx.status("/a.txt").await, "archived");
}

#[tokio::test]
async fn vanished_source_with_queued_copy_is_forgotten() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"data").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    while let Ok(trigger) = fx.triggers.try_recv() {
        fx.engine
            .reconcile_path(&trigger.path, trigger.reason)
            .await
            .unwrap();
    }

    std::fs::remove_file(fx.source("/a.txt")).unwrap();
    fx.touch("/a.txt").await;
    assert!(fx.engine.list_entries(None).await.unwrap().is_empty());
    assert!(!fx.mirror("/a.txt").exists());
}

#[tokio::test]
async fn non_utf8_names_are_skipped() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let mut fx = fixture().await;
    let odd = fx.roots.source.join(OsStr::from_bytes(b"caf\xe9.txt"));
    std::fs::write(&odd, b"latin-1").unwrap();
    std::fs::write(fx.source("/plain.txt"), b"ok").unwrap();
    fx.scan().await;

    let paths: Vec<String> = fx
        .engine
        .list_entries(None)
        .await
        .unwrap()
        .into_iter()
        .map(|view| view.path)
        .collect();
    assert_eq!(paths, vec!["/plain.txt".to_string()]);
    assert_eq!(std::fs::read(&odd).unwrap(), b"latin-1");
}

#[tokio::test]
async fn symlinks_are_neither_listed_nor_followed() {
    let mut fx = fixture().await;
    std::fs::create_dir_all(fx.source("/real")).unwrap();
    std::fs::write(fx.source("/real/a.txt"), b"a").unwrap();
    std::os::unix::fs::symlink("real", fx.source("/link")).unwrap();
    std::os::unix::fs::symlink("real/a.txt", fx.source("/a-link.txt")).unwrap();
    std::os::unix::fs::symlink("/nowhere", fx.mirror("/m-link")).unwrap();
    fx.scan().await;

    let mut paths: Vec<String> = fx
        .engine
        .list_entries(None)
        .await
        .unwrap()
        .into_iter()
        .map(|view| view.path)
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["/real".to_string(), "/real/a.txt".to_string()]);

    let real = fx.ino("/real").await;
    fx.engine.select(&[real]).await.unwrap();
    fx.settle().await;
    assert_eq!(std::fs::read(fx.mirror("/real/a.txt")).unwrap(), b"a");
    assert!(std::fs::symlink_metadata(fx.mirror("/link")).is_err());
    assert!(std::fs::symlink_metadata(fx.source("/m-link")).is_err());
    assert!(
        std::fs::symlink_metadata(fx.mirror("/m-link"))
            .unwrap()
            .file_type()
            .is_symlink()
    );
}

#[tokio::test]
async fn selecting_a_synced_entry_queues_nothing() {
    let mut fx = fixture().await;
    std::fs::write(fx.source("/a.txt"), b"steady").unwrap();
    fx.scan().await;
    let ino = fx.ino("/a.txt").await;
    fx.engine.select(&[ino]).await.unwrap();
    fx.settle().await;
    assert_eq!(fx.status("/a.txt").await, "synced");
    let before = stat(&fx.mirror("/a.txt")).await.unwrap().unwrap();

    assert_eq!(fx.engine.select(&[ino]).await.unwrap(), 1);
    while let Ok(trigger) = fx.triggers.try_recv() {
        let action = fx
            .engine
            .reconcile_path(&trigger.path, trigger.reason)
            .await
            .unwrap();
        assert_eq!(action, None, "unexpected action for {}", trigger.path);
    }
    assert!(!fx.worker.run_once().await.unwrap());

    let after = stat(&fx.mirror("/a.txt")).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(fx.status("/a.txt").await, "synced");
}
