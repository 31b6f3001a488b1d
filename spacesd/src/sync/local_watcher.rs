use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::paths::{Tree, TreeRoots, ancestors, is_transfer_tmp};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// How much the platform tells us about renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenameSupport {
    /// Both sides of a rename arrive as unrelated changed paths.
    PathOnly,
    /// Renames also arrive as `(from, to)` pairs.
    #[default]
    LinkedPair,
}

impl RenameSupport {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "path" | "path_only" | "pathonly" => Some(RenameSupport::PathOnly),
            "linked" | "linked_pair" | "linkedpair" => Some(RenameSupport::LinkedPair),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
    Path {
        tree: Tree,
        path: String,
    },
    Renamed {
        tree: Tree,
        from: String,
        to: String,
    },
    RenameFrom {
        tree: Tree,
        path: String,
        cookie: usize,
    },
    RenameTo {
        tree: Tree,
        path: String,
        cookie: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePair {
    pub from: String,
    pub to: String,
}

/// One debounced burst: every affected path plus its ancestors, and the
/// source-tree renames seen in the burst (LinkedPair only).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub paths: Vec<String>,
    pub renames: Vec<RenamePair>,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    pub settle: Duration,
    pub max_settle_windows: u32,
    pub rename_support: RenameSupport,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(300),
            max_settle_windows: 10,
            rename_support: RenameSupport::LinkedPair,
        }
    }
}

pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    debouncer: JoinHandle<()>,
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.debouncer.abort();
    }
}

pub fn start_notify_watcher(
    roots: &TreeRoots,
    config: WatchConfig,
) -> Result<(LocalWatcher, mpsc::UnboundedReceiver<WatchBatch>), WatchError> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (batch_tx, batch_rx) = mpsc::unbounded_channel();
    let watch_roots = roots.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in map_event(&watch_roots, event) {
                let _ = raw_tx.send(change);
            }
        }
        Err(err) => tracing::warn!(error = %err, "watch event error"),
    })?;
    watcher.watch(&roots.source, RecursiveMode::Recursive)?;
    watcher.watch(&roots.mirror, RecursiveMode::Recursive)?;
    let debouncer = tokio::spawn(run_debouncer(raw_rx, batch_tx, config));
    Ok((
        LocalWatcher {
            _watcher: watcher,
            debouncer,
        },
        batch_rx,
    ))
}

pub fn map_event(roots: &TreeRoots, event: Event) -> Vec<RawChange> {
    let cookie = event.attrs.tracker();
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => map_rename(roots, mode, cookie, &event.paths),
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| classify(roots, path))
            .map(|(tree, path)| RawChange::Path { tree, path })
            .collect(),
        _ => Vec::new(),
    }
}

fn map_rename(
    roots: &TreeRoots,
    mode: RenameMode,
    cookie: Option<usize>,
    paths: &[std::path::PathBuf],
) -> Vec<RawChange> {
    if mode == RenameMode::Both && paths.len() >= 2 {
        return match (classify(roots, &paths[0]), classify(roots, &paths[1])) {
            (Some((from_tree, from)), Some((to_tree, to))) if from_tree == to_tree => {
                vec![RawChange::Renamed {
                    tree: from_tree,
                    from,
                    to,
                }]
            }
            (from, to) => from
                .into_iter()
                .chain(to)
                .map(|(tree, path)| RawChange::Path { tree, path })
                .collect(),
        };
    }

    let mut out = Vec::new();
    for (tree, path) in paths.iter().filter_map(|path| classify(roots, path)) {
        let change = match (mode, cookie) {
            (RenameMode::From, Some(cookie)) => RawChange::RenameFrom { tree, path, cookie },
            (RenameMode::To, Some(cookie)) => RawChange::RenameTo { tree, path, cookie },
            _ => RawChange::Path { tree, path },
        };
        out.push(change);
    }
    out
}

fn classify(roots: &TreeRoots, path: &Path) -> Option<(Tree, String)> {
    if is_transfer_tmp(path) {
        return None;
    }
    roots.classify(path)
}

/// Accumulates raw changes into one batch.
#[derive(Debug)]
pub struct BatchBuilder {
    rename_support: RenameSupport,
    paths: BTreeSet<String>,
    renames: Vec<RenamePair>,
    half_renames: HashMap<usize, (Tree, String)>,
}

impl BatchBuilder {
    pub fn new(rename_support: RenameSupport) -> Self {
        Self {
            rename_support,
            paths: BTreeSet::new(),
            renames: Vec::new(),
            half_renames: HashMap::new(),
        }
    }

    fn add_path(&mut self, path: String) {
        if path == "/" {
            return;
        }
        for ancestor in ancestors(&path) {
            self.paths.insert(ancestor);
        }
        self.paths.insert(path);
    }

    fn add_rename(&mut self, tree: Tree, from: String, to: String) {
        if self.rename_support == RenameSupport::LinkedPair && tree == Tree::Source {
            let pair = RenamePair {
                from: from.clone(),
                to: to.clone(),
            };
            if !self.renames.contains(&pair) {
                self.renames.push(pair);
            }
        }
        self.add_path(from);
        self.add_path(to);
    }

    pub fn push(&mut self, change: RawChange) {
        match change {
            RawChange::Path { path, .. } => self.add_path(path),
            RawChange::Renamed { tree, from, to } => self.add_rename(tree, from, to),
            RawChange::RenameFrom { tree, path, cookie } => {
                self.half_renames.insert(cookie, (tree, path.clone()));
                self.add_path(path);
            }
            RawChange::RenameTo { tree, path, cookie } => match self.half_renames.remove(&cookie) {
                Some((from_tree, from)) if from_tree == tree => self.add_rename(tree, from, path),
                _ => self.add_path(path),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn take(&mut self) -> Option<WatchBatch> {
        self.half_renames.clear();
        if self.paths.is_empty() {
            self.renames.clear();
            return None;
        }
        Some(WatchBatch {
            paths: std::mem::take(&mut self.paths).into_iter().collect(),
            renames: std::mem::take(&mut self.renames),
        })
    }
}

/// Flushes a batch once the stream has been quiet for one settle window,
/// or after `max_settle_windows` windows of continuous activity.
pub async fn run_debouncer(
    mut raw: mpsc::UnboundedReceiver<RawChange>,
    batches: mpsc::UnboundedSender<WatchBatch>,
    config: WatchConfig,
) {
    let settle = config.settle.max(Duration::from_millis(1));
    let hard_cap = settle * config.max_settle_windows.max(1);
    let mut builder = BatchBuilder::new(config.rename_support);

    while let Some(first) = raw.recv().await {
        builder.push(first);
        let started = Instant::now();
        let mut closed = false;
        loop {
            let remaining = hard_cap.saturating_sub(started.elapsed());
            let wait = settle.min(remaining);
            if wait.is_zero() {
                break;
            }
            match tokio::time::timeout(wait, raw.recv()).await {
                Ok(Some(change)) => builder.push(change),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if let Some(batch) = builder.take() {
            tracing::debug!(paths = batch.paths.len(), renames = batch.renames.len(), "watch batch");
            if batches.send(batch).is_err() {
                return;
            }
        }
        if closed {
            return;
        }
    }
}
