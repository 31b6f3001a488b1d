fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

async fn sweep_trees(roots: &TreeRoots) -> anyhow::Result<usize> {
    let roots = roots.clone();
    let removed = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
        Ok(sweep_tmp_files(&roots.source)? + sweep_tmp_files(&roots.mirror)?)
    })
    .await
    .context("temp file sweep panicked")?
    .context("failed to sweep temp files")?;
    Ok(removed)
}

/// Statuses that differ from the last poll; entries that disappeared are
/// dropped from `known` silently.
fn status_changes(known: &mut HashMap<String, String>, views: &[EntryView]) -> Vec<(String, String)> {
    let mut changed = Vec::new();
    let mut current = HashMap::with_capacity(views.len());
    for view in views {
        if known.get(&view.path) != Some(&view.status) {
            changed.push((view.path.clone(), view.status.clone()));
        }
        current.insert(view.path.clone(), view.status.clone());
    }
    *known = current;
    changed
}
