//! Challenge directory scan used to seed the session state.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::state::FileEntry;

/// List regular files under `root`, sorted by relative path, at most `max_files`.
///
/// Symlinks are not followed; unreadable entries are skipped with a warning.
pub fn scan_inventory(root: &Path, max_files: usize) -> Result<Vec<FileEntry>> {
    debug!(root = %root.display(), max_files, "scanning challenge inventory");
    if !root.is_dir() {
        anyhow::bail!("challenge root is not a directory: {}", root.display());
    }

    let mut entries = Vec::new();
    let mut capped = false;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(err = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entries.len() >= max_files {
            capped = true;
            break;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("strip prefix {}", entry.path().display()))?;
        let size = entry.metadata().map(|meta| meta.len()).unwrap_or_default();
        entries.push(FileEntry {
            path: relative_display(relative),
            size,
            extension: relative
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
        });
    }

    if capped {
        warn!(max_files, "inventory capped");
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(files = entries.len(), "inventory scanned");
    Ok(entries)
}

/// `/`-joined relative path regardless of host separator.
pub fn relative_display(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// One path per line, the form `list_files` reports.
pub fn render_listing(entries: &[FileEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.path);
        out.push('\n');
    }
    out
}
