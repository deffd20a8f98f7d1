use crate::error::{IoContext, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Keep the `retain_count` most recently modified files in `archive_dir`
/// and delete the rest. Deletion is best-effort: a file that cannot be
/// removed is reported and the remaining deletions still run.
pub fn enforce(archive_dir: &Path, retain_count: usize) -> Result<RetentionReport> {
    let mut archives = list_archives(archive_dir)?;
    // newest first; equal mtimes fall back to the name, highest first
    archives.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut report = RetentionReport::default();
    for (index, (path, _)) in archives.into_iter().enumerate() {
        if index < retain_count {
            report.kept.push(path);
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Deleted old archive {}", path.display());
                report.deleted.push(path);
            }
            Err(e) => {
                log::warn!("Failed to delete old archive {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }
    Ok(report)
}

fn list_archives(archive_dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>> {
    let entries = fs::read_dir(archive_dir)
        .io_context(|| format!("failed to list {}", archive_dir.display()))?;

    let mut archives = Vec::new();
    for entry in entries {
        let entry = entry.io_context(|| format!("failed to list {}", archive_dir.display()))?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            // removed between listing and stat
            Err(e) => {
                log::debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .io_context(|| format!("failed to read mtime of {}", entry.path().display()))?;
        archives.push((entry.path(), modified));
    }
    Ok(archives)
}
