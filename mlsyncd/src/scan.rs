use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use mlsync_core::{ItemMetadata, MediaKind};
use thiserror::Error;
use time::OffsetDateTime;

use crate::sync::index::{IndexError, IndexStore, LocalItemInput};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("media root does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Default)]
pub struct ScanSummary {
    /// Items seen for the first time.
    pub registered: Vec<ItemMetadata>,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl ScanSummary {
    pub fn changed(&self) -> bool {
        !self.registered.is_empty() || self.updated > 0 || self.removed > 0
    }
}

/// Walks `root` and mirrors its media files into `local_items` for `owner_id`.
///
/// Hidden entries and symlinks are skipped. Files whose size or mtime changed
/// lose their processing record so the next run reindexes them; rows whose
/// file disappeared are deleted.
pub async fn scan_media_root(
    store: &IndexStore,
    owner_id: i64,
    root: &Path,
) -> Result<ScanSummary, ScanError> {
    if !tokio::fs::try_exists(root).await.map_err(|source| ScanError::Io {
        path: root.to_path_buf(),
        source,
    })? {
        return Err(ScanError::MissingRoot(root.to_path_buf()));
    }

    let mut summary = ScanSummary::default();
    let mut seen = HashSet::new();
    for input in collect_media_files(owner_id, root).await? {
        let key = input.local_path.to_string_lossy().into_owned();
        let existing = store.get_local_item_by_path(&key).await?;
        seen.insert(key);
        match existing {
            None => {
                let item = store.upsert_local_item(&input).await?;
                tracing::debug!(item_id = %item.id, path = %input.local_path.display(), "registered media file");
                summary.registered.push(item);
            }
            Some(item) if item.size != input.size || item.modified != input.modified => {
                store.upsert_local_item(&input).await?;
                store.reset_processing(item.id).await?;
                summary.updated += 1;
            }
            Some(_) => summary.unchanged += 1,
        }
    }

    for item in store.list_local_items(owner_id).await? {
        let still_present = item
            .local_path
            .as_ref()
            .is_some_and(|path| seen.contains(&*path.to_string_lossy()));
        if !still_present {
            store.delete_local_item(item.id).await?;
            summary.removed += 1;
        }
    }

    tracing::info!(
        root = %root.display(),
        registered = summary.registered.len(),
        updated = summary.updated,
        unchanged = summary.unchanged,
        removed = summary.removed,
        "media scan finished"
    );
    Ok(summary)
}

async fn collect_media_files(
    owner_id: i64,
    root: &Path,
) -> Result<Vec<LocalItemInput>, ScanError> {
    let mut found = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let io_err = |source: std::io::Error| ScanError::Io {
            path: dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err)?;
            if file_type.is_dir() {
                dirs.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let Some(kind) = MediaKind::from_path(&path) else {
                continue;
            };
            let metadata = entry.metadata().await.map_err(io_err)?;
            found.push(LocalItemInput {
                owner_id,
                title: name.to_string_lossy().into_owned(),
                kind,
                size: i64::try_from(metadata.len()).ok(),
                modified: metadata.modified().ok().map(unix_seconds),
                local_path: path,
            });
        }
    }
    found.sort_by(|a, b| a.local_path.cmp(&b.local_path));
    Ok(found)
}

fn unix_seconds(at: SystemTime) -> i64 {
    OffsetDateTime::from(at).unix_timestamp()
}
