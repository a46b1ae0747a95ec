async fn read_raw_bytes(item: &ItemMetadata, max_bytes: u64) -> Option<Vec<u8>> {
    let path = item.local_path.as_ref()?;
    let size = u64::try_from(item.size?).ok()?;
    if size > max_bytes {
        tracing::debug!(item_id = %item.id, size, "file too large to upload, indexing metadata only");
        return None;
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::warn!(item_id = %item.id, path = %path.display(), error = %err, "failed to read media file");
            None
        }
    }
}

fn default_user_agent() -> String {
    format!("mlsyncd/{}", env!("CARGO_PKG_VERSION"))
}

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

fn read_i64_env(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
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
