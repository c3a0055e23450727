//! Shared utility functions for the cadre crate.

use anyhow::{Context, Result};
use std::path::Path;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write a file atomically: write to `<path>.tmp`, fsync, then rename over
/// the destination. Readers never observe a partially-written file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let tmp = {
        let mut os = path.as_os_str().to_os_string();
        os.push(".tmp");
        std::path::PathBuf::from(os)
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("Failed to create temp file {}", tmp.display()))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to fsync {}", tmp.display()))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}
