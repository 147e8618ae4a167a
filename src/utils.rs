use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

/// Creates `path` and any missing parents. Does nothing if it already exists.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path)
            .await
            .with_context(|| format!("failed to create directory {:?}", path))?;
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// Reads a JSON file. `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        debug!("No file at {:?}", path);
        return Ok(None);
    }
    let json = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;
    let value =
        serde_json::from_str(&json).with_context(|| format!("malformed JSON in {:?}", path))?;
    Ok(Some(value))
}

/// Writes `value` as pretty JSON, replacing `path` through a temporary file
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, json)
        .await
        .with_context(|| format!("failed to write {:?}", staging))?;
    fs::rename(&staging, path).await?;
    Ok(())
}
