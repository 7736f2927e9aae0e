//! One-time download of the published LPIPS weight asset.
//!
//! Construction-time plumbing, not a hot path: the asset is fetched once and
//! cached on disk, subsequent calls are a pure existence check.

use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to fetch weight asset: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to store weight asset: {0}")]
    Io(#[from] std::io::Error),
}

/// Makes sure the weight asset at `local_path` exists, fetching it from
/// `remote_url` if it doesn't.
///
/// Idempotent: an existing file is trusted as-is and the remote store is
/// never contacted. On any failure the asset is left absent and the error
/// propagates; there is no retry and no degraded mode.
pub async fn ensure_weights_available(
    local_path: &Path,
    remote_url: &str,
) -> Result<(), DownloadError> {
    if local_path.exists() {
        log::debug!("weight asset already cached at {}", local_path.display());
        return Ok(());
    }

    if let Some(parent) = local_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    log::info!("fetching weight asset from {remote_url}");
    let response = reqwest::get(remote_url).await?.error_for_status()?;
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let mut reader = StreamReader::new(stream);

    // Stage under a temporary name so a partial download never passes the
    // existence check above.
    let staging = local_path.with_extension("part");
    let mut file = tokio::fs::File::create(&staging).await?;
    let streamed = async {
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = streamed {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(err.into());
    }
    tokio::fs::rename(&staging, local_path).await?;

    log::info!("cached weight asset at {}", local_path.display());
    Ok(())
}
