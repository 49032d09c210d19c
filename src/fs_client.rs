//! A [`BundleClient`] backed by two local directories: a source directory
//! standing in for the remote bundle host, and the local bundle store.
//!
//! Bundles are directories `source_dir/<id>/`. Making a bundle local copies
//! it chunk by chunk into `local_dir/.<id>.part/` and renames the directory
//! to `local_dir/<id>/` once complete, so a bundle directory in the store is
//! always whole.

use async_trait::async_trait;
use futures_util::stream;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::{BundleClient, ClientError, StatusStream};
use crate::config::StoreConfig;
use crate::limiter::SpeedLimiter;
use crate::models::{BundleId, BundleMetadata, StatusEvent};

pub struct FsBundleClient {
    source_dir: PathBuf,
    local_dir: PathBuf,
    chunk_size: usize,
    status_buffer: usize,
    limiter: SpeedLimiter,
    channels: Mutex<HashMap<BundleId, broadcast::Sender<StatusEvent>>>,
}

impl FsBundleClient {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            source_dir: config.source_dir.clone(),
            local_dir: config.local_dir.clone(),
            chunk_size: config.chunk_size.max(1),
            status_buffer: config.status_buffer.max(1),
            limiter: SpeedLimiter::new(config.rate_limit_bytes_per_sec),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    fn channel(&self, id: &BundleId) -> broadcast::Sender<StatusEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(self.status_buffer).0)
            .clone()
    }

    fn emit(&self, id: &BundleId, event: StatusEvent) {
        // No receivers is fine; nobody is watching this bundle.
        let _ = self.channel(id).send(event);
    }

    async fn transfer(&self, metadata: &BundleMetadata, part_dir: &Path) -> Result<(), ClientError> {
        let id = &metadata.id;
        let source = self.source_dir.join(id.as_str());
        let files = collect_files(&source).await?;
        let total: u64 = files.iter().map(|(_, len)| *len).sum();

        if fs::try_exists(part_dir).await? {
            fs::remove_dir_all(part_dir).await?;
        }
        fs::create_dir_all(part_dir).await?;

        self.emit(id, StatusEvent::Began);
        let mut copied = 0u64;
        let mut buffer = vec![0u8; self.chunk_size];
        for (relative, _) in &files {
            let target = part_dir.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut reader = File::open(source.join(relative)).await?;
            let mut writer = File::create(&target).await?;
            loop {
                let n = reader.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                self.limiter.take(n as u64).await;
                writer.write_all(&buffer[..n]).await?;
                copied += n as u64;
                if total > 0 {
                    self.emit(id, StatusEvent::Downloading(copied as f64 / total as f64));
                }
            }
            writer.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BundleClient for FsBundleClient {
    async fn fetch_metadata(&self, id: &BundleId) -> Result<BundleMetadata, ClientError> {
        let source = self.source_dir.join(checked_relative(id.as_str())?);
        match fs::metadata(&source).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(ClientError::NotFound(id.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ClientError::NotFound(id.to_string()))
            }
            Err(e) => return Err(ClientError::Network(e.to_string())),
        }

        let files = collect_files(&source)
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let size: u64 = files.iter().map(|(_, len)| *len).sum();
        let mut metadata = BundleMetadata::new(id.clone()).with_size(size);
        if let [(only, _)] = files.as_slice() {
            metadata = metadata.with_content_path(format!("{}/{}", id, path_to_slash(only)));
        }
        Ok(metadata)
    }

    async fn ensure_local_availability(&self, metadata: &BundleMetadata) -> Result<(), ClientError> {
        let id = &metadata.id;
        let target = self.local_dir.join(checked_relative(id.as_str())?);
        if fs::try_exists(&target).await? {
            debug!(bundle = %id, "already local");
            self.emit(id, StatusEvent::Finished);
            return Ok(());
        }

        let part_dir = self.local_dir.join(format!(".{}.part", id));
        info!(bundle = %id, "transferring bundle into {}", self.local_dir.display());
        match self.transfer(metadata, &part_dir).await {
            Ok(()) => {
                fs::rename(&part_dir, &target).await?;
                self.emit(id, StatusEvent::Finished);
                Ok(())
            }
            Err(e) => {
                warn!(bundle = %id, "transfer failed: {}", e);
                let _ = fs::remove_dir_all(&part_dir).await;
                self.emit(id, StatusEvent::Failed(e.to_string()));
                Err(match e {
                    ClientError::Io(io) => ClientError::Storage(io.to_string()),
                    other => other,
                })
            }
        }
    }

    async fn read_content(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        let full = self.local_dir.join(checked_relative(path)?);
        match fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ClientError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn status_updates(&self, id: &BundleId) -> StatusStream {
        let rx = self.channel(id).subscribe();
        Box::pin(stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let next = if event.is_terminal() { None } else { Some(rx) };
                        return Some((event, next));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "status subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }

    async fn remove(&self, id: &BundleId) -> Result<(), ClientError> {
        let target = self.local_dir.join(checked_relative(id.as_str())?);
        match fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rejects absolute paths and parent traversal.
fn checked_relative(path: &str) -> Result<&Path, ClientError> {
    let candidate = Path::new(path);
    let normal = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if normal {
        Ok(candidate)
    } else {
        Err(ClientError::NotFound(path.to_string()))
    }
}

fn path_to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Regular files under `root`, relative to it, sorted, with their sizes.
async fn collect_files(root: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let mut entries = fs::read_dir(root.join(&relative)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            let path = relative.join(entry.file_name());
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() {
                files.push((path, entry.metadata().await?.len()));
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tempfile::TempDir;

    async fn fixture(files: &[(&str, &[u8])]) -> (TempDir, FsBundleClient) {
        let dir = TempDir::new().unwrap();
        for (path, data) in files {
            let full = dir.path().join("remote").join(path);
            fs::create_dir_all(full.parent().unwrap()).await.unwrap();
            fs::write(full, data).await.unwrap();
        }
        let config = StoreConfig {
            source_dir: dir.path().join("remote"),
            local_dir: dir.path().join("local"),
            chunk_size: 4,
            ..StoreConfig::default()
        };
        (dir, FsBundleClient::new(&config))
    }

    #[tokio::test]
    async fn metadata_of_single_file_bundle_names_its_content() {
        let (_dir, client) = fixture(&[("Essential/image1.jpg", b"jpeg-bytes")]).await;
        let metadata = client.fetch_metadata(&"Essential".into()).await.unwrap();
        assert_eq!(metadata.size_bytes, Some(10));
        assert_eq!(metadata.content_path.as_deref(), Some("Essential/image1.jpg"));
    }

    #[tokio::test]
    async fn unknown_bundle_is_not_found() {
        let (_dir, client) = fixture(&[]).await;
        let err = client.fetch_metadata(&"Missing".into()).await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn transfer_reports_progress_and_makes_content_readable() {
        let (_dir, client) = fixture(&[("OnDemand/image3.jpg", b"0123456789abcdef")]).await;
        let id = BundleId::from("OnDemand");
        let metadata = client.fetch_metadata(&id).await.unwrap();

        let events = client.status_updates(&id);
        client.ensure_local_availability(&metadata).await.unwrap();
        let events: Vec<_> = events.collect().await;

        assert_eq!(events.first(), Some(&StatusEvent::Began));
        assert_eq!(events.last(), Some(&StatusEvent::Finished));
        let fractions: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                StatusEvent::Downloading(f) => Some(*f),
                _ => None,
            })
            .collect();
        assert_eq!(fractions, vec![0.25, 0.5, 0.75, 1.0]);

        let bytes = client.read_content("OnDemand/image3.jpg").await.unwrap();
        assert_eq!(bytes, b"0123456789abcdef");
    }

    #[tokio::test]
    async fn already_local_bundle_is_not_copied_again() {
        let (_dir, client) = fixture(&[("Prefetch/a.bin", b"abc")]).await;
        let metadata = client.fetch_metadata(&"Prefetch".into()).await.unwrap();
        client.ensure_local_availability(&metadata).await.unwrap();
        fs::write(client.local_dir().join("Prefetch/a.bin"), b"changed").await.unwrap();

        client.ensure_local_availability(&metadata).await.unwrap();
        assert_eq!(client.read_content("Prefetch/a.bin").await.unwrap(), b"changed");
    }

    #[tokio::test]
    async fn already_local_bundle_closes_its_status_stream() {
        let (_dir, client) = fixture(&[("Prefetch/a.bin", b"abc")]).await;
        let metadata = client.fetch_metadata(&"Prefetch".into()).await.unwrap();
        client.ensure_local_availability(&metadata).await.unwrap();

        let events = client.status_updates(&"Prefetch".into());
        client.ensure_local_availability(&metadata).await.unwrap();
        let seen: Vec<_> = tokio::time::timeout(std::time::Duration::from_secs(5), events.collect())
            .await
            .unwrap();
        assert_eq!(seen, vec![StatusEvent::Finished]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, client) = fixture(&[("OnDemand/x", b"x")]).await;
        let id = BundleId::from("OnDemand");
        let metadata = client.fetch_metadata(&id).await.unwrap();
        client.ensure_local_availability(&metadata).await.unwrap();

        client.remove(&id).await.unwrap();
        client.remove(&id).await.unwrap();
        assert!(matches!(
            client.read_content("OnDemand/x").await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let (_dir, client) = fixture(&[]).await;
        assert!(client.read_content("../secret").await.is_err());
        assert!(client.read_content("/etc/passwd").await.is_err());
    }
}
