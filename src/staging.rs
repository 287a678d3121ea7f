//! Attachment staging.
//!
//! Uploaded parts are written under a directory unique to one request
//! (`{root}/{uuid}/`), handed to the composer as [`AttachmentRef`]s and
//! reclaimed exactly once. [`StagedAttachments`] owns the staged set: it is
//! released explicitly by the reconciler and, on any path that skips that
//! (panic, early return), from its `Drop` impl.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::submission::UploadedPart;
use crate::error::StagingError;

/// Staging area configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Root directory for request-scoped staging directories
    pub dir: PathBuf,

    /// Maximum bytes one request may stage (None = unlimited)
    pub max_request_bytes: Option<u64>,

    /// Request directories older than this are removed by [`Stager::sweep_stale`]
    pub stale_after_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("fieldlog-uploads"),
            max_request_bytes: Some(200 * 1024 * 1024),
            stale_after_secs: 3600,
        }
    }
}

/// A staged attachment, as handed to the composer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRef {
    /// Name shown to the recipient
    pub original_name: String,
    /// Where the bytes live until release
    pub location: PathBuf,
    pub size_bytes: u64,
    pub content_type: String,
}

/// Result of a release call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseReport {
    /// Files deleted by this call
    pub removed: usize,
    /// Files that were already gone
    pub already_absent: usize,
    /// Files that could not be deleted
    pub failed: usize,
}

impl ReleaseReport {
    fn merge(&mut self, other: ReleaseReport) {
        self.removed += other.removed;
        self.already_absent += other.already_absent;
        self.failed += other.failed;
    }
}

/// Lifetime counters for the staging area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagingStats {
    pub files_staged: u64,
    pub files_released: u64,
    pub bytes_staged: u64,
}

#[derive(Debug, Default)]
struct StagingCounters {
    files_staged: AtomicU64,
    files_released: AtomicU64,
    bytes_staged: AtomicU64,
}

/// Where staged bytes are written.
#[async_trait]
pub trait StagingWriter: fmt::Debug + Send + Sync + 'static {
    async fn write(&self, path: &Path, data: &[u8]) -> std::io::Result<()>;
}

/// Writes staged files to the local filesystem.
#[derive(Debug, Default)]
pub struct FsWriter;

#[async_trait]
impl StagingWriter for FsWriter {
    async fn write(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(path, data).await
    }
}

#[derive(Debug)]
struct StagerInner {
    root: PathBuf,
    max_request_bytes: Option<u64>,
    writer: Arc<dyn StagingWriter>,
    counters: StagingCounters,
}

/// Writes uploads to request-scoped directories and reclaims them.
#[derive(Debug, Clone)]
pub struct Stager {
    inner: Arc<StagerInner>,
}

impl Stager {
    pub fn new(config: &StagingConfig) -> Self {
        Self::with_writer(config, Arc::new(FsWriter))
    }

    pub fn with_writer(config: &StagingConfig, writer: Arc<dyn StagingWriter>) -> Self {
        Self {
            inner: Arc::new(StagerInner {
                root: config.dir.clone(),
                max_request_bytes: config.max_request_bytes,
                writer,
                counters: StagingCounters::default(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn stats(&self) -> StagingStats {
        let c = &self.inner.counters;
        StagingStats {
            files_staged: c.files_staged.load(Ordering::Relaxed),
            files_released: c.files_released.load(Ordering::Relaxed),
            bytes_staged: c.bytes_staged.load(Ordering::Relaxed),
        }
    }

    /// Write every part to a fresh request directory.
    ///
    /// If any write fails, files already written by this call are released
    /// before the error is returned.
    pub async fn stage(&self, parts: Vec<UploadedPart>) -> Result<StagedAttachments, StagingError> {
        let request_dir = self.create_request_dir().await?;
        let mut staged = StagedAttachments {
            stager: self.clone(),
            dir: request_dir,
            refs: Vec::with_capacity(parts.len()),
            released: false,
        };

        let mut total_bytes: u64 = 0;
        for (i, part) in parts.into_iter().enumerate() {
            let display_name = part
                .file_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment_{}", i + 1));

            total_bytes += part.data.len() as u64;
            if let Some(limit) = self.inner.max_request_bytes.filter(|&l| total_bytes > l) {
                tracing::warn!(
                    dir = %staged.dir.display(),
                    limit,
                    "Staging quota exceeded, reclaiming partial upload"
                );
                staged.release().await;
                return Err(StagingError::QuotaExceeded { limit });
            }

            let path = staged.dir.join(format!(
                "{:02}-{}",
                i + 1,
                sanitize_path_component(&display_name)
            ));

            if let Err(source) = self.inner.writer.write(&path, &part.data).await {
                tracing::error!(
                    path = %path.display(),
                    error = %source,
                    "Failed to write staged attachment, reclaiming partial upload"
                );
                // The failed write may have left a truncated file behind
                let _ = tokio::fs::remove_file(&path).await;
                staged.release().await;
                return Err(StagingError::Write {
                    name: display_name,
                    source,
                });
            }

            let content_type = part
                .content_type
                .filter(|ct| !ct.is_empty() && ct != "application/octet-stream")
                .unwrap_or_else(|| detect_mime_type(&display_name, &part.data).to_string());

            self.inner.counters.files_staged.fetch_add(1, Ordering::Relaxed);
            self.inner
                .counters
                .bytes_staged
                .fetch_add(part.data.len() as u64, Ordering::Relaxed);

            staged.refs.push(AttachmentRef {
                original_name: display_name,
                location: path,
                size_bytes: part.data.len() as u64,
                content_type,
            });
        }

        tracing::debug!(
            dir = %staged.dir.display(),
            files = staged.refs.len(),
            bytes = total_bytes,
            "Staged attachments"
        );

        Ok(staged)
    }

    /// Delete the files behind `refs`.
    ///
    /// Idempotent: files that are already gone are counted as
    /// `already_absent`, never as errors. Only paths under this stager's root
    /// are touched.
    pub async fn release(&self, refs: &[AttachmentRef]) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for attachment in refs {
            if !attachment.location.starts_with(&self.inner.root) {
                tracing::warn!(
                    path = %attachment.location.display(),
                    "Refusing to release file outside staging root"
                );
                report.failed += 1;
                continue;
            }
            match tokio::fs::remove_file(&attachment.location).await {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.already_absent += 1,
                Err(e) => {
                    tracing::warn!(
                        path = %attachment.location.display(),
                        error = %e,
                        "Failed to release staged file"
                    );
                    report.failed += 1;
                }
            }
        }
        self.inner
            .counters
            .files_released
            .fetch_add(report.removed as u64, Ordering::Relaxed);
        report
    }

    /// Remove request directories older than `max_age`, left over by a crash.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize, StagingError> {
        let root = &self.inner.root;
        if !root.exists() {
            return Ok(0);
        }

        let entries = std::fs::read_dir(root).map_err(|source| StagingError::Sweep {
            path: root.clone(),
            source,
        })?;

        let now = SystemTime::now();
        let mut cleaned = 0;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() <= max_age {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => cleaned += 1,
                Err(e) => tracing::warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to remove stale staging directory"
                ),
            }
        }

        if cleaned > 0 {
            tracing::info!(cleaned, "Removed stale staging directories");
        }
        Ok(cleaned)
    }

    async fn create_request_dir(&self) -> Result<PathBuf, StagingError> {
        let root = &self.inner.root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| StagingError::CreateDir {
                path: root.clone(),
                source,
            })?;

        // create_dir (not create_dir_all) so a reused key is an error rather than a shared directory
        let dir = root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|source| StagingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }
}

/// The staged files of one submission.
///
/// Dropping this without calling [`StagedAttachments::release`] reclaims the
/// files synchronously, so staged bytes never outlive the submission.
#[derive(Debug)]
pub struct StagedAttachments {
    stager: Stager,
    dir: PathBuf,
    refs: Vec<AttachmentRef>,
    released: bool,
}

impl StagedAttachments {
    pub fn refs(&self) -> &[AttachmentRef] {
        &self.refs
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Release every staged file and the request directory.
    pub async fn release(mut self) -> ReleaseReport {
        self.released = true;
        let report = self.stager.release(&self.refs).await;
        match tokio::fs::remove_dir(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                dir = %self.dir.display(),
                error = %e,
                "Failed to remove staging directory"
            ),
        }
        report
    }

    fn release_blocking(&mut self) -> ReleaseReport {
        self.released = true;
        let mut report = ReleaseReport::default();
        for attachment in &self.refs {
            let mut single = ReleaseReport::default();
            match std::fs::remove_file(&attachment.location) {
                Ok(()) => single.removed = 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => single.already_absent = 1,
                Err(_) => single.failed = 1,
            }
            report.merge(single);
        }
        self.stager
            .inner
            .counters
            .files_released
            .fetch_add(report.removed as u64, Ordering::Relaxed);
        let _ = std::fs::remove_dir(&self.dir);
        report
    }
}

impl Drop for StagedAttachments {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let report = self.release_blocking();
        tracing::warn!(
            dir = %self.dir.display(),
            removed = report.removed,
            failed = report.failed,
            "Staged attachments released on drop"
        );
    }
}

/// Sanitize a path component to prevent directory traversal.
fn sanitize_path_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .take(128)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Detect a MIME type from magic bytes, falling back to the file extension.
fn detect_mime_type(filename: &str, data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return "image/png";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.starts_with(b"%PDF") {
        return "application/pdf";
    }

    match filename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "heic" => "image/heic",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "pdf" => "application/pdf",
            "txt" => "text/plain",
            "csv" => "text/csv",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}
