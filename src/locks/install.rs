//! Where runtime archives come from, and how they land on disk.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::{Error, InstallConfig, Result};

/// Supplies the zip archive for a runtime version.
#[async_trait]
pub trait InstallSource: Send + Sync {
    async fn fetch(&self, version: &str) -> Result<Bytes>;
}

/// Downloads `<template with {version}>` over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpInstallSource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpInstallSource {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl InstallSource for HttpInstallSource {
    async fn fetch(&self, version: &str) -> Result<Bytes> {
        let url = self.url_template.replace("{version}", version);
        tracing::info!(%url, "downloading runtime");

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        tracing::debug!(%url, bytes = body.len(), "runtime download complete");
        Ok(body.freeze())
    }
}

/// Reads `<template with {version}>` from the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalArchiveSource {
    path_template: String,
}

impl LocalArchiveSource {
    pub fn new(path_template: impl Into<String>) -> Self {
        Self {
            path_template: path_template.into(),
        }
    }
}

#[async_trait]
impl InstallSource for LocalArchiveSource {
    async fn fetch(&self, version: &str) -> Result<Bytes> {
        let path = PathBuf::from(self.path_template.replace("{version}", version));
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::unavailable(
                format!("no runtime archive at {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Source used when no download template is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredSource;

#[async_trait]
impl InstallSource for UnconfiguredSource {
    async fn fetch(&self, version: &str) -> Result<Bytes> {
        Err(Error::unavailable(format!(
            "cannot install {}: install.download_url_template is not configured",
            version
        )))
    }
}

/// Pick the source implied by `download_url_template`.
pub fn source_from_config(config: &InstallConfig) -> Arc<dyn InstallSource> {
    let template = config.download_url_template.trim();
    if template.is_empty() {
        return Arc::new(UnconfiguredSource);
    }
    if let Some(path) = template.strip_prefix("file://") {
        return Arc::new(LocalArchiveSource::new(path));
    }
    if template.contains("://") {
        Arc::new(HttpInstallSource::new(template))
    } else {
        Arc::new(LocalArchiveSource::new(template))
    }
}

/// Replace `dir` with the contents of `archive` and write the version marker.
pub(crate) fn extract_into(archive: Bytes, dir: &Path, marker: &str, version: &str) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    zip.extract(dir)?;
    std::fs::write(dir.join(marker), version)?;
    Ok(())
}

/// Version recorded in an install directory, if any.
pub(crate) fn read_marker(dir: &Path, marker: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(marker))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
