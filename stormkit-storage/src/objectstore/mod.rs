//! Object store adapter.
//!
//! A single capability set (`upload`, `get_file`, `delete_artifacts`) over
//! two backends picked at construction time from the location scheme:
//! `s3:<bucket>/<prefix>` or `local:<absolute-path>`.

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::{S3Config, S3Store};

use std::collections::HashMap;
use std::path::PathBuf;
use stormkit_core::DeploymentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("invalid location: {0}")]
    InvalidLocation(String),
}

/// Arguments for fetching a single deployment file.
#[derive(Debug, Clone)]
pub struct GetFileArgs {
    /// Tagged location URI from the app config.
    pub location: String,
    /// Manifest file name, e.g. `/some/url/index.html`.
    pub file_name: String,
    pub deployment_id: DeploymentId,
}

/// A fetched file. `None` from `get_file` means not-found so callers can
/// fall through to the 404 path.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub content: Vec<u8>,
    pub content_type: String,
    pub size: u64,
}

/// Artifact zips produced by the runner, ready for upload.
#[derive(Debug, Clone, Default)]
pub struct UploadArgs {
    pub app_id: u64,
    pub deployment_id: DeploymentId,
    pub client_zip: Option<PathBuf>,
    pub server_zip: Option<PathBuf>,
    pub api_zip: Option<PathBuf>,
    /// `file:handler` suffix for the serverless entry, e.g. `index.mjs:handler`.
    pub server_handler: String,
    pub api_handler: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOverview {
    pub bytes_uploaded: u64,
    pub files_uploaded: u64,
    /// Location the edge will use: a storage URI for client files, an ARN
    /// for server/api payloads.
    pub location: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadResult {
    pub client: Option<UploadOverview>,
    pub server: Option<UploadOverview>,
    pub api: Option<UploadOverview>,
}

/// Locations of every artifact bound to a deployment; any of them is enough
/// to find the deployment's storage root.
#[derive(Debug, Clone, Default)]
pub struct DeleteArtifactsArgs {
    pub storage_location: String,
    pub function_location: String,
    pub api_location: String,
}

/// Tagged backend variant. Constructed once at startup, not per call.
#[derive(Clone)]
pub enum ObjectStore {
    S3(S3Store),
    Local(LocalStore),
}

impl ObjectStore {
    /// Upload the three artifact zips; empty (absent) zips are skipped.
    pub async fn upload(&self, args: UploadArgs) -> Result<UploadResult, StoreError> {
        match self {
            ObjectStore::S3(s3) => s3.upload(args).await,
            ObjectStore::Local(local) => local.upload(args).await,
        }
    }

    /// Fetch one deployment file. `Ok(None)` means not-found.
    pub async fn get_file(&self, args: GetFileArgs) -> Result<Option<FileContent>, StoreError> {
        if args.location.starts_with("local:") {
            return LocalStore::get_file_at(&args);
        }

        match self {
            ObjectStore::S3(s3) => s3.get_file(args).await,
            ObjectStore::Local(local) => local.get_file(args).await,
        }
    }

    /// Remove every artifact belonging to a deployment.
    pub async fn delete_artifacts(&self, args: DeleteArtifactsArgs) -> Result<(), StoreError> {
        match self {
            ObjectStore::S3(s3) => s3.delete_artifacts(args).await,
            ObjectStore::Local(local) => local.delete_artifacts(args).await,
        }
    }
}

/// MIME type for a file path, by extension. Unknown extensions fall back to
/// `application/octet-stream`.
pub fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    let table: &[(&str, &str)] = &[
        ("html", "text/html; charset=utf-8"),
        ("htm", "text/html; charset=utf-8"),
        ("css", "text/css; charset=utf-8"),
        ("js", "application/javascript; charset=utf-8"),
        ("mjs", "application/javascript"),
        ("json", "application/json"),
        ("txt", "text/plain; charset=utf-8"),
        ("xml", "application/xml"),
        ("csv", "text/csv"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("svg", "image/svg+xml"),
        ("ico", "image/x-icon"),
        ("webp", "image/webp"),
        ("avif", "image/avif"),
        ("woff", "font/woff"),
        ("woff2", "font/woff2"),
        ("ttf", "font/ttf"),
        ("eot", "application/vnd.ms-fontobject"),
        ("otf", "font/otf"),
        ("mp4", "video/mp4"),
        ("webm", "video/webm"),
        ("mp3", "audio/mpeg"),
        ("wav", "audio/wav"),
        ("ogg", "audio/ogg"),
        ("pdf", "application/pdf"),
        ("map", "application/json"),
        ("wasm", "application/wasm"),
        ("webmanifest", "application/manifest+json"),
    ];

    table
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, ct)| *ct)
        .unwrap_or("application/octet-stream")
}

/// Split a tagged location URI into `(scheme, rest)`.
pub(crate) fn split_location(location: &str) -> Result<(&str, &str), StoreError> {
    location
        .split_once(':')
        .ok_or_else(|| StoreError::InvalidLocation(location.to_string()))
}

/// Per-request headers map size, used for bandwidth accounting.
pub fn headers_size(headers: &HashMap<String, String>) -> i64 {
    headers
        .iter()
        .map(|(k, v)| (k.len() + v.len()) as i64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for_common_extensions() {
        assert_eq!(content_type_for("/index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("/a/b/app.JS"), "application/javascript; charset=utf-8");
        assert_eq!(content_type_for("/logo.png"), "image/png");
        assert_eq!(content_type_for("/font.woff2"), "font/woff2");
        assert_eq!(content_type_for("/blob.bin"), "application/octet-stream");
        assert_eq!(content_type_for("noextension"), "application/octet-stream");
    }

    #[test]
    fn test_split_location() {
        assert_eq!(
            split_location("s3:bucket/prefix").unwrap(),
            ("s3", "bucket/prefix")
        );
        assert_eq!(
            split_location("local:/var/stormkit").unwrap(),
            ("local", "/var/stormkit")
        );
        assert!(split_location("no-scheme").is_err());
    }

    #[test]
    fn test_headers_size_counts_keys_and_values() {
        let headers = HashMap::from([
            ("a".to_string(), "12".to_string()),
            ("bb".to_string(), "3".to_string()),
        ]);
        assert_eq!(headers_size(&headers), 6);
    }
}
