//! Local filesystem backend.
//!
//! Artifacts are unzipped into `<root>/deployment-<id>/{client,server,api}`
//! and locations are reported as `local:<...>/<handler>` so the invoker can
//! execute server payloads directly from disk.

use super::{
    DeleteArtifactsArgs, FileContent, GetFileArgs, StoreError, UploadArgs, UploadOverview,
    UploadResult, content_type_for,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn deployment_root(&self, args: &UploadArgs) -> PathBuf {
        self.root.join(format!("deployment-{}", args.deployment_id))
    }

    pub async fn upload(&self, args: UploadArgs) -> Result<UploadResult, StoreError> {
        let root = self.deployment_root(&args);
        let mut result = UploadResult::default();

        if let Some(zip) = &args.client_zip {
            result.client = self.extract_zip(zip, &root.join("client"), "")?;
        }
        if let Some(zip) = &args.server_zip {
            result.server = self.extract_zip(zip, &root.join("server"), &args.server_handler)?;
        }
        if let Some(zip) = &args.api_zip {
            result.api = self.extract_zip(zip, &root.join("api"), &args.api_handler)?;
        }

        Ok(result)
    }

    fn extract_zip(
        &self,
        zip_path: &Path,
        destination: &Path,
        handler: &str,
    ) -> Result<Option<UploadOverview>, StoreError> {
        let file = match fs::File::open(zip_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bytes_uploaded = file.metadata()?.len();
        fs::create_dir_all(destination)?;

        let mut archive = zip::ZipArchive::new(file)?;
        let mut files_uploaded = 0u64;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(relative) = entry.enclosed_name() else {
                continue;
            };
            let target = destination.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            files_uploaded += 1;
        }

        let mut location = format!("local:{}", destination.display());
        if !handler.is_empty() {
            location = format!("{location}/{handler}");
        }

        Ok(Some(UploadOverview {
            bytes_uploaded,
            files_uploaded,
            location,
        }))
    }

    pub async fn get_file(&self, args: GetFileArgs) -> Result<Option<FileContent>, StoreError> {
        Self::get_file_at(&args)
    }

    /// Read a file relative to a `local:` location. Missing files are
    /// `Ok(None)`, not errors.
    pub fn get_file_at(args: &GetFileArgs) -> Result<Option<FileContent>, StoreError> {
        let base = args.location.trim_start_matches("local:");
        let relative = args.file_name.trim_start_matches('/');
        let path = Path::new(base).join(relative);

        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            return Ok(None);
        }

        let content = fs::read(&path)?;
        Ok(Some(FileContent {
            content_type: content_type_for(&path.to_string_lossy()).to_string(),
            size: metadata.len(),
            content,
        }))
    }

    pub async fn delete_artifacts(&self, args: DeleteArtifactsArgs) -> Result<(), StoreError> {
        let location = [
            args.storage_location,
            args.function_location,
            args.api_location,
        ]
        .into_iter()
        .find(|l| !l.is_empty());

        let Some(location) = location else {
            return Ok(());
        };

        let Some(root) = deployment_dir(&location) else {
            return Ok(());
        };

        match fs::remove_dir_all(&root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Walk a `local:` location upwards until the `deployment-<N>` directory.
fn deployment_dir(location: &str) -> Option<PathBuf> {
    let mut path = PathBuf::from(location.trim_start_matches("local:"));

    for _ in 0..20 {
        let base = path.file_name()?.to_string_lossy().to_string();
        if base.starts_with("deployment-") {
            return Some(path);
        }
        path = path.parent()?.to_path_buf();
    }

    None
}
