//! Filesystem-backed [`LocalStore`]
//!
//! Layout under the storage root:
//!
//! - `{root}/{package}/package.json` - the package record
//! - `{root}/{package}/{filename}` - cached or uploaded tarballs
//!
//! Scoped packages (`@scope/name`) nest one directory deeper. Records and tarballs are
//! written to a temporary file first and renamed into place, so readers never observe
//! partial content.

use crate::error::{StoreError, StoreResult};
use crate::local_store::{read_optional, ByteStream, LocalStore, TarballSink};
use crate::model::PackageRecord;
use crate::validate_filename;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PACKAGE_FILE_NAME: &str = "package.json";
const READ_CHUNK_SIZE: usize = 64 * 1024;
const MAX_PACKAGE_NAME_LENGTH: usize = 214;

pub struct FsLocalStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsLocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dir(&self, name: &str) -> StoreResult<PathBuf> {
        validate_package_name(name)?;
        Ok(name
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    fn tarball_path(&self, name: &str, filename: &str) -> StoreResult<PathBuf> {
        validate_filename(filename)?;
        if filename == PACKAGE_FILE_NAME || filename.contains('/') {
            return Err(StoreError::BadRequest(format!(
                "'{filename}' is not a valid tarball name"
            )));
        }
        Ok(self.package_dir(name)?.join(filename))
    }
}

/// Reject names that cannot safely become directory names.
fn validate_package_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| {
        warn!(package = %name, reason = %reason, "Rejected package name");
        Err(StoreError::BadRequest(format!(
            "invalid package name '{name}': {reason}"
        )))
    };

    if name.is_empty() || name.len() > MAX_PACKAGE_NAME_LENGTH {
        return invalid("length out of range");
    }
    if name.contains('\\') || name.chars().any(|c| c.is_control()) {
        return invalid("forbidden character");
    }

    let segments: Vec<&str> = name.split('/').collect();
    let well_formed = match segments.as_slice() {
        [single] => !single.starts_with('@'),
        [scope, _] => scope.starts_with('@') && scope.len() > 1,
        _ => false,
    };
    if !well_formed {
        return invalid("unexpected '/' placement");
    }
    if segments
        .iter()
        .any(|s| s.is_empty() || s.starts_with('.') || *s == "node_modules")
    {
        return invalid("reserved path segment");
    }

    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let suffix: u32 = rand::rng().random();
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{suffix:08x}"));
    path.with_file_name(name)
}

fn map_missing(error: std::io::Error, what: impl FnOnce() -> String) -> StoreError {
    if error.kind() == std::io::ErrorKind::NotFound {
        StoreError::not_found(what())
    } else {
        StoreError::Io(error)
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn read_record(&self, name: &str) -> StoreResult<PackageRecord> {
        let path = self.package_dir(name)?.join(PACKAGE_FILE_NAME);
        let content = fs::read(&path)
            .await
            .map_err(|e| map_missing(e, || format!("no such package available: {name}")))?;

        let record = serde_json::from_slice(&content).map_err(|e| {
            StoreError::Internal(format!("corrupted record for {name}: {e}"))
        })?;
        debug!(package = %name, path = %path.display(), "Read package record");
        Ok(record)
    }

    async fn write_record(
        &self,
        name: &str,
        record: &PackageRecord,
        expected_revision: Option<&str>,
    ) -> StoreResult<()> {
        let dir = self.package_dir(name)?;
        let _guard = self.write_lock.lock().await;

        let current = read_optional(self, name).await?;
        match (&current, expected_revision) {
            (None, None) => {}
            (Some(_), None) => {
                return Err(StoreError::Conflict(format!(
                    "this package is already present: {name}"
                )));
            }
            (None, Some(_)) => {
                return Err(StoreError::not_found(format!(
                    "no such package available: {name}"
                )));
            }
            (Some(current), Some(expected)) => {
                let actual = current.revision.as_deref().unwrap_or_default();
                if actual != expected {
                    warn!(package = %name, expected = %expected, actual = %actual, "Revision mismatch");
                    return Err(StoreError::Conflict(format!(
                        "revision mismatch for {name}: expected {expected}, found {actual}"
                    )));
                }
            }
        }

        fs::create_dir_all(&dir).await?;
        let path = dir.join(PACKAGE_FILE_NAME);
        let tmp = temp_path(&path);
        let content = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, &content).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        info!(
            package = %name,
            revision = ?record.revision,
            size = content.len(),
            "Package record saved"
        );
        Ok(())
    }

    async fn remove_record(&self, name: &str) -> StoreResult<()> {
        let dir = self.package_dir(name)?;
        let _guard = self.write_lock.lock().await;
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| map_missing(e, || format!("no such package available: {name}")))?;
        info!(package = %name, "Removed package from local storage");
        Ok(())
    }

    async fn open_tarball_read(&self, name: &str, filename: &str) -> StoreResult<ByteStream> {
        let path = self.tarball_path(name, filename)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| map_missing(e, || format!("no such file available: {filename}")))?;
        let length = file.metadata().await?.len();
        debug!(package = %name, filename = %filename, size = length, "Opened local tarball");

        let body = futures_util::stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(file)))
                }
                Err(e) => Some((Err(StoreError::Io(e)), None)),
            }
        })
        .boxed();

        Ok(ByteStream::new(Some(length), body))
    }

    async fn open_tarball_write(
        &self,
        name: &str,
        filename: &str,
    ) -> StoreResult<Box<dyn TarballSink>> {
        let path = self.tarball_path(name, filename)?;
        if fs::try_exists(&path).await? {
            return Err(StoreError::Conflict(format!(
                "file already exists: {filename}"
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&path);
        let file = fs::File::create(&tmp).await?;
        debug!(package = %name, filename = %filename, "Opened tarball for writing");

        Ok(Box::new(FsTarballSink {
            file: Some(file),
            tmp,
            path,
            written: 0,
        }))
    }

    async fn remove_tarball(&self, name: &str, filename: &str) -> StoreResult<()> {
        let path = self.tarball_path(name, filename)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_missing(e, || format!("no such file available: {filename}")))?;
        info!(package = %name, filename = %filename, "Removed tarball from local storage");
        Ok(())
    }

    async fn list_package_names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        if !fs::try_exists(&self.root).await? {
            debug!(root = %self.root.display(), "Storage directory does not exist");
            return Ok(names);
        }

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();

            if dir_name.starts_with('@') {
                let mut scoped = fs::read_dir(entry.path()).await?;
                while let Some(inner) = scoped.next_entry().await? {
                    if fs::try_exists(inner.path().join(PACKAGE_FILE_NAME)).await? {
                        names.push(format!(
                            "{dir_name}/{}",
                            inner.file_name().to_string_lossy()
                        ));
                    }
                }
            } else if fs::try_exists(entry.path().join(PACKAGE_FILE_NAME)).await? {
                names.push(dir_name);
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Writes into a temporary file that is renamed over the target on commit.
struct FsTarballSink {
    file: Option<fs::File>,
    tmp: PathBuf,
    path: PathBuf,
    written: u64,
}

#[async_trait]
impl TarballSink for FsTarballSink {
    async fn write(&mut self, chunk: Bytes) -> StoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Internal("tarball sink already closed".to_string()))?;
        file.write_all(&chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        if fs::try_exists(&self.path).await? {
            return Err(StoreError::Conflict(format!(
                "file already exists: {}",
                self.path.display()
            )));
        }
        fs::rename(&self.tmp, &self.path).await?;

        info!(path = %self.path.display(), size = self.written, "Tarball saved");
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.tmp).await {
            debug!(path = %self.tmp.display(), error = %e, "Could not remove partial tarball");
        }
    }
}

impl Drop for FsTarballSink {
    fn drop(&mut self) {
        // the temp file is gone after a successful rename, so this only hits leftovers
        if std::fs::metadata(&self.tmp).is_ok() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}
