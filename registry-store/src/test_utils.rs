//! Shared fixtures for unit tests: scripted uplinks, a store that can be told to
//! fail, and builders for upstream documents.

use crate::error::{StoreError, StoreResult, UplinkFailure};
use crate::fs_store::FsLocalStore;
use crate::local_store::{ByteStream, LocalStore, TarballSink};
use crate::model::PackageRecord;
use crate::upstream::{MetadataResponse, Uplink};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const REMOTE_BASE: &str = "https://registry.example.com";

/// Tarball URL as published by the fake upstream
pub fn remote_tarball_url(name: &str, version: &str) -> String {
    let file = name.rsplit('/').next().unwrap_or(name);
    format!("{REMOTE_BASE}/{name}/-/{file}-{version}.tgz")
}

/// A minimal upstream document with `latest` on the last version given
pub fn remote_document(name: &str, versions: &[&str]) -> Value {
    let mut version_map = serde_json::Map::new();
    for version in versions {
        version_map.insert(
            version.to_string(),
            json!({
                "name": name,
                "version": version,
                "description": format!("{name} at {version}"),
                "dist": { "tarball": remote_tarball_url(name, version) }
            }),
        );
    }

    let mut document = json!({
        "name": name,
        "versions": version_map,
        "dist-tags": {},
        "time": { "modified": "2024-01-01T00:00:00.000Z" }
    });
    if let Some(last) = versions.last() {
        document["dist-tags"]["latest"] = json!(last);
    }
    document
}

/// A locally published record with one version
pub fn local_record(name: &str, version: &str) -> PackageRecord {
    serde_json::from_value(json!({
        "name": name,
        "_rev": "1-0000000000000001",
        "versions": {
            version: {
                "name": name,
                "version": version,
                "dist": { "tarball": format!("http://localhost/{name}/-/{name}-{version}.tgz") }
            }
        },
        "dist-tags": { "latest": version }
    }))
    .unwrap()
}

/// An uplink that answers from a script and counts every call
pub struct MockUplink {
    id: String,
    maxage: Duration,
    cache: bool,
    routes: Option<Vec<String>>,
    metadata: Mutex<Result<MetadataResponse, UplinkFailure>>,
    tarballs: Mutex<HashMap<String, Vec<Bytes>>>,
    broken_tarballs: Mutex<HashMap<String, Vec<Bytes>>>,
    stalled_tarballs: Mutex<HashMap<String, Vec<Bytes>>>,
    delay: Duration,
    stream_guard: Arc<()>,
    seen_etags: Mutex<Vec<Option<String>>>,
    metadata_calls: AtomicUsize,
    tarball_calls: AtomicUsize,
}

impl MockUplink {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            maxage: Duration::from_secs(120),
            cache: true,
            routes: None,
            metadata: Mutex::new(Err(UplinkFailure::new(
                crate::error::SyncErrorKind::NotFound,
                "not scripted",
            ))),
            tarballs: Mutex::new(HashMap::new()),
            broken_tarballs: Mutex::new(HashMap::new()),
            stalled_tarballs: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            stream_guard: Arc::new(()),
            seen_etags: Mutex::new(Vec::new()),
            metadata_calls: AtomicUsize::new(0),
            tarball_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_maxage(mut self, maxage: Duration) -> Self {
        self.maxage = maxage;
        self
    }

    /// Answer metadata requests only after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    /// Only route the listed package names
    pub fn routing(mut self, names: &[&str]) -> Self {
        self.routes = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn responding(self, response: Result<MetadataResponse, UplinkFailure>) -> Self {
        *self.metadata.lock().unwrap() = response;
        self
    }

    pub fn serving(self, body: Value, etag: Option<&str>) -> Self {
        self.responding(Ok(MetadataResponse::Modified {
            body,
            etag: etag.map(str::to_string),
        }))
    }

    pub fn failing(self, failure: UplinkFailure) -> Self {
        self.responding(Err(failure))
    }

    pub fn with_tarball(self, url: &str, chunks: &[&[u8]]) -> Self {
        self.tarballs.lock().unwrap().insert(
            url.to_string(),
            chunks.iter().map(|chunk| Bytes::copy_from_slice(chunk)).collect(),
        );
        self
    }

    /// A tarball that yields `chunks` and then fails
    pub fn with_broken_tarball(self, url: &str, chunks: &[&[u8]]) -> Self {
        self.broken_tarballs.lock().unwrap().insert(
            url.to_string(),
            chunks.iter().map(|chunk| Bytes::copy_from_slice(chunk)).collect(),
        );
        self
    }

    /// A tarball that yields `chunks` and then never produces another one
    pub fn with_stalled_tarball(self, url: &str, chunks: &[&[u8]]) -> Self {
        self.stalled_tarballs.lock().unwrap().insert(
            url.to_string(),
            chunks.iter().map(|chunk| Bytes::copy_from_slice(chunk)).collect(),
        );
        self
    }

    /// Stalled tarball bodies handed out and not dropped yet
    pub fn open_streams(&self) -> usize {
        Arc::strong_count(&self.stream_guard) - 1
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn tarball_calls(&self) -> usize {
        self.tarball_calls.load(Ordering::SeqCst)
    }

    pub fn seen_etags(&self) -> Vec<Option<String>> {
        self.seen_etags.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uplink for MockUplink {
    fn id(&self) -> &str {
        &self.id
    }

    fn maxage(&self) -> Duration {
        self.maxage
    }

    fn cache_enabled(&self) -> bool {
        self.cache
    }

    fn matches(&self, name: &str) -> bool {
        self.routes
            .as_ref()
            .is_none_or(|routes| routes.iter().any(|route| route == name))
    }

    async fn fetch_metadata(
        &self,
        _name: &str,
        etag: Option<&str>,
    ) -> Result<MetadataResponse, UplinkFailure> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_etags
            .lock()
            .unwrap()
            .push(etag.map(str::to_string));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.metadata.lock().unwrap().clone()
    }

    async fn fetch_tarball(&self, url: &str) -> StoreResult<ByteStream> {
        self.tarball_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(chunks) = self.tarballs.lock().unwrap().get(url).cloned() {
            return Ok(ByteStream::from_chunks(chunks));
        }

        if let Some(chunks) = self.broken_tarballs.lock().unwrap().get(url).cloned() {
            let body = futures_util::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures_util::stream::once(async {
                    Err(StoreError::Internal("connection dropped".to_string()))
                }))
                .boxed();
            return Ok(ByteStream::new(None, body));
        }

        if let Some(chunks) = self.stalled_tarballs.lock().unwrap().get(url).cloned() {
            let guard = self.stream_guard.clone();
            let body = futures_util::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures_util::stream::pending())
                .map(move |chunk| {
                    let _held = &guard;
                    chunk
                })
                .boxed();
            return Ok(ByteStream::new(None, body));
        }

        Err(StoreError::not_found(format!("no tarball at {url}")))
    }
}

/// A filesystem store whose failure modes can be switched on per test
pub struct FlakyStore {
    inner: FsLocalStore,
    pub fail_reads: AtomicBool,
    pub fail_tarball_writes: AtomicBool,
    pub fail_sink_writes: AtomicBool,
    pub fail_record_writes: AtomicBool,
    pub record_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            inner: FsLocalStore::new(root),
            fail_reads: AtomicBool::new(false),
            fail_tarball_writes: AtomicBool::new(false),
            fail_sink_writes: AtomicBool::new(false),
            fail_record_writes: AtomicBool::new(false),
            record_writes: AtomicUsize::new(0),
        }
    }
}

struct FailingSink;

#[async_trait]
impl TarballSink for FailingSink {
    async fn write(&mut self, _chunk: Bytes) -> StoreResult<()> {
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }

    async fn abort(self: Box<Self>) {}
}

#[async_trait]
impl LocalStore for FlakyStore {
    async fn read_record(&self, name: &str) -> StoreResult<PackageRecord> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("storage offline")));
        }
        self.inner.read_record(name).await
    }

    async fn write_record(
        &self,
        name: &str,
        record: &PackageRecord,
        expected_revision: Option<&str>,
    ) -> StoreResult<()> {
        self.record_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_record_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("no space left on device")));
        }
        self.inner
            .write_record(name, record, expected_revision)
            .await
    }

    async fn remove_record(&self, name: &str) -> StoreResult<()> {
        self.inner.remove_record(name).await
    }

    async fn open_tarball_read(&self, name: &str, filename: &str) -> StoreResult<ByteStream> {
        self.inner.open_tarball_read(name, filename).await
    }

    async fn open_tarball_write(
        &self,
        name: &str,
        filename: &str,
    ) -> StoreResult<Box<dyn TarballSink>> {
        if self.fail_tarball_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("read-only filesystem")));
        }
        if self.fail_sink_writes.load(Ordering::SeqCst) {
            return Ok(Box::new(FailingSink));
        }
        self.inner.open_tarball_write(name, filename).await
    }

    async fn remove_tarball(&self, name: &str, filename: &str) -> StoreResult<()> {
        self.inner.remove_tarball(name, filename).await
    }

    async fn list_package_names(&self) -> StoreResult<Vec<String>> {
        self.inner.list_package_names().await
    }
}

pub fn create_flaky_store() -> (Arc<FlakyStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    (Arc::new(FlakyStore::new(temp_dir.path())), temp_dir)
}
