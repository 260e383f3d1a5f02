//! Shared helpers for the registry-store integration tests.
//!
//! Provides a scripted in-memory uplink, canned package documents, and a
//! [`TestRegistry`] that wires a [`Storage`] over a temporary filesystem store.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use registry_store::error::UplinkFailure;
use registry_store::search::NoopIndexer;
use registry_store::tokens::MemoryTokenStore;
use registry_store::{
    sha1_hash, ByteStream, Config, FsLocalStore, LocalStore, MetadataResponse, PackageRecord, Storage,
    StoreError, StoreResult, SyncErrorKind, Uplink,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const REMOTE: &str = "https://upstream.test";

/// Tarball URL as advertised by the upstream registry
pub fn tarball_url(name: &str, version: &str) -> String {
    let basename = name.rsplit('/').next().unwrap_or(name);
    format!("{REMOTE}/{name}/-/{basename}-{version}.tgz")
}

/// Bytes served as the tarball of `name@version`
pub fn tarball_content(name: &str, version: &str) -> Vec<u8> {
    format!("tarball of {name}@{version}").into_bytes()
}

/// A package document as an upstream registry would serve it; every `dist.shasum`
/// matches [`tarball_content`].
pub fn upstream_document(name: &str, versions: &[&str]) -> Value {
    let mut doc_versions = serde_json::Map::new();
    let mut time = serde_json::Map::new();
    for version in versions {
        doc_versions.insert(
            version.to_string(),
            json!({
                "name": name,
                "version": version,
                "readme": format!("# {name} {version}"),
                "dist": {
                    "tarball": tarball_url(name, version),
                    "shasum": sha1_hash(&tarball_content(name, version))
                }
            }),
        );
        time.insert(version.to_string(), json!("2024-01-01T00:00:00.000Z"));
    }
    time.insert("modified".to_string(), json!("2024-01-02T00:00:00.000Z"));

    json!({
        "name": name,
        "versions": doc_versions,
        "dist-tags": { "latest": versions.last().copied().unwrap_or_default() },
        "time": time,
    })
}

/// A package record as a client would publish it
pub fn publish_document(name: &str, version: &str) -> Result<PackageRecord> {
    let record = serde_json::from_value(json!({
        "name": name,
        "versions": {
            version: {
                "name": name,
                "version": version,
                "readme": "local readme",
                "dist": { "tarball": format!("http://localhost:4873/{name}/-/{name}-{version}.tgz") }
            }
        },
        "dist-tags": { "latest": version }
    }))?;
    Ok(record)
}

/// Scripted uplink answering from memory and counting the calls it receives.
pub struct ScriptedUplink {
    id: String,
    maxage: Duration,
    cache: bool,
    routes: Option<Vec<String>>,
    metadata: Mutex<Option<Result<MetadataResponse, UplinkFailure>>>,
    tarballs: Mutex<HashMap<String, Vec<Bytes>>>,
    metadata_calls: AtomicUsize,
    tarball_calls: AtomicUsize,
    etags: Mutex<Vec<Option<String>>>,
    delay: Duration,
}

impl ScriptedUplink {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            maxage: Duration::from_secs(120),
            cache: true,
            routes: None,
            metadata: Mutex::new(None),
            tarballs: Mutex::new(HashMap::new()),
            metadata_calls: AtomicUsize::new(0),
            tarball_calls: AtomicUsize::new(0),
            etags: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
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

    pub fn uncached(mut self) -> Self {
        self.cache = false;
        self
    }

    /// Only route the listed package names through this uplink
    pub fn routing(mut self, names: &[&str]) -> Self {
        self.routes = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn serving(self, body: Value, etag: Option<&str>) -> Self {
        self.respond(Ok(MetadataResponse::Modified {
            body,
            etag: etag.map(str::to_string),
        }));
        self
    }

    pub fn failing(self, kind: SyncErrorKind) -> Self {
        self.respond(Err(UplinkFailure::new(kind, format!("scripted {kind:?}"))));
        self
    }

    pub fn respond(&self, response: Result<MetadataResponse, UplinkFailure>) {
        *self.metadata.lock().unwrap() = Some(response);
    }

    pub fn with_tarball(self, url: &str, content: &[u8]) -> Self {
        let chunks = content
            .chunks(4)
            .map(Bytes::copy_from_slice)
            .collect();
        self.tarballs.lock().unwrap().insert(url.to_string(), chunks);
        self
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn tarball_calls(&self) -> usize {
        self.tarball_calls.load(Ordering::SeqCst)
    }

    pub fn seen_etags(&self) -> Vec<Option<String>> {
        self.etags.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uplink for ScriptedUplink {
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
        self.etags.lock().unwrap().push(etag.map(str::to_string));
        tokio::time::sleep(self.delay).await;
        self.metadata.lock().unwrap().clone().unwrap_or_else(|| {
            Err(UplinkFailure::new(SyncErrorKind::NotFound, "not scripted"))
        })
    }

    async fn fetch_tarball(&self, url: &str) -> StoreResult<ByteStream> {
        self.tarball_calls.fetch_add(1, Ordering::SeqCst);
        match self.tarballs.lock().unwrap().get(url) {
            Some(chunks) => Ok(ByteStream::from_chunks(chunks.clone())),
            None => Err(StoreError::not_found(format!("no tarball at {url}"))),
        }
    }
}

/// A [`Storage`] over a temporary directory, plus direct access to its store.
pub struct TestRegistry {
    pub storage: Storage,
    pub store: Arc<FsLocalStore>,
    _temp_dir: TempDir,
}

impl TestRegistry {
    pub fn new(uplinks: Vec<Arc<dyn Uplink>>) -> Result<Self> {
        Self::with_config(Config::default(), uplinks)
    }

    pub fn with_config(mut config: Config, uplinks: Vec<Arc<dyn Uplink>>) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        config.storage = temp_dir.path().join("storage");
        let store = Arc::new(FsLocalStore::new(config.storage.clone()));

        let storage = Storage::new(
            config,
            store.clone() as Arc<dyn LocalStore>,
            uplinks,
            Arc::new(NoopIndexer),
            Arc::new(MemoryTokenStore::new()),
        );

        Ok(Self {
            storage,
            store,
            _temp_dir: temp_dir,
        })
    }
}
