//! # Storage facade
//!
//! [`Storage`] is the entry point an HTTP layer talks to. Reads go through the
//! synchronizer and the tarball engine; writes go straight to the local store with a
//! revision check and a fresh revision token.

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::filters::MetadataFilter;
use crate::fs_store::FsLocalStore;
use crate::local_store::{read_optional, LocalStore, TarballSink};
use crate::model::{
    tarball_filename, Attachment, PackageRecord, Token, TokenFilter, VersionRecord,
    TIME_CREATED, TIME_MODIFIED,
};
use crate::normalize::{
    generate_revision, latest_readme, normalize_dist_tags, rewrite_tarball_urls, strip_private,
    tag_version,
};
use crate::publish::{timestamp, Publisher};
use crate::search::{NoopIndexer, SearchIndexer};
use crate::sync::{SyncOptions, Synced, Synchronizer};
use crate::tarball::{TarballEngine, TarballStream};
use crate::tokens::{MemoryTokenStore, TokenStore};
use crate::upstream::{build_uplinks, Uplink};
use bytes::Bytes;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options of [`Storage::get_package`]
#[derive(Debug, Clone)]
pub struct GetPackageOptions {
    /// Consult the uplinks; `false` answers from the local store only
    pub uplinks_look: bool,
    /// Keep `_uplinks` and version provenance in the answer
    pub keep_uplink_data: bool,
    /// Base URL tarball links are rewritten to; overrides `public_url` from the config
    pub public_url: Option<String>,
}

impl Default for GetPackageOptions {
    fn default() -> Self {
        Self {
            uplinks_look: true,
            keep_uplink_data: false,
            public_url: None,
        }
    }
}

/// Latest version of a locally stored package, as listed by
/// [`Storage::get_local_database`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalPackage {
    #[serde(flatten)]
    pub version: VersionRecord,
    /// Publish time of that version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub users: BTreeMap<String, bool>,
}

pub struct Storage {
    config: Config,
    store: Arc<dyn LocalStore>,
    sync: Arc<Synchronizer>,
    publisher: Publisher,
    tarballs: TarballEngine,
    search: Arc<dyn SearchIndexer>,
    tokens: Arc<dyn TokenStore>,
}

impl Storage {
    pub fn new(
        config: Config,
        store: Arc<dyn LocalStore>,
        uplinks: Vec<Arc<dyn Uplink>>,
        search: Arc<dyn SearchIndexer>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        Self::with_filters(config, store, uplinks, Vec::new(), search, tokens)
    }

    pub fn with_filters(
        config: Config,
        store: Arc<dyn LocalStore>,
        uplinks: Vec<Arc<dyn Uplink>>,
        filters: Vec<Arc<dyn MetadataFilter>>,
        search: Arc<dyn SearchIndexer>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        let sync = Arc::new(Synchronizer::new(store.clone(), uplinks, filters));
        let publisher = Publisher::new(
            store.clone(),
            sync.clone(),
            search.clone(),
            config.publish.allow_offline,
        );
        let tarballs = TarballEngine::new(store.clone(), sync.clone());

        Self {
            config,
            store,
            sync,
            publisher,
            tarballs,
            search,
            tokens,
        }
    }

    /// Filesystem store under `config.storage`, HTTP uplinks, no search backend and
    /// in-memory tokens.
    pub fn from_config(config: Config) -> StoreResult<Self> {
        let store: Arc<dyn LocalStore> = Arc::new(FsLocalStore::new(config.storage.clone()));
        let uplinks = build_uplinks(&config)?;
        info!(
            storage = %config.storage.display(),
            uplinks = uplinks.len(),
            "Initialized storage"
        );
        Ok(Self::new(
            config,
            store,
            uplinks,
            Arc::new(NoopIndexer),
            Arc::new(MemoryTokenStore::new()),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Package metadata as served to clients, merged with the uplinks.
    ///
    /// Internal bookkeeping is stripped, attachments are emptied and an empty readme
    /// is replaced by the best one found in the versions. Uplink failures that did not
    /// prevent an answer are returned next to it.
    pub async fn get_package(&self, name: &str, options: GetPackageOptions) -> StoreResult<Synced> {
        debug!(package = %name, uplinks_look = options.uplinks_look, "Getting package");
        let local = read_optional(self.store.as_ref(), name).await?;

        let sync_options = SyncOptions {
            consult_uplinks: options.uplinks_look,
            existence_only: false,
        };
        let Synced { record, errors } = self.sync.synchronize(name, local, sync_options).await?;

        let mut record = normalize_dist_tags(strip_private(record, options.keep_uplink_data));
        if record.readme.as_deref().is_none_or(str::is_empty) {
            record.readme = Some(latest_readme(&record));
        }

        if let Some(base) = options.public_url.as_ref().or(self.config.public_url.as_ref()) {
            record = rewrite_tarball_urls(record, base);
        }

        if !errors.is_empty() {
            debug!(package = %name, errors = errors.len(), "Served package with uplink errors");
        }
        Ok(Synced { record, errors })
    }

    /// Publish a new package
    pub async fn add_package(&self, name: &str, metadata: PackageRecord) -> StoreResult<()> {
        self.publisher.publish(name, metadata).await
    }

    /// Add `version` to an existing package and point `tag` at it.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the package does not exist locally
    /// - `StoreError::Conflict` if the version is already present
    /// - `StoreError::BadRequest` if an uploaded tarball's checksum disagrees with
    ///   `dist.shasum`
    pub async fn add_version(
        &self,
        name: &str,
        version: &str,
        mut metadata: VersionRecord,
        tag: Option<&str>,
    ) -> StoreResult<()> {
        self.update_record(name, |record| {
            if record.versions.contains_key(version) {
                return Err(StoreError::Conflict(format!(
                    "this package is already present: {name}@{version}"
                )));
            }

            if let Some(readme) = metadata.readme.take().filter(|readme| !readme.is_empty()) {
                record.readme = Some(readme);
            }

            let now = timestamp();
            if let Some(attachment) = tarball_filename(&metadata.dist.tarball)
                .and_then(|filename| record.attachments.get_mut(&filename))
            {
                if let (Some(uploaded), Some(declared)) =
                    (attachment.shasum.as_deref(), metadata.dist.shasum.as_deref())
                {
                    if uploaded != declared {
                        return Err(StoreError::BadRequest(format!(
                            "shasum error, {uploaded} != {declared}"
                        )));
                    }
                }
                attachment.version = Some(version.to_string());
            }

            record.time.insert(version.to_string(), now.clone());
            record
                .time
                .entry(TIME_CREATED.to_string())
                .or_insert_with(|| now.clone());
            record.versions.insert(version.to_string(), metadata);
            if let Some(tag) = tag {
                tag_version(record, version, tag);
            }
            Ok(())
        })
        .await?;

        info!(package = %name, version = %version, tag = ?tag, "Added version");
        Ok(())
    }

    /// Set or remove dist-tags. `None` removes the tag.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the package, or a version a tag should point at, does
    /// not exist.
    pub async fn merge_tags(
        &self,
        name: &str,
        tags: BTreeMap<String, Option<String>>,
    ) -> StoreResult<()> {
        self.update_record(name, |record| {
            for (tag, version) in &tags {
                match version {
                    None => {
                        record.dist_tags.remove(tag);
                    }
                    Some(version) => {
                        if !record.versions.contains_key(version) {
                            return Err(StoreError::not_found(format!(
                                "this version doesn't exist: {version}"
                            )));
                        }
                        record.dist_tags.insert(tag.clone(), version.clone());
                    }
                }
            }
            Ok(())
        })
        .await?;

        debug!(package = %name, tags = tags.len(), "Merged dist-tags");
        Ok(())
    }

    /// Apply a client's edit of a package (unpublishing versions, deprecations,
    /// dist-tags, stars).
    ///
    /// Versions missing from `metadata` are removed together with their publish time,
    /// `deprecated` markers are copied over, and dist-tags and users are replaced.
    /// Everything else in the stored record is kept.
    ///
    /// # Errors
    ///
    /// `StoreError::Conflict` if `revision` is not the stored revision.
    pub async fn change_package(
        &self,
        name: &str,
        metadata: PackageRecord,
        revision: &str,
    ) -> StoreResult<()> {
        self.update_record(name, |record| {
            let current = record.revision.as_deref().unwrap_or_default();
            if current != revision {
                return Err(StoreError::Conflict(format!(
                    "revision mismatch for {name}: expected {current}, got {revision}"
                )));
            }

            let existing: Vec<String> = record.versions.keys().cloned().collect();
            for version in existing {
                match metadata.versions.get(&version) {
                    None => {
                        record.versions.remove(&version);
                        record.time.remove(&version);
                        for attachment in record.attachments.values_mut() {
                            if attachment.version.as_deref() == Some(version.as_str()) {
                                attachment.version = None;
                            }
                        }
                    }
                    Some(incoming) => {
                        if let (Some(deprecated), Some(local)) = (
                            incoming.extra.get("deprecated"),
                            record.versions.get_mut(&version),
                        ) {
                            local
                                .extra
                                .insert("deprecated".to_string(), deprecated.clone());
                        }
                    }
                }
            }

            record.users = metadata.users.clone();
            record.dist_tags = metadata.dist_tags.clone();
            let versions = &record.versions;
            record
                .dist_tags
                .retain(|_, version| versions.contains_key(version));
            Ok(())
        })
        .await?;

        info!(package = %name, "Changed package");
        Ok(())
    }

    /// Remove a package and everything stored for it
    pub async fn remove_package(&self, name: &str) -> StoreResult<()> {
        self.store.remove_record(name).await?;
        if let Err(e) = self.search.remove(name).await {
            warn!(package = %name, error = %e, "Failed to remove package from search index");
        }
        info!(package = %name, "Removed package");
        Ok(())
    }

    /// Remove one stored tarball.
    ///
    /// # Errors
    ///
    /// - `StoreError::Conflict` if `revision` is not the stored revision
    /// - `StoreError::NotFound` if the package or the file does not exist
    pub async fn remove_tarball(&self, name: &str, filename: &str, revision: &str) -> StoreResult<()> {
        let record = self.store.read_record(name).await?;
        let current = record.revision.as_deref().unwrap_or_default();
        if current != revision {
            return Err(StoreError::Conflict(format!(
                "revision mismatch for {name}: expected {current}, got {revision}"
            )));
        }

        self.store.remove_tarball(name, filename).await?;
        self.update_record(name, |record| {
            record.attachments.remove(filename);
            record.dist_files.remove(filename);
            Ok(())
        })
        .await?;

        info!(package = %name, filename = %filename, "Removed tarball");
        Ok(())
    }

    /// Open an upload for a tarball of an existing package.
    ///
    /// The file becomes visible once [`TarballUpload::commit`] succeeds, which also
    /// records its checksum in the package's attachments.
    pub async fn add_tarball(&self, name: &str, filename: &str) -> StoreResult<TarballUpload<'_>> {
        let sink = self.store.open_tarball_write(name, filename).await?;
        debug!(package = %name, filename = %filename, "Receiving tarball upload");
        Ok(TarballUpload {
            storage: self,
            name: name.to_string(),
            filename: filename.to_string(),
            sink,
            hasher: Sha1::new(),
            length: 0,
        })
    }

    /// Stream a tarball, from the local store or through the owning uplink
    pub fn get_tarball(&self, name: &str, filename: &str) -> TarballStream {
        self.tarballs.get_tarball(name, filename)
    }

    /// The latest version of every locally stored package.
    ///
    /// Packages without a usable `latest` tag are skipped with a warning, as are
    /// records that cannot be read.
    pub async fn get_local_database(&self) -> StoreResult<Vec<LocalPackage>> {
        let names = self.store.list_package_names().await?;
        let mut packages = Vec::with_capacity(names.len());

        for name in names {
            let mut record = match self.store.read_record(&name).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(package = %name, error = %e, "Skipping unreadable package");
                    continue;
                }
            };

            let latest = record.dist_tags.get("latest").cloned();
            let Some(version) = latest.and_then(|latest| record.versions.remove(&latest)) else {
                warn!(package = %name, "Package does not have a \"latest\" tag");
                continue;
            };

            packages.push(LocalPackage {
                time: record.time.get(&version.version).cloned(),
                users: record.users,
                version,
            });
        }

        Ok(packages)
    }

    pub async fn read_tokens(&self, filter: &TokenFilter) -> StoreResult<Vec<Token>> {
        self.tokens.read_tokens(filter).await
    }

    pub async fn save_token(&self, token: Token) -> StoreResult<()> {
        self.tokens.save_token(token).await
    }

    pub async fn delete_token(&self, user: &str, key: &str) -> StoreResult<()> {
        self.tokens.delete_token(user, key).await
    }

    /// Read-modify-write of a local record with an optimistic revision check
    async fn update_record<F>(&self, name: &str, update: F) -> StoreResult<PackageRecord>
    where
        F: FnOnce(&mut PackageRecord) -> StoreResult<()>,
    {
        let mut record = self.store.read_record(name).await?;
        let expected = record.revision.clone().unwrap_or_default();

        update(&mut record)?;

        record.revision = Some(generate_revision(&expected));
        record
            .time
            .insert(TIME_MODIFIED.to_string(), timestamp());
        self.store
            .write_record(name, &record, Some(&expected))
            .await?;
        Ok(record)
    }
}

/// An in-progress tarball upload, see [`Storage::add_tarball`]
pub struct TarballUpload<'a> {
    storage: &'a Storage,
    name: String,
    filename: String,
    sink: Box<dyn TarballSink>,
    hasher: Sha1,
    length: u64,
}

impl TarballUpload<'_> {
    pub async fn write(&mut self, chunk: Bytes) -> StoreResult<()> {
        self.hasher.update(&chunk);
        self.length += chunk.len() as u64;
        self.sink.write(chunk).await
    }

    /// Make the file visible and record its checksum
    pub async fn commit(self) -> StoreResult<()> {
        let shasum = format!("{:x}", self.hasher.finalize());
        self.sink.commit().await?;

        let length = self.length;
        self.storage
            .update_record(&self.name, |record| {
                let attachment = record
                    .attachments
                    .entry(self.filename.clone())
                    .or_insert_with(Attachment::default);
                attachment.shasum = Some(shasum.clone());
                attachment.length = Some(length);
                Ok(())
            })
            .await?;

        info!(package = %self.name, filename = %self.filename, shasum = %shasum, "Stored uploaded tarball");
        Ok(())
    }

    pub async fn abort(self) {
        self.sink.abort().await;
    }
}
