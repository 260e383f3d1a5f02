//! Publishing a new package.
//!
//! A name may only be claimed when neither the local store nor any uplink knows it.
//! When an uplink cannot answer cleanly the outcome depends on
//! `publish.allow_offline`: refuse with `ServiceUnavailable`, or publish anyway.

use crate::error::{StoreError, StoreResult, SyncErrorKind};
use crate::local_store::{read_optional, LocalStore};
use crate::model::{PackageRecord, TIME_CREATED, TIME_MODIFIED};
use crate::normalize::{generate_revision, normalize_package, search_summary};
use crate::search::SearchIndexer;
use crate::sync::{SyncOptions, Synchronizer};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Current time as stored in `time` maps
pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct Publisher {
    store: Arc<dyn LocalStore>,
    sync: Arc<Synchronizer>,
    search: Arc<dyn SearchIndexer>,
    allow_offline: bool,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn LocalStore>,
        sync: Arc<Synchronizer>,
        search: Arc<dyn SearchIndexer>,
        allow_offline: bool,
    ) -> Self {
        Self {
            store,
            sync,
            search,
            allow_offline,
        }
    }

    /// Publish `metadata` as the new package `name`.
    ///
    /// # Errors
    ///
    /// - `StoreError::Validation` if the metadata names another package
    /// - `StoreError::Conflict` if the package exists locally or on an uplink
    /// - `StoreError::ServiceUnavailable` if an uplink could not answer and offline
    ///   publishing is disabled
    /// - any local store error
    pub async fn publish(&self, name: &str, metadata: PackageRecord) -> StoreResult<()> {
        if metadata.name != name {
            return Err(StoreError::Validation(format!(
                "metadata name '{}' does not match package '{name}'",
                metadata.name
            )));
        }

        debug!(package = %name, "Checking local storage before publish");
        self.check_local(name).await?;
        debug!(package = %name, "Checking uplinks before publish");
        self.check_remote(name).await?;

        let record = self.write(name, metadata).await?;
        self.index(&record).await;
        Ok(())
    }

    async fn check_local(&self, name: &str) -> StoreResult<()> {
        match read_optional(self.store.as_ref(), name).await? {
            Some(_) => Err(StoreError::Conflict(format!(
                "this package is already present: {name}"
            ))),
            None => Ok(()),
        }
    }

    async fn check_remote(&self, name: &str) -> StoreResult<()> {
        let errors = match self
            .sync
            .synchronize(name, None, SyncOptions::existence_only())
            .await
        {
            Ok(_) => {
                return Err(StoreError::Conflict(format!(
                    "this package is already present: {name}"
                )))
            }
            Err(StoreError::NotFound { uplink_errors, .. })
            | Err(StoreError::ServiceUnavailable { uplink_errors, .. }) => uplink_errors,
            Err(e) => return Err(e),
        };

        let Some(failure) = errors.iter().find(|e| e.kind != SyncErrorKind::NotFound) else {
            return Ok(());
        };

        if self.allow_offline {
            warn!(package = %name, error = %failure, "Uplink unavailable, publishing offline");
            return Ok(());
        }

        Err(StoreError::ServiceUnavailable {
            message: format!(
                "one of the uplinks is down, refusing to publish {name}"
            ),
            uplink_errors: errors,
        })
    }

    async fn write(&self, name: &str, metadata: PackageRecord) -> StoreResult<PackageRecord> {
        let mut record = normalize_package(metadata);
        let now = timestamp();

        record
            .time
            .entry(TIME_CREATED.to_string())
            .or_insert_with(|| now.clone());
        record
            .time
            .entry(TIME_MODIFIED.to_string())
            .or_insert_with(|| now.clone());
        for version in record.versions.keys() {
            record
                .time
                .entry(version.clone())
                .or_insert_with(|| now.clone());
        }

        record.attachments.clear();
        let previous = record.revision.clone().unwrap_or_default();
        record.revision = Some(generate_revision(&previous));

        self.store.write_record(name, &record, None).await?;
        info!(package = %name, versions = record.versions.len(), "Published package");
        Ok(record)
    }

    async fn index(&self, record: &PackageRecord) {
        let Some(summary) = search_summary(record) else {
            debug!(package = %record.name, "Nothing to index");
            return;
        };

        if let Err(e) = self.search.index(summary).await {
            warn!(package = %record.name, error = %e, "Failed to update search index");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SyncErrorKind, UplinkFailure};
    use crate::search::{NoopIndexer, SearchSummary};
    use crate::test_utils::{create_flaky_store, local_record, remote_document, MockUplink};
    use crate::upstream::Uplink;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIndexer {
        indexed: Mutex<Vec<SearchSummary>>,
    }

    #[async_trait]
    impl SearchIndexer for RecordingIndexer {
        async fn index(&self, summary: SearchSummary) -> StoreResult<()> {
            self.indexed.lock().unwrap().push(summary);
            Ok(())
        }

        async fn remove(&self, _name: &str) -> StoreResult<()> {
            Ok(())
        }
    }

    fn publisher(
        store: Arc<dyn LocalStore>,
        uplink: Arc<MockUplink>,
        search: Arc<dyn SearchIndexer>,
        allow_offline: bool,
    ) -> Publisher {
        let sync = Arc::new(Synchronizer::new(
            store.clone(),
            vec![uplink as Arc<dyn Uplink>],
            Vec::new(),
        ));
        Publisher::new(store, sync, search, allow_offline)
    }

    fn not_found_uplink() -> Arc<MockUplink> {
        Arc::new(MockUplink::new("npmjs").failing(UplinkFailure::new(SyncErrorKind::NotFound, "404")))
    }

    #[tokio::test]
    async fn test_publish_writes_record_and_indexes() {
        let (store, _temp_dir) = create_flaky_store();
        let indexer = Arc::new(RecordingIndexer::default());
        let publisher = publisher(store.clone(), not_found_uplink(), indexer.clone(), false);

        let mut metadata = local_record("fresh", "1.0.0");
        metadata.revision = None;
        publisher.publish("fresh", metadata).await.unwrap();

        let stored = store.read_record("fresh").await.unwrap();
        assert_eq!(stored.id.as_deref(), Some("fresh"));
        assert!(stored.revision.as_deref().unwrap().starts_with("1-"));
        assert!(stored.time.contains_key(TIME_CREATED));
        assert!(stored.time.contains_key(TIME_MODIFIED));
        assert!(stored.time.contains_key("1.0.0"));

        let indexed = indexer.indexed.lock().unwrap();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].name, "fresh");
        assert_eq!(indexed[0].dist_tags["latest"], "1.0.0");
    }

    #[tokio::test]
    async fn test_local_conflict_contacts_no_uplink() {
        let (store, _temp_dir) = create_flaky_store();
        store
            .write_record("taken", &local_record("taken", "1.0.0"), None)
            .await
            .unwrap();
        let uplink = not_found_uplink();
        let publisher = publisher(store, uplink.clone(), Arc::new(NoopIndexer), false);

        let err = publisher
            .publish("taken", local_record("taken", "2.0.0"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(uplink.metadata_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_conflict() {
        let (store, _temp_dir) = create_flaky_store();
        let uplink = Arc::new(MockUplink::new("npmjs").serving(remote_document("react", &["18.0.0"]), None));
        let publisher = publisher(store.clone(), uplink, Arc::new(NoopIndexer), false);

        let err = publisher
            .publish("react", local_record("react", "0.0.1"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.read_record("react").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_uplink_blocks_publish() {
        let (store, _temp_dir) = create_flaky_store();
        let uplink = Arc::new(MockUplink::new("npmjs").failing(UplinkFailure::new(SyncErrorKind::Status(500), "500")));
        let publisher = publisher(store, uplink, Arc::new(NoopIndexer), false);

        let err = publisher
            .publish("pkg", local_record("pkg", "1.0.0"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ServiceUnavailable { .. }));
        assert_eq!(err.uplink_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_publish_proceeds_on_timeout() {
        let (store, _temp_dir) = create_flaky_store();
        let uplink = Arc::new(MockUplink::new("npmjs").failing(UplinkFailure::new(SyncErrorKind::Timeout, "timed out")));
        let publisher = publisher(store.clone(), uplink, Arc::new(NoopIndexer), true);

        publisher
            .publish("pkg", local_record("pkg", "1.0.0"))
            .await
            .unwrap();
        assert!(store.read_record("pkg").await.is_ok());
    }

    #[tokio::test]
    async fn test_name_mismatch_is_rejected() {
        let (store, _temp_dir) = create_flaky_store();
        let publisher = publisher(store, not_found_uplink(), Arc::new(NoopIndexer), false);

        let err = publisher
            .publish("a", local_record("b", "1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }
}
