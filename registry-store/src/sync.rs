//! # Metadata synchronization
//!
//! One pass merges what the uplinks know about a package into the local record:
//!
//! 1. every uplink routing the package is asked concurrently (joined, never raced),
//!    skipping those whose cached answer is younger than their `maxage`
//! 2. the answers are folded into the working record one by one, in configuration
//!    order, so conflicting dist-tags always resolve the same way
//! 3. the merged record is persisted and passed through the metadata filters
//!
//! Per-uplink and per-filter failures are collected next to the result. The pass only
//! fails when neither the local store nor any uplink could produce a record.

use crate::error::{StoreError, StoreResult, SyncError, SyncErrorKind, UplinkFailure};
use crate::filters::MetadataFilter;
use crate::local_store::{read_optional, LocalStore};
use crate::model::{PackageRecord, UplinkState};
use crate::normalize::{
    generate_revision, merge_uplink_time, merge_versions, normalize_package, package_template,
    validate_metadata,
};
use crate::upstream::{MetadataResponse, Uplink};
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a pass may reach beyond the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ask the uplinks at all; `false` serves from the local store only
    pub consult_uplinks: bool,
    /// Only find out whether the package exists anywhere: nothing is persisted and no
    /// filter runs
    pub existence_only: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            consult_uplinks: true,
            existence_only: false,
        }
    }
}

impl SyncOptions {
    pub fn local_only() -> Self {
        Self {
            consult_uplinks: false,
            ..Self::default()
        }
    }

    pub fn existence_only() -> Self {
        Self {
            existence_only: true,
            ..Self::default()
        }
    }
}

/// Result of a successful pass
#[derive(Debug, Clone)]
pub struct Synced {
    pub record: PackageRecord,
    /// Failures of individual uplinks and filters, in that order
    pub errors: Vec<SyncError>,
}

/// Attempts at storing a merged record before a conflict is reported
const MAX_PERSIST_ATTEMPTS: usize = 5;

/// What one uplink answered during a pass
enum Outcome {
    Cached,
    NotModified,
    Fresh {
        remote: Box<PackageRecord>,
        etag: Option<String>,
    },
    Failed(UplinkFailure),
}

/// An uplink answer that changes the record, kept so it can be merged again
enum Contribution {
    NotModified,
    Fresh {
        remote: Box<PackageRecord>,
        etag: Option<String>,
    },
}

/// Fold the uplink answers into `record` in configuration order
fn apply_contributions(
    record: &mut PackageRecord,
    contributions: &[(String, Contribution)],
    fetched: i64,
) {
    for (id, contribution) in contributions {
        match contribution {
            Contribution::NotModified => {
                record.uplinks.entry(id.clone()).or_default().fetched = Some(fetched);
            }
            Contribution::Fresh { remote, etag } => {
                record.time = merge_uplink_time(record, remote);
                merge_versions(record, remote.as_ref().clone(), id);
                record.uplinks.insert(
                    id.clone(),
                    UplinkState {
                        etag: etag.clone(),
                        fetched: Some(fetched),
                    },
                );
            }
        }
    }
}

pub struct Synchronizer {
    store: Arc<dyn LocalStore>,
    uplinks: Vec<Arc<dyn Uplink>>,
    filters: Vec<Arc<dyn MetadataFilter>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn LocalStore>,
        uplinks: Vec<Arc<dyn Uplink>>,
        filters: Vec<Arc<dyn MetadataFilter>>,
    ) -> Self {
        Self {
            store,
            uplinks,
            filters,
        }
    }

    /// Configured uplinks in configuration order
    pub fn uplinks(&self) -> &[Arc<dyn Uplink>] {
        &self.uplinks
    }

    /// Synchronize `name` against its uplinks.
    ///
    /// `local` is the record as currently stored, `None` when the package is not known
    /// locally.
    ///
    /// # Errors
    ///
    /// - `StoreError::ServiceUnavailable` when nothing was found and at least one uplink
    ///   timed out or reset the connection
    /// - `StoreError::NotFound` when nothing was found otherwise
    /// - any error of the local store while persisting the merged record
    ///
    /// Both not-found variants carry every per-uplink error.
    pub async fn synchronize(
        &self,
        name: &str,
        local: Option<PackageRecord>,
        options: SyncOptions,
    ) -> StoreResult<Synced> {
        let (mut record, mut found, local_revision) = match local {
            Some(record) => {
                let revision = record.revision.clone().unwrap_or_default();
                (record, true, Some(revision))
            }
            None => (package_template(name), false, None),
        };

        let eligible: Vec<Arc<dyn Uplink>> = if options.consult_uplinks {
            self.uplinks
                .iter()
                .filter(|uplink| uplink.matches(name))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        debug!(package = %name, uplinks = eligible.len(), found, "Synchronizing metadata");

        if eligible.is_empty() {
            if found {
                return Ok(Synced {
                    record,
                    errors: Vec::new(),
                });
            }
            return Err(StoreError::not_found(format!("package not found: {name}")));
        }

        let started = now_millis();
        let outcomes = join_all(eligible.iter().map(|uplink| {
            let state = record.uplinks.get(uplink.id()).cloned();
            fetch_outcome(uplink.as_ref(), name, state, started)
        }))
        .await;

        let mut errors = Vec::new();
        let mut contributions = Vec::new();
        for (uplink, outcome) in eligible.iter().zip(outcomes) {
            let id = uplink.id();
            match outcome {
                Outcome::Cached => {
                    debug!(package = %name, uplink = %id, "Uplink metadata still fresh");
                }
                Outcome::NotModified => {
                    contributions.push((id.to_string(), Contribution::NotModified));
                }
                Outcome::Fresh { remote, etag } => {
                    found = true;
                    contributions.push((id.to_string(), Contribution::Fresh { remote, etag }));
                }
                Outcome::Failed(failure) => {
                    warn!(package = %name, uplink = %id, kind = ?failure.kind, error = %failure.message, "Uplink failed");
                    errors.push(SyncError::uplink(id, failure));
                }
            }
        }

        if !found {
            if errors.iter().any(|e| e.kind.is_unreachable()) {
                return Err(StoreError::ServiceUnavailable {
                    message: format!("uplinks are unreachable while looking up {name}"),
                    uplink_errors: errors,
                });
            }
            return Err(StoreError::NotFound {
                message: format!("package not found: {name}"),
                uplink_errors: errors,
            });
        }

        let fetched = now_millis();
        apply_contributions(&mut record, &contributions, fetched);

        if options.existence_only {
            return Ok(Synced { record, errors });
        }

        if !contributions.is_empty() {
            record = self
                .persist(name, record, local_revision, &contributions, fetched)
                .await?;
        }

        let (record, filter_errors) = self.apply_filters(name, record).await;
        errors.extend(filter_errors);

        Ok(Synced { record, errors })
    }

    /// Store the merged record.
    ///
    /// When another writer got there first, the uplink answers of this pass are merged
    /// again into whatever is stored now and the write is retried.
    async fn persist(
        &self,
        name: &str,
        mut record: PackageRecord,
        mut expected_revision: Option<String>,
        contributions: &[(String, Contribution)],
        fetched: i64,
    ) -> StoreResult<PackageRecord> {
        let mut attempt = 1;
        loop {
            let mut candidate = normalize_package(record);
            candidate.revision = Some(generate_revision(
                expected_revision.as_deref().unwrap_or_default(),
            ));

            match self
                .store
                .write_record(name, &candidate, expected_revision.as_deref())
                .await
            {
                Ok(()) => {
                    info!(package = %name, revision = ?candidate.revision, "Stored merged metadata");
                    return Ok(candidate);
                }
                // a conflict, or the record vanished since it was read
                Err(e)
                    if attempt < MAX_PERSIST_ATTEMPTS
                        && (matches!(e, StoreError::Conflict(_)) || e.is_not_found()) =>
                {
                    debug!(package = %name, attempt, reason = %e, "Record changed concurrently, merging again");
                    attempt += 1;

                    let current = read_optional(self.store.as_ref(), name).await?;
                    expected_revision = current
                        .as_ref()
                        .map(|current| current.revision.clone().unwrap_or_default());
                    record = current.unwrap_or_else(|| package_template(name));
                    apply_contributions(&mut record, contributions, fetched);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run every filter in order. A failing filter leaves the record as it was.
    async fn apply_filters(
        &self,
        name: &str,
        mut record: PackageRecord,
    ) -> (PackageRecord, Vec<SyncError>) {
        let mut errors = Vec::new();
        for filter in &self.filters {
            match filter.filter_metadata(record.clone()).await {
                Ok(filtered) => record = filtered,
                Err(e) => {
                    error!(package = %name, filter = %filter.name(), error = %e, "Metadata filter failed");
                    errors.push(SyncError::filter(filter.name(), &e));
                }
            }
        }
        (record, errors)
    }
}

async fn fetch_outcome(
    uplink: &dyn Uplink,
    name: &str,
    state: Option<UplinkState>,
    now: i64,
) -> Outcome {
    let maxage = i64::try_from(uplink.maxage().as_millis()).unwrap_or(i64::MAX);
    if let Some(fetched) = state.as_ref().and_then(|state| state.fetched) {
        if now - fetched < maxage {
            return Outcome::Cached;
        }
    }

    let etag = state.as_ref().and_then(|state| state.etag.as_deref());
    match uplink.fetch_metadata(name, etag).await {
        Ok(MetadataResponse::NotModified) => Outcome::NotModified,
        Ok(MetadataResponse::Modified { body, etag }) => match validate_metadata(body, name) {
            Ok(remote) => Outcome::Fresh {
                remote: Box::new(remote),
                etag,
            },
            Err(e) => Outcome::Failed(UplinkFailure::new(SyncErrorKind::Validation, e.to_string())),
        },
        Err(failure) => Outcome::Failed(failure),
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
