//! Metadata filter plugins
//!
//! Filters run after every synchronization pass that touched an uplink, strictly in
//! registration order. A filter may rewrite the record freely (hide versions, patch
//! dist-tags, ...). Because a broken filter is a policy concern, its failure is always
//! reported back to the caller even though the pass carries on.

use crate::error::StoreResult;
use crate::model::PackageRecord;
use async_trait::async_trait;

#[async_trait]
pub trait MetadataFilter: Send + Sync {
    /// Name used when reporting failures
    fn name(&self) -> &str;

    async fn filter_metadata(&self, record: PackageRecord) -> StoreResult<PackageRecord>;
}
