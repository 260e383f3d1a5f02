//! Search indexer seam
//!
//! The storage layer only tells the indexer what changed. Index maintenance is
//! fire-and-forget: failures are logged by the caller and never fail a publish or a
//! removal.

use crate::error::StoreResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Searchable summary of a package, derived from its latest version
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
    pub maintainers: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Value>,
    #[serde(rename = "readmeFilename")]
    pub readme_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bugs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<Value>,
    pub versions: BTreeMap<String, String>,
}

#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn index(&self, summary: SearchSummary) -> StoreResult<()>;

    async fn remove(&self, name: &str) -> StoreResult<()>;
}

/// Indexer used when no search backend is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIndexer;

#[async_trait]
impl SearchIndexer for NoopIndexer {
    async fn index(&self, _summary: SearchSummary) -> StoreResult<()> {
        Ok(())
    }

    async fn remove(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }
}
