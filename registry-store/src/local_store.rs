//! Local store seam
//!
//! The durable side of the registry: package records and tarball bytes. The
//! orchestration code only talks to [`LocalStore`]; [`crate::fs_store::FsLocalStore`]
//! is the bundled filesystem implementation.

use crate::error::StoreResult;
use crate::model::PackageRecord;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::fmt;

/// A lazily produced byte sequence with an optional known length
pub struct ByteStream {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, StoreResult<Bytes>>,
}

impl ByteStream {
    pub fn new(content_length: Option<u64>, body: BoxStream<'static, StoreResult<Bytes>>) -> Self {
        Self {
            content_length,
            body,
        }
    }

    /// A stream over chunks already held in memory
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let length = chunks.iter().map(|chunk| chunk.len() as u64).sum();
        Self::new(
            Some(length),
            futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        )
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Destination of a tarball being written into the store.
///
/// Content becomes visible to readers only after [`TarballSink::commit`]. Dropping a
/// sink without committing discards what was written.
#[async_trait]
pub trait TarballSink: Send {
    async fn write(&mut self, chunk: Bytes) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read a package record; `StoreError::NotFound` when the package is unknown
    async fn read_record(&self, name: &str) -> StoreResult<PackageRecord>;

    /// Write a package record.
    ///
    /// `expected_revision` is the revision the caller based its change on; `None`
    /// means the package must not exist yet. A mismatch fails with
    /// `StoreError::Conflict`.
    async fn write_record(
        &self,
        name: &str,
        record: &PackageRecord,
        expected_revision: Option<&str>,
    ) -> StoreResult<()>;

    /// Remove a package record together with all its tarballs
    async fn remove_record(&self, name: &str) -> StoreResult<()>;

    async fn open_tarball_read(&self, name: &str, filename: &str) -> StoreResult<ByteStream>;

    /// Open a sink for a tarball; fails with `StoreError::Conflict` if it already exists
    async fn open_tarball_write(
        &self,
        name: &str,
        filename: &str,
    ) -> StoreResult<Box<dyn TarballSink>>;

    async fn remove_tarball(&self, name: &str, filename: &str) -> StoreResult<()>;

    async fn list_package_names(&self) -> StoreResult<Vec<String>>;
}

/// Treat a missing record as `None`, any other failure as an error
pub async fn read_optional(store: &dyn LocalStore, name: &str) -> StoreResult<Option<PackageRecord>> {
    match store.read_record(name).await {
        Ok(record) => Ok(Some(record)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Drain a [`ByteStream`] into memory
pub async fn collect_bytes(stream: ByteStream) -> StoreResult<Vec<u8>> {
    let mut body = stream.body;
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}
