//! # Tarball retrieval
//!
//! [`TarballEngine::get_tarball`] hands back a [`TarballStream`] right away and does
//! the work in a producer task owned by that stream:
//!
//! - a file already in the local store is relayed as-is, without touching metadata
//!   or the network
//! - on a local miss the package's `_distfiles` entry locates the remote copy (running
//!   a synchronization pass when the local record does not know the file), the owning
//!   uplink streams it, and each chunk is teed into a local cache write
//!
//! Caching is best effort: a cache write that cannot be opened, fails midway, or ends
//! with a checksum mismatch is discarded while the client still receives every byte.
//! Dropping or aborting the stream stops the producer, which releases both the remote
//! response and the pending cache write.

use crate::error::{StoreError, StoreResult};
use crate::local_store::{read_optional, ByteStream, LocalStore, TarballSink};
use crate::model::DistFile;
use crate::sync::{SyncOptions, Synchronizer};
use crate::upstream::{HttpUplink, Uplink};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha1::{Digest, Sha1};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 16;

/// One item of a tarball download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TarballEvent {
    /// Total size, announced at most once and before any data when known
    ContentLength(u64),
    Data(Bytes),
}

/// An abortable, lazily produced tarball download.
///
/// Ends after the last chunk, or after yielding a single error.
pub struct TarballStream {
    receiver: mpsc::Receiver<StoreResult<TarballEvent>>,
    producer: JoinHandle<()>,
}

impl TarballStream {
    /// Stop the download. Local and remote reads are released and an unfinished cache
    /// write is discarded.
    pub fn abort(&mut self) {
        self.producer.abort();
        self.receiver.close();
    }

    /// Drain the stream, returning the announced length and the body
    pub async fn read_all(mut self) -> StoreResult<(Option<u64>, Vec<u8>)> {
        let mut length = None;
        let mut body = Vec::new();
        while let Some(event) = self.next().await {
            match event? {
                TarballEvent::ContentLength(len) => length = Some(len),
                TarballEvent::Data(chunk) => body.extend_from_slice(&chunk),
            }
        }
        Ok((length, body))
    }
}

impl Stream for TarballStream {
    type Item = StoreResult<TarballEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for TarballStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

pub struct TarballEngine {
    store: Arc<dyn LocalStore>,
    sync: Arc<Synchronizer>,
}

impl TarballEngine {
    pub fn new(store: Arc<dyn LocalStore>, sync: Arc<Synchronizer>) -> Self {
        Self { store, sync }
    }

    /// Start serving `filename` of package `name`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_tarball(&self, name: &str, filename: &str) -> TarballStream {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let fetch = TarballFetch {
            store: self.store.clone(),
            sync: self.sync.clone(),
            name: name.to_string(),
            filename: filename.to_string(),
            sender,
        };

        let producer = tokio::spawn(async move {
            let sender = fetch.sender.clone();
            if let Err(e) = fetch.run().await {
                debug!(error = %e, "Tarball download failed");
                let _ = sender.send(Err(e)).await;
            }
        });

        TarballStream { receiver, producer }
    }
}

/// State of one download, living inside the producer task
struct TarballFetch {
    store: Arc<dyn LocalStore>,
    sync: Arc<Synchronizer>,
    name: String,
    filename: String,
    sender: mpsc::Sender<StoreResult<TarballEvent>>,
}

impl TarballFetch {
    async fn run(self) -> StoreResult<()> {
        let local_miss = match self.store.open_tarball_read(&self.name, &self.filename).await {
            Ok(local) => {
                debug!(package = %self.name, filename = %self.filename, "Serving tarball from local storage");
                return self.relay_local(local).await;
            }
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        let dist_file = self.locate(local_miss).await?;
        let uplink = self.owner(&dist_file)?;
        self.relay_remote(uplink, dist_file).await
    }

    /// Send an event; `false` once the consumer is gone
    async fn emit(&self, event: TarballEvent) -> bool {
        self.sender.send(Ok(event)).await.is_ok()
    }

    async fn relay_local(&self, local: ByteStream) -> StoreResult<()> {
        if let Some(length) = local.content_length {
            if !self.emit(TarballEvent::ContentLength(length)).await {
                return Ok(());
            }
        }

        let mut body = local.body;
        while let Some(chunk) = body.next().await {
            if !self.emit(TarballEvent::Data(chunk?)).await {
                break;
            }
        }
        Ok(())
    }

    /// Find where the file lives upstream. A file nobody knows about reports the
    /// original local miss.
    async fn locate(&self, local_miss: StoreError) -> StoreResult<DistFile> {
        let local = read_optional(self.store.as_ref(), &self.name).await?;
        if let Some(dist_file) = local
            .as_ref()
            .and_then(|record| record.dist_files.get(&self.filename))
        {
            return Ok(dist_file.clone());
        }

        match self
            .sync
            .synchronize(&self.name, local, SyncOptions::default())
            .await
        {
            Ok(synced) => synced
                .record
                .dist_files
                .get(&self.filename)
                .cloned()
                .ok_or(local_miss),
            Err(e) if e.is_not_found() => Err(local_miss),
            Err(e) => Err(e),
        }
    }

    /// The uplink that advertised the file, then any uplink routing the package, then
    /// an ad-hoc proxy for the file's origin.
    fn owner(&self, dist_file: &DistFile) -> StoreResult<Arc<dyn Uplink>> {
        let uplinks = self.sync.uplinks();
        let recorded = dist_file.registry.as_deref().and_then(|id| {
            uplinks
                .iter()
                .find(|uplink| uplink.id() == id && uplink.matches(&self.name))
        });

        if let Some(uplink) = recorded.or_else(|| uplinks.iter().find(|uplink| uplink.matches(&self.name))) {
            return Ok(uplink.clone());
        }

        debug!(package = %self.name, url = %dist_file.url, "No configured uplink owns tarball");
        Ok(Arc::new(HttpUplink::autogenerated(&dist_file.url)?))
    }

    fn open_cache(&self, sink: StoreResult<Box<dyn TarballSink>>) -> Option<Box<dyn TarballSink>> {
        match sink {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!(package = %self.name, filename = %self.filename, error = %e, "Cannot cache tarball, serving without cache");
                None
            }
        }
    }

    async fn relay_remote(&self, uplink: Arc<dyn Uplink>, dist_file: DistFile) -> StoreResult<()> {
        let (mut sink, remote) = if uplink.cache_enabled() {
            let (sink, remote) = tokio::join!(
                self.store.open_tarball_write(&self.name, &self.filename),
                uplink.fetch_tarball(&dist_file.url)
            );
            (self.open_cache(sink), remote)
        } else {
            (None, uplink.fetch_tarball(&dist_file.url).await)
        };

        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                if let Some(sink) = sink {
                    sink.abort().await;
                }
                return Err(e);
            }
        };
        info!(package = %self.name, filename = %self.filename, uplink = %uplink.id(), "Fetching tarball from uplink");

        if let Some(length) = remote.content_length {
            if !self.emit(TarballEvent::ContentLength(length)).await {
                if let Some(sink) = sink {
                    sink.abort().await;
                }
                return Ok(());
            }
        }

        let mut hasher = dist_file.sha.as_ref().map(|_| Sha1::new());
        let mut body = remote.body;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Some(sink) = sink.take() {
                        sink.abort().await;
                    }
                    return Err(e);
                }
            };

            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }

            if let Some(writer) = sink.as_mut() {
                if let Err(e) = writer.write(chunk.clone()).await {
                    warn!(package = %self.name, filename = %self.filename, error = %e, "Cache write failed, serving without cache");
                    if let Some(sink) = sink.take() {
                        sink.abort().await;
                    }
                }
            }

            if !self.emit(TarballEvent::Data(chunk)).await {
                if let Some(sink) = sink.take() {
                    sink.abort().await;
                }
                return Ok(());
            }
        }

        let Some(sink) = sink else {
            return Ok(());
        };

        if let (Some(expected), Some(hasher)) = (dist_file.sha.as_deref(), hasher) {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(package = %self.name, filename = %self.filename, expected = %expected, actual = %actual, "Checksum mismatch, discarding cached tarball");
                sink.abort().await;
                return Ok(());
            }
        }

        match sink.commit().await {
            Ok(()) => info!(package = %self.name, filename = %self.filename, "Cached tarball"),
            Err(e) => warn!(package = %self.name, filename = %self.filename, error = %e, "Failed to commit cached tarball"),
        }
        Ok(())
    }
}
