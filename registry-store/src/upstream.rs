use crate::config::{Config, PackageRules, UplinkConfig};
use crate::error::{StoreError, StoreResult, SyncErrorKind, UplinkFailure};
use crate::local_store::ByteStream;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const METADATA_ACCEPT: &str =
    "application/json;q=0.9, application/vnd.npm.install-v1+json;q=0.8, */*;q=0.1";
const USER_AGENT: &str = concat!("registry-store/", env!("CARGO_PKG_VERSION"));

/// Answer of an uplink to a metadata request
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataResponse {
    /// A full document, together with the validator to use next time
    Modified { body: Value, etag: Option<String> },
    /// The cached validator is still current
    NotModified,
}

/// An upstream registry the storage layer can proxy.
///
/// Implementations must be cheap to share: the synchronizer and the tarball engine
/// hold them behind `Arc` and call them concurrently.
#[async_trait]
pub trait Uplink: Send + Sync {
    /// Stable identifier, as used in configuration and `_uplinks`
    fn id(&self) -> &str;

    /// How long fetched metadata stays fresh
    fn maxage(&self) -> Duration;

    /// Whether tarballs fetched through this uplink are cached locally
    fn cache_enabled(&self) -> bool {
        true
    }

    /// Whether packages called `name` are routed through this uplink
    fn matches(&self, name: &str) -> bool;

    async fn fetch_metadata(
        &self,
        name: &str,
        etag: Option<&str>,
    ) -> Result<MetadataResponse, UplinkFailure>;

    async fn fetch_tarball(&self, url: &str) -> StoreResult<ByteStream>;
}

/// HTTP client for one upstream registry.
///
/// Wraps a [`reqwest::Client`] configured with the uplink's timeout. Routing is
/// decided by the shared [`PackageRules`]; an autogenerated uplink (see
/// [`HttpUplink::autogenerated`]) routes nothing and only serves tarballs by URL.
///
/// # Examples
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use registry_store::config::{Config, PackageRules};
/// # use registry_store::upstream::{HttpUplink, Uplink};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let rules = Arc::new(PackageRules::compile(&config.packages)?);
/// let npmjs = HttpUplink::new("npmjs", &config.uplinks["npmjs"], rules)?;
///
/// let metadata = npmjs.fetch_metadata("express", None).await?;
/// # Ok(())
/// # }
/// ```
pub struct HttpUplink {
    id: String,
    base_url: String,
    maxage: Duration,
    cache: bool,
    rules: Option<Arc<PackageRules>>,
    client: Client,
}

impl HttpUplink {
    /// Create a configured uplink.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be created.
    pub fn new(id: &str, config: &UplinkConfig, rules: Arc<PackageRules>) -> StoreResult<Self> {
        Ok(Self {
            id: id.to_string(),
            base_url: config.url.trim_end_matches('/').to_string(),
            maxage: config.maxage,
            cache: config.cache,
            rules: Some(rules),
            client: build_client(config.timeout)?,
        })
    }

    /// A one-off caching proxy bound to the origin of `url`, used for tarballs hosted
    /// outside the configured uplinks.
    pub fn autogenerated(url: &str) -> StoreResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| StoreError::BadRequest(format!("invalid tarball url '{url}': {e}")))?;
        let origin = parsed.origin().ascii_serialization();
        let config = UplinkConfig::new(origin.clone());

        Ok(Self {
            id: origin.clone(),
            base_url: origin,
            maxage: config.maxage,
            cache: true,
            rules: None,
            client: build_client(config.timeout)?,
        })
    }

    fn metadata_url(&self, name: &str) -> String {
        // scoped names keep the '@' but escape the separator
        format!("{}/{}", self.base_url, name.replace('/', "%2f"))
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

/// One [`HttpUplink`] per configured uplink, in configuration order, sharing the
/// compiled package rules.
pub fn build_uplinks(config: &Config) -> StoreResult<Vec<Arc<dyn Uplink>>> {
    let rules = Arc::new(PackageRules::compile(&config.packages)?);
    config
        .uplinks
        .iter()
        .map(|(id, uplink)| {
            let uplink: Arc<dyn Uplink> = Arc::new(HttpUplink::new(id, uplink, rules.clone())?);
            Ok(uplink)
        })
        .collect()
}

fn build_client(timeout: Duration) -> StoreResult<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| StoreError::Internal(format!("Failed to create HTTP client: {e}")))
}

/// Map a transport error onto the failure taxonomy.
///
/// Timeouts and connection resets are singled out because they make the registry
/// answer "unavailable" rather than "not found".
pub fn classify_transport_error(error: &reqwest::Error) -> SyncErrorKind {
    if error.is_timeout() {
        return SyncErrorKind::Timeout;
    }

    let mut source = error.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::TimedOut => return SyncErrorKind::Timeout,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    return SyncErrorKind::ConnectionReset
                }
                _ => {}
            }
        }
        source = inner.source();
    }

    SyncErrorKind::Transport
}

#[async_trait]
impl Uplink for HttpUplink {
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
        self.rules
            .as_ref()
            .is_some_and(|rules| rules.proxies_to(name, &self.id))
    }

    async fn fetch_metadata(
        &self,
        name: &str,
        etag: Option<&str>,
    ) -> Result<MetadataResponse, UplinkFailure> {
        let url = self.metadata_url(name);
        debug!(uplink = %self.id, url = %url, etag = ?etag, "Fetching metadata");

        let mut request = self.client.get(&url).header(ACCEPT, METADATA_ACCEPT);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| {
            warn!(uplink = %self.id, error = %e, "Failed to fetch metadata");
            UplinkFailure::new(classify_transport_error(&e), e.to_string())
        })?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!(uplink = %self.id, package = %name, "Metadata not modified");
                Ok(MetadataResponse::NotModified)
            }
            StatusCode::NOT_FOUND => Err(UplinkFailure::new(
                SyncErrorKind::NotFound,
                format!("package not found on {}: {name}", self.id),
            )),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let body = response.json::<Value>().await.map_err(|e| {
                    if e.is_decode() {
                        UplinkFailure::new(
                            SyncErrorKind::Validation,
                            format!("invalid JSON from {}: {e}", self.id),
                        )
                    } else {
                        UplinkFailure::new(classify_transport_error(&e), e.to_string())
                    }
                })?;
                info!(uplink = %self.id, package = %name, "Successfully fetched metadata");
                Ok(MetadataResponse::Modified { body, etag })
            }
            status => Err(UplinkFailure::new(
                SyncErrorKind::Status(status.as_u16()),
                format!("bad status code {} from {}", status.as_u16(), self.id),
            )),
        }
    }

    async fn fetch_tarball(&self, url: &str) -> StoreResult<ByteStream> {
        let full_url = self.absolute_url(url);
        debug!(uplink = %self.id, url = %full_url, "Streaming tarball");

        let response = self.client.get(&full_url).send().await.map_err(|e| {
            warn!(uplink = %self.id, error = %e, "Failed to fetch tarball");
            match classify_transport_error(&e) {
                kind if kind.is_unreachable() => {
                    StoreError::unavailable(format!("uplink {} is unreachable: {e}", self.id))
                }
                _ => StoreError::Internal(format!("tarball request to {} failed: {e}", self.id)),
            }
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::not_found(format!(
                "file not found on {}: {full_url}",
                self.id
            ))),
            status if status.is_success() => {
                let content_length = response.content_length();
                let uplink = self.id.clone();
                let body = response
                    .bytes_stream()
                    .map_err(move |e| {
                        StoreError::Internal(format!("tarball stream from {uplink} failed: {e}"))
                    })
                    .boxed();
                Ok(ByteStream::new(content_length, body))
            }
            status => Err(StoreError::Internal(format!(
                "bad status code {} from {} for {full_url}",
                status.as_u16(),
                self.id
            ))),
        }
    }
}
