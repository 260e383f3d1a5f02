//! # Registry Store
//!
//! Storage core of a private npm-style package registry. Package metadata and
//! tarballs are served from a local store while zero or more upstream registries
//! ("uplinks") are federated: their metadata is merged into the local record and
//! their tarballs are cached on first download.
//!
//! ## Key Modules
//!
//! - [`storage`]: the [`Storage`] facade, entry point for an HTTP layer
//! - [`sync`]: metadata synchronization against the uplinks
//! - [`tarball`]: streaming tarball retrieval with cache fill
//! - [`publish`]: publishing new packages
//! - [`normalize`]: pure record helpers (normalization, tags, revisions, readmes)
//! - [`local_store`] and [`fs_store`]: the durable store seam and its filesystem
//!   implementation
//! - [`upstream`]: the uplink seam and its HTTP implementation
//! - [`config`], [`error`], [`logging`]: configuration, error taxonomy, tracing setup
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use registry_store::{Config, GetPackageOptions, Storage};
//! # async fn example() -> Result<(), registry_store::StoreError> {
//! let _guard = registry_store::logging::init_subscriber();
//! let storage = Storage::from_config(Config::load_or_default("registry.json")?)?;
//!
//! let synced = storage
//!     .get_package("lodash", GetPackageOptions::default())
//!     .await?;
//! println!("{} versions", synced.record.versions.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod filters;
pub mod fs_store;
pub mod local_store;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod publish;
pub mod search;
pub mod storage;
pub mod sync;
pub mod tarball;
pub mod tokens;
pub mod upstream;

pub use config::{Config, PackageRule, UplinkConfig};
pub use error::{ErrorCode, ErrorSource, StoreError, StoreResult, SyncError, SyncErrorKind};
pub use fs_store::FsLocalStore;
pub use local_store::{ByteStream, LocalStore, TarballSink};
pub use model::{DistFile, PackageRecord, VersionRecord};
pub use storage::{GetPackageOptions, LocalPackage, Storage, TarballUpload};
pub use sync::{SyncOptions, Synced, Synchronizer};
pub use tarball::{TarballEvent, TarballStream};
pub use upstream::{HttpUplink, MetadataResponse, Uplink};

/// Calculate the SHA-1 of data as lowercase hex, the form npm uses for `dist.shasum`.
///
/// # Examples
///
/// ```
/// # use registry_store::sha1_hash;
/// let hash = sha1_hash(b"hello world");
/// assert_eq!(hash, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
/// ```
pub fn sha1_hash(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Validates a tarball filename before it is turned into a path.
///
/// # Errors
///
/// Returns `StoreError::BadRequest` if the filename:
/// - is empty or longer than 255 characters
/// - contains null bytes or control characters
/// - contains `..`, or starts with `/` or `\`
/// - starts with a drive letter
/// - is a reserved Windows device name
///
/// # Examples
///
/// ```
/// # use registry_store::validate_filename;
/// assert!(validate_filename("lodash-4.17.21.tgz").is_ok());
/// assert!(validate_filename("../package.json").is_err());
/// assert!(validate_filename("/etc/passwd").is_err());
/// ```
pub fn validate_filename(filename: &str) -> StoreResult<()> {
    const MAX_FILENAME_LENGTH: usize = 255;
    const RESERVED_WINDOWS_NAMES: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    let reject = |reason: &str| {
        tracing::warn!(filename = %filename.escape_debug(), reason = %reason, "Rejected filename");
        Err(StoreError::BadRequest(format!("invalid filename: {reason}")))
    };

    if filename.is_empty() {
        return reject("empty");
    }
    if filename.len() > MAX_FILENAME_LENGTH {
        return reject("too long");
    }
    if filename.chars().any(char::is_control) {
        return reject("contains control characters");
    }
    if filename.contains("..") {
        return reject("contains parent directory reference");
    }
    if filename.starts_with('/') || filename.starts_with('\\') {
        return reject("absolute path");
    }

    let mut chars = filename.chars();
    if let (Some(first), Some(':')) = (chars.next(), chars.next()) {
        if first.is_ascii_alphabetic() {
            return reject("contains drive letter");
        }
    }

    let base_name = filename
        .rfind('.')
        .map_or(filename, |dot| &filename[..dot]);
    if RESERVED_WINDOWS_NAMES
        .iter()
        .any(|reserved| base_name.eq_ignore_ascii_case(reserved))
    {
        return reject("reserved on Windows");
    }

    Ok(())
}

#[cfg(test)]
pub mod test_utils;
