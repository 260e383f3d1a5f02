//! Package record model
//!
//! Strongly typed versions of the npm-style package document. Upstream metadata is
//! deserialized into these types as soon as it arrives, so every later stage works
//! with validated data. Unknown keys are preserved through the flattened `extra`
//! maps so a round trip through the store does not lose information.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Reserved `time` key holding the creation timestamp
pub const TIME_CREATED: &str = "created";
/// Reserved `time` key holding the last modification timestamp
pub const TIME_MODIFIED: &str = "modified";
/// The dist-tag every normalized record carries when it has versions
pub const LATEST_TAG: &str = "latest";

/// Treat an explicit JSON `null` as the type's default value.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The canonical representation of one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,

    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub versions: BTreeMap<String, VersionRecord>,

    #[serde(rename = "dist-tags", default, deserialize_with = "null_as_default")]
    pub dist_tags: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub time: BTreeMap<String, String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub users: BTreeMap<String, bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,

    /// Per-uplink cache freshness, never shown to API consumers
    #[serde(
        rename = "_uplinks",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub uplinks: BTreeMap<String, UplinkState>,

    /// Where tarballs not yet cached locally can be fetched from
    #[serde(
        rename = "_distfiles",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub dist_files: BTreeMap<String, DistFile>,

    /// Transient upload payloads, cleared before a record reaches a reader
    #[serde(rename = "_attachments", default, deserialize_with = "null_as_default")]
    pub attachments: BTreeMap<String, Attachment>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PackageRecord {
    /// An empty record for `name`, as used before anything is known about it
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            revision: None,
            versions: BTreeMap::new(),
            dist_tags: BTreeMap::new(),
            time: BTreeMap::new(),
            users: BTreeMap::new(),
            readme: None,
            uplinks: BTreeMap::new(),
            dist_files: BTreeMap::new(),
            attachments: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// The version the `latest` tag points at, if it exists
    pub fn latest(&self) -> Option<&VersionRecord> {
        self.dist_tags
            .get(LATEST_TAG)
            .and_then(|version| self.versions.get(version))
    }
}

/// One published version of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub dist: Dist,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainers: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bugs: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,

    #[serde(
        rename = "readmeFilename",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub readme_filename: Option<String>,

    /// Provenance: the uplink that supplied this version, `None` when published locally
    #[serde(rename = "_uplink", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VersionRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dist: Dist::default(),
            description: None,
            author: None,
            maintainers: None,
            repository: None,
            homepage: None,
            keywords: None,
            bugs: None,
            license: None,
            readme: None,
            readme_filename: None,
            origin: None,
            extra: Map::new(),
        }
    }
}

/// Tarball location and integrity data of a version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Dist {
    /// The file name part of the tarball URL
    pub fn filename(&self) -> Option<String> {
        tarball_filename(&self.tarball)
    }
}

/// Extract the last path segment of a tarball URL.
///
/// Absolute URLs are parsed properly; anything else falls back to splitting on `/`.
pub fn tarball_filename(tarball: &str) -> Option<String> {
    let segment = match url::Url::parse(tarball) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(|s| s.to_string()),
        Err(_) => tarball.rsplit('/').next().map(|s| s.to_string()),
    };
    segment.filter(|s| !s.is_empty())
}

/// Cached freshness information for one uplink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Epoch milliseconds of the last successful fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<i64>,
}

/// A remotely hosted tarball that has not necessarily been cached yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistFile {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,

    /// Identifier of the uplink that advertised this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

/// An inline tarball upload carried by a publish request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    /// SHA-1 of an uploaded tarball, recorded once the upload completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,

    /// Version the tarball was attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// An API token as kept by the token store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub user: String,
    pub key: String,
    pub token: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub cidr: Vec<String>,
    /// Epoch milliseconds
    pub created: i64,
}

/// Selection criteria for listing tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFilter {
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_collections_deserialize_as_empty() {
        let record: PackageRecord = serde_json::from_value(json!({
            "name": "pkg",
            "versions": null,
            "dist-tags": null,
            "_distfiles": null,
            "_attachments": null,
            "_uplinks": null,
            "time": null
        }))
        .unwrap();

        assert!(record.versions.is_empty());
        assert!(record.dist_tags.is_empty());
        assert!(record.dist_files.is_empty());
        assert!(record.attachments.is_empty());
        assert!(record.uplinks.is_empty());
        assert!(record.time.is_empty());
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let source = json!({
            "name": "pkg",
            "description": "kept",
            "versions": {
                "1.0.0": {
                    "name": "pkg",
                    "version": "1.0.0",
                    "scripts": { "test": "true" },
                    "dist": { "tarball": "https://r.example/pkg/-/pkg-1.0.0.tgz", "fileCount": 3 }
                }
            }
        });
        let record: PackageRecord = serde_json::from_value(source).unwrap();
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["description"], "kept");
        assert_eq!(value["versions"]["1.0.0"]["scripts"]["test"], "true");
        assert_eq!(value["versions"]["1.0.0"]["dist"]["fileCount"], 3);
    }

    #[test]
    fn test_provenance_is_a_regular_field() {
        let mut version = VersionRecord::new("pkg", "1.0.0");
        version.origin = Some("npmjs".to_string());
        let value = serde_json::to_value(&version).unwrap();
        assert_eq!(value["_uplink"], "npmjs");

        let back: VersionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.origin.as_deref(), Some("npmjs"));
    }

    #[test]
    fn test_tarball_filename() {
        assert_eq!(
            tarball_filename("https://registry.npmjs.org/@scope/pkg/-/pkg-1.0.0.tgz").as_deref(),
            Some("pkg-1.0.0.tgz")
        );
        assert_eq!(
            tarball_filename("/pkg/-/pkg-2.0.0.tgz").as_deref(),
            Some("pkg-2.0.0.tgz")
        );
        assert_eq!(tarball_filename("https://registry.npmjs.org/"), None);
    }
}
