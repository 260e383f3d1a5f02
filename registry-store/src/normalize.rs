//! # Record normalization and merge helpers
//!
//! Pure functions over [`PackageRecord`]; nothing in here performs I/O. These are the
//! shared primitives used by the synchronizer, the publish path and the facade:
//!
//! - shape normalization ([`normalize_package`], [`normalize_dist_tags`])
//! - the tag rule ([`tag_version`])
//! - revision tokens ([`generate_revision`])
//! - reader-facing cleanup ([`strip_private`], [`latest_readme`], [`rewrite_tarball_urls`])
//! - upstream merging ([`validate_metadata`], [`merge_uplink_time`], [`merge_versions`])

use crate::error::{StoreError, StoreResult};
use crate::model::{tarball_filename, DistFile, PackageRecord, LATEST_TAG};
use crate::search::SearchSummary;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Revision assigned to records that never had one
pub const DEFAULT_REVISION: &str = "0-0000000000000000";

/// Pre-release tags consulted, in order, when neither the record nor `latest` has a readme
pub const README_TAG_PRIORITY: [&str; 6] = ["next", "beta", "alpha", "test", "dev", "canary"];

/// An empty record used when a package is not known locally
pub fn package_template(name: &str) -> PackageRecord {
    let mut record = PackageRecord::new(name);
    record.revision = Some(String::new());
    record
}

/// Parse a version the way npm does in loose mode: a leading `v` or `=` is accepted.
pub fn parse_version(version: &str) -> Option<semver::Version> {
    let trimmed = version.trim().trim_start_matches(['v', '=']);
    semver::Version::parse(trimmed).ok()
}

/// Ensure revision, id and dist-tags are in canonical form.
///
/// Collection fields are already guaranteed to be present by deserialization, so
/// only the scalar defaults and the dist-tag invariants are handled here.
pub fn normalize_package(mut record: PackageRecord) -> PackageRecord {
    if record.revision.is_none() {
        record.revision = Some(DEFAULT_REVISION.to_string());
    }

    if record.id.is_none() {
        record.id = Some(record.name.clone());
    }

    normalize_dist_tags(record)
}

/// Make every dist-tag reference an existing, valid version.
///
/// When `latest` is missing it is pointed at the highest version present.
pub fn normalize_dist_tags(mut record: PackageRecord) -> PackageRecord {
    let versions = &record.versions;
    record.dist_tags.retain(|tag, version| {
        let keep = parse_version(version).is_some() && versions.contains_key(version);
        if !keep {
            debug!(tag = %tag, version = %version, "Dropping dist-tag without a matching version");
        }
        keep
    });

    // only after pruning, so a dangling `latest` is replaced in the same pass
    if !record.dist_tags.contains_key(LATEST_TAG) {
        if let Some(highest) = highest_version(record.versions.keys()) {
            record.dist_tags.insert(LATEST_TAG.to_string(), highest);
        }
    }

    record
}

fn highest_version<'a>(versions: impl Iterator<Item = &'a String>) -> Option<String> {
    versions
        .filter_map(|v| parse_version(v).map(|parsed| (parsed, v)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v.clone())
}

/// The version a reader should consider current: `latest` if tagged, otherwise the
/// highest semantic version.
pub fn latest_version(record: &PackageRecord) -> Option<String> {
    record
        .dist_tags
        .get(LATEST_TAG)
        .cloned()
        .or_else(|| highest_version(record.versions.keys()))
}

/// Point `tag` at `version`.
///
/// Returns `false`, leaving the record untouched, when the version is not valid
/// semver or the tag already points there.
pub fn tag_version(record: &mut PackageRecord, version: &str, tag: &str) -> bool {
    if tag.is_empty() || parse_version(version).is_none() {
        return false;
    }

    if record.dist_tags.get(tag).map(String::as_str) == Some(version) {
        return false;
    }

    record.dist_tags.insert(tag.to_string(), version.to_string());
    true
}

/// Produce the next revision token after `previous`.
///
/// The numeric prefix is incremented (an unparsable prefix counts as zero) and fresh
/// randomness is appended.
pub fn generate_revision(previous: &str) -> String {
    let counter = previous
        .split('-')
        .next()
        .and_then(|prefix| prefix.parse::<u64>().ok())
        .unwrap_or(0);
    let suffix: u64 = rand::rng().random();
    format!("{}-{suffix:016x}", counter.saturating_add(1))
}

/// The best readme available for a record.
///
/// Preference order: the record's own readme, the `latest` version's readme, then the
/// versions tagged with [`README_TAG_PRIORITY`]. Empty string when none has one.
pub fn latest_readme(record: &PackageRecord) -> String {
    let tagged_readme = |tag: &str| -> Option<String> {
        record
            .dist_tags
            .get(tag)
            .and_then(|version| record.versions.get(version))
            .and_then(|version| version.readme.as_deref())
            .map(|readme| readme.trim().to_string())
            .filter(|readme| !readme.is_empty())
    };

    if let Some(readme) = record
        .readme
        .as_deref()
        .map(str::trim)
        .filter(|readme| !readme.is_empty())
    {
        return readme.to_string();
    }

    std::iter::once(LATEST_TAG)
        .chain(README_TAG_PRIORITY)
        .find_map(tagged_readme)
        .unwrap_or_default()
}

/// Remove everything an external caller must not see.
///
/// Only revision, name, versions, dist-tags, readme, time, id and users survive.
/// Uplink freshness and version provenance are kept only when `keep_uplink_data` is
/// set by an internal caller.
pub fn strip_private(mut record: PackageRecord, keep_uplink_data: bool) -> PackageRecord {
    record.dist_files.clear();
    record.attachments.clear();
    record.extra.clear();

    if !keep_uplink_data {
        record.uplinks.clear();
        for version in record.versions.values_mut() {
            version.origin = None;
        }
    }

    record
}

/// Rewrite every tarball URL so clients download through this registry.
pub fn rewrite_tarball_urls(mut record: PackageRecord, base_url: &str) -> PackageRecord {
    let base = base_url.trim_end_matches('/');
    let name = record.name.clone();

    for version in record.versions.values_mut() {
        if let Some(filename) = version.dist.filename() {
            version.dist.tarball = format!("{base}/{name}/-/{filename}");
        }
    }

    record
}

/// Check that an upstream document describes `name` and deserialize it.
pub fn validate_metadata(body: Value, name: &str) -> StoreResult<PackageRecord> {
    if !body.is_object() {
        return Err(StoreError::Validation(
            "metadata is not a JSON object".to_string(),
        ));
    }

    let record: PackageRecord = serde_json::from_value(body)
        .map_err(|e| StoreError::Validation(format!("malformed metadata for {name}: {e}")))?;

    if record.name != name {
        return Err(StoreError::Validation(format!(
            "metadata name '{}' does not match requested package '{name}'",
            record.name
        )));
    }

    for (key, version) in &record.versions {
        if key != &version.version {
            return Err(StoreError::Validation(format!(
                "version key '{key}' does not match its version field '{}'",
                version.version
            )));
        }
    }

    Ok(record)
}

/// Union of both `time` maps; upstream entries win on conflicting keys.
pub fn merge_uplink_time(
    local: &PackageRecord,
    remote: &PackageRecord,
) -> BTreeMap<String, String> {
    let mut time = local.time.clone();
    time.extend(
        remote
            .time
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    time
}

/// Fold a validated upstream record into `local`.
///
/// Remote versions are stamped with `uplink` as their origin. A remote version is
/// adopted when the local record lacks it or only holds a copy that itself came from
/// an uplink; locally published versions are never replaced. Every adopted version
/// registers its tarball in `dist_files`. Remote dist-tags go through [`tag_version`].
pub fn merge_versions(local: &mut PackageRecord, remote: PackageRecord, uplink: &str) {
    for (key, mut version) in remote.versions {
        version.origin = Some(uplink.to_string());

        let adopt = match local.versions.get(&key) {
            None => true,
            Some(existing) => existing.origin.is_some(),
        };
        if !adopt {
            continue;
        }

        if let Some(filename) = tarball_filename(&version.dist.tarball) {
            local.dist_files.insert(
                filename,
                DistFile {
                    url: version.dist.tarball.clone(),
                    sha: version.dist.shasum.clone(),
                    registry: Some(uplink.to_string()),
                },
            );
        }
        local.versions.insert(key, version);
    }

    for (tag, version) in &remote.dist_tags {
        tag_version(local, version, tag);
    }

    if local.readme.as_deref().is_none_or(str::is_empty) {
        if let Some(readme) = remote.readme.filter(|readme| !readme.is_empty()) {
            local.readme = Some(readme);
        }
    }
}

/// The searchable summary of a record's latest version
pub fn search_summary(record: &PackageRecord) -> Option<SearchSummary> {
    let latest = latest_version(record)?;
    let version = record.versions.get(&latest)?;

    let maintainers = match &version.maintainers {
        Some(maintainers) => maintainers.clone(),
        None => version.author.iter().cloned().collect(),
    };

    Some(SearchSummary {
        name: version.name.clone(),
        description: version.description.clone(),
        dist_tags: BTreeMap::from([(LATEST_TAG.to_string(), latest.clone())]),
        maintainers,
        author: version.author.clone(),
        repository: version.repository.clone(),
        readme_filename: version.readme_filename.clone().unwrap_or_default(),
        homepage: version.homepage.clone(),
        keywords: version.keywords.clone(),
        bugs: version.bugs.clone(),
        license: version.license.clone(),
        versions: BTreeMap::from([(latest, LATEST_TAG.to_string())]),
    })
}
