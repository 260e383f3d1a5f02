//! # Configuration Management
//!
//! Configuration for the storage layer: where packages live, which uplinks exist,
//! which packages are routed through which uplinks, and the publish policy.
//!
//! ## Configuration Structure
//!
//! - [`Config`]: top-level settings
//! - [`UplinkConfig`]: one upstream registry (URL, staleness budget, timeout, caching)
//! - [`PackageRule`]: a package-name glob and the uplinks it may be proxied through
//! - [`PublishConfig`]: offline publish policy
//!
//! Uplinks are kept in an [`IndexMap`] so that the order they appear in the file is
//! the order they are consulted and merged in.
//!
//! ## Loading Configuration
//!
//! ```rust,no_run
//! # use registry_store::config::Config;
//! // Load from file with fallback to defaults
//! let config = Config::load_or_default("registry.json")?;
//!
//! // Use built-in defaults
//! let config = Config::default();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{StoreError, StoreResult};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Main configuration structure for the storage layer.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base directory of the filesystem store
    #[serde(default = "default_storage")]
    pub storage: PathBuf,
    /// Upstream registries in consultation order
    #[serde(default)]
    pub uplinks: IndexMap<String, UplinkConfig>,
    /// Package routing rules; the first matching pattern wins
    #[serde(default)]
    pub packages: Vec<PackageRule>,
    #[serde(default)]
    pub publish: PublishConfig,
    /// Public base URL used to rewrite tarball links handed to clients
    #[serde(default)]
    pub public_url: Option<String>,
}

/// Settings of one upstream registry.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    /// Base URL of the registry
    pub url: String,
    /// How long fetched metadata stays fresh
    #[serde(default = "default_maxage", deserialize_with = "deserialize_interval")]
    pub maxage: Duration,
    /// HTTP request timeout
    #[serde(default = "default_timeout", deserialize_with = "deserialize_interval")]
    pub timeout: Duration,
    /// Whether tarballs fetched through this uplink are cached locally
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl UplinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            maxage: default_maxage(),
            timeout: default_timeout(),
            cache: true,
        }
    }
}

/// Routing rule for a package-name pattern.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageRule {
    /// Glob over package names: `*` stays within a path segment, `**` spans segments
    pub pattern: String,
    /// Uplink identifiers matching packages may be proxied through
    #[serde(default)]
    pub proxy: Vec<String>,
}

/// Publish policy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishConfig {
    /// Allow publishing when uplinks cannot confirm the package is new
    #[serde(default)]
    pub allow_offline: bool,
}

fn default_storage() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_maxage() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, is not valid JSON, or a package rule or
    /// interval string is malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let config_str = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_str)?;
        PackageRules::compile(&config.packages)?;
        Ok(config)
    }

    /// Load configuration from file with fallback to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut uplinks = IndexMap::new();
        uplinks.insert(
            "npmjs".to_string(),
            UplinkConfig::new("https://registry.npmjs.org/"),
        );

        Config {
            storage: default_storage(),
            uplinks,
            packages: vec![
                PackageRule {
                    pattern: "@*/*".to_string(),
                    proxy: vec!["npmjs".to_string()],
                },
                PackageRule {
                    pattern: "**".to_string(),
                    proxy: vec!["npmjs".to_string()],
                },
            ],
            publish: PublishConfig::default(),
            public_url: None,
        }
    }
}

/// Compiled package routing rules.
#[derive(Debug, Clone)]
pub struct PackageRules {
    rules: Vec<(Regex, Vec<String>)>,
}

impl PackageRules {
    pub fn compile(rules: &[PackageRule]) -> StoreResult<Self> {
        let rules = rules
            .iter()
            .map(|rule| Ok((glob_to_regex(&rule.pattern)?, rule.proxy.clone())))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// The proxy list of the first rule matching `name`
    pub fn proxies_for(&self, name: &str) -> &[String] {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(name))
            .map(|(_, proxy)| proxy.as_slice())
            .unwrap_or(&[])
    }

    /// Whether packages called `name` may be fetched through `uplink`
    pub fn proxies_to(&self, name: &str, uplink: &str) -> bool {
        self.proxies_for(name).iter().any(|id| id == uplink)
    }
}

fn glob_to_regex(pattern: &str) -> StoreResult<Regex> {
    let mut expr = String::from("^");
    let mut rest = pattern;
    while let Some(pos) = rest.find('*') {
        expr.push_str(&regex::escape(&rest[..pos]));
        if rest[pos..].starts_with("**") {
            expr.push_str(".*");
            rest = &rest[pos + 2..];
        } else {
            expr.push_str("[^/]*");
            rest = &rest[pos + 1..];
        }
    }
    expr.push_str(&regex::escape(rest));
    expr.push('$');

    Regex::new(&expr)
        .map_err(|e| StoreError::BadRequest(format!("invalid package pattern '{pattern}': {e}")))
}

/// Parse an interval such as `"2m"`, `"1h 30m"` or `"500ms"`.
///
/// Supported units are `ms`, `s`, `m`, `h`, `d`, `w`, `M` (30 days) and `y` (365
/// days). A bare number is seconds. Units must appear from largest to smallest.
pub fn parse_interval(interval: &str) -> StoreResult<Duration> {
    static INTERVAL_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = INTERVAL_REGEX.get_or_init(|| {
        Regex::new(r"^((?:0|[1-9][0-9]*)(?:\.[0-9]+)?)(ms|s|m|h|d|w|M|y|)$").unwrap_or_else(|e| {
            panic!("Failed to compile interval regex: {e}. This is a bug in the code - the regex pattern should be valid.")
        })
    });

    let invalid = || StoreError::BadRequest(format!("invalid interval: {interval}"));
    let parts: Vec<&str> = interval.split_whitespace().collect();
    if parts.is_empty() {
        return Err(invalid());
    }

    let mut total_ms = 0f64;
    let mut last_unit = f64::INFINITY;
    for part in &parts {
        let caps = re.captures(part).ok_or_else(invalid)?;
        let unit = &caps[2];
        if unit.is_empty() && parts.len() > 1 {
            return Err(invalid());
        }
        let unit_ms = match unit {
            "ms" => 1.0,
            "" | "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            "w" => 7.0 * 86_400_000.0,
            "M" => 30.0 * 86_400_000.0,
            _ => 365.0 * 86_400_000.0,
        };
        if unit_ms >= last_unit {
            return Err(invalid());
        }
        last_unit = unit_ms;

        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        total_ms += value * unit_ms;
    }

    Ok(Duration::from_millis(total_ms.round() as u64))
}

fn deserialize_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Interval {
        Seconds(f64),
        Text(String),
    }

    match Interval::deserialize(deserializer)? {
        Interval::Seconds(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid interval {secs}: {e}"))),
        Interval::Text(text) => parse_interval(&text).map_err(serde::de::Error::custom),
    }
}
