//! Change detection and the persistent per-directory cache
//!
//! Every visited directory owns one cache file under its build directory,
//! keyed first by rule identity (a digest over the rule's sorted product
//! paths) and then by target/dependency path. Entries store the last
//! observed file modification time, the virtual flag and virtual
//! modification time for products with no on-disk file, and arbitrary
//! module-private data. Unknown keys are preserved across load/store so
//! that caches written by a newer installation survive a round-trip.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A modification timestamp with stable serialization.
///
/// Holds whole seconds and nanoseconds since the Unix epoch; equality is
/// exact, matching the filesystem's own granularity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct FileStamp {
    /// Whole seconds since the Unix epoch.
    pub secs: u64,
    /// Nanosecond remainder.
    pub nanos: u32,
}

impl FileStamp {
    /// The zero timestamp, used as the initial virtual modification time.
    pub const ZERO: FileStamp = FileStamp { secs: 0, nanos: 0 };

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    /// Convert from a [`SystemTime`]; times before the epoch collapse to zero.
    pub fn from_system(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs(),
                nanos: d.subsec_nanos(),
            },
            Err(_) => Self::ZERO,
        }
    }

    /// Read a path's modification time, if the path exists.
    pub fn of_path(path: &Path) -> Option<Self> {
        let md = fs::metadata(path).ok()?;
        md.modified().ok().map(Self::from_system)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One cached record for a target or dependency path (or a module-private
/// key) within a rule's cache sub-map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Last observed filesystem modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<FileStamp>,
    /// Whether the path is a virtual product (no on-disk file).
    #[serde(rename = "virtual", default, skip_serializing_if = "is_false")]
    pub is_virtual: bool,
    /// Logical modification time for virtual products.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmodtime: Option<FileStamp>,
    /// Dependency paths discovered while building (recorded by modules that
    /// scan sources, so they are known before the next run).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_deps: Option<Vec<String>>,
    /// Any other keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A rule's cache: path (or module key) → entry.
pub type RuleCache = BTreeMap<String, CacheEntry>;

/// Free-form module-private storage attached to a scope.
pub type BlobMap = serde_json::Map<String, serde_json::Value>;

/// The persistent cache for one directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirCache {
    /// Rule identity key → that rule's cache sub-map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rules: BTreeMap<String, RuleCache>,
    /// Scope-level module-private storage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other: BTreeMap<String, BlobMap>,
    /// Unknown top-level keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DirCache {
    /// Whether there is nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.other.is_empty() && self.extra.is_empty()
    }

    /// Load a cache file. Any read or parse failure yields an empty cache;
    /// a stale or corrupt cache must never abort a build.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(cache) => cache,
                Err(err) => {
                    tracing::debug!("Ignoring unparseable cache file {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write the cache file, or remove it if the cache is empty.
    pub fn store(&self, path: &Path) -> std::io::Result<()> {
        if self.is_empty() {
            match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            let data = serde_json::to_vec(self).map_err(std::io::Error::other)?;
            fs::write(path, data)
        }
    }
}

/// The cache file name for a directory: a fixed prefix plus a digest of the
/// directory path, so sibling directories sharing one on-disk build dir get
/// distinct cache files.
pub fn cache_file_name(dir: &Path) -> String {
    let digest = blake3::hash(dir.to_string_lossy().as_bytes());
    format!("__emk_cache__{}", hex::encode(&digest.as_bytes()[..16]))
}

/// A rule's stable identity: a digest over its lexicographically sorted
/// canonical product paths joined with a NUL separator. Invariant under
/// product-order changes in the declaration.
pub fn rule_key(product_paths: &[PathBuf]) -> String {
    let mut paths: Vec<String> = product_paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    paths.sort();
    let mut hasher = blake3::Hasher::new();
    for (i, p) in paths.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\0");
        }
        hasher.update(p.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// The verdict of a change function for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The path differs from the cached record (or had no record).
    Changed,
    /// The path matches the cached record.
    Unchanged,
    /// The path does not exist, so no comparison was possible.
    Unknown,
}

/// A per-rule change detector: given a path, its cache entry, and whether
/// the path is a weak dependency, report whether it changed. The entry may
/// be mutated to record the newly observed state.
pub type ChangeFn = Arc<dyn Fn(&Path, &mut CacheEntry, bool) -> Change + Send + Sync>;

/// The default change detector: compare and record the filesystem
/// modification time. A missing cache entry reports changed (first sight),
/// except for weak dependencies, which are tolerated silently on first
/// sight. A missing path reports unknown.
pub fn default_has_changed(path: &Path, entry: &mut CacheEntry, weak: bool) -> Change {
    let Some(current) = FileStamp::of_path(path) else {
        return Change::Unknown;
    };
    let cached = entry.mtime;
    if cached == Some(current) {
        tracing::debug!("Modtime for {} has not changed", path.display());
        return Change::Unchanged;
    }
    tracing::debug!(
        "Modtime for {} has changed; cached = {:?}, actual = {:?}",
        path.display(),
        cached,
        current
    );
    entry.mtime = Some(current);
    if weak && cached.is_none() {
        return Change::Unchanged;
    }
    Change::Changed
}

/// The default change detector as a shareable [`ChangeFn`].
pub fn default_change_fn() -> ChangeFn {
    Arc::new(default_has_changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_key_order_invariant() {
        let a = rule_key(&[PathBuf::from("/x/b"), PathBuf::from("/x/a")]);
        let b = rule_key(&[PathBuf::from("/x/a"), PathBuf::from("/x/b")]);
        assert_eq!(a, b);
        let c = rule_key(&[PathBuf::from("/x/a")]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cache_round_trip_preserves_unknown_keys() {
        let raw = r#"{
            "rules": {
                "k1": {
                    "/p/out": {"mtime": {"secs": 5, "nanos": 7}, "virtual": true, "vmodtime": {"secs": 1, "nanos": 0}, "novel_field": [1, 2]}
                }
            },
            "other": {"revision": {"sha": "abc"}},
            "future_section": {"x": true}
        }"#;
        let cache: DirCache = serde_json::from_str(raw).unwrap();
        let entry = &cache.rules["k1"]["/p/out"];
        assert_eq!(entry.mtime, Some(FileStamp { secs: 5, nanos: 7 }));
        assert!(entry.is_virtual);
        assert_eq!(entry.vmodtime, Some(FileStamp { secs: 1, nanos: 0 }));
        assert_eq!(entry.extra["novel_field"], serde_json::json!([1, 2]));

        let out = serde_json::to_string(&cache).unwrap();
        let back: DirCache = serde_json::from_str(&out).unwrap();
        assert_eq!(back.rules["k1"]["/p/out"].extra["novel_field"], serde_json::json!([1, 2]));
        assert_eq!(back.other["revision"]["sha"], serde_json::json!("abc"));
        assert_eq!(back.extra["future_section"], serde_json::json!({"x": true}));
    }

    #[test]
    fn test_load_unparseable_cache_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache");
        fs::write(&path, b"{not json").unwrap();
        let cache = DirCache::load(&path);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_store_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache");
        let mut cache = DirCache::default();
        cache
            .rules
            .entry("key".to_string())
            .or_default()
            .insert("/a".to_string(), CacheEntry {
                mtime: Some(FileStamp { secs: 3, nanos: 9 }),
                ..CacheEntry::default()
            });
        cache.store(&path).unwrap();
        let back = DirCache::load(&path);
        assert_eq!(back.rules["key"]["/a"].mtime, Some(FileStamp { secs: 3, nanos: 9 }));
    }

    #[test]
    fn test_default_has_changed() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f.txt");
        fs::write(&file, b"hello").unwrap();

        let mut entry = CacheEntry::default();
        // First sight: changed, and the mtime is recorded.
        assert_eq!(default_has_changed(&file, &mut entry, false), Change::Changed);
        assert!(entry.mtime.is_some());
        // Second sight: unchanged.
        assert_eq!(default_has_changed(&file, &mut entry, false), Change::Unchanged);

        // Weak first sight: recorded but tolerated.
        let mut weak_entry = CacheEntry::default();
        assert_eq!(default_has_changed(&file, &mut weak_entry, true), Change::Unchanged);
        assert!(weak_entry.mtime.is_some());

        // Missing path: unknown.
        let mut missing = CacheEntry::default();
        assert_eq!(
            default_has_changed(&tmp.path().join("absent"), &mut missing, false),
            Change::Unknown
        );
    }

    #[test]
    fn test_cache_file_name_distinguishes_dirs() {
        let a = cache_file_name(Path::new("/proj/a"));
        let b = cache_file_name(Path::new("/proj/b"));
        assert_ne!(a, b);
        assert!(a.starts_with("__emk_cache__"));
    }
}
