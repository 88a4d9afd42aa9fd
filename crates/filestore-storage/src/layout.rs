//! On-disk layout of the store
//!
//! ```text
//! <data_dir>/
//! +-- blob/                  one tree per data type
//! |   +-- cal/long/          FsId directory segments
//! |       +-- .dirhash       bucket marker (bins, levels)
//! |       +-- hd-17/hd-402/  hash buckets, `levels` deep
//! |           +-- 100:112    the stored item
//! +-- ts/
//! +-- mts/
//! +-- xlog/                  journals and the transaction ledger
//! ```
//!
//! Path mapping is a pure function of the configuration. Each FsId
//! directory records the bucket parameters it was created with so a later
//! walk knows how deep the buckets go.

use filestore_common::config::StorageConfig;
use filestore_common::{DataType, Error, FsId, HASH_DIR_PREFIX, Result, SEPARATOR, Xid};
use filestore_query::Matcher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Directory holding journals and the ledger
pub const XLOG_DIR: &str = "xlog";

/// Bucket marker written into every FsId directory
pub const DIR_HASH_FILE: &str = ".dirhash";

/// Suffix of journal files in [`XLOG_DIR`]
pub const JOURNAL_SUFFIX: &str = "journal";

/// Bucketing parameters of one FsId directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirHash {
    /// Buckets per level
    pub bins: u32,
    /// Bucket directories between the FsId directory and the item
    pub levels: u32,
    /// Set once the marker is completely written
    pub ok: bool,
}

impl DirHash {
    /// Smallest depth such that `bins^levels` leaves of `max_files_per_dir`
    /// items hold `max_files_per_store` items.
    ///
    /// There is always at least one level. Items never share a directory
    /// with the FsId subdirectories, so `/a/b` and `/a/b/c` can coexist.
    #[must_use]
    pub fn for_limits(max_files_per_dir: u32, max_files_per_store: u64) -> Self {
        let per_dir = u64::from(max_files_per_dir);
        let mut levels = 1;
        let mut capacity = per_dir.saturating_mul(per_dir);
        while capacity < max_files_per_store {
            capacity = capacity.saturating_mul(per_dir);
            levels += 1;
        }
        Self {
            bins: max_files_per_dir,
            levels,
            ok: true,
        }
    }

    /// Bucket number at each level for an item name
    #[must_use]
    pub fn buckets(&self, name: &str) -> Vec<u32> {
        let bins = u64::from(self.bins.max(1));
        let mut hash = xxh3_64(name.as_bytes());
        (0..self.levels)
            .map(|_| {
                let bucket = hash % bins;
                hash /= bins;
                // bucket < bins <= u32::MAX
                u32::try_from(bucket).unwrap_or(0)
            })
            .collect()
    }

    fn load(dir: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(dir.join(DIR_HASH_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let marker: Self = toml::from_str(&text).map_err(|e| {
            Error::corruption(dir.join(DIR_HASH_FILE), 0, format!("bad bucket marker: {e}"))
        })?;
        Ok(marker.ok.then_some(marker))
    }

    fn store(&self, dir: &Path) -> Result<()> {
        let text = toml::to_string(self).map_err(|e| Error::internal(e.to_string()))?;
        let tmp = dir.join(format!("{DIR_HASH_FILE}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, dir.join(DIR_HASH_FILE))?;
        Ok(())
    }
}

/// Maps ids to files under the data directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    hash: DirHash,
}

impl StorageLayout {
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.data_dir.clone(),
            hash: DirHash::for_limits(config.max_files_per_dir, config.max_files_per_store),
        }
    }

    /// Create the namespace and transaction log directories
    pub fn create_dirs(&self) -> Result<()> {
        for data_type in DataType::ALL {
            fs::create_dir_all(self.namespace_dir(data_type))?;
        }
        fs::create_dir_all(self.xlog_dir())?;
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bucketing used for newly created directories
    #[must_use]
    pub const fn dir_hash(&self) -> DirHash {
        self.hash
    }

    #[must_use]
    pub fn namespace_dir(&self, data_type: DataType) -> PathBuf {
        self.root.join(data_type.dir_name())
    }

    #[must_use]
    pub fn xlog_dir(&self) -> PathBuf {
        self.root.join(XLOG_DIR)
    }

    /// Directory of an id's path segments, without buckets
    #[must_use]
    pub fn directory(&self, data_type: DataType, id: &FsId) -> PathBuf {
        let mut dir = self.namespace_dir(data_type);
        dir.extend(id.path_segments());
        dir
    }

    /// Final location of an item
    #[must_use]
    pub fn file_path(&self, data_type: DataType, id: &FsId) -> PathBuf {
        let mut path = self.directory(data_type, id);
        for bucket in self.hash.buckets(id.name()) {
            path.push(format!("{HASH_DIR_PREFIX}{bucket}"));
        }
        path.push(id.name());
        path
    }

    /// Journal of one transaction for one data type
    #[must_use]
    pub fn journal_path(&self, xid: Xid, data_type: DataType) -> PathBuf {
        self.xlog_dir()
            .join(format!("{xid}.{}.{JOURNAL_SUFFIX}", data_type.dir_name()))
    }

    /// Reverse of [`StorageLayout::journal_path`] for a file name
    #[must_use]
    pub fn parse_journal_name(name: &str) -> Option<(Xid, DataType)> {
        let stem = name.strip_suffix(JOURNAL_SUFFIX)?.strip_suffix('.')?;
        let (xid, data_type) = stem.rsplit_once('.')?;
        Some((xid.parse().ok()?, DataType::from_dir_name(data_type)?))
    }

    /// Make sure an id's directory and buckets exist and return the item path.
    ///
    /// A directory created earlier with different bucket parameters is an
    /// error: its items would no longer be found.
    pub fn prepare(&self, data_type: DataType, id: &FsId) -> Result<PathBuf> {
        let dir = self.directory(data_type, id);
        match DirHash::load(&dir)? {
            Some(marker) if marker.bins != self.hash.bins || marker.levels != self.hash.levels => {
                return Err(Error::configuration(format!(
                    "{} is bucketed {} x {} but the store is configured for {} x {}",
                    dir.display(),
                    marker.bins,
                    marker.levels,
                    self.hash.bins,
                    self.hash.levels
                )));
            }
            Some(_) => {}
            None => {
                fs::create_dir_all(&dir)?;
                self.hash.store(&dir)?;
                debug!(dir = %dir.display(), levels = self.hash.levels, "created id directory");
            }
        }
        let path = self.file_path(data_type, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// All stored ids of the matcher's data type that it matches completely.
    ///
    /// Subtrees whose directory is not a prefix of any match are skipped;
    /// bucket directories are only entered to list items.
    pub fn find(&self, matcher: &Matcher) -> Result<BTreeSet<FsId>> {
        let mut found = BTreeSet::new();
        let root = self.namespace_dir(matcher.data_type());
        if root.is_dir() {
            let mut visited = 0usize;
            self.walk(&root, "", matcher, &mut found, &mut visited)?;
            debug!(pattern = matcher.pattern(), visited, found = found.len(), "find complete");
        }
        Ok(found)
    }

    fn walk(
        &self,
        dir: &Path,
        rel: &str,
        matcher: &Matcher,
        found: &mut BTreeSet<FsId>,
        visited: &mut usize,
    ) -> Result<()> {
        *visited += 1;
        let verdict = matcher.matches_directory(rel);
        if !verdict.path_prefix_matched {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with(HASH_DIR_PREFIX) || name.starts_with('.') {
                continue;
            }
            let child = format!("{rel}{SEPARATOR}{name}");
            self.walk(&entry.path(), &child, matcher, found, visited)?;
        }
        if verdict.path_matched {
            if let Some(marker) = DirHash::load(dir)? {
                list_items(dir, rel, marker.levels, matcher, found)?;
            }
        }
        Ok(())
    }
}

/// Collect matching items from the buckets under an id directory
fn list_items(
    dir: &Path,
    rel: &str,
    levels: u32,
    matcher: &Matcher,
    found: &mut BTreeSet<FsId>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        // markers and in-flight temp files
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        if levels > 0 {
            if is_dir && name.starts_with(HASH_DIR_PREFIX) {
                list_items(&entry.path(), rel, levels - 1, matcher, found)?;
            }
            continue;
        }
        if is_dir {
            continue;
        }
        match FsId::new(rel, &name) {
            Ok(id) => {
                if matcher.is_match(&id) {
                    found.insert(id);
                }
            }
            Err(e) => warn!(dir = %dir.display(), "skipping stray file {name:?}: {e}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout(root: &Path, per_dir: u32, per_store: u64) -> StorageLayout {
        StorageLayout::new(&StorageConfig {
            data_dir: root.to_path_buf(),
            max_files_per_dir: per_dir,
            max_files_per_store: per_store,
        })
    }

    fn put(layout: &StorageLayout, data_type: DataType, id: &str) {
        let id = FsId::parse(id).unwrap();
        let path = layout.prepare(data_type, &id).unwrap();
        fs::write(path, id.as_str()).unwrap();
    }

    fn find(layout: &StorageLayout, pattern: &str) -> Vec<String> {
        let matcher = Matcher::compile(pattern).unwrap();
        layout
            .find(&matcher)
            .unwrap()
            .into_iter()
            .map(|id| id.to_string())
            .collect()
    }

    #[test]
    fn test_dir_hash_levels() {
        assert_eq!(DirHash::for_limits(1000, 1).levels, 1);
        assert_eq!(DirHash::for_limits(1000, 1000).levels, 1);
        assert_eq!(DirHash::for_limits(1000, 1_000_000).levels, 1);
        assert_eq!(DirHash::for_limits(1000, 1_000_001).levels, 2);
        assert_eq!(DirHash::for_limits(1000, 10_000_000).levels, 2);
        assert_eq!(DirHash::for_limits(1, 1).levels, 1);
        assert_eq!(DirHash::for_limits(2, u64::MAX).levels, 63);
    }

    #[test]
    fn test_buckets_are_stable_and_bounded() {
        let hash = DirHash::for_limits(10, 10_000);
        assert_eq!(hash.levels, 3);
        let a = hash.buckets("100:112");
        assert_eq!(a, hash.buckets("100:112"));
        assert_eq!(a.len(), 3);
        assert!(a.iter().all(|&b| b < 10));
    }

    #[test]
    fn test_file_path_mapping() {
        let root = Path::new("/data");
        let id = FsId::parse("/cal/long/100:112").unwrap();

        let small = layout(root, 1000, 1000);
        let path = small.file_path(DataType::TimeSeries, &id);
        let rel: Vec<_> = path
            .strip_prefix("/data/ts/cal/long")
            .unwrap()
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rel.len(), 2);
        assert!(rel[0].starts_with("hd-"));
        assert_eq!(rel[1], "100:112");

        let deep = layout(root, 1000, 10_000_000);
        let path = deep.file_path(DataType::Blob, &id);
        let rel: Vec<_> = path
            .strip_prefix("/data/blob/cal/long")
            .unwrap()
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rel.len(), 3);
        assert!(rel[0].starts_with("hd-") && rel[1].starts_with("hd-"));
        assert_eq!(rel[2], "100:112");
    }

    #[test]
    fn test_journal_names() {
        let layout = layout(Path::new("/data"), 1000, 1000);
        let xid = Xid::new(7, 9);
        let path = layout.journal_path(xid, DataType::MjdTimeSeries);
        assert_eq!(path.parent().unwrap(), Path::new("/data/xlog"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(
            StorageLayout::parse_journal_name(name),
            Some((xid, DataType::MjdTimeSeries))
        );
        assert_eq!(StorageLayout::parse_journal_name("ledger.log"), None);
        assert_eq!(StorageLayout::parse_journal_name("nonsense.blob.journal"), None);
        assert_eq!(
            StorageLayout::parse_journal_name(&format!("{xid}.tape.journal")),
            None
        );
    }

    #[test]
    fn test_prepare_rejects_changed_buckets() {
        let dir = tempdir().unwrap();
        put(&layout(dir.path(), 4, 4), DataType::Blob, "/a/b/x");
        let wider = layout(dir.path(), 4, 64);
        let id = FsId::parse("/a/b/y").unwrap();
        assert!(matches!(
            wider.prepare(DataType::Blob, &id),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_find_walks_buckets() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path(), 4, 100);
        assert_eq!(layout.dir_hash().levels, 3);
        let mut want = Vec::new();
        for i in 0..40 {
            let id = format!("/cal/long/{i}:{}", i * 7);
            put(&layout, DataType::Blob, &id);
            want.push(id);
        }
        put(&layout, DataType::Blob, "/cal/short/1:1");
        put(&layout, DataType::TimeSeries, "/cal/long/1:7");
        want.sort();

        assert_eq!(find(&layout, "b@/cal/long/*"), want);
        assert_eq!(find(&layout, "b@/cal/*/1:[1-7]"), vec!["/cal/long/1:7", "/cal/short/1:1"]);
        assert_eq!(find(&layout, "t@/cal/*"), vec!["/cal/long/1:7"]);
        assert!(find(&layout, "m@/cal/*").is_empty());
        assert!(find(&layout, "b@/other/*").is_empty());
    }

    #[test]
    fn test_find_skips_temp_files_and_nested_dirs() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path(), 1000, 1000);
        put(&layout, DataType::Blob, "/a/b/c");
        put(&layout, DataType::Blob, "/a/b/c2/d");
        let tmp = layout.directory(DataType::Blob, &FsId::parse("/a/b/c").unwrap());
        fs::write(tmp.join(".c.0.tmp"), b"half").unwrap();

        assert_eq!(find(&layout, "b@/a/b/*"), vec!["/a/b/c", "/a/b/c2/d"]);
        assert_eq!(find(&layout, "b@/a/b/\\w"), vec!["/a/b/c"]);
    }

    #[test]
    fn test_item_and_child_directory_share_a_name() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path(), 1000, 1);
        assert_eq!(layout.dir_hash().levels, 1);
        put(&layout, DataType::Blob, "/a/b");
        put(&layout, DataType::Blob, "/a/b/c");
        put(&layout, DataType::Blob, "/a/b/c/d");

        let b = layout.file_path(DataType::Blob, &FsId::parse("/a/b").unwrap());
        assert_eq!(fs::read_to_string(b).unwrap(), "/a/b");
        assert_eq!(find(&layout, "b@/a/*"), vec!["/a/b", "/a/b/c", "/a/b/c/d"]);
        assert_eq!(find(&layout, "b@/a/b"), vec!["/a/b"]);
    }
}
