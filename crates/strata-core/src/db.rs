//! The database: owner and orchestrator of the version chain.
//!
//! Loads the store directory, orders version layers by their encoded
//! timestamps, links parent pointers eldest→newest, optionally creates a
//! fresh head for writable use, and resolves the newest remaining layer
//! into the live tree.

use crate::dir::LiveDir;
use crate::version::Version;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use strata_error::{Result, StrataError};
use strata_types::{encode_version_name, parse_version_name, Counters, VersionStamp};
use tracing::{debug, info};

/// An ordered chain of versions over one backing store.
#[derive(Debug)]
pub struct Database {
    store: PathBuf,
    versions: Vec<Arc<Version>>,
    root: Option<Arc<LiveDir>>,
    counters: Arc<Counters>,
}

impl Database {
    /// Open the store at `dir`.
    ///
    /// `writable` creates a fresh head version before scanning. A nonzero
    /// `version_index` truncates the chain to its first `version_index`
    /// layers, exposing a historical view; an index beyond the chain is
    /// `InvalidIndex`. The newest remaining layer is resolved into the live
    /// tree; an empty read-only store resolves to no root at all.
    pub fn open(dir: impl AsRef<Path>, version_index: usize, writable: bool) -> Result<Self> {
        let store = fs::canonicalize(dir.as_ref())?;

        let mut discovered = scan_store(&store)?;
        let mut head_name = None;
        if writable {
            let stamp = next_head_stamp(&discovered);
            let name = encode_version_name(stamp);
            let base = store.join(&name);
            fs::create_dir(&base)?;
            fs::create_dir(base.join("root"))?;
            info!(layer = %base.display(), "created head version");
            discovered.push((stamp, name.clone()));
            head_name = Some(name);
        }

        if version_index > discovered.len() {
            return Err(StrataError::InvalidIndex {
                index: version_index,
                len: discovered.len(),
            });
        }
        if version_index > 0 {
            discovered.truncate(version_index);
        }

        let mut versions: Vec<Arc<Version>> = Vec::with_capacity(discovered.len());
        for (stamp, name) in discovered {
            let parent = versions.last().cloned();
            let fresh = head_name.as_deref() == Some(name.as_str());
            versions.push(Version::open(store.join(&name), stamp, parent, fresh)?);
        }
        if let Some(newest) = versions.last() {
            for version in &versions {
                version.set_head(newest);
            }
        }

        let counters = Arc::new(Counters::new());
        let root = match versions.last() {
            Some(newest) => Some(newest.resolve(&counters)?),
            None => None,
        };

        Ok(Self {
            store,
            versions,
            root,
            counters,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Path {
        &self.store
    }

    /// Root of the live tree; `None` only for an empty read-only store.
    #[must_use]
    pub fn root(&self) -> Option<&Arc<LiveDir>> {
        self.root.as_ref()
    }

    #[must_use]
    pub fn versions(&self) -> &[Arc<Version>] {
        &self.versions
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Finalize every layer, head last; the first failure propagates.
    pub fn save(&self) -> Result<()> {
        let head_index = self.versions.len().saturating_sub(1);
        for (index, version) in self.versions.iter().enumerate() {
            version.finalize(!self.versions.is_empty() && index == head_index)?;
        }
        Ok(())
    }

    /// `(index, creation stamp)` per version, eldest first.
    #[must_use]
    pub fn dump(&self) -> Vec<(usize, VersionStamp)> {
        self.versions
            .iter()
            .enumerate()
            .map(|(index, version)| (index, version.stamp()))
            .collect()
    }
}

/// List version directories in the store, sorted by stamp.
///
/// Entries that are not directories or do not parse as version names are
/// skipped; the store may carry unrelated files.
fn scan_store(store: &Path) -> Result<Vec<(VersionStamp, String)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(store)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        match parse_version_name(&name) {
            Ok(stamp) => found.push((stamp, name)),
            Err(_) => {
                debug!(entry = %name, "skipping non-version store entry");
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Stamp for a freshly created head: now, bumped past the newest existing
/// layer so chain timestamps stay strictly increasing even under clock skew
/// or rapid remounts.
fn next_head_stamp(existing: &[(VersionStamp, String)]) -> VersionStamp {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let floor = existing
        .iter()
        .map(|(stamp, _)| stamp.0 + 1)
        .max()
        .unwrap_or(i64::MIN);
    VersionStamp(now.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LiveNode;

    fn seed_version(store: &Path, secs: i64) -> PathBuf {
        let base = store.join(encode_version_name(VersionStamp(secs)));
        fs::create_dir_all(base.join("root")).expect("seed version");
        base
    }

    #[test]
    fn load_orders_versions_and_links_parents() {
        let store = tempfile::tempdir().expect("tempdir");
        // Created out of order on purpose.
        seed_version(store.path(), 30);
        seed_version(store.path(), 10);
        seed_version(store.path(), 20);

        let db = Database::open(store.path(), 0, false).expect("open");
        let stamps: Vec<i64> = db.versions().iter().map(|v| v.stamp().0).collect();
        assert_eq!(stamps, vec![10, 20, 30]);

        assert!(db.versions()[0].parent().is_none());
        for pair in db.versions().windows(2) {
            let linked = pair[1].parent().expect("parent link");
            assert!(Arc::ptr_eq(linked, &pair[0]));
        }
    }

    #[test]
    fn scan_skips_unrelated_entries() {
        let store = tempfile::tempdir().expect("tempdir");
        seed_version(store.path(), 5);
        fs::write(store.path().join("README"), b"not a version").expect("file");
        fs::create_dir(store.path().join("scratch")).expect("dir");

        let db = Database::open(store.path(), 0, false).expect("open");
        assert_eq!(db.versions().len(), 1);
    }

    #[test]
    fn writable_open_creates_a_strictly_newer_head() {
        let store = tempfile::tempdir().expect("tempdir");
        let far_future = i64::MAX / 2;
        seed_version(store.path(), far_future);

        let db = Database::open(store.path(), 0, true).expect("open");
        assert_eq!(db.versions().len(), 2);
        let stamps: Vec<i64> = db.versions().iter().map(|v| v.stamp().0).collect();
        assert!(stamps[1] > stamps[0], "head must sort after all ancestors");
        assert!(db.versions()[1].base().join("root").is_dir());
    }

    #[test]
    fn empty_store_readonly_has_no_root() {
        let store = tempfile::tempdir().expect("tempdir");
        let db = Database::open(store.path(), 0, false).expect("open");
        assert!(db.root().is_none());
        assert!(db.dump().is_empty());
    }

    #[test]
    fn empty_store_writable_resolves_a_fresh_empty_root() {
        let store = tempfile::tempdir().expect("tempdir");
        let db = Database::open(store.path(), 0, true).expect("open");
        let root = db.root().expect("root");
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn version_index_exposes_a_historical_prefix() {
        let store = tempfile::tempdir().expect("tempdir");
        let v1 = seed_version(store.path(), 1);
        fs::write(v1.join("root/only_v1"), b"1").expect("write");
        let v2 = seed_version(store.path(), 2);
        fs::write(v2.join("root/only_v2"), b"2").expect("write");

        let db = Database::open(store.path(), 1, false).expect("open at 1");
        assert_eq!(db.versions().len(), 1);
        let root = db.root().expect("root");
        assert!(root.lookup("only_v1").is_some());
        assert!(root.lookup("only_v2").is_none());
    }

    #[test]
    fn version_index_equal_to_chain_length_is_the_full_view() {
        let store = tempfile::tempdir().expect("tempdir");
        seed_version(store.path(), 1);
        seed_version(store.path(), 2);

        let db = Database::open(store.path(), 2, false).expect("open at len");
        assert_eq!(db.versions().len(), 2);
    }

    #[test]
    fn version_index_beyond_chain_is_invalid() {
        let store = tempfile::tempdir().expect("tempdir");
        seed_version(store.path(), 1);

        let err = Database::open(store.path(), 5, false).expect_err("beyond");
        assert!(matches!(
            err,
            StrataError::InvalidIndex { index: 5, len: 1 }
        ));
    }

    #[test]
    fn save_collects_an_untouched_fresh_head() {
        let store = tempfile::tempdir().expect("tempdir");
        let v1 = seed_version(store.path(), 1);
        fs::write(v1.join("root/f"), b"f").expect("write");

        {
            let db = Database::open(store.path(), 0, true).expect("open writable");
            assert_eq!(db.versions().len(), 2);
            db.save().expect("save");
        }

        let remaining = scan_store(store.path()).expect("rescan");
        assert_eq!(remaining.len(), 1, "empty head is removed again");
        assert_eq!(remaining[0].0, VersionStamp(1));
    }

    #[test]
    fn resolved_root_serves_the_union() {
        let store = tempfile::tempdir().expect("tempdir");
        let v1 = seed_version(store.path(), 1);
        fs::create_dir(v1.join("root/a")).expect("mkdir");
        fs::write(v1.join("root/a/b.txt"), b"hi").expect("write");

        let db = Database::open(store.path(), 0, true).expect("open");
        let root = db.root().expect("root");
        let a = match root.lookup("a") {
            Some(LiveNode::Dir(dir)) => dir,
            _ => panic!("expected /a"),
        };
        let file = match a.lookup("b.txt") {
            Some(LiveNode::File(file)) => file,
            _ => panic!("expected /a/b.txt"),
        };
        let h = file.open(libc::O_RDONLY, 0).expect("open");
        assert_eq!(file.read_all(h).expect("read"), b"hi");
        file.release(h).expect("release");
    }
}
