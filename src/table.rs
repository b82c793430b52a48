//! Local cache of one index table.
//!
//! A table is a per-day bucket of index files. Its on-disk layout mirrors
//! remote storage: common index files (not attributable to a single tenant)
//! sit at the table directory root, per-tenant files under a tenant-named
//! subdirectory. In memory the table is a collection of [`IndexSet`]s, one
//! for the common index and one per tenant, each owning its open file
//! handles, a last-used stamp for eviction, and a single-flight gate for the
//! initial download.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::index::{OpenIndex, OpenIndexFileFn};
use crate::metrics::{Metrics, TableLabels};
use crate::storage::{FileRef, IndexStorageClient};

/// Key of the common (tenant-less) index set in the sets map.
const COMMON_INDEX_USER_ID: &str = "";

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// The locally cached copy of one remote table.
pub struct Table {
    name: String,
    dir: PathBuf,
    storage: Arc<dyn IndexStorageClient>,
    open_index_file: OpenIndexFileFn,
    metrics: Metrics,
    index_sets: RwLock<HashMap<String, Arc<IndexSet>>>,
}

impl Table {
    /// Create an empty table rooted at `dir`. Files are downloaded on
    /// demand, per index set.
    pub(crate) fn new(
        name: &str,
        dir: PathBuf,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
        metrics: Metrics,
    ) -> Self {
        Self {
            name: name.to_string(),
            dir,
            storage,
            open_index_file,
            metrics,
            index_sets: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild a table from an existing cache directory.
    ///
    /// Root files become the common index set, subdirectories become tenant
    /// sets. Every file is opened eagerly; an open failure aborts the load
    /// so a corrupt cache surfaces at startup rather than at query time.
    pub(crate) fn load(
        name: &str,
        dir: PathBuf,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
        metrics: Metrics,
    ) -> Result<Self> {
        let mut sets = HashMap::new();

        let common = IndexSet::load(
            name,
            COMMON_INDEX_USER_ID,
            dir.clone(),
            Arc::clone(&storage),
            open_index_file.clone(),
        )?;
        sets.insert(COMMON_INDEX_USER_ID.to_string(), Arc::new(common));

        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("read table directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let user_id = entry.file_name().to_string_lossy().into_owned();
            let set = IndexSet::load(
                name,
                &user_id,
                entry.path(),
                Arc::clone(&storage),
                open_index_file.clone(),
            )?;
            sets.insert(user_id, Arc::new(set));
        }

        Ok(Self {
            name: name.to_string(),
            dir,
            storage,
            open_index_file,
            metrics,
            index_sets: RwLock::new(sets),
        })
    }

    /// Guarantee the user's index and the common index are present locally,
    /// then invoke `callback` over every open index file.
    ///
    /// The callback runs under each set's files read lock, so sync and
    /// eviction cannot delete a file out from under an in-flight iteration.
    pub async fn for_each<F>(&self, user_id: &str, callback: &mut F) -> Result<()>
    where
        F: FnMut(bool, &dyn OpenIndex) -> Result<()> + Send,
    {
        let start = Instant::now();

        let common = self.get_or_create_index_set(COMMON_INDEX_USER_ID).await?;
        let user_set = self.get_or_create_index_set(user_id).await?;

        common.ensure_downloaded().await?;
        user_set.ensure_downloaded().await?;

        self.metrics
            .query_time_table_download_duration_seconds
            .get_or_create(&TableLabels {
                table: self.name.clone(),
            })
            .inc_by(start.elapsed().as_secs_f64());

        common.for_each(callback).await?;
        if user_id != COMMON_INDEX_USER_ID {
            user_set.for_each(callback).await?;
        }

        Ok(())
    }

    /// Pre-download the common index and the index of every listed user.
    ///
    /// Downloads are single-flight per set and skipped when already
    /// complete, so repeated passes over an unchanged remote are free.
    pub async fn ensure_query_readiness(&self, user_ids: &[String]) -> Result<()> {
        let common = self.get_or_create_index_set(COMMON_INDEX_USER_ID).await?;
        common.ensure_downloaded().await?;

        for user_id in user_ids {
            let set = self.get_or_create_index_set(user_id).await?;
            set.ensure_downloaded().await?;
        }

        Ok(())
    }

    /// Reconcile every index set against a fresh remote listing: download
    /// files missing locally, remove local files gone remotely.
    pub async fn sync(&self) -> Result<()> {
        debug!(table = %self.name, "syncing table");

        let sets: Vec<Arc<IndexSet>> = self.index_sets.read().await.values().cloned().collect();
        for set in sets {
            set.sync()
                .await
                .with_context(|| format!("sync table {}", self.name))?;
        }

        Ok(())
    }

    /// Evict index sets idle longer than `ttl`, closing their files and
    /// removing them from disk. Returns whether the table is now empty.
    pub async fn drop_unused_index(&self, ttl: Duration, now: SystemTime) -> Result<bool> {
        let mut sets = self.index_sets.write().await;

        let expired: Vec<String> = sets
            .iter()
            .filter(|(_, set)| set.expired(ttl, now))
            .map(|(user_id, _)| user_id.clone())
            .collect();

        for user_id in expired {
            if let Some(set) = sets.remove(&user_id) {
                debug!(table = %self.name, user = %user_id, "dropping expired index set");
                set.drop_files().await?;
            }
        }

        Ok(sets.is_empty())
    }

    /// Release all open file handles. On-disk files are retained.
    pub async fn close(&self) {
        let mut sets = self.index_sets.write().await;
        for (_, set) in sets.drain() {
            set.close().await;
        }
    }

    async fn get_or_create_index_set(&self, user_id: &str) -> Result<Arc<IndexSet>> {
        {
            let sets = self.index_sets.read().await;
            if let Some(set) = sets.get(user_id) {
                return Ok(Arc::clone(set));
            }
        }

        let mut sets = self.index_sets.write().await;
        if let Some(set) = sets.get(user_id) {
            return Ok(Arc::clone(set));
        }

        let dir = if user_id == COMMON_INDEX_USER_ID {
            self.dir.clone()
        } else {
            self.dir.join(user_id)
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create index set directory {}", dir.display()))?;

        let set = Arc::new(IndexSet::new(
            &self.name,
            user_id,
            dir,
            Arc::clone(&self.storage),
            self.open_index_file.clone(),
        ));
        sets.insert(user_id.to_string(), Arc::clone(&set));
        Ok(set)
    }
}

// ---------------------------------------------------------------------------
// IndexSet
// ---------------------------------------------------------------------------

/// The files of one table belonging to one tenant (or to no tenant, for the
/// common index).
struct IndexSet {
    table_name: String,
    user_id: String,
    dir: PathBuf,
    storage: Arc<dyn IndexStorageClient>,
    open_index_file: OpenIndexFileFn,
    files: RwLock<HashMap<String, Box<dyn OpenIndex>>>,
    /// Unix milliseconds of the last read access; stamped at creation.
    last_used_ms: AtomicI64,
    /// Gates the initial download. An error leaves the cell empty so the
    /// next caller retries.
    init: OnceCell<()>,
}

impl IndexSet {
    fn new(
        table_name: &str,
        user_id: &str,
        dir: PathBuf,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
    ) -> Self {
        Self {
            table_name: table_name.to_string(),
            user_id: user_id.to_string(),
            dir,
            storage,
            open_index_file,
            files: RwLock::new(HashMap::new()),
            last_used_ms: AtomicI64::new(unix_ms(SystemTime::now())),
            init: OnceCell::new(),
        }
    }

    /// Rebuild a set from files already on disk, marked as downloaded.
    /// Remote files missing locally are picked up by the next sync.
    fn load(
        table_name: &str,
        user_id: &str,
        dir: PathBuf,
        storage: Arc<dyn IndexStorageClient>,
        open_index_file: OpenIndexFileFn,
    ) -> Result<Self> {
        let mut files: HashMap<String, Box<dyn OpenIndex>> = HashMap::new();

        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("read index set directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                // In-flight temp download from a crashed process.
                warn!(path = %entry.path().display(), "removing leftover temp file");
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            let index = (open_index_file)(&entry.path())?;
            files.insert(name, index);
        }

        Ok(Self {
            table_name: table_name.to_string(),
            user_id: user_id.to_string(),
            dir,
            storage,
            open_index_file,
            files: RwLock::new(files),
            last_used_ms: AtomicI64::new(unix_ms(SystemTime::now())),
            init: OnceCell::new_with(Some(())),
        })
    }

    fn is_common(&self) -> bool {
        self.user_id == COMMON_INDEX_USER_ID
    }

    fn touch(&self) {
        self.last_used_ms
            .store(unix_ms(SystemTime::now()), Ordering::Relaxed);
    }

    fn expired(&self, ttl: Duration, now: SystemTime) -> bool {
        unix_ms(now) - self.last_used_ms.load(Ordering::Relaxed) > ttl.as_millis() as i64
    }

    /// Download every remote file of this set, once. Concurrent callers for
    /// the same set wait on the same download.
    async fn ensure_downloaded(&self) -> Result<()> {
        self.init.get_or_try_init(|| self.download_all()).await?;
        Ok(())
    }

    async fn download_all(&self) -> Result<()> {
        let start = Instant::now();

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create index set directory {}", self.dir.display()))?;

        let remote = self.list_remote(false).await?;
        info!(
            table = %self.table_name,
            user = %self.user_id,
            files = remote.len(),
            "downloading index set"
        );

        let mut files = self.files.write().await;
        for file in &remote {
            // A previous failed attempt may have gotten partway through.
            if files.contains_key(&file.name) {
                continue;
            }
            let index = self.download_and_open(&file.name).await?;
            files.insert(file.name.clone(), index);
        }

        debug!(
            table = %self.table_name,
            user = %self.user_id,
            duration = ?start.elapsed(),
            "index set downloaded"
        );
        Ok(())
    }

    /// Reconcile local files against a fresh remote listing.
    async fn sync(&self) -> Result<()> {
        if !self.init.initialized() {
            // Initial download still pending; nothing to reconcile yet.
            return Ok(());
        }

        let remote = self.list_remote(true).await?;

        let missing: Vec<FileRef> = {
            let files = self.files.read().await;
            remote
                .iter()
                .filter(|file| !files.contains_key(&file.name))
                .cloned()
                .collect()
        };

        // Download outside the files lock so readers keep flowing.
        let mut downloaded = Vec::with_capacity(missing.len());
        for file in &missing {
            downloaded.push((file.name.clone(), self.download_and_open(&file.name).await?));
        }

        let remote_names: HashSet<&str> = remote.iter().map(|file| file.name.as_str()).collect();

        let mut files = self.files.write().await;
        for (name, index) in downloaded {
            files.insert(name, index);
        }

        let stale: Vec<String> = files
            .keys()
            .filter(|name| !remote_names.contains(name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            debug!(
                table = %self.table_name,
                user = %self.user_id,
                file = %name,
                "removing index file deleted remotely"
            );
            files.remove(&name);
            let path = self.dir.join(&name);
            if let Err(error) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %error, "failed to remove stale index file");
            }
        }

        Ok(())
    }

    /// Invoke `callback` over every open index file, bumping the last-used
    /// stamp. Holds the files read lock for the duration of the iteration.
    async fn for_each<F>(&self, callback: &mut F) -> Result<()>
    where
        F: FnMut(bool, &dyn OpenIndex) -> Result<()> + Send,
    {
        self.touch();

        let files = self.files.read().await;
        for index in files.values() {
            callback(self.is_common(), index.as_ref())?;
        }

        Ok(())
    }

    /// Close all files and delete them from disk.
    async fn drop_files(&self) -> Result<()> {
        let mut files = self.files.write().await;
        files.clear();

        if self.is_common() {
            // The table root also holds tenant subdirectories; remove files only.
            let entries = std::fs::read_dir(&self.dir)
                .with_context(|| format!("read index set directory {}", self.dir.display()))?;
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    tokio::fs::remove_file(entry.path())
                        .await
                        .with_context(|| format!("remove {}", entry.path().display()))?;
                }
            }
        } else {
            tokio::fs::remove_dir_all(&self.dir)
                .await
                .with_context(|| format!("remove {}", self.dir.display()))?;
        }

        Ok(())
    }

    /// Release file handles without touching the disk.
    async fn close(&self) {
        self.files.write().await.clear();
    }

    async fn list_remote(&self, bypass_cache: bool) -> Result<Vec<FileRef>> {
        if self.is_common() {
            let (files, _user_ids) = self
                .storage
                .list_files(&self.table_name, bypass_cache)
                .await?;
            Ok(files)
        } else {
            self.storage
                .list_user_files(&self.table_name, &self.user_id, bypass_cache)
                .await
        }
    }

    /// Download one file through a dot-prefixed temp file in the set
    /// directory, so a crash never leaves a partial file under its final
    /// name, then open it.
    async fn download_and_open(&self, file_name: &str) -> Result<Box<dyn OpenIndex>> {
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("create temp file in {}", self.dir.display()))?;
        let tmp_path = tmp.path().to_path_buf();

        if self.is_common() {
            self.storage
                .download_file(&self.table_name, file_name, &tmp_path)
                .await?;
        } else {
            self.storage
                .download_user_file(&self.table_name, &self.user_id, file_name, &tmp_path)
                .await?;
        }

        let path = self.dir.join(file_name);
        tmp.persist(&path)
            .with_context(|| format!("persist downloaded file {}", path.display()))?;

        (self.open_index_file)(&path)
    }
}

fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::testutil::{raw_open_fn, MockStorage};

    fn test_metrics() -> Metrics {
        Metrics::new(&mut prometheus_client::registry::Registry::default())
    }

    fn new_table(dir: &Path, storage: Arc<MockStorage>) -> Table {
        Table::new(
            "tbl_100",
            dir.to_path_buf(),
            storage,
            raw_open_fn(),
            test_metrics(),
        )
    }

    async fn collect_names(table: &Table, user_id: &str) -> Vec<(bool, String)> {
        let mut seen = Vec::new();
        table
            .for_each(user_id, &mut |is_common, index: &dyn OpenIndex| {
                seen.push((is_common, index.name().to_string()));
                Ok(())
            })
            .await
            .unwrap();
        seen.sort();
        seen
    }

    #[tokio::test]
    async fn for_each_downloads_then_serves_locally() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");
        storage.add_common_file("tbl_100", "c2");
        storage.add_user_file("tbl_100", "u1", "f1");

        let table = new_table(tmp.path(), Arc::clone(&storage));

        let seen = collect_names(&table, "u1").await;
        assert_eq!(
            seen,
            vec![
                (false, "f1".to_string()),
                (true, "c1".to_string()),
                (true, "c2".to_string()),
            ]
        );
        assert!(tmp.path().join("c1").is_file());
        assert!(tmp.path().join("u1").join("f1").is_file());
        assert_eq!(storage.total_downloads(), 3);

        // Second read is served from the local cache.
        let seen = collect_names(&table, "u1").await;
        assert_eq!(seen.len(), 3);
        assert_eq!(storage.total_downloads(), 3);
    }

    #[tokio::test]
    async fn concurrent_for_each_downloads_each_file_once() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");
        storage.add_user_file("tbl_100", "u1", "f1");
        storage.add_user_file("tbl_100", "u1", "f2");

        let table = Arc::new(new_table(tmp.path(), Arc::clone(&storage)));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let mut count = 0;
                table
                    .for_each("u1", &mut |_, _: &dyn OpenIndex| {
                        count += 1;
                        Ok(())
                    })
                    .await
                    .unwrap();
                count
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 3);
        }

        assert_eq!(storage.total_downloads(), 3);
    }

    #[tokio::test]
    async fn sync_downloads_new_and_removes_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");
        storage.add_user_file("tbl_100", "u1", "f1");

        let table = new_table(tmp.path(), Arc::clone(&storage));
        collect_names(&table, "u1").await;

        storage.add_common_file("tbl_100", "c2");
        storage.remove_user_file("tbl_100", "u1", "f1");
        table.sync().await.unwrap();

        let seen = collect_names(&table, "u1").await;
        assert_eq!(seen, vec![(true, "c1".to_string()), (true, "c2".to_string())]);
        assert!(tmp.path().join("c2").is_file());
        assert!(!tmp.path().join("u1").join("f1").exists());
    }

    #[tokio::test]
    async fn drop_unused_index_reaps_idle_sets() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");
        storage.add_user_file("tbl_100", "u1", "f1");

        let table = new_table(tmp.path(), Arc::clone(&storage));
        collect_names(&table, "u1").await;

        // Still fresh half an hour in.
        let soon = SystemTime::now() + Duration::from_secs(30 * 60);
        assert!(!table
            .drop_unused_index(Duration::from_secs(3600), soon)
            .await
            .unwrap());

        // Two hours idle against a one hour TTL: everything goes.
        let later = SystemTime::now() + Duration::from_secs(2 * 3600);
        let is_empty = table
            .drop_unused_index(Duration::from_secs(3600), later)
            .await
            .unwrap();
        assert!(is_empty);
        assert!(!tmp.path().join("c1").exists());
        assert!(!tmp.path().join("u1").exists());
    }

    #[tokio::test]
    async fn close_retains_disk_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");

        let table = new_table(tmp.path(), Arc::clone(&storage));
        collect_names(&table, "u1").await;

        table.close().await;
        assert!(tmp.path().join("c1").is_file());
    }

    #[tokio::test]
    async fn load_reconstructs_from_disk_without_downloads() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("c1"), b"index-data").unwrap();
        std::fs::create_dir(tmp.path().join("u1")).unwrap();
        std::fs::write(tmp.path().join("u1").join("f1"), b"index-data").unwrap();

        let storage = Arc::new(MockStorage::new());
        let table = Table::load(
            "tbl_100",
            tmp.path().to_path_buf(),
            storage.clone(),
            raw_open_fn(),
            test_metrics(),
        )
        .unwrap();

        let seen = collect_names(&table, "u1").await;
        assert_eq!(seen, vec![(false, "f1".to_string()), (true, "c1".to_string())]);
        assert_eq!(storage.total_downloads(), 0);
    }

    #[tokio::test]
    async fn load_removes_leftover_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("c1"), b"index-data").unwrap();
        std::fs::write(tmp.path().join(".tmp123"), b"partial").unwrap();

        let table = Table::load(
            "tbl_100",
            tmp.path().to_path_buf(),
            Arc::new(MockStorage::new()),
            raw_open_fn(),
            test_metrics(),
        )
        .unwrap();

        assert!(!tmp.path().join(".tmp123").exists());
        let seen = collect_names(&table, "u1").await;
        assert_eq!(seen, vec![(true, "c1".to_string())]);
    }

    #[tokio::test]
    async fn load_propagates_open_failures() {
        let tmp = tempfile::tempdir().unwrap();
        // Zero-length file: a partial write from a crashed process.
        std::fs::write(tmp.path().join("c1"), b"").unwrap();

        let result = Table::load(
            "tbl_100",
            tmp.path().to_path_buf(),
            Arc::new(MockStorage::new()),
            raw_open_fn(),
            test_metrics(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_download_is_retried_on_next_read() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");
        storage.fail_downloads(true);

        let table = new_table(tmp.path(), Arc::clone(&storage));
        assert!(table.for_each("u1", &mut |_, _: &dyn OpenIndex| Ok(())).await.is_err());

        storage.fail_downloads(false);
        let seen = collect_names(&table, "u1").await;
        assert_eq!(seen, vec![(true, "c1".to_string())]);
    }
}
