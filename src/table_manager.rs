//! Owns the collection of locally cached tables.
//!
//! The manager bootstraps from the cache directory, keeps tables in sync
//! with remote storage, pre-downloads tables recent queries are expected to
//! need, and evicts tables idle past the cache TTL. Readers resolve tables
//! through a single-flight guard so concurrent queries for a new table
//! trigger exactly one construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::index::{OpenIndex, OpenIndexFileFn};
use crate::limits::Limits;
use crate::metrics::{Metrics, OperationStatus, StatusLabels};
use crate::readiness::{table_number_from_name, users_for_query_readiness};
use crate::storage::IndexStorageClient;
use crate::table::Table;

/// Expired tables are reaped on this fixed cadence.
const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Answers whether this instance is responsible for a tenant in a sharded
/// deployment. Tenants it rejects are skipped during query readiness.
pub type OwnsTenantFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Table number of the bucket covering the current wall-clock day.
pub fn active_table_number() -> i64 {
    chrono::Utc::now().timestamp() / SECONDS_PER_DAY
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the local table cache; created if absent.
    pub cache_dir: PathBuf,
    /// Interval between sync passes against remote storage.
    pub sync_interval: Duration,
    /// Maximum idle time before a table's unused index is evicted.
    pub cache_ttl: Duration,
    /// Days of index, counted back from the active table, kept downloaded
    /// ahead of queries regardless of tenant.
    pub query_ready_num_days: i32,
}

// ---------------------------------------------------------------------------
// TableManager
// ---------------------------------------------------------------------------

pub struct TableManager {
    cfg: Config,
    open_index_file: OpenIndexFileFn,
    storage: Arc<dyn IndexStorageClient>,
    limits: Arc<dyn Limits>,
    owns_tenant: Option<OwnsTenantFn>,
    metrics: Metrics,

    tables: RwLock<HashMap<String, Arc<Table>>>,

    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TableManager {
    /// Build a manager over `cfg.cache_dir`: load every table already on
    /// disk, perform the initial query-readiness pass, then start the
    /// background maintenance loop. The manager is fully usable for reads
    /// once this returns.
    ///
    /// On failure all file resources opened so far are released and the
    /// error is returned; no manager is produced.
    pub async fn new(
        cfg: Config,
        open_index_file: OpenIndexFileFn,
        storage: Arc<dyn IndexStorageClient>,
        limits: Arc<dyn Limits>,
        owns_tenant: Option<OwnsTenantFn>,
        registry: &mut Registry,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&cfg.cache_dir)
            .await
            .with_context(|| format!("create cache directory {}", cfg.cache_dir.display()))?;

        let manager = Arc::new(Self {
            metrics: Metrics::new(registry),
            cfg,
            open_index_file,
            storage,
            limits,
            owns_tenant,
            tables: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        });

        if let Err(error) = manager.load_local_tables().await {
            manager.close_all_tables().await;
            return Err(error);
        }

        // Pre-download tables queries are expected to need before serving.
        if let Err(error) = manager.ensure_query_readiness().await {
            manager.close_all_tables().await;
            return Err(error);
        }

        let handle = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run().await }
        });
        *manager.loop_handle.lock().await = Some(handle);

        Ok(manager)
    }

    /// Resolve or create the named table, then invoke `callback` over every
    /// index file the user may read in it. Safe under concurrent callers.
    pub async fn for_each<F>(&self, table_name: &str, user_id: &str, callback: &mut F) -> Result<()>
    where
        F: FnMut(bool, &dyn OpenIndex) -> Result<()> + Send,
    {
        let table = self.get_or_create_table(table_name).await?;
        table.for_each(user_id, callback).await
    }

    /// Cancel the background loop, wait for it to exit, then close every
    /// table. On-disk files are retained for the next start.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.close_all_tables().await;
    }

    // -----------------------------------------------------------------------
    // Background loop
    // -----------------------------------------------------------------------

    async fn run(&self) {
        let mut sync_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cfg.sync_interval,
            self.cfg.sync_interval,
        );
        sync_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut cleanup_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + CACHE_CLEANUP_INTERVAL,
            CACHE_CLEANUP_INTERVAL,
        );
        cleanup_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sync_ticker.tick() => {
                    let tick = async {
                        if let Err(error) = self.sync_tables().await {
                            error!(error = %error, "error syncing local index files with storage");
                        }
                        // Each new day needs its table pre-downloaded, which would
                        // otherwise only happen at query time.
                        if let Err(error) = self.ensure_query_readiness().await {
                            error!(error = %error, "error ensuring query readiness of tables");
                        }
                    };
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tick => {}
                    }
                }
                _ = cleanup_ticker.tick() => {
                    let tick = async {
                        if let Err(error) = self.cleanup_cache().await {
                            error!(error = %error, "error cleaning up expired tables");
                        }
                    };
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tick => {}
                    }
                }
                () = self.cancel.cancelled() => return,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Table resolution
    // -----------------------------------------------------------------------

    async fn get_or_create_table(&self, table_name: &str) -> Result<Arc<Table>> {
        {
            let tables = self.tables.read().await;
            if let Some(table) = tables.get(table_name) {
                return Ok(Arc::clone(table));
            }
        }

        let mut tables = self.tables.write().await;
        // A competing caller may have created the table while we waited.
        if let Some(table) = tables.get(table_name) {
            return Ok(Arc::clone(table));
        }

        info!(table = %table_name, "downloading all files for table");

        let table_path = self.cfg.cache_dir.join(table_name);
        std::fs::create_dir_all(&table_path)
            .with_context(|| format!("create table directory {}", table_path.display()))?;

        let table = Arc::new(Table::new(
            table_name,
            table_path,
            Arc::clone(&self.storage),
            self.open_index_file.clone(),
            self.metrics.clone(),
        ));
        tables.insert(table_name.to_string(), Arc::clone(&table));

        Ok(table)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Sync every table against remote storage. Stops at the first failure
    /// and reports it; the remaining tables are retried on the next tick.
    async fn sync_tables(&self) -> Result<()> {
        let start = Instant::now();
        info!("syncing tables");

        // Snapshot so eviction never waits behind a long sync for the map lock.
        let tables: Vec<Arc<Table>> = self.tables.read().await.values().cloned().collect();

        let mut result = Ok(());
        for table in tables {
            if let Err(error) = table.sync().await {
                result = Err(error);
                break;
            }
        }

        let status = if result.is_ok() {
            OperationStatus::Success
        } else {
            OperationStatus::Failure
        };
        self.metrics
            .tables_sync_operation_total
            .get_or_create(&StatusLabels { status })
            .inc();
        self.metrics
            .tables_download_operation_duration_seconds
            .set(start.elapsed().as_secs_f64());

        result
    }

    /// Evict index sets idle past the cache TTL and drop tables left empty.
    async fn cleanup_cache(&self) -> Result<()> {
        info!("cleaning tables cache");

        let mut tables = self.tables.write().await;
        let names: Vec<String> = tables.keys().cloned().collect();

        for name in names {
            debug!(table = %name, "checking table for expired index");
            let table = Arc::clone(&tables[&name]);
            let is_empty = table
                .drop_unused_index(self.cfg.cache_ttl, SystemTime::now())
                .await?;

            if is_empty {
                info!(table = %name, "removing expired table");
                tokio::fs::remove_dir_all(self.cfg.cache_dir.join(&name))
                    .await
                    .with_context(|| format!("remove table directory {name}"))?;
                tables.remove(&name);
            }
        }

        Ok(())
    }

    /// Compare the tables required to be query ready against what is cached
    /// and download the missing ones.
    async fn ensure_query_readiness(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.query_readiness_pass().await;
        info!(duration = ?start.elapsed(), "query readiness setup completed");
        result
    }

    async fn query_readiness_pass(&self) -> Result<()> {
        let active_table_number = active_table_number();

        // Find the widest readiness window across the common setting, the
        // tenant default, and every explicit tenant override.
        let default_limits = self.limits.default_limits();
        let mut largest_query_readiness_num = self
            .cfg
            .query_ready_num_days
            .max(default_limits.query_ready_index_num_days);

        let mut query_readiness_num_by_user_id = HashMap::new();
        for (user_id, limits) in self.limits.all_by_user_id() {
            if limits.query_ready_index_num_days != 0 {
                largest_query_readiness_num =
                    largest_query_readiness_num.max(limits.query_ready_index_num_days);
                query_readiness_num_by_user_id
                    .insert(user_id, limits.query_ready_index_num_days);
            }
        }

        // Nothing has to be downloaded ahead of queries.
        if largest_query_readiness_num == 0 {
            return Ok(());
        }

        let table_names = self.storage.list_tables().await?;

        for table_name in table_names {
            let Some(table_number) = table_number_from_name(&table_name) else {
                continue;
            };

            // Outside the widest window, no tenant can need this table.
            if active_table_number - table_number > i64::from(largest_query_readiness_num) {
                continue;
            }

            let (_, users_with_index) = self.storage.list_files(&table_name, false).await?;

            let users_to_be_ready_for = users_for_query_readiness(
                table_number,
                active_table_number,
                &users_with_index,
                &query_readiness_num_by_user_id,
                default_limits.query_ready_index_num_days,
                self.owns_tenant.as_ref(),
            );

            // Neither a user index nor the common index is needed from here.
            if users_to_be_ready_for.is_empty()
                && active_table_number - table_number > i64::from(self.cfg.query_ready_num_days)
            {
                continue;
            }

            let table = self.get_or_create_table(&table_name).await?;

            let per_table_start = Instant::now();
            table.ensure_query_readiness(&users_to_be_ready_for).await?;
            info!(
                table = %table_name,
                users = users_to_be_ready_for.len(),
                duration = ?per_table_start.elapsed(),
                "index pre-download for query readiness completed"
            );
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bootstrap / shutdown
    // -----------------------------------------------------------------------

    /// Load every table directory already present in the cache.
    async fn load_local_tables(&self) -> Result<()> {
        let mut tables = self.tables.write().await;

        let entries = std::fs::read_dir(&self.cfg.cache_dir)
            .with_context(|| format!("read cache directory {}", self.cfg.cache_dir.display()))?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            info!(table = %name, "loading local table");

            let table = Table::load(
                &name,
                entry.path(),
                Arc::clone(&self.storage),
                self.open_index_file.clone(),
                self.metrics.clone(),
            )?;
            tables.insert(name, Arc::new(table));
        }

        Ok(())
    }

    async fn close_all_tables(&self) {
        let mut tables = self.tables.write().await;
        for (_, table) in tables.drain() {
            table.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::LimitsConfig;
    use crate::limits::TenantLimits;
    use crate::testutil::{raw_open_fn, MockStorage};

    fn config(cache_dir: &std::path::Path, query_ready_num_days: i32) -> Config {
        Config {
            cache_dir: cache_dir.to_path_buf(),
            sync_interval: Duration::from_secs(3600),
            cache_ttl: Duration::from_secs(3600),
            query_ready_num_days,
        }
    }

    fn limits(default_days: i32, tenants: &[(&str, i32)]) -> Arc<LimitsConfig> {
        Arc::new(LimitsConfig {
            default: TenantLimits {
                query_ready_index_num_days: default_days,
            },
            tenants: tenants
                .iter()
                .map(|(user_id, days)| {
                    (
                        user_id.to_string(),
                        TenantLimits {
                            query_ready_index_num_days: *days,
                        },
                    )
                })
                .collect(),
        })
    }

    async fn new_manager(
        cfg: Config,
        storage: Arc<MockStorage>,
        limits: Arc<LimitsConfig>,
        owns_tenant: Option<OwnsTenantFn>,
    ) -> Result<Arc<TableManager>> {
        TableManager::new(
            cfg,
            raw_open_fn(),
            storage,
            limits,
            owns_tenant,
            &mut Registry::default(),
        )
        .await
    }

    async fn table_names(manager: &TableManager) -> HashSet<String> {
        manager.tables.read().await.keys().cloned().collect()
    }

    #[tokio::test]
    async fn fresh_start_downloads_query_ready_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let active = active_table_number();
        let recent = format!("tbl_{}", active - 1);
        let older = format!("tbl_{}", active - 2);

        let storage = Arc::new(MockStorage::new());
        storage.add_common_file(&recent, "c1");
        storage.add_common_file(&older, "c1");
        storage.add_common_file("tbl_junk", "c1");

        let manager = new_manager(
            config(tmp.path(), 2),
            Arc::clone(&storage),
            limits(0, &[]),
            None,
        )
        .await
        .unwrap();

        let names = table_names(&manager).await;
        assert_eq!(
            names,
            HashSet::from([recent.clone(), older.clone()])
        );
        assert!(tmp.path().join(&recent).join("c1").is_file());
        assert!(tmp.path().join(&older).join("c1").is_file());
        assert!(!tmp.path().join("tbl_junk").exists());

        // The map mirrors the cache directory exactly.
        let on_disk: HashSet<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(on_disk, names);

        manager.stop().await;
    }

    #[tokio::test]
    async fn per_tenant_override_widens_readiness() {
        let tmp = tempfile::tempdir().unwrap();
        let active = active_table_number();
        let table = format!("tbl_{}", active - 2);

        let storage = Arc::new(MockStorage::new());
        storage.add_common_file(&table, "c1");
        storage.add_user_file(&table, "u", "f1");
        storage.add_user_file(&table, "v", "f1");

        // Common window of one day excludes the table; u's override of five
        // days pulls it back in, v stays excluded by the zero default.
        let manager = new_manager(
            config(tmp.path(), 1),
            Arc::clone(&storage),
            limits(0, &[("u", 5)]),
            None,
        )
        .await
        .unwrap();

        assert_eq!(storage.downloads(&table, "u", "f1"), 1);
        assert_eq!(storage.downloads(&table, "v", "f1"), 0);
        assert_eq!(storage.downloads(&table, "", "c1"), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn ownership_predicate_excludes_foreign_tenants() {
        let tmp = tempfile::tempdir().unwrap();
        let active = active_table_number();
        let table = format!("tbl_{}", active - 2);

        let storage = Arc::new(MockStorage::new());
        storage.add_common_file(&table, "c1");
        storage.add_user_file(&table, "u", "f1");

        let owns: OwnsTenantFn = Arc::new(|user_id: &str| user_id != "u");
        let manager = new_manager(
            config(tmp.path(), 0),
            Arc::clone(&storage),
            limits(0, &[("u", 5)]),
            Some(owns),
        )
        .await
        .unwrap();

        assert_eq!(storage.downloads(&table, "u", "f1"), 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn query_readiness_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let active = active_table_number();
        let table = format!("tbl_{active}");

        let storage = Arc::new(MockStorage::new());
        storage.add_common_file(&table, "c1");
        storage.add_user_file(&table, "u", "f1");

        let manager = new_manager(
            config(tmp.path(), 1),
            Arc::clone(&storage),
            limits(1, &[]),
            None,
        )
        .await
        .unwrap();

        let after_first = storage.total_downloads();
        manager.ensure_query_readiness().await.unwrap();
        assert_eq!(storage.total_downloads(), after_first);

        manager.stop().await;
    }

    #[tokio::test]
    async fn zero_readiness_window_skips_remote_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");

        let manager = new_manager(
            config(tmp.path(), 0),
            Arc::clone(&storage),
            limits(0, &[]),
            None,
        )
        .await
        .unwrap();

        assert_eq!(storage.list_tables_calls(), 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn concurrent_for_each_creates_table_once() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_new", "c1");
        storage.add_user_file("tbl_new", "userA", "f1");

        let manager = new_manager(
            config(tmp.path(), 0),
            Arc::clone(&storage),
            limits(0, &[]),
            None,
        )
        .await
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let mut count = 0;
                manager
                    .for_each("tbl_new", "userA", &mut |_, _: &dyn OpenIndex| {
                        count += 1;
                        Ok(())
                    })
                    .await
                    .unwrap();
                count
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 2);
        }

        assert_eq!(storage.downloads("tbl_new", "", "c1"), 1);
        assert_eq!(storage.downloads("tbl_new", "userA", "f1"), 1);
        assert_eq!(table_names(&manager).await.len(), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn restart_reconstructs_tables_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");
        storage.add_user_file("tbl_100", "u", "f1");

        let manager = new_manager(
            config(tmp.path(), 0),
            Arc::clone(&storage),
            limits(0, &[]),
            None,
        )
        .await
        .unwrap();
        manager
            .for_each("tbl_100", "u", &mut |_, _: &dyn OpenIndex| Ok(()))
            .await
            .unwrap();
        manager.stop().await;

        let downloads_before = storage.total_downloads();
        let manager = new_manager(
            config(tmp.path(), 0),
            Arc::clone(&storage),
            limits(0, &[]),
            None,
        )
        .await
        .unwrap();

        assert_eq!(table_names(&manager).await, HashSet::from(["tbl_100".to_string()]));
        // Everything was served from disk.
        assert_eq!(storage.total_downloads(), downloads_before);

        let mut seen = Vec::new();
        manager
            .for_each("tbl_100", "u", &mut |_, index: &dyn OpenIndex| {
                seen.push(index.name().to_string());
                Ok(())
            })
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["c1".to_string(), "f1".to_string()]);

        manager.stop().await;
    }

    #[tokio::test]
    async fn cleanup_cache_evicts_idle_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_50", "c1");

        let mut cfg = config(tmp.path(), 0);
        cfg.cache_ttl = Duration::from_millis(5);
        let manager = new_manager(cfg, Arc::clone(&storage), limits(0, &[]), None)
            .await
            .unwrap();

        manager
            .for_each("tbl_50", "u", &mut |_, _: &dyn OpenIndex| Ok(()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.cleanup_cache().await.unwrap();
        assert!(table_names(&manager).await.is_empty());
        assert!(!tmp.path().join("tbl_50").exists());

        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(MockStorage::new());
        storage.add_common_file("tbl_100", "c1");
        storage.set_download_delay(Duration::from_millis(100));

        let mut cfg = config(tmp.path(), 0);
        cfg.sync_interval = Duration::from_millis(20);
        let manager = new_manager(cfg, Arc::clone(&storage), limits(0, &[]), None)
            .await
            .unwrap();

        // Create the table so the next sync tick has work in flight.
        storage.set_download_delay(Duration::ZERO);
        manager
            .for_each("tbl_100", "u", &mut |_, _: &dyn OpenIndex| Ok(()))
            .await
            .unwrap();
        storage.add_common_file("tbl_100", "c2");
        storage.set_download_delay(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(30)).await;

        manager.stop().await;

        // The loop has exited and every table has been closed.
        assert!(manager.loop_handle.lock().await.is_none());
        assert!(table_names(&manager).await.is_empty());
    }
}
