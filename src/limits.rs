//! Per-tenant limits consumed by query readiness.

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Tenant limits
// ---------------------------------------------------------------------------

/// The subset of per-tenant limits the cache manager consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
pub struct TenantLimits {
    /// Number of days of index, counted back from the active table, to keep
    /// downloaded ahead of queries. 0 means no readiness required.
    #[serde(default)]
    pub query_ready_index_num_days: i32,
}

/// Source of per-tenant limit overrides.
///
/// Implemented by the configuration layer; in a multi-tenant deployment this
/// is typically backed by a runtime-reloadable overrides file.
pub trait Limits: Send + Sync {
    /// Limits applied to tenants without an explicit override.
    fn default_limits(&self) -> TenantLimits;

    /// All tenants with an explicit override, keyed by tenant ID.
    fn all_by_user_id(&self) -> HashMap<String, TenantLimits>;
}
