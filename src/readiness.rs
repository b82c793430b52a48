//! Query-readiness policy.
//!
//! Decides, per remote table, which tenants must have their index
//! pre-downloaded before queries arrive. Pure functions so the window
//! arithmetic is testable without storage or a clock.

use std::collections::HashMap;

use crate::table_manager::OwnsTenantFn;

// ---------------------------------------------------------------------------
// Table numbers
// ---------------------------------------------------------------------------

/// Extract the trailing decimal table number from a table name.
///
/// Returns `None` for names without a digit suffix (not every remote key is
/// a dated table) and for suffixes that do not fit in an `i64`.
pub fn table_number_from_name(table_name: &str) -> Option<i64> {
    let suffix_len = table_name
        .bytes()
        .rev()
        .take_while(u8::is_ascii_digit)
        .count();
    if suffix_len == 0 {
        return None;
    }
    table_name[table_name.len() - suffix_len..].parse().ok()
}

// ---------------------------------------------------------------------------
// Per-table user selection
// ---------------------------------------------------------------------------

/// Return the users whose index must be made query-ready for the given
/// table, preserving the input order.
///
/// A user's window is its override in `overrides` if present, otherwise
/// `default_num_days`. A zero window excludes the user, as does an
/// ownership predicate that rejects it; otherwise the user is included iff
/// the table falls within its window counted back from the active table.
pub fn users_for_query_readiness(
    table_number: i64,
    active_table_number: i64,
    users_with_index: &[String],
    overrides: &HashMap<String, i32>,
    default_num_days: i32,
    owns_tenant: Option<&OwnsTenantFn>,
) -> Vec<String> {
    let mut users = Vec::new();

    for user_id in users_with_index {
        let num_days = overrides
            .get(user_id)
            .copied()
            .unwrap_or(default_num_days);

        if num_days == 0 {
            continue;
        }

        if let Some(owns) = owns_tenant {
            if !owns(user_id) {
                continue;
            }
        }

        if active_table_number - table_number <= i64::from(num_days) {
            users.push(user_id.clone());
        }
    }

    users
}
