// orchestrator/changeid.rs
//
// Per-VM, per-disk CBT change-ID lookup over the completed-backup history.
// The capture agent calls this before each incremental disk; the empty
// string tells it no prior backup exists and the disk must go as full.

use sqlx::{MySql, Pool};

use crate::db::queries;

/// Most recent change ID recorded for `(vm_name, disk_index)`, or `""`.
pub async fn get_previous_change_id(
    pool: &Pool<MySql>,
    vm_name: &str,
    disk_index: i32,
) -> Result<String, sqlx::Error> {
    Ok(queries::backup::previous_change_id(pool, vm_name, disk_index)
        .await?
        .unwrap_or_default())
}
