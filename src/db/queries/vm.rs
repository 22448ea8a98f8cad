use crate::db::tables::{Vm, VmDisk};
use sqlx::{MySql, Pool};

/// Resolve a VM by name from the configuration store.
pub async fn get_vm_by_name(pool: &Pool<MySql>, name: &str) -> Result<Option<Vm>, sqlx::Error> {
    sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// Disk layout of a VM, dense from index zero.
pub async fn list_vm_disks(pool: &Pool<MySql>, vm_id: &str) -> Result<Vec<VmDisk>, sqlx::Error> {
    sqlx::query_as::<_, VmDisk>(
        "SELECT * FROM vm_disks WHERE vm_id = ? ORDER BY disk_index",
    )
    .bind(vm_id)
    .fetch_all(pool)
    .await
}
