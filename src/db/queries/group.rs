use crate::db::tables::{VmGroup, VmGroupMember};
use sqlx::{MySql, Pool};

pub async fn get_group(
    pool: &Pool<MySql>,
    group_id: &str,
) -> Result<Option<VmGroup>, sqlx::Error> {
    sqlx::query_as::<_, VmGroup>("SELECT * FROM vm_groups WHERE id = ?")
        .bind(group_id)
        .fetch_optional(pool)
        .await
}

pub async fn create_group(pool: &Pool<MySql>, group: &VmGroup) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO vm_groups (id, name, max_concurrent_vms, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&group.id)
    .bind(&group.name)
    .bind(group.max_concurrent_vms)
    .bind(group.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn add_member(pool: &Pool<MySql>, member: &VmGroupMember) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO vm_group_members (group_id, vm_name, position, enabled) VALUES (?, ?, ?, ?)",
    )
    .bind(&member.group_id)
    .bind(&member.vm_name)
    .bind(member.position)
    .bind(member.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

/// Enabled members of a group in their configured order.
pub async fn list_enabled_members(
    pool: &Pool<MySql>,
    group_id: &str,
) -> Result<Vec<VmGroupMember>, sqlx::Error> {
    sqlx::query_as::<_, VmGroupMember>(
        "SELECT * FROM vm_group_members WHERE group_id = ? AND enabled = TRUE ORDER BY position",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
}
