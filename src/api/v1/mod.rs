use rocket::routes;

pub mod backups;
pub mod flows;
pub mod groups;
pub mod policies;
pub mod repositories;
pub mod restore;
pub mod schedules;
pub mod system;

use backups::*;
use flows::*;
use groups::*;
use policies::*;
use repositories::*;
use restore::*;
use schedules::*;
use system::*;

pub fn routes() -> Vec<rocket::Route> {
    routes![
        // backups
        create_backup,
        list_backups,
        get_backup_chain,
        get_change_id,
        get_backup,
        get_backup_disks,
        complete_disk,
        report_progress,
        cancel_backup,
        list_backup_copies,
        verify_backup,
        delete_backup,
        // protection flows
        create_flow,
        list_flows,
        flow_summary,
        get_flow,
        update_flow,
        delete_flow,
        enable_flow,
        disable_flow,
        bulk_enable,
        bulk_disable,
        execute_flow,
        list_executions,
        cancel_execution,
        // restore
        mount_backup,
        list_mounts,
        list_files,
        file_info,
        download_file,
        download_directory,
        unmount_backup,
        // repositories
        create_repository,
        list_repositories,
        get_repository,
        update_repository,
        storage_info,
        test_repository,
        list_repository_contexts,
        delete_repository,
        // schedules
        create_schedule,
        list_schedules,
        // policies
        create_policy,
        get_policy,
        // groups
        create_group,
        get_group,
        // system
        system_status,
    ]
}
