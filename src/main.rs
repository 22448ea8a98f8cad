use colored::Colorize;
use log::info;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, routes};
use std::env;
use std::sync::Arc;
use std::time::Duration;

mod api;
mod config;
mod copyengine;
mod db;
mod flows;
mod logging;
mod nbd;
mod orchestrator;
mod qcow2;
mod repository;
mod restore;
mod scheduler;
mod state;
mod tools;

use copyengine::CopyEngine;
use db::DatabaseManager;
use flows::FlowEngine;
use nbd::{DevicePool, PortAllocator, QemuNbdManager};
use orchestrator::{AgentClient, BackupOrchestrator};
use repository::{immutable, RepositoryRegistry};
use restore::RestoreEngine;
use scheduler::Scheduler;
use state::EngineState;

#[get("/health")]
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Palisade backup hub is healthy",
    }))
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    logging::print_banner("Palisade Backup Hub", |s| s.cyan());

    let config = config::SERVER_CONFIG.clone();
    let setup_timeout = Duration::from_secs(config.tool_setup_timeout_secs);
    let teardown_timeout = Duration::from_secs(config.tool_teardown_timeout_secs);

    // Database + schema
    let database = DatabaseManager::new(&config.database_url).await?;
    let pool = database.pool().clone();
    info!("{}", "✓ database ready".green());

    // Repositories
    let registry = Arc::new(RepositoryRegistry::new(
        pool.clone(),
        setup_timeout,
        teardown_timeout,
    ));
    let loaded = registry.load_all().await?;
    info!("{}", format!("✓ {} repositories registered", loaded).green());

    // NBD data plane
    let ports = Arc::new(PortAllocator::new(
        config.nbd.port_range_start,
        config.nbd.port_range_end,
    ));
    let nbd_servers = Arc::new(QemuNbdManager::new(teardown_timeout));
    nbd_servers.spawn_reaper();

    // Capture agent client
    let agent = AgentClient::new(
        &config.agent_url,
        config.agent_retry_attempts,
        Duration::from_secs(30),
    );

    // Backup orchestrator
    let backup_orchestrator = Arc::new(BackupOrchestrator::new(
        pool.clone(),
        Arc::clone(&registry),
        Arc::clone(&ports),
        Arc::clone(&nbd_servers),
        agent,
        &config,
    ));

    // Restore engine (device pool is disjoint from the backup data plane)
    let devices = Arc::new(DevicePool::new(&config.restore.nbd_devices));
    let restore_engine = Arc::new(RestoreEngine::new(
        pool.clone(),
        Arc::clone(&devices),
        config.restore.max_mounts,
        config.restore.mount_base.clone().into(),
        config.restore.idle_timeout_secs,
        setup_timeout,
        teardown_timeout,
    ));
    restore_engine.spawn_cleanup_worker(Duration::from_secs(config.restore.cleanup_interval_secs));

    // Protection flows + scheduler
    let flow_engine = Arc::new(FlowEngine::new(pool.clone(), Arc::clone(&backup_orchestrator)));
    let flow_scheduler = Arc::new(Scheduler::new(pool.clone(), Arc::clone(&flow_engine)));

    // Copy engine worker pool
    let copy_engine = Arc::new(CopyEngine::new(
        pool.clone(),
        Arc::clone(&registry),
        config.copy.workers,
        Duration::from_secs(config.copy.poll_interval_secs),
    ));
    copy_engine.spawn();

    // Immutability worker
    immutable::spawn_immutability_worker(
        pool.clone(),
        Duration::from_secs(config.immutability_sweep_interval_secs),
        teardown_timeout,
    );

    // Startup reconciliation: settle whatever a previous process left behind
    let failed_jobs = backup_orchestrator.reconcile().await?;
    let (adopted, dropped) = restore_engine.reconcile().await?;
    let failed_executions = db::queries::flow::fail_running_executions(&pool).await?;
    let armed = flow_scheduler.rearm_all().await?;
    info!(
        "{}",
        format!(
            "✓ reconciliation: {} jobs failed, {} mounts adopted, {} dropped, {} executions settled, {} schedules armed",
            failed_jobs, adopted, dropped, failed_executions, armed
        )
        .green()
    );

    let engine_state = EngineState {
        pool,
        registry,
        orchestrator: backup_orchestrator,
        restore: restore_engine,
        flows: flow_engine,
        scheduler: flow_scheduler,
        ports,
        nbd_servers: Arc::clone(&nbd_servers),
        devices,
    };

    let rocket_config = rocket::Config {
        port: config.port,
        address: config.address.parse()?,
        ..Default::default()
    };

    info!(
        "{}",
        format!("✓ REST API listening on {}:{}", config.address, config.port).green()
    );

    let _rocket = rocket::build()
        .configure(rocket_config)
        .manage(engine_state)
        .mount("/", routes![health_check])
        .mount("/api/v1", api::v1::routes())
        .launch()
        .await?;

    // graceful shutdown: no qemu-nbd may outlive the hub
    nbd_servers.stop_all().await;

    Ok(())
}
