//! Fabric controller - flow scheduler daemon for a Fat-Tree fabric
//!
//! Runs the scheduler loop, accepts southbound events over HTTP and emits
//! southbound commands as structured log lines for the OpenFlow adapter.

use anyhow::Result;
use fabric_controller::{api, config::ControllerConfig};
use fabric_lib::{
    health::{components, HealthRegistry},
    sinks::{
        ChannelSouthbound, FilePlacementStore, InMemorySliceStore, RouteTable, SliceStore,
        SouthboundCommand,
    },
    FabricController, FlowScheduler, SchedulerMetrics, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Forward southbound commands to the adapter log and mirror installed routes
async fn drain_southbound(mut commands: mpsc::Receiver<SouthboundCommand>, routes: Arc<RouteTable>) {
    while let Some(command) = commands.recv().await {
        match serde_json::to_string(&command) {
            Ok(json) => debug!(target: "southbound", command = %json, "Southbound command"),
            Err(e) => debug!(target: "southbound", error = %e, "Unencodable southbound command"),
        }
        match command {
            SouthboundCommand::InstallRoute { rule } => routes.record(rule),
            SouthboundCommand::RequestPortStats { .. } => {
                let expired = routes.prune_expired();
                if expired > 0 {
                    debug!(expired = expired, "Dropped idle routes from the mirror");
                }
            }
        }
    }
    info!("Southbound channel closed");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fabric-controller");

    let config = ControllerConfig::load()?;
    let scheduler_config = config.scheduler_config()?;
    info!(
        controller = %config.controller_name,
        fat_tree_k = config.fat_tree_k,
        placement_path = %config.placement_path.display(),
        "Controller configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::PLACEMENT_STORE).await;
    health_registry.register(components::SOUTHBOUND).await;

    // Registers the scheduler metrics before the first scrape
    let _metrics = SchedulerMetrics::new();

    let logger = StructuredLogger::new(&config.controller_name);
    logger.log_startup(CONTROLLER_VERSION, config.fat_tree_k);

    let placements = Arc::new(FilePlacementStore::new(&config.placement_path));
    let slices: Arc<dyn SliceStore> = match &config.slices_path {
        Some(path) => Arc::new(InMemorySliceStore::load(path).await?),
        None => Arc::new(InMemorySliceStore::default()),
    };

    let (southbound, commands) = ChannelSouthbound::new(config.southbound_buffer);
    let southbound = Arc::new(southbound);
    let routes = Arc::new(RouteTable::new());
    tokio::spawn(drain_southbound(commands, routes.clone()));

    let scheduler = Arc::new(
        FlowScheduler::builder()
            .config(scheduler_config)
            .transport(southbound.clone())
            .installer(southbound.clone())
            .placements(placements.clone())
            .slices(slices.clone())
            .health(health_registry.clone())
            .controller_name(config.controller_name.clone())
            .build()?,
    );
    let controller = Arc::new(FabricController::new(
        scheduler.clone(),
        southbound.clone(),
        slices.clone(),
    ));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        controller,
        placements,
        slices,
        routes,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let handle = scheduler.start().await?;
    let mut scheduler_task = tokio::spawn(handle.join());

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut scheduler_task => Some(result),
    };
    let result = match finished {
        Some(result) => {
            logger.log_shutdown("scheduler loop exited");
            result
        }
        None => {
            logger.log_shutdown("SIGINT received");
            scheduler.stop().await;
            scheduler_task.await
        }
    };
    result??;

    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
