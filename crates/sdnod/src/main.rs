//! sdnod - SDN Domain Orchestrator Daemon
//!
//! Boot order: configuration, logging, database reachability (a dead
//! database fails the start with a non-zero exit code), controller client
//! selection, component wiring. The HTTP facade, authentication and the
//! messaging client are hosted outside this process and talk to the
//! coordinator built here.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use sdno_controller::{ControllerClient, ControllerKind, OdlClient, OnosClient, TopologyProvider};
use sdno_core::{Config, SessionCoordinator, ResourceDescription};
use sdno_store::GraphStore;

#[derive(Parser, Debug)]
#[command(name = "sdnod", about = "SDN domain orchestrator")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/default-config.yaml")]
    config: String,
}

/// Initializes tracing/logging subsystem
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn build_controller(config: &Config) -> anyhow::Result<Arc<dyn ControllerClient>> {
    match config.network_controller.controller_name {
        ControllerKind::Onos => {
            let onos = config
                .onos
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("missing [onos] section"))?;
            Ok(Arc::new(OnosClient::new(
                &onos.endpoint,
                &onos.username,
                &onos.password,
                onos.version,
            )))
        }
        ControllerKind::Opendaylight => {
            let odl = config
                .opendaylight
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("missing [opendaylight] section"))?;
            Ok(Arc::new(OdlClient::new(
                &odl.endpoint,
                &odl.username,
                &odl.password,
                odl.version,
            )))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    info!("--- Starting sdnod ---");

    let config = match Config::from_file(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = %err, "could not load configuration");
            return ExitCode::from(1);
        }
    };

    // The database must be reachable at boot.
    let store = match GraphStore::connect(&config.database.connection).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "database unreachable");
            return ExitCode::from(2);
        }
    };
    if let Err(err) = store.ping().await {
        error!(error = %err, "database unreachable");
        return ExitCode::from(2);
    }

    let controller = match build_controller(&config) {
        Ok(controller) => controller,
        Err(err) => {
            error!(error = %err, "could not build controller client");
            return ExitCode::from(1);
        }
    };

    let description = match ResourceDescription::load(
        &config.domain_description.domain_description_file,
        &config.domain_description.domain_description_dynamic_file,
    ) {
        Ok(description) => Arc::new(description),
        Err(err) => {
            error!(error = %err, "could not load the domain description");
            return ExitCode::from(1);
        }
    };

    let topology = Arc::new(tokio::sync::RwLock::new(TopologyProvider::new(
        config.other_options.use_interfaces_names,
    )));

    let _coordinator = SessionCoordinator::new(
        config.clone(),
        store,
        controller,
        topology,
        description,
        None,
    );

    info!(
        ip = %config.domain_orchestrator.ip,
        port = config.domain_orchestrator.port,
        controller = config.network_controller.controller_name.as_str(),
        detached = config.domain_orchestrator.detached_mode,
        "orchestrator ready, waiting for requests"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(error = %err, "could not listen for shutdown signal"),
    }

    ExitCode::SUCCESS
}
