//! Controller daemon: loads the configuration, restores the last state
//! snapshot and runs the background reconciler until shutdown. The RPC
//! surface lives in `slate::controller`; wiring it to a transport is up
//! to the deployment.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use slate::blocks::fabric::{Fabric, SimFabric};
use slate::blocks::{planner_from_config, BlockPlanner};
use slate::common::config::ControllerConfig;
use slate::common::setup::setup_logging;
use slate::controller::Controller;
use slate::cred::CredentialEngine;
use slate::reconciler::Reconciler;
use slate::state::{new_state_ref, snapshot, StateStore};

#[derive(Parser)]
#[command(name = "slated", about = "Cluster workload manager controller")]
struct Opts {
    /// Controller configuration file (`key = value` lines).
    #[arg(long, default_value = "/etc/slate/slate.conf")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    verbose: bool,
}

fn load_config(path: &PathBuf) -> anyhow::Result<ControllerConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => ControllerConfig::parse(&text)
            .with_context(|| format!("cannot parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("No configuration at {}; using defaults", path.display());
            Ok(ControllerConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    setup_logging(opts.verbose);

    let config = load_config(&opts.config)?;
    let creds = Arc::new(CredentialEngine::with_generated_key(
        config.expiration_window,
    )?);

    let snapshot_path = config.state_save_location.join("state.bin");
    let store = if snapshot_path.exists() {
        log::info!("Restoring state from {}", snapshot_path.display());
        snapshot::load(&snapshot_path, &creds)?
    } else {
        log::info!("No snapshot found; starting with an empty state");
        StateStore::new()
    };
    let state = new_state_ref(store);

    // For a grid topology the reconciler keeps the block layout on the
    // fabric aligned with the configuration. The simulated fabric
    // stands in until a hardware driver is supplied.
    let (planner, fabric): (Option<Arc<tokio::sync::Mutex<BlockPlanner>>>, Option<Arc<dyn Fabric>>) =
        match planner_from_config(&config)? {
            Some(planner) => {
                log::info!(
                    "Block planner up in {:?} mode with {} blocks",
                    planner.mode(),
                    planner.blocks().len()
                );
                (
                    Some(Arc::new(tokio::sync::Mutex::new(planner))),
                    Some(Arc::new(SimFabric::new())),
                )
            }
            None => (None, None),
        };

    let controller = Arc::new(Controller::new(
        state.clone(),
        Arc::clone(&creds),
        config.clone(),
    ));
    let cancel = controller.shutdown_token();
    let reconciler = Reconciler::new(state, creds, planner, fabric, config);
    let handle = reconciler.spawn(cancel.clone());
    log::info!("Controller up");

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("cannot listen for the interrupt signal")?;
            log::info!("Interrupted; shutting down");
            cancel.cancel();
        }
    }
    // The reconciler writes the final snapshot on its way out.
    handle.await.context("reconciler task failed")?;
    Ok(())
}
