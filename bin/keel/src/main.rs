#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Keel rollup sequencing node.

use clap::{CommandFactory, Parser, error::ErrorKind};
use tracing::info;

use keel_config::Opts;
use keel_node::{Node, NodeError};
use keel_primitives::shutdown::{ShutdownSignal, run_until_shutdown};

mod allocator;
use allocator::{Allocator, new_allocator};

#[global_allocator]
static ALLOC: Allocator = new_allocator();

#[tokio::main]
async fn main() -> eyre::Result<()> {
    if let Ok(custom_env_file) = std::env::var("ENV_FILE") {
        // Try from custom env file, and abort if it fails
        dotenvy::from_filename(custom_env_file)?;
    } else {
        // The default .env file is optional.
        dotenvy::dotenv().ok();
    }

    let opts = Opts::parse();

    let log_provider = opts.telemetry.setup(&opts.instance_name)?;

    info!("⚓ Keel node starting...");

    let node = match Node::new(opts) {
        Ok(node) => node,
        Err(NodeError::Config(e)) => {
            log_provider.shutdown();
            Opts::command().error(ErrorKind::ArgumentConflict, e).exit()
        }
        Err(e) => return Err(e.into()),
    };

    let shutdown_signal = ShutdownSignal::new();
    let token = shutdown_signal.token();
    let on_shutdown = || {
        info!("👋 Keel node shutting down...");
        log_provider.shutdown();
    };

    run_until_shutdown(node.run(token), shutdown_signal, on_shutdown).await?;
    Ok(())
}
