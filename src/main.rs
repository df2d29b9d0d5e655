mod config;
mod containers;
mod docker;
mod grace;
mod image;
mod images;
mod observability;
mod registry;
#[cfg(test)]
mod testing;
mod timer;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::containers::Containers;
use crate::docker::{ContainerEngine, DockerEngine};
use crate::images::Images;
use crate::watcher::Watcher;

/// Reclaims container images that stayed unreferenced for a grace period.
#[derive(Parser)]
#[command(name = "caduc", version)]
struct Args {
    /// Default grace TIME between last container (or child image) removal
    /// and proper image removal
    #[arg(long = "image-gracetime", value_name = "TIME", default_value = "1d")]
    image_gracetime: String,

    /// Inline configuration override (dotted KEY=VAL), repeatable
    #[arg(short = 'c', long = "config", value_name = "KEY=VAL")]
    config: Vec<String>,

    /// Location of the caduc configuration FILE
    #[arg(short = 'C', long = "config-file", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Switch debug logging on
    #[arg(short = 'D', long = "debug")]
    debug: bool,

    /// Expose Prometheus metrics on this port
    #[arg(long = "metrics-port", value_name = "PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    observability::init(args.metrics_port);

    let config = Arc::new(Config::load(&args.config, args.config_file.as_deref())?);
    grace::validate(&config)?;

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::connect()?);
    let images = Images::new(engine.clone(), config, args.image_gracetime);
    let containers = Containers::new(engine.clone(), images.clone());

    // All state is derived from the engine: enumerate what exists, link
    // containers to their images, then arm schedules for whatever is idle.
    images.initial_sync().await?;
    containers.initial_sync().await?;
    images.update_timers().await;

    let watcher = Watcher::new(engine, images, containers);
    tokio::select! {
        result = watcher.watch() => {
            result?;
            info!("engine event stream closed, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling pending removals");
            timer::cancel_all();
        }
    }
    Ok(())
}
