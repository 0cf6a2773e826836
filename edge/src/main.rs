mod buffer;
mod config;
mod payload;
mod publisher;
mod scheduler;
mod sensors;

use clap::Parser;
use config::Config;
use scheduler::Scheduler;
use tracing::info;

// Everything on the device is cooperative interleaving on one thread; the
// current-thread runtime makes that explicit.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cfg = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting edge agent {}", cfg.device_id);
    info!("Broker: {}:{}", cfg.broker, cfg.port);
    info!(
        "Cadences: motion {} ms, telemetry {} ms, shock threshold {:.1} g",
        cfg.motion_interval_ms, cfg.telemetry_interval_ms, cfg.shock_threshold_g
    );
    info!("Offline buffer: {:?} (cap {})", cfg.buffer_path, cfg.buffer_max_records);

    // Runs until device reset.
    Scheduler::new(cfg).run().await;
}
