//! ==============================================================================
//! main.rs - hwwwmon entry point
//! ==============================================================================
//!
//! purpose:
//!     watch fans and temperatures of this machine from another device's
//!     browser while something else (a game, a render) owns the local screen.
//!
//! responsibilities:
//!     - load configuration (file + command line)
//!     - pick the sensor source (hwmon sysfs, or mock)
//!     - run the sampler loop that keeps the latest sample current
//!     - run the reaper that evicts stale sessions
//!     - serve the page and the single-client live feed
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                        hwwwmon process                       │
//!     │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐  │
//!     │  │  sampler    │    │   reaper    │    │   web server     │  │
//!     │  │ (1s cycle)  │    │ (1s sweep)  │    │  (port 8484)     │  │
//!     │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘  │
//!     │         │ publish          │ evict              │ admit/wait │
//!     │   ┌─────┴──────┐    ┌──────┴───────┐    ┌───────┴────────┐   │
//!     │   │ SampleFeed │───▶│  Dispatcher  │◀───│  SessionGate   │   │
//!     │   │ (watch)    │    │ (per client) │    │ (0 or 1 owner) │   │
//!     │   └────────────┘    └──────────────┘    └────────────────┘   │
//!     └──────────────────────────────────────────────────────────────┘
//!                 ▲
//!                 │ read()
//!         ┌───────┴────────┐
//!         │ /sys/class/    │
//!         │ hwmon          │
//!         └────────────────┘
//!
//! ==============================================================================

mod config;
mod dispatcher;
mod domain;
mod error;
mod feed;
mod sampler;
mod sensor;
mod server;
mod session;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Args, MonitorConfig, SourceKind};
use crate::feed::SampleFeed;
use crate::sampler::Sampler;
use crate::sensor::{HwmonSource, MockSource, SensorSource};
use crate::server::AppState;
use crate::session::SessionGate;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // startup banner
    println!("===========================================================");
    println!("  hwwwmon - hardware monitor over the web");
    println!("===========================================================");

    // step 1: load configuration
    let config = MonitorConfig::from_args(&args)?;
    config.print_summary();

    // step 2: logging (RUST_LOG wins over the config file)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // step 3: sensor source
    let source: Arc<dyn SensorSource> = match config.sensors.source {
        SourceKind::Hwmon => Arc::new(HwmonSource::new(&config.sensors.hwmon_root)),
        SourceKind::Mock => Arc::new(MockSource::new()),
    };

    // step 4: shared state
    let feed = SampleFeed::new(config.polling.history);
    let gate = SessionGate::new(config.session.policy, config.stale_timeout());
    tracing::info!(policy = ?gate.policy(), stale_timeout = ?gate.stale_timeout(), "session gate ready");
    let state = AppState::new(feed.clone(), gate.clone(), config.keepalive());

    // step 5: bind before spawning anything, a taken port is fatal
    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "dashboard live at http://{addr}");

    // step 6: background loops
    let sampler = Sampler::new(source, feed, config.poll_interval(), config.read_timeout())
        .show_data(config.logging.show_sensor_data);
    tokio::spawn(sampler.run());
    tokio::spawn(gate.run_reaper(config.poll_interval()));

    // step 7: serve until killed
    server::run_server(listener, state).await
}
