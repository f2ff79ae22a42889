pub mod models {
    pub mod lighting;
}

pub mod boosts;
pub mod client;
pub mod config;
pub mod env_file;
pub mod notify;
pub mod registry;
pub mod utils;
pub mod services {
    pub mod aggregator;
    pub mod control;
    pub mod coordinator;
    pub mod locks;
}

use crate::boosts::HomeAssistantBoosts;
use crate::client::HomeAssistantClient;
use crate::config::{Config, ZonesFile};
use crate::notify::LogNotifier;
use crate::registry::ZoneRegistry;
use crate::services::{control, coordinator::Coordinator};
use log::{error, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env().map_err(|e| format!("Invalid configuration: {}", e))?;
    info!(
        "Config loaded (ha_url={}, zones_file={}, cycle_interval={}s, manual_timeout={}s, scene_timeout={}s, sleep_window={}, dim_threshold={}%, max_request_retries={})",
        cfg.ha_url,
        cfg.zones_file.display(),
        cfg.cycle_interval.as_secs(),
        cfg.lock_policy.manual_timeout.as_secs(),
        cfg.lock_policy.scene_timeout.as_secs(),
        cfg.lock_policy
            .sleep_window
            .map(|w| w.to_string())
            .unwrap_or_else(|| "off".to_string()),
        cfg.lock_policy.dim_threshold_pct,
        cfg.max_request_retries.get()
    );

    // 2) Zones and scenes
    let file = ZonesFile::load(&cfg.zones_file).map_err(|e| format!("Loading zones failed: {}", e))?;
    let registry = ZoneRegistry::from_file(file).map_err(|e| format!("Invalid zone configuration: {}", e))?;
    info!(
        "Registered {} zone(s) and {} scene(s)",
        registry.len(),
        registry.scenes().count()
    );

    // 3) Home Assistant
    let client = Arc::new(HomeAssistantClient::new(
        cfg.ha_url.clone(),
        &cfg.ha_token,
        cfg.max_request_retries,
    ));
    match client.ping() {
        Ok(()) => info!("Connected to Home Assistant at {}", cfg.ha_url),
        Err(e) => warn!(
            "Home Assistant at {} not reachable yet ({}); zones will report errors until it is",
            cfg.ha_url, e
        ),
    }

    // 4) Coordinator and control input
    let boosts = Arc::new(HomeAssistantBoosts::new(client.clone(), cfg.boosts.clone()));
    let coordinator = Coordinator::new(registry, client, boosts, Arc::new(LogNotifier), cfg.lock_policy)
        .map_err(|e| format!("Starting lock timers failed: {}", e))?;
    control::spawn_stdin_reader(coordinator.clone()).map_err(|e| format!("Starting control reader failed: {}", e))?;

    // 5) Periodic cycle (steady cadence)
    info!("Starting cycle loop: interval={}s", cfg.cycle_interval.as_secs());
    loop {
        let tick_start = Instant::now();
        coordinator.run_cycle();

        let elapsed = tick_start.elapsed();
        if elapsed < cfg.cycle_interval {
            thread::sleep(cfg.cycle_interval - elapsed);
        }
    }
}

fn main() {
    let loaded_env = match env_file::load_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "lighting-coordinator {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
