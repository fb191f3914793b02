pub mod once;
pub mod serve;

use std::sync::Arc;
use std::time::Duration;

use rngcontrol_core::{ControlConfig, Controller, MachineSettings, Services};

/// Parse "1500ms", "5s", "2m", "1h"; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        (s, 1000)
    };

    let value: u64 = numeric
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    value
        .checked_mul(multiplier)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {s}"))
}

pub fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Could not start async runtime: {e}");
            std::process::exit(1);
        }
    }
}

/// Validate the config, log in, and start the controller.
///
/// A failed startup login is fatal: without a session nothing can be queued.
pub async fn start_controller(config: ControlConfig) -> Controller {
    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {e}");
        std::process::exit(1);
    }
    let config = Arc::new(config);
    log::info!(
        "rngcontrol v{}: {} trials per run against {}",
        rngcontrol_core::VERSION,
        config.trial_count(),
        config.rng_url
    );

    let services = match Services::connect(Arc::clone(&config)) {
        Ok(s) => s,
        Err(e) => {
            log::error!("Could not build service clients: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = services.auth.login().await {
        log::error!("Login to {} failed: {e}", config.service_url);
        std::process::exit(1);
    }

    Controller::spawn(MachineSettings::from(config.as_ref()), services)
}
