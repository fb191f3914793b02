//! CLI for rngcontrol, the automated control participant of a randomness experiment platform.

mod commands;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use rngcontrol_core::{ControlConfig, RawPayload};

#[derive(Parser)]
#[command(name = "rngcontrol")]
#[command(about = "rngcontrol: runs control experiments against a hardware RNG")]
#[command(version = rngcontrol_core::VERSION)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Connection and run settings shared by every subcommand.
#[derive(Args)]
struct ConfigArgs {
    /// Base URL of the scheduling service
    #[arg(long, global = true, env = "RNGCONTROL_SERVICE_URL", default_value = "http://localhost:7000")]
    service_url: String,

    /// WebSocket URL of the randomness source
    #[arg(long, global = true, env = "RNGCONTROL_RNG_URL", default_value = "ws://localhost:8080")]
    rng_url: String,

    /// Account used to log into the scheduling service
    #[arg(long, global = true, env = "RNGCONTROL_EMAIL", default_value = "control@chickenrand.org")]
    email: String,

    #[arg(long, global = true, env = "RNGCONTROL_PASSWORD", hide_env_values = true, default_value = "")]
    password: String,

    /// Identifier of the RNG reported with results
    #[arg(long, global = true, env = "RNGCONTROL_RNG_ID", default_value = "1")]
    rng_id: String,

    /// Experiment length (e.g. 5s, 1500ms, 2m)
    #[arg(long, global = true, env = "RNGCONTROL_XP_DURATION", default_value = "5s", value_parser = commands::parse_duration)]
    xp_duration: Duration,

    /// Samples the source emits per second
    #[arg(long, global = true, env = "RNGCONTROL_TRIALS_PER_SECOND", default_value = "10")]
    trials_per_second: u32,

    /// Delay between queue position checks
    #[arg(long, global = true, env = "RNGCONTROL_POLL_INTERVAL", default_value = "3s", value_parser = commands::parse_duration)]
    poll_interval: Duration,

    /// Give up waiting after this many position checks (default: wait forever)
    #[arg(long, global = true, env = "RNGCONTROL_MAX_POLL_ATTEMPTS")]
    max_poll_attempts: Option<u32>,

    /// Time to discard source output before sending the start signal
    #[arg(long, global = true, env = "RNGCONTROL_ARM_DELAY", default_value = "1s", value_parser = commands::parse_duration)]
    arm_delay: Duration,

    /// Text frame that tells the source to start counting
    #[arg(long, global = true, env = "RNGCONTROL_START_SIGNAL", default_value = "start")]
    start_signal: String,

    /// Leave the queue when the service refuses to start the experiment
    #[arg(long, global = true, env = "RNGCONTROL_RELEASE_ON_START_FAILURE")]
    release_on_start_failure: bool,

    /// Raw bytes attached to each trial: numbers, base64, omit
    #[arg(long, global = true, env = "RNGCONTROL_RAW_PAYLOAD", default_value = "numbers")]
    raw_payload: RawPayload,

    /// Timeout for HTTP requests and the source handshake
    #[arg(long, global = true, env = "RNGCONTROL_REQUEST_TIMEOUT", default_value = "30s", value_parser = commands::parse_duration)]
    request_timeout: Duration,
}

impl ConfigArgs {
    fn into_config(self) -> ControlConfig {
        ControlConfig {
            service_url: self.service_url,
            rng_url: self.rng_url,
            email: self.email,
            password: self.password,
            rng_id: self.rng_id,
            xp_duration: self.xp_duration,
            trials_per_second: self.trials_per_second,
            poll_interval: self.poll_interval,
            arm_delay: self.arm_delay,
            start_signal: self.start_signal,
            max_poll_attempts: self.max_poll_attempts,
            release_ticket_on_start_failure: self.release_on_start_failure,
            raw_payload: self.raw_payload,
            request_timeout: self.request_timeout,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and wait for control requests on POST /rng-control
    Serve {
        /// Bind address
        #[arg(long, env = "RNGCONTROL_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port
        #[arg(long, env = "RNGCONTROL_PORT", default_value = "1337")]
        port: u16,
    },

    /// Log in, run a single control experiment, and exit
    Once {
        /// Experiment to run
        #[arg(long)]
        xp_id: String,

        /// User the control run is recorded for
        #[arg(long, default_value = "")]
        user_id: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config.into_config();

    match cli.command {
        Commands::Serve { host, port } => commands::serve::run(config, &host, port),
        Commands::Once { xp_id, user_id } => commands::once::run(config, &xp_id, &user_id),
    }
}
