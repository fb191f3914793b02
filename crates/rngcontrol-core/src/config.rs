//! Controller configuration, resolved once at startup and passed in by value.

use std::time::Duration;

use crate::error::{ControlError, Result};

/// How each trial's raw bytes are carried in the submitted results bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawPayload {
    /// Drop the raw bytes once they are tallied.
    Omit,
    /// Keep them as a JSON array of byte values (what the scheduling service stores).
    #[default]
    Numbers,
    /// Keep them as standard base64 text.
    Base64,
}

impl std::fmt::Display for RawPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Omit => write!(f, "omit"),
            Self::Numbers => write!(f, "numbers"),
            Self::Base64 => write!(f, "base64"),
        }
    }
}

impl std::str::FromStr for RawPayload {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "omit" | "none" => Ok(Self::Omit),
            "numbers" => Ok(Self::Numbers),
            "base64" | "b64" => Ok(Self::Base64),
            other => Err(ControlError::Config(format!(
                "unknown raw payload mode '{other}' (expected omit, numbers or base64)"
            ))),
        }
    }
}

/// Everything the controller and its clients need to know about the outside world.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Base URL of the scheduling service, e.g. `http://localhost:7000`.
    pub service_url: String,
    /// WebSocket address of the randomness source, e.g. `ws://localhost:8080`.
    pub rng_url: String,
    pub email: String,
    pub password: String,
    /// Identifier attached to result submissions as `rng_id`.
    pub rng_id: String,
    /// Experiment length. Together with `trials_per_second` it fixes the trial count.
    pub xp_duration: Duration,
    pub trials_per_second: u32,
    pub poll_interval: Duration,
    /// Pause between stream open and the start signal.
    pub arm_delay: Duration,
    /// Text frame sent to the source to begin data collection.
    pub start_signal: String,
    /// Cap on queue position polls. `None` polls forever.
    pub max_poll_attempts: Option<u32>,
    /// Release the queue slot when the service rejects `start`.
    pub release_ticket_on_start_failure: bool,
    pub raw_payload: RawPayload,
    pub request_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:7000".to_string(),
            rng_url: "ws://localhost:8080".to_string(),
            email: "control@chickenrand.org".to_string(),
            password: String::new(),
            rng_id: "1".to_string(),
            xp_duration: Duration::from_secs(5),
            trials_per_second: 10,
            poll_interval: Duration::from_secs(3),
            arm_delay: Duration::from_secs(1),
            start_signal: "start".to_string(),
            max_poll_attempts: None,
            release_ticket_on_start_failure: false,
            raw_payload: RawPayload::Numbers,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ControlConfig {
    /// Number of stream messages that make up one run.
    pub fn trial_count(&self) -> usize {
        let n = self.xp_duration.as_millis() * u128::from(self.trials_per_second) / 1000;
        usize::try_from(n).unwrap_or(usize::MAX).max(1)
    }

    /// Reject configurations the clients cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.service_url.starts_with("http://") || self.service_url.starts_with("https://"))
        {
            return Err(ControlError::Config(format!(
                "service url must be http(s), got '{}'",
                self.service_url
            )));
        }
        if !(self.rng_url.starts_with("ws://") || self.rng_url.starts_with("wss://")) {
            return Err(ControlError::Config(format!(
                "rng url must be ws(s), got '{}'",
                self.rng_url
            )));
        }
        if self.trials_per_second == 0 {
            return Err(ControlError::Config(
                "trials per second must be positive".to_string(),
            ));
        }
        if self.xp_duration.is_zero() {
            return Err(ControlError::Config(
                "experiment duration must be positive".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ControlError::Config(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.max_poll_attempts == Some(0) {
            return Err(ControlError::Config(
                "max poll attempts must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Scheduling service URL for `path`, without a doubled slash.
    pub fn service_endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.service_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
