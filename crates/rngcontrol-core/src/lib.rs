//! # rngcontrol-core
//!
//! **The automated control participant of a remote randomness experiment.**
//!
//! `rngcontrol-core` logs into a scheduling service, queues a synthetic
//! experiment, waits for its turn, streams a fixed number of samples from a
//! hardware random number source, tallies their bits, and submits the results
//! back to the service as a control run.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rngcontrol_core::{
//!     Authenticator, ControlConfig, Controller, ExperimentRequest, MachineSettings, Services,
//! };
//!
//! # async fn run() -> rngcontrol_core::Result<()> {
//! let config = Arc::new(ControlConfig::default());
//! let services = Services::connect(Arc::clone(&config))?;
//! services.auth.login().await?;
//!
//! let controller = Controller::spawn(MachineSettings::from(config.as_ref()), services);
//! let handle = controller.handle();
//! handle.trigger(ExperimentRequest::new("2", "1"));
//! handle.wait_idle_after(0).await;
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Session → Queue → (poll) → Start → Stream → Telemetry → Remove → Submit → Drain
//!
//! - [`session`]: the authenticated cookie session, refreshed in place.
//! - [`queue`]: the queue verbs and result submission.
//! - [`stream`]: the WebSocket connection to the randomness source.
//! - [`telemetry`]: per-sample bit tallies and the results bundle.
//! - [`machine`]: the pure lifecycle state machine.
//! - [`controller`]: the single task that executes the machine's effects.

pub mod config;
pub mod controller;
pub mod error;
pub mod machine;
pub mod queue;
pub mod session;
pub mod stream;
pub mod telemetry;

pub use config::{ControlConfig, RawPayload};
pub use controller::{Controller, ControllerHandle, Services};
pub use error::{ControlError, Result};
pub use machine::{
    Completion, ControllerStatus, Effect, ExperimentRequest, Machine, MachineSettings, Phase,
};
pub use queue::{QueueAdmission, QueueClient, QueueId, SchedulingService};
pub use session::{Authenticator, SessionManager};
pub use stream::{RandomnessSource, StreamClient, StreamOutcome, StreamState};
pub use telemetry::{Aggregator, ResultsBundle, Sample, TrialResult, tally};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
