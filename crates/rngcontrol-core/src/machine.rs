//! Experiment lifecycle state machine.
//!
//! Pure transition logic: inputs are inbound triggers and the completions of
//! previously requested operations, outputs are the next [`Effect`] to run.
//! No I/O happens here; [`crate::controller`] executes effects and feeds
//! their results back.
//!
//! ```text
//! Idle -> Admitting -> (Polling ->)* Starting -> Streaming -> Finishing -> Draining -> Idle
//!                                                                             \-> Admitting
//! ```
//!
//! Every admission opens a new run generation. Completions tagged with an
//! older generation, or arriving in a phase that does not expect them, are
//! ignored.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::config::ControlConfig;
use crate::error::Result;
use crate::queue::{QueueAdmission, QueueId};
use crate::stream::StreamOutcome;
use crate::telemetry::ResultsBundle;

/// One inbound request to run an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentRequest {
    pub experiment_id: String,
    pub requester_id: String,
}

impl ExperimentRequest {
    pub fn new(experiment_id: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            requester_id: requester_id.into(),
        }
    }
}

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Admitting,
    Polling,
    Starting,
    Streaming,
    Finishing,
    Draining,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Admitting => write!(f, "admitting"),
            Self::Polling => write!(f, "polling"),
            Self::Starting => write!(f, "starting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Finishing => write!(f, "finishing"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// Result of an operation the machine asked for.
#[derive(Debug)]
pub enum Completion {
    Admitted(Result<QueueAdmission>),
    /// `Ok(true)` when the ticket is first in line.
    Polled(Result<bool>),
    Started(Result<()>),
    StreamEnded(StreamOutcome),
    Removed(Result<()>),
    ResultsSubmitted(Result<()>),
}

impl Completion {
    fn expected_phase(&self) -> Phase {
        match self {
            Self::Admitted(_) => Phase::Admitting,
            Self::Polled(_) => Phase::Polling,
            Self::Started(_) => Phase::Starting,
            Self::StreamEnded(_) => Phase::Streaming,
            Self::Removed(_) | Self::ResultsSubmitted(_) => Phase::Finishing,
        }
    }
}

/// Operation the driver must perform next.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Admit {
        experiment_id: String,
    },
    Poll {
        queue_id: QueueId,
        after: Duration,
    },
    Start {
        queue_id: QueueId,
    },
    Stream {
        trials: usize,
    },
    Remove {
        queue_id: QueueId,
    },
    Submit {
        experiment_id: String,
        requester_id: String,
        bundle: ResultsBundle,
    },
}

/// Snapshot of the controller for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub phase: Phase,
    pub generation: u64,
    /// Unique id of the current or most recent run, for log correlation.
    pub run_id: Option<String>,
    pub queue_id: Option<String>,
    pub experiment_id: Option<String>,
    pub pending: usize,
}

/// Tunables the machine needs from [`ControlConfig`].
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: Option<u32>,
    pub trials: usize,
    pub release_ticket_on_start_failure: bool,
}

impl From<&ControlConfig> for MachineSettings {
    fn from(config: &ControlConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            max_poll_attempts: config.max_poll_attempts,
            trials: config.trial_count(),
            release_ticket_on_start_failure: config.release_ticket_on_start_failure,
        }
    }
}

/// The controller's single source of truth.
#[derive(Debug)]
pub struct Machine {
    settings: MachineSettings,
    phase: Phase,
    generation: u64,
    run_id: Option<Uuid>,
    ticket: Option<QueueId>,
    current: Option<ExperimentRequest>,
    /// LIFO: the most recent follow-up is served next.
    pending: Vec<ExperimentRequest>,
    sealed: Option<ResultsBundle>,
    polls: u32,
}

impl Machine {
    pub fn new(settings: MachineSettings) -> Self {
        Self {
            settings,
            phase: Phase::Idle,
            generation: 0,
            run_id: None,
            ticket: None,
            current: None,
            pending: Vec::new(),
            sealed: None,
            polls: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Generation of the run currently in flight.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ticket(&self) -> Option<&QueueId> {
        self.ticket.as_ref()
    }

    pub fn current(&self) -> Option<&ExperimentRequest> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> &[ExperimentRequest] {
        &self.pending
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            phase: self.phase,
            generation: self.generation,
            run_id: self.run_id.map(|id| id.to_string()),
            queue_id: self.ticket.as_ref().map(|q| q.to_string()),
            experiment_id: self.current.as_ref().map(|r| r.experiment_id.clone()),
            pending: self.pending.len(),
        }
    }

    fn enter(&mut self, next: Phase) {
        log::info!(
            "Run {} {} -> {next}{}",
            self.generation,
            self.phase,
            self.current
                .as_ref()
                .map(|r| format!(" (experiment {})", r.experiment_id))
                .unwrap_or_default()
        );
        self.phase = next;
    }

    /// An inbound request. Starts a run only when nothing is in flight and no
    /// ticket is held; otherwise the request waits on the pending stack.
    pub fn trigger(&mut self, request: ExperimentRequest) -> Option<Effect> {
        if request.experiment_id.trim().is_empty() {
            log::warn!("Dropping request without experiment id");
            return None;
        }
        if self.phase != Phase::Idle || self.ticket.is_some() {
            log::info!(
                "Busy ({}), queueing experiment {} as follow-up #{}",
                self.phase,
                request.experiment_id,
                self.pending.len() + 1
            );
            self.pending.push(request);
            return None;
        }
        Some(self.admit(request))
    }

    fn admit(&mut self, request: ExperimentRequest) -> Effect {
        self.generation += 1;
        let run_id = Uuid::new_v4();
        log::info!(
            "Run {} ({run_id}) for experiment {}",
            self.generation,
            request.experiment_id
        );
        self.run_id = Some(run_id);
        self.polls = 0;
        self.sealed = None;
        let experiment_id = request.experiment_id.clone();
        self.current = Some(request);
        self.enter(Phase::Admitting);
        Effect::Admit { experiment_id }
    }

    /// Feed back the result of an effect issued for run `generation`.
    pub fn complete(&mut self, generation: u64, completion: Completion) -> Option<Effect> {
        if generation != self.generation || completion.expected_phase() != self.phase {
            log::warn!(
                "Ignoring stale completion {:?} for run {generation} (current run {}, {})",
                completion.expected_phase(),
                self.generation,
                self.phase
            );
            return None;
        }

        match completion {
            Completion::Admitted(Ok(admission)) => {
                self.ticket = Some(admission.queue_id.clone());
                if admission.queue_length <= 1 {
                    self.enter(Phase::Starting);
                    Some(Effect::Start {
                        queue_id: admission.queue_id,
                    })
                } else {
                    log::info!(
                        "Waiting behind {} other slot(s)",
                        admission.queue_length - 1
                    );
                    self.enter(Phase::Polling);
                    Some(self.poll(admission.queue_id))
                }
            }
            Completion::Admitted(Err(e)) => {
                log::error!("Queue admission abandoned: {e}");
                self.drain()
            }
            Completion::Polled(Ok(true)) => {
                let queue_id = self.ticket.clone()?;
                self.enter(Phase::Starting);
                Some(Effect::Start { queue_id })
            }
            Completion::Polled(Ok(false)) => {
                self.polls += 1;
                let queue_id = self.ticket.clone()?;
                if let Some(max) = self.settings.max_poll_attempts
                    && self.polls >= max
                {
                    log::error!("Still not at the front after {max} polls, giving up");
                    return Some(self.release(queue_id));
                }
                Some(self.poll(queue_id))
            }
            Completion::Polled(Err(e)) => {
                log::error!("Queue polling failed: {e}");
                let queue_id = self.ticket.clone()?;
                Some(self.release(queue_id))
            }
            Completion::Started(Ok(())) => {
                self.enter(Phase::Streaming);
                Some(Effect::Stream {
                    trials: self.settings.trials,
                })
            }
            Completion::Started(Err(e)) => {
                log::error!("Experiment start refused: {e}");
                match self.ticket.clone() {
                    Some(queue_id) if self.settings.release_ticket_on_start_failure => {
                        Some(self.release(queue_id))
                    }
                    held => {
                        if let Some(queue_id) = held {
                            log::warn!(
                                "Queue slot {queue_id} is still held and must be released manually"
                            );
                        }
                        self.current = None;
                        self.enter(Phase::Idle);
                        None
                    }
                }
            }
            Completion::StreamEnded(outcome) => {
                let queue_id = self.ticket.clone()?;
                match outcome {
                    StreamOutcome::Completed(bundle) => {
                        log::info!("Collected {} trials", bundle.trials.len());
                        self.sealed = Some(bundle);
                    }
                    StreamOutcome::Failed(e) => {
                        log::error!("Run aborted, results discarded: {e}");
                        self.sealed = None;
                    }
                }
                self.enter(Phase::Finishing);
                Some(Effect::Remove { queue_id })
            }
            Completion::Removed(result) => {
                if let Err(e) = result {
                    log::warn!("Leaving the queue failed, clearing local slot anyway: {e}");
                }
                self.ticket = None;
                match (self.sealed.take(), self.current.clone()) {
                    (Some(bundle), Some(request)) => Some(Effect::Submit {
                        experiment_id: request.experiment_id,
                        requester_id: request.requester_id,
                        bundle,
                    }),
                    _ => self.drain(),
                }
            }
            Completion::ResultsSubmitted(result) => {
                match result {
                    Ok(()) => log::info!("Results submitted"),
                    Err(e) => log::error!("Result submission failed: {e}"),
                }
                self.drain()
            }
        }
    }

    fn poll(&self, queue_id: QueueId) -> Effect {
        Effect::Poll {
            queue_id,
            after: self.settings.poll_interval,
        }
    }

    /// Abandon the run while holding a slot: leave the queue, submit nothing.
    fn release(&mut self, queue_id: QueueId) -> Effect {
        self.sealed = None;
        self.enter(Phase::Finishing);
        Effect::Remove { queue_id }
    }

    fn drain(&mut self) -> Option<Effect> {
        self.enter(Phase::Draining);
        self.current = None;
        match self.pending.pop() {
            Some(next) => Some(self.admit(next)),
            None => {
                self.enter(Phase::Idle);
                None
            }
        }
    }

    /// Stop the machine. Returns the held slot, if any, so it can be released.
    pub fn shutdown(&mut self) -> Option<QueueId> {
        self.pending.clear();
        self.sealed = None;
        self.current = None;
        self.generation += 1;
        self.phase = Phase::Idle;
        self.ticket.take()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
