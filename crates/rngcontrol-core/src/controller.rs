//! Experiment controller: runs the [`Machine`] on a single task.
//!
//! The controller task is the only mutator of run state. Inbound triggers
//! arrive over a channel, each [`Effect`] runs as one spawned operation, and
//! its [`Completion`] comes back to the same loop tagged with the run
//! generation that requested it. At most one operation is in flight.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::ControlConfig;
use crate::error::Result;
use crate::machine::{
    Completion, ControllerStatus, Effect, ExperimentRequest, Machine, MachineSettings, Phase,
};
use crate::queue::{QueueClient, SchedulingService};
use crate::session::{Authenticator, SessionManager};
use crate::stream::{RandomnessSource, StreamClient};

/// The collaborators the controller drives.
#[derive(Clone)]
pub struct Services {
    pub queue: Arc<dyn SchedulingService>,
    pub auth: Arc<dyn Authenticator>,
    pub source: Arc<dyn RandomnessSource>,
}

impl Services {
    /// HTTP + WebSocket clients sharing one authenticated session.
    pub fn connect(config: Arc<ControlConfig>) -> Result<Self> {
        let session = Arc::new(SessionManager::new(Arc::clone(&config))?);
        Ok(Self {
            queue: Arc::new(QueueClient::new(Arc::clone(&session))),
            auth: session,
            source: Arc::new(StreamClient::new(&config)),
        })
    }
}

enum Command {
    Trigger(ExperimentRequest),
    Shutdown,
}

/// Cloneable handle for submitting requests and observing progress.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ControllerStatus>,
}

impl ControllerHandle {
    /// Hand a request to the controller. Returns immediately; `false` if the
    /// controller has stopped.
    pub fn trigger(&self, request: ExperimentRequest) -> bool {
        self.commands.send(Command::Trigger(request)).is_ok()
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Wait until the controller is idle again after run `generation` started.
    pub async fn wait_idle_after(&self, generation: u64) {
        let mut rx = self.subscribe();
        let _ = rx
            .wait_for(|s| s.phase == Phase::Idle && s.generation > generation)
            .await;
    }
}

/// Owner of the controller task.
pub struct Controller {
    handle: ControllerHandle,
    task: JoinHandle<()>,
}

impl Controller {
    /// Start the controller loop on the current tokio runtime.
    pub fn spawn(settings: MachineSettings, services: Services) -> Self {
        let machine = Machine::new(settings);
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(machine.status());
        let worker = Worker {
            machine,
            services,
            commands: rx,
            inflight: JoinSet::new(),
            status: status_tx,
        };
        Self {
            handle: ControllerHandle { commands, status },
            task: tokio::spawn(worker.run()),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    /// Stop the loop, abort in-flight work, and release a held queue slot.
    pub async fn shutdown(self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            log::error!("Controller task ended abnormally: {e}");
        }
    }
}

struct Worker {
    machine: Machine,
    services: Services,
    commands: mpsc::UnboundedReceiver<Command>,
    inflight: JoinSet<(u64, Completion)>,
    status: watch::Sender<ControllerStatus>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Trigger(request)) => {
                        let effect = self.machine.trigger(request);
                        self.dispatch(effect);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(joined) = self.inflight.join_next() => match joined {
                    Ok((generation, completion)) => {
                        let effect = self.machine.complete(generation, completion);
                        self.dispatch(effect);
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => log::error!("Controller operation panicked: {e}"),
                },
            }
            self.status.send_replace(self.machine.status());
        }

        log::info!("Controller shutting down");
        self.inflight.shutdown().await;
        if let Some(queue_id) = self.machine.shutdown() {
            log::info!("Releasing queue slot {queue_id}");
            if let Err(e) = self.services.queue.remove(&queue_id).await {
                log::warn!("Could not release queue slot {queue_id}: {e}");
            }
        }
        self.status.send_replace(self.machine.status());
    }

    fn dispatch(&mut self, effect: Option<Effect>) {
        let Some(effect) = effect else {
            return;
        };
        let generation = self.machine.generation();
        let services = self.services.clone();
        self.inflight
            .spawn(async move { (generation, execute(&services, effect).await) });
    }
}

async fn execute(services: &Services, effect: Effect) -> Completion {
    match effect {
        Effect::Admit { experiment_id } => {
            Completion::Admitted(admit(services, &experiment_id).await)
        }
        Effect::Poll { queue_id, after } => {
            tokio::time::sleep(after).await;
            let result = services.queue.poll_position(&queue_id).await;
            Completion::Polled(relogin_on_auth(services, result).await)
        }
        Effect::Start { queue_id } => {
            let result = services.queue.start(&queue_id).await;
            Completion::Started(relogin_on_auth(services, result).await)
        }
        Effect::Stream { trials } => Completion::StreamEnded(services.source.collect(trials).await),
        Effect::Remove { queue_id } => {
            let result = services.queue.remove(&queue_id).await;
            Completion::Removed(relogin_on_auth(services, result).await)
        }
        Effect::Submit {
            experiment_id,
            requester_id,
            bundle,
        } => {
            let result = services
                .queue
                .submit_results(&experiment_id, &bundle, &requester_id)
                .await;
            Completion::ResultsSubmitted(relogin_on_auth(services, result).await)
        }
    }
}

/// Admission is the one call retried after re-authenticating, exactly once.
async fn admit(services: &Services, experiment_id: &str) -> Result<crate::queue::QueueAdmission> {
    match services.queue.add(experiment_id).await {
        Err(e) if e.is_auth() => {
            log::warn!("Admission rejected as unauthenticated ({e}), logging in again");
            if let Err(login_err) = services.auth.login().await {
                log::error!("Re-login failed, abandoning admission: {login_err}");
                return Err(login_err);
            }
            services.queue.add(experiment_id).await
        }
        other => other,
    }
}

/// Refresh the session after an auth failure, but report the original
/// failure: everywhere except admission the operation is abandoned.
async fn relogin_on_auth<T>(services: &Services, result: Result<T>) -> Result<T> {
    if let Err(e) = &result
        && e.is_auth()
    {
        log::warn!("Session rejected ({e}), logging in again");
        if let Err(login_err) = services.auth.login().await {
            log::error!("Re-login failed: {login_err}");
        }
    }
    result
}
