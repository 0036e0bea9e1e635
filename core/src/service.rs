//! Service lifecycle substrate
//!
//! Every pipeline component (scheduler, workers, record processors,
//! aggregator, dataset provider) runs as a service task. The
//! [`ServiceHarness`] gives each one the shared lifecycle behavior: the
//! configure/start command handshake with the controller, periodic
//! heartbeat publication, cooperative shutdown via `CancellationToken`,
//! and failure propagation onto the bus.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Command, CommandAck, CommandEnvelope, Event, MessageBus};
use crate::error::{Error, ErrorDetails, ErrorKind, Result};

/// How often services report liveness
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive missed heartbeats before the controller aborts the run
pub const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// Service categories in the run topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Credit scheduler
    Scheduler,
    /// Worker pool member
    Worker,
    /// Record processor pool member
    RecordProcessor,
    /// Centralised aggregator
    Aggregator,
    /// Dataset provider
    Dataset,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Scheduler => write!(f, "scheduler"),
            ServiceKind::Worker => write!(f, "worker"),
            ServiceKind::RecordProcessor => write!(f, "record-processor"),
            ServiceKind::Aggregator => write!(f, "aggregator"),
            ServiceKind::Dataset => write!(f, "dataset"),
        }
    }
}

/// Identifies one service instance, e.g. `worker-3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    /// Service category
    pub kind: ServiceKind,
    /// Instance index within the category
    pub index: usize,
}

impl ServiceId {
    /// Create a service id
    pub fn new(kind: ServiceKind, index: usize) -> Self {
        Self { kind, index }
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.kind, self.index)
    }
}

/// Lifecycle state reported in heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Constructed but not yet configured
    Created,
    /// Configured, waiting for start
    Initialized,
    /// Processing work
    Running,
    /// Finished cleanly
    Stopped,
    /// Hit an unrecoverable error
    Failed,
}

/// Per-service lifecycle helper
pub struct ServiceHarness {
    id: ServiceId,
    bus: Arc<MessageBus>,
    commands: broadcast::Receiver<CommandEnvelope>,
    acks: tokio::sync::mpsc::Sender<CommandAck>,
    shutdown: CancellationToken,
}

impl ServiceHarness {
    /// Create a harness bound to the bus and the run's shutdown token
    pub fn new(id: ServiceId, bus: &Arc<MessageBus>, shutdown: CancellationToken) -> Self {
        Self {
            id,
            bus: Arc::clone(bus),
            commands: bus.command_receiver(),
            acks: bus.ack_sender(),
            shutdown,
        }
    }

    /// This service's id
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// The run's shutdown token
    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for the given command and acknowledge it.
    ///
    /// Returns `false` when shutdown was requested before the command
    /// arrived; the service should exit cleanly in that case.
    pub async fn await_command(&mut self, expected: Command) -> Result<bool> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(false),
                envelope = self.commands.recv() => match envelope {
                    Ok(envelope) if envelope.command == expected => {
                        self.acks
                            .send(CommandAck {
                                command_id: envelope.command_id,
                                service: self.id,
                            })
                            .await
                            .map_err(|_| Error::ChannelClosed("command acks"))?;
                        return Ok(true);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(service = %self.id, skipped, "command channel lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::ChannelClosed("commands"));
                    }
                },
            }
        }
    }

    /// Perform the standard configure/start handshake.
    ///
    /// Returns `false` when the run shut down before starting.
    pub async fn startup_handshake(&mut self) -> Result<bool> {
        if !self.await_command(Command::Configure).await? {
            return Ok(false);
        }
        self.publish_state(ServiceState::Initialized);
        if !self.await_command(Command::Start).await? {
            return Ok(false);
        }
        self.publish_state(ServiceState::Running);
        Ok(true)
    }

    /// Publish a heartbeat with the given state
    pub fn publish_state(&self, state: ServiceState) {
        self.bus.publish(Event::Heartbeat {
            service: self.id,
            state,
        });
    }

    /// Spawn the periodic heartbeat task; it stops on shutdown.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let id = self.id;
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        bus.publish(Event::Heartbeat {
                            service: id,
                            state: ServiceState::Running,
                        });
                    }
                }
            }
        })
    }

    /// Report an unrecoverable failure to the controller
    pub fn publish_failure(&self, error: &Error) {
        tracing::error!(service = %self.id, error = %error, "service failed");
        self.bus.publish(Event::ServiceFailed {
            service: self.id,
            error: ErrorDetails::new(ErrorKind::FatalInternalError, error.to_string()),
        });
    }
}

/// Tracks the spawned service tasks of a run
#[derive(Default)]
pub struct ServiceSet {
    handles: Vec<(ServiceId, JoinHandle<Result<()>>)>,
}

impl ServiceSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a service future and track it
    pub fn spawn<F>(&mut self, id: ServiceId, future: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.handles.push((id, tokio::spawn(future)));
    }

    /// Number of tracked services
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Service ids in spawn order
    pub fn ids(&self) -> Vec<ServiceId> {
        self.handles.iter().map(|(id, _)| *id).collect()
    }

    /// Wait for every service to finish, collecting failures.
    ///
    /// A panicked task is reported as an internal error rather than
    /// propagating the panic.
    pub async fn join_all(self) -> Vec<(ServiceId, Result<()>)> {
        let mut results = Vec::with_capacity(self.handles.len());
        for (id, handle) in self.handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(Error::Internal(format!(
                    "service {id} panicked: {join_error}"
                ))),
            };
            results.push((id, result));
        }
        results
    }

    /// Abort every tracked task
    pub fn abort_all(&self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}
