// ── Command API ──
//
// User intents flow through a unified `Command` enum and a bounded
// mpsc channel to the lifecycle manager's command processor. Results
// are observed through state changes; `execute` additionally waits for
// the processor's verdict.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};

use crate::error::CoreError;
use crate::model::{GroupId, ServiceId};

pub(crate) const COMMAND_CHANNEL_SIZE: usize = 64;

/// All user intents accepted by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enable { id: ServiceId },
    Disable { id: ServiceId },
    RemoveGroup { id: GroupId },
}

/// A command envelope sent through the command channel, with an
/// optional reply slot.
pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub response_tx: Option<oneshot::Sender<Result<(), CoreError>>>,
}

/// The enable / disable surface a view is constructed with.
///
/// Implemented by the lifecycle manager itself and by [`CommandHandle`],
/// and trivially by test doubles.
pub trait ServiceControl: Send + Sync {
    fn enable(&self, id: &ServiceId) -> impl Future<Output = Result<(), CoreError>> + Send;
    fn disable(&self, id: &ServiceId) -> impl Future<Output = Result<(), CoreError>> + Send;
}

// ── CommandHandle ───────────────────────────────────────────────────

/// Cloneable sender side of the command channel.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl CommandHandle {
    pub(crate) fn new(tx: mpsc::Sender<CommandEnvelope>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget: queue a command without waiting for its outcome.
    ///
    /// Fails only if the processor has stopped.
    pub async fn send(&self, command: Command) -> Result<(), CoreError> {
        self.tx
            .send(CommandEnvelope {
                command,
                response_tx: None,
            })
            .await
            .map_err(|_| CoreError::ManagerShutDown)
    }

    /// Queue a command and wait for the processor to apply it.
    pub async fn execute(&self, command: Command) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CommandEnvelope {
                command,
                response_tx: Some(tx),
            })
            .await
            .map_err(|_| CoreError::ManagerShutDown)?;
        rx.await.map_err(|_| CoreError::ManagerShutDown)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ServiceControl for CommandHandle {
    async fn enable(&self, id: &ServiceId) -> Result<(), CoreError> {
        self.execute(Command::Enable { id: id.clone() }).await
    }

    async fn disable(&self, id: &ServiceId) -> Result<(), CoreError> {
        self.execute(Command::Disable { id: id.clone() }).await
    }
}
