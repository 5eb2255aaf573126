//! Asynchronous notification delivery
//!
//! Notify pushes are submitted from the controller task and executed off it:
//! the dispatcher worker spawns one task per job, so a slow peer never stalls
//! connection handling or other notifications. Delivery order across jobs is
//! unspecified.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::DispatchError;
use crate::gatt::Uuid16;
use crate::peers::{ConnectedPeers, PeerId};
use crate::transport::Notifier;

// ----------------------------------------------------------------------------
// Jobs and Tickets
// ----------------------------------------------------------------------------

/// A single notification to push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyJob {
    pub peer: PeerId,
    pub characteristic: Uuid16,
    pub payload: Vec<u8>,
}

/// Completion signal for a submitted job
#[derive(Debug)]
pub struct NotifyTicket {
    outcome: oneshot::Receiver<Result<(), DispatchError>>,
}

impl NotifyTicket {
    /// Wait for the delivery outcome
    pub async fn outcome(self) -> Result<(), DispatchError> {
        self.outcome.await.map_err(|_| DispatchError::Closed)?
    }
}

struct Envelope {
    job: NotifyJob,
    ack: oneshot::Sender<Result<(), DispatchError>>,
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Executes notify jobs concurrently
pub struct NotificationDispatcher {
    sender: mpsc::UnboundedSender<Envelope>,
    worker: JoinHandle<()>,
}

impl NotificationDispatcher {
    /// Start the dispatcher worker. Must be called within a tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, peers: ConnectedPeers) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(receiver, notifier, peers));
        Self { sender, worker }
    }

    /// Queue a job. Returns immediately.
    pub fn submit(&self, job: NotifyJob) -> Result<NotifyTicket, DispatchError> {
        let (ack, outcome) = oneshot::channel();
        self.sender
            .send(Envelope { job, ack })
            .map_err(|_| DispatchError::Closed)?;
        Ok(NotifyTicket { outcome })
    }

    /// Stop accepting jobs and wait for the worker to exit.
    ///
    /// Jobs already spawned keep running to completion.
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.worker.await;
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Envelope>,
    notifier: Arc<dyn Notifier>,
    peers: ConnectedPeers,
) {
    info!("Notification dispatcher started");

    while let Some(envelope) = receiver.recv().await {
        let notifier = notifier.clone();
        let peers = peers.clone();
        tokio::spawn(async move {
            let Envelope { job, ack } = envelope;
            let outcome = deliver(notifier.as_ref(), &peers, &job).await;
            if let Err(e) = &outcome {
                warn!(
                    "Notify {} to {} failed: {}",
                    job.characteristic, job.peer, e
                );
            }
            // The submitter may have dropped its ticket
            let _ = ack.send(outcome);
        });
    }

    info!("Notification dispatcher stopped");
}

async fn deliver(
    notifier: &dyn Notifier,
    peers: &ConnectedPeers,
    job: &NotifyJob,
) -> Result<(), DispatchError> {
    let handle = peers
        .handle(&job.peer)
        .await
        .ok_or_else(|| DispatchError::PeerNotConnected(job.peer.clone()))?;

    notifier
        .notify(&job.peer, handle, job.characteristic, &job.payload)
        .await?;

    debug!(
        "Notified {} on {}: {}",
        job.peer,
        job.characteristic,
        hex::encode(&job.payload)
    );
    Ok(())
}
