use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{Result, TabulaError};
use crate::ingest::JobTicket;

/// In-process job queue. Durability comes from the registry, not the
/// channel: pending version rows are re-enqueued on open, which gives
/// at-least-once delivery across restarts.
pub struct JobQueue {
    tx: Sender<JobTicket>,
    rx: Receiver<JobTicket>,
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> Sender<JobTicket> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<JobTicket> {
        self.rx.clone()
    }

    pub fn enqueue(&self, ticket: JobTicket) -> Result<()> {
        self.tx
            .send(ticket)
            .map_err(|_| TabulaError::ChannelClosed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
