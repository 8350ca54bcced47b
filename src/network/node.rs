use tokio::sync::mpsc::UnboundedSender;

use crate::consensus::message::{Envelope, ParticipantId};

/// Mailbox handle of a single participant.
#[derive(Debug, Clone)]
pub struct Address {
    pub id: ParticipantId,
    pub tx: UnboundedSender<Envelope>,
}

impl Address {
    pub fn new(id: ParticipantId, tx: UnboundedSender<Envelope>) -> Self {
        Address { id, tx }
    }

    /// Returns false when the participant's task has stopped.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}
