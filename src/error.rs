use thiserror::Error;

use crate::consensus::message::ParticipantId;

/// Failures of the hosting infrastructure. Protocol faults (aborts, stale
/// decides, crashes, stalls) are states of a participant, never errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("participant {0} is not in the membership view")]
    UnknownParticipant(ParticipantId),

    #[error("mailbox of participant {0} is closed")]
    MailboxClosed(ParticipantId),

    #[error("every participant is crash-prone, no leader can be elected")]
    NoLeaderCandidate,
}

pub type Result<T> = std::result::Result<T, Error>;
