use std::fmt;

use super::peers::Peers;

/*
    Every participant runs the same two-phase protocol for each ballot it
    owns. In the read phase the proposer sends read(b) and collects
    gather(b, imposeBallot, estimate) from a majority, adopting the estimate
    with the highest impose ballot if any exists. In the impose phase it
    sends impose(b, v) and waits for a majority of ack(b). Any acceptor that
    has already promised a higher ballot answers abort(b) instead. Once a
    majority acks, the value is decided and flooded with decide(v, origin, b).
*/

pub type Ballot = i64;

pub type ParticipantId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Value(pub u64);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Message {
    // Protocol traffic between participants
    ReadRequest { ballot: Ballot },
    Gather { ballot: Ballot, impose_ballot: Ballot, estimate: Option<Value> },
    ImposeRequest { ballot: Ballot, value: Value },
    Ack { ballot: Ballot },
    Abort { ballot: Ballot },
    Decide { value: Value, origin: ParticipantId, ballot: Ballot },
    Hold,

    // Control signals from the driver
    Membership(Peers),
    Launch,
    CrashSignal,
    LeaderElected { leader: ParticipantId },
    Restart,
    Reset,
}

impl Message {
    /// Restart and Reset bypass crash handling entirely.
    pub fn is_reset(&self) -> bool {
        matches!(self, Message::Restart | Message::Reset)
    }
}

/// A message together with its sender. Driver signals carry no sender.
/// Peer messages are stamped with the sender's run number; a participant
/// drops peer traffic from any run other than its own.
#[derive(Clone, PartialEq, Debug)]
pub struct Envelope {
    pub from: Option<ParticipantId>,
    pub run: u64,
    pub message: Message,
}

impl Envelope {
    pub fn from_peer(from: ParticipantId, message: Message) -> Self {
        Envelope { from: Some(from), run: 0, message }
    }

    pub fn control(message: Message) -> Self {
        Envelope { from: None, run: 0, message }
    }

    pub fn in_run(mut self, run: u64) -> Self {
        self.run = run;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_messages() {
        assert!(Message::Restart.is_reset());
        assert!(Message::Reset.is_reset());
        assert!(!Message::Launch.is_reset());
        assert!(!Message::Abort { ballot: 3 }.is_reset());
    }

    #[test]
    fn test_envelope_sender() {
        let envelope = Envelope::from_peer(2, Message::Ack { ballot: 5 });
        assert_eq!(envelope.from, Some(2));

        let envelope = Envelope::control(Message::Launch);
        assert_eq!(envelope.from, None);

        let envelope = Envelope::from_peer(3, Message::Hold).in_run(4);
        assert_eq!(envelope.run, 4);
    }
}
