use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::common::rng::Seed;
use super::{
    message::{Ballot, Envelope, Message, ParticipantId, Value},
    peers::majority,
};

/// Outputs of the state machine. The processor turns these into channel
/// sends and monitor updates; the state machine itself performs no I/O.
#[derive(Clone, PartialEq, Debug)]
pub enum Action {
    /// Reply to a single participant.
    Send { to: ParticipantId, message: Message },
    /// Send to every participant except self.
    Broadcast { message: Message },
    /// This participant has just entered `Phase::Decided`.
    Decided { value: Value },
    /// A majority acknowledged this participant's impose.
    ReportDelay,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Idle,
    Gathering,
    Imposing,
    Decided,
}

/// Per-participant protocol state.
pub struct ParticipantState {
    id: ParticipantId,
    n: usize,
    crash_probability: f64,
    seed: Seed,
    rng: ChaCha8Rng,
    run: u64,

    phase: Phase,
    ballot: Ballot,
    read_ballot: Ballot,
    impose_ballot: Ballot,
    estimate: Option<Value>,
    proposal: Option<Value>,
    msg_ballot: Ballot,
    states: HashMap<ParticipantId, (Ballot, Option<Value>)>,
    ack_responses: HashMap<ParticipantId, Ballot>,
    hold: bool,
    decided: bool,
    fault_prone: bool,
    silent: bool,
}

impl ParticipantState {
    pub fn new(id: ParticipantId, n: usize, crash_probability: f64, seed: Seed) -> Self {
        let initial = id as Ballot - n as Ballot;
        ParticipantState {
            id,
            n,
            crash_probability: crash_probability.clamp(0.0, 1.0),
            seed,
            rng: ChaCha8Rng::from_seed(seed),
            run: 0,
            phase: Phase::Idle,
            ballot: initial,
            read_ballot: 0,
            impose_ballot: initial,
            estimate: None,
            proposal: None,
            msg_ballot: 0,
            states: HashMap::new(),
            ack_responses: HashMap::new(),
            hold: false,
            decided: false,
            fault_prone: false,
            silent: false,
        }
    }

    pub fn handle(&mut self, envelope: Envelope) -> Vec<Action> {
        let Envelope { from, run, message } = envelope;
        let mut actions = Vec::new();

        if from.is_some() && run != self.run {
            debug!(id = self.id, run, current = self.run, "Dropping message from another run");
            return actions;
        }

        if !message.is_reset() {
            if self.silent {
                return actions;
            }
            if self.fault_prone && self.rng.gen_bool(self.crash_probability) {
                self.silent = true;
                info!(id = self.id, "Participant crashed");
                return actions;
            }
        }

        match message {
            Message::Launch => {
                if !self.decided {
                    let value = self.choose_value();
                    self.propose(value, &mut actions);
                }
            }
            Message::ReadRequest { ballot } => {
                if let Some(sender) = self.sender(from, "read") {
                    self.handle_read(sender, ballot, &mut actions);
                }
            }
            Message::Gather { ballot, impose_ballot, estimate } => {
                if let Some(sender) = self.sender(from, "gather") {
                    self.handle_gather(sender, ballot, impose_ballot, estimate, &mut actions);
                }
            }
            Message::ImposeRequest { ballot, value } => {
                if let Some(sender) = self.sender(from, "impose") {
                    self.handle_impose(sender, ballot, value, &mut actions);
                }
            }
            Message::Ack { ballot } => {
                if let Some(sender) = self.sender(from, "ack") {
                    self.handle_ack(sender, ballot, &mut actions);
                }
            }
            Message::Abort { ballot } => self.handle_abort(ballot, &mut actions),
            Message::Decide { value, origin, ballot } => {
                self.handle_decide(value, origin, ballot, &mut actions)
            }
            Message::LeaderElected { leader } => self.handle_leader_elected(leader, &mut actions),
            Message::Hold => {
                debug!(id = self.id, "Holding, only the leader proposes");
                self.hold = true;
            }
            Message::CrashSignal => {
                debug!(id = self.id, "Armed crash trials");
                self.fault_prone = true;
            }
            Message::Membership(_) => {
                // Addresses are the processor's concern.
            }
            Message::Restart | Message::Reset => self.reset(),
        }

        actions
    }

    fn sender(&self, from: Option<ParticipantId>, kind: &str) -> Option<ParticipantId> {
        if from.is_none() {
            warn!(id = self.id, kind, "Dropping protocol message without sender");
        }
        from
    }

    fn choose_value(&mut self) -> Value {
        Value(self.rng.gen_range(0..2))
    }

    /// True when no higher read or impose has been promised.
    fn accepts(&self, ballot: Ballot) -> bool {
        self.read_ballot <= ballot && self.impose_ballot <= ballot
    }

    fn propose(&mut self, value: Value, actions: &mut Vec<Action>) {
        if self.decided || self.hold {
            return;
        }

        self.proposal = Some(value);
        self.ballot += self.n as Ballot;
        // Skip ballots this participant has already promised away locally.
        while !self.accepts(self.ballot) {
            self.ballot += self.n as Ballot;
        }

        self.states.clear();
        self.ack_responses.clear();
        self.read_ballot = self.ballot;
        self.states.insert(self.id, (self.impose_ballot, self.estimate));
        self.phase = Phase::Gathering;

        info!(id = self.id, ballot = self.ballot, value = %value, "Proposing");
        actions.push(Action::Broadcast {
            message: Message::ReadRequest { ballot: self.ballot },
        });

        self.try_impose(actions);
    }

    fn handle_read(&mut self, sender: ParticipantId, ballot: Ballot, actions: &mut Vec<Action>) {
        if !self.accepts(ballot) {
            debug!(id = self.id, sender, ballot, "Aborting stale read");
            actions.push(Action::Send { to: sender, message: Message::Abort { ballot } });
            return;
        }

        self.read_ballot = ballot;
        actions.push(Action::Send {
            to: sender,
            message: Message::Gather {
                ballot,
                impose_ballot: self.impose_ballot,
                estimate: self.estimate,
            },
        });
    }

    fn handle_gather(
        &mut self,
        sender: ParticipantId,
        ballot: Ballot,
        impose_ballot: Ballot,
        estimate: Option<Value>,
        actions: &mut Vec<Action>,
    ) {
        if self.phase != Phase::Gathering || ballot != self.ballot || self.impose_ballot == self.ballot {
            return;
        }

        self.states.insert(sender, (impose_ballot, estimate));
        self.try_impose(actions);
    }

    fn try_impose(&mut self, actions: &mut Vec<Action>) {
        if self.states.len() < majority(self.n) {
            return;
        }

        // Carry forward the estimate stored against the highest impose ballot.
        if let Some((highest, Some(value))) = self.states.values().max_by_key(|(b, _)| *b).copied() {
            if highest > 0 {
                self.proposal = Some(value);
            }
        }

        let Some(value) = self.proposal else {
            return;
        };

        if !self.accepts(self.ballot) {
            debug!(id = self.id, ballot = self.ballot, "Own round superseded before impose");
            self.abort_round(actions);
            return;
        }

        self.impose_ballot = self.ballot;
        self.estimate = Some(value);
        self.ack_responses.clear();
        self.ack_responses.insert(self.id, self.ballot);
        self.phase = Phase::Imposing;

        debug!(id = self.id, ballot = self.ballot, value = %value, "Imposing");
        actions.push(Action::Broadcast {
            message: Message::ImposeRequest { ballot: self.ballot, value },
        });

        self.try_decide(actions);
    }

    fn handle_impose(
        &mut self,
        sender: ParticipantId,
        ballot: Ballot,
        value: Value,
        actions: &mut Vec<Action>,
    ) {
        if !self.accepts(ballot) {
            debug!(id = self.id, sender, ballot, "Aborting stale impose");
            actions.push(Action::Send { to: sender, message: Message::Abort { ballot } });
            return;
        }

        if !self.decided {
            self.estimate = Some(value);
        }
        self.impose_ballot = ballot;
        actions.push(Action::Send { to: sender, message: Message::Ack { ballot } });
    }

    fn handle_ack(&mut self, sender: ParticipantId, ballot: Ballot, actions: &mut Vec<Action>) {
        if self.decided || self.phase != Phase::Imposing || ballot != self.ballot {
            return;
        }

        self.ack_responses.insert(sender, ballot);
        self.try_decide(actions);
    }

    fn try_decide(&mut self, actions: &mut Vec<Action>) {
        if self.ack_responses.len() < majority(self.n) {
            return;
        }
        let Some(value) = self.proposal else {
            return;
        };

        self.decided = true;
        self.phase = Phase::Decided;
        self.estimate = Some(value);
        self.msg_ballot = self.msg_ballot.max(self.ballot);

        info!(id = self.id, ballot = self.ballot, value = %value, "Decided by majority");
        actions.push(Action::ReportDelay);
        actions.push(Action::Broadcast {
            message: Message::Decide { value, origin: self.id, ballot: self.ballot },
        });
        actions.push(Action::Decided { value });
    }

    fn handle_abort(&mut self, ballot: Ballot, actions: &mut Vec<Action>) {
        if ballot != self.ballot || self.decided {
            return;
        }
        debug!(id = self.id, ballot, "Round aborted");
        self.abort_round(actions);
    }

    fn abort_round(&mut self, actions: &mut Vec<Action>) {
        self.states.clear();
        self.ack_responses.clear();
        self.phase = Phase::Idle;

        if !self.hold {
            if let Some(value) = self.proposal {
                self.propose(value, actions);
            }
        }
    }

    fn handle_decide(
        &mut self,
        value: Value,
        origin: ParticipantId,
        ballot: Ballot,
        actions: &mut Vec<Action>,
    ) {
        if ballot <= self.msg_ballot {
            return;
        }

        if !self.decided {
            self.estimate = Some(value);
        } else if self.estimate != Some(value) {
            warn!(id = self.id, origin, ballot, value = %value, "Conflicting decide");
        }
        self.msg_ballot = ballot;

        actions.push(Action::Broadcast {
            message: Message::Decide { value, origin, ballot },
        });

        if !self.decided {
            self.decided = true;
            self.phase = Phase::Decided;
            info!(id = self.id, origin, ballot, value = %value, "Decided by relay");
            actions.push(Action::Decided { value });
        }
    }

    fn handle_leader_elected(&mut self, leader: ParticipantId, actions: &mut Vec<Action>) {
        if self.decided || leader != self.id {
            return;
        }

        info!(id = self.id, "Elected leader");
        self.hold = false;
        actions.push(Action::Broadcast { message: Message::Hold });

        let value = match self.proposal {
            Some(value) => value,
            None => self.choose_value(),
        };
        self.propose(value, actions);
    }

    /// Returns to the run-start baseline and moves on to the next run.
    pub fn reset(&mut self) {
        let run = self.run + 1;
        *self = ParticipantState::new(self.id, self.n, self.crash_probability, self.seed);
        self.run = run;
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn read_ballot(&self) -> Ballot {
        self.read_ballot
    }

    pub fn impose_ballot(&self) -> Ballot {
        self.impose_ballot
    }

    pub fn msg_ballot(&self) -> Ballot {
        self.msg_ballot
    }

    pub fn estimate(&self) -> Option<Value> {
        self.estimate
    }

    pub fn proposal(&self) -> Option<Value> {
        self.proposal
    }

    pub fn decision(&self) -> Option<Value> {
        if self.decided {
            self.estimate
        } else {
            None
        }
    }

    pub fn is_decided(&self) -> bool {
        self.decided
    }

    pub fn is_held(&self) -> bool {
        self.hold
    }

    pub fn is_fault_prone(&self) -> bool {
        self.fault_prone
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    #[cfg(test)]
    pub(crate) fn silence(&mut self) {
        self.silent = true;
    }
}
