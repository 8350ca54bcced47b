use std::sync::Arc;

use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};

use crate::{
    common::rng::{derive_seed, rng_for, Stream},
    network::{node::Address, NetworkConfig},
};
use super::{
    message::{Envelope, Message, ParticipantId},
    monitor::RunMonitor,
    peers::Peers,
    state::{Action, ParticipantState},
};

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub id: ParticipantId,
    pub n: usize,
    pub crash_probability: f64,
    pub seed: u64,
    pub network: NetworkConfig,
}

/// One participant task. Owns its protocol state exclusively; everything
/// else reaches it through its mailbox.
pub struct Participant {
    pub state: ParticipantState,
    pub peers: Option<Peers>,
    pub msg_rx: UnboundedReceiver<Envelope>,
    monitor: Arc<RunMonitor>,
    network: NetworkConfig,
    rng: ChaCha8Rng,
}

impl Participant {
    pub fn new(config: ParticipantConfig, msg_rx: UnboundedReceiver<Envelope>, monitor: Arc<RunMonitor>) -> Self {
        let state = ParticipantState::new(
            config.id,
            config.n,
            config.crash_probability,
            derive_seed(config.seed, Stream::Protocol, config.id),
        );
        Participant {
            state,
            peers: None,
            msg_rx,
            monitor,
            network: config.network,
            rng: rng_for(config.seed, Stream::Network, config.id),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.state.id()
    }

    /// Processes messages until every sender handle is dropped.
    pub async fn run(&mut self) {
        debug!(id = self.id(), "Running participant");
        while let Some(envelope) = self.msg_rx.recv().await {
            self.process(envelope);
        }
        debug!(id = self.id(), "Mailbox closed, participant stopped");
    }

    pub fn process(&mut self, envelope: Envelope) {
        trace!(id = self.id(), from = ?envelope.from, message = ?envelope.message, "Received");

        if let Message::Membership(peers) = envelope.message {
            debug!(id = self.id(), members = peers.len(), "Received membership view");
            self.peers = Some(peers);
            return;
        }

        for action in self.state.handle(envelope) {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Send { to, message } => {
                let Some(peers) = self.view() else { return };
                match peers.get(to).cloned() {
                    Some(address) => self.send(&address, message),
                    None => warn!(id = self.id(), to, "Reply to participant outside the view"),
                }
            }
            Action::Broadcast { message } => {
                let Some(peers) = self.view() else { return };
                let targets: Vec<Address> = peers.others(self.id()).cloned().collect();
                for address in &targets {
                    self.send(address, message.clone());
                }
            }
            Action::Decided { .. } => {
                self.monitor.record_decision();
            }
            Action::ReportDelay => {
                self.monitor.report_delay(self.id());
            }
        }
    }

    fn view(&self) -> Option<&Peers> {
        if self.peers.is_none() {
            warn!(id = self.id(), "No membership view yet, dropping outgoing message");
        }
        self.peers.as_ref()
    }

    fn send(&mut self, address: &Address, message: Message) {
        let envelope = Envelope::from_peer(self.id(), message).in_run(self.state.run());
        let delay = self.network.sample_delay(&mut self.rng);

        if delay.is_zero() {
            if !address.deliver(envelope) {
                debug!(id = self.id(), to = address.id, "Peer mailbox closed");
            }
            return;
        }

        let address = address.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !address.deliver(envelope) {
                debug!(to = address.id, "Peer mailbox closed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    use super::*;
    use crate::consensus::message::Value;

    fn config(id: ParticipantId, n: usize) -> ParticipantConfig {
        ParticipantConfig {
            id,
            n,
            crash_probability: 0.0,
            seed: 42,
            network: NetworkConfig::immediate(),
        }
    }

    #[tokio::test]
    async fn test_replies_to_sender_through_view() {
        let monitor = Arc::new(RunMonitor::new());
        let (incoming_tx, incoming_rx) = unbounded_channel();
        let (peer2_tx, mut peer2_rx) = unbounded_channel();
        let (peer3_tx, _peer3_rx) = unbounded_channel();

        let mut participant = Participant::new(config(1, 3), incoming_rx, monitor);
        let peers = Peers::new(vec![
            Address::new(1, incoming_tx.clone()),
            Address::new(2, peer2_tx),
            Address::new(3, peer3_tx),
        ]);

        incoming_tx.send(Envelope::control(Message::Membership(peers))).unwrap();
        incoming_tx.send(Envelope::from_peer(2, Message::ReadRequest { ballot: 2 })).unwrap();

        tokio::spawn(async move {
            participant.run().await;
        });

        let reply = peer2_rx.recv().await.unwrap();
        assert_eq!(reply.from, Some(1));
        assert_eq!(reply.message, Message::Gather { ballot: 2, impose_ballot: -2, estimate: None });
    }

    #[tokio::test]
    async fn test_launch_broadcasts_to_others_only() {
        let monitor = Arc::new(RunMonitor::new());
        let (self_tx, self_rx) = unbounded_channel();
        let (peer_tx, mut peer_rx) = unbounded_channel();

        let mut participant = Participant::new(config(1, 2), self_rx, monitor);
        participant.process(Envelope::control(Message::Membership(Peers::new(vec![
            Address::new(1, self_tx.clone()),
            Address::new(2, peer_tx),
        ]))));
        participant.process(Envelope::control(Message::Launch));

        let read = peer_rx.recv().await.unwrap();
        assert_eq!(read.message, Message::ReadRequest { ballot: 1 });
        drop(self_tx);
        assert!(participant.msg_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_decision_recorded_on_monitor() {
        let monitor = Arc::new(RunMonitor::new());
        let (self_tx, self_rx) = unbounded_channel();
        let (peer_tx, _peer_rx): (UnboundedSender<Envelope>, _) = unbounded_channel();

        let mut participant = Participant::new(config(2, 3), self_rx, monitor.clone());
        participant.process(Envelope::control(Message::Membership(Peers::new(vec![
            Address::new(1, peer_tx.clone()),
            Address::new(2, self_tx),
            Address::new(3, peer_tx),
        ]))));
        participant.process(Envelope::from_peer(
            1,
            Message::Decide { value: Value(1), origin: 1, ballot: 4 },
        ));

        assert_eq!(monitor.decided_count(), 1);
        assert_eq!(monitor.delay(), None);
        assert_eq!(participant.state.decision(), Some(Value(1)));
    }

    #[tokio::test]
    async fn test_restart_stamps_new_run_and_drops_old_replies() {
        let monitor = Arc::new(RunMonitor::new());
        let (self_tx, self_rx) = unbounded_channel();
        let (peer_tx, mut peer_rx) = unbounded_channel();

        let mut participant = Participant::new(config(1, 2), self_rx, monitor.clone());
        participant.process(Envelope::control(Message::Membership(Peers::new(vec![
            Address::new(1, self_tx),
            Address::new(2, peer_tx),
        ]))));
        participant.process(Envelope::control(Message::Launch));
        let read = peer_rx.recv().await.unwrap();
        assert_eq!(read.run, 0);

        participant.process(Envelope::control(Message::Restart));
        participant.process(Envelope::control(Message::Launch));
        let read = peer_rx.recv().await.unwrap();
        assert_eq!(read.run, 1);
        assert_eq!(read.message, Message::ReadRequest { ballot: 1 });

        // A late reply from the first run must not complete the new round.
        participant.process(Envelope::from_peer(2, Message::Gather { ballot: 1, impose_ballot: 0, estimate: None }));
        assert!(peer_rx.try_recv().is_err());

        participant.process(
            Envelope::from_peer(2, Message::Gather { ballot: 1, impose_ballot: 0, estimate: None }).in_run(1),
        );
        let impose = peer_rx.recv().await.unwrap();
        assert_eq!(impose.run, 1);
        assert!(matches!(impose.message, Message::ImposeRequest { ballot: 1, .. }));

        participant.process(Envelope::from_peer(2, Message::Ack { ballot: 1 }));
        assert_eq!(monitor.decided_count(), 0);
        participant.process(Envelope::from_peer(2, Message::Ack { ballot: 1 }).in_run(1));
        assert_eq!(monitor.decided_count(), 1);
    }

    #[tokio::test]
    async fn test_jittered_delivery_arrives() {
        let monitor = Arc::new(RunMonitor::new());
        let (self_tx, self_rx) = unbounded_channel();
        let (peer_tx, mut peer_rx) = unbounded_channel();

        let mut participant = Participant::new(
            ParticipantConfig {
                network: NetworkConfig::default().with_max_jitter(Duration::from_millis(5)),
                ..config(1, 2)
            },
            self_rx,
            monitor,
        );
        participant.process(Envelope::control(Message::Membership(Peers::new(vec![
            Address::new(1, self_tx),
            Address::new(2, peer_tx),
        ]))));
        participant.process(Envelope::control(Message::Launch));

        let read = tokio::time::timeout(Duration::from_secs(1), peer_rx.recv()).await.unwrap().unwrap();
        assert_eq!(read.message, Message::ReadRequest { ballot: 1 });
    }
}
