pub mod node;

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::{sync::mpsc::unbounded_channel, task::JoinHandle};
use tracing::info;

use crate::{
    consensus::{
        message::{Envelope, Message, ParticipantId},
        monitor::RunMonitor,
        peers::Peers,
        processor::{Participant, ParticipantConfig},
    },
    error::{Error, Result},
};
use node::Address;

/*
    Delivery between participants is asynchronous and unordered. Every
    peer-to-peer message is held back for a random delay drawn from
    [0, max_jitter], so two messages from the same sender may overtake each
    other. Nothing is lost in transit; crashes are modelled by the
    participants themselves.
*/

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Upper bound of the per-message delivery delay.
    pub max_jitter: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_jitter: Duration::from_millis(5),
        }
    }
}

impl NetworkConfig {
    /// Delivers every message as soon as it is sent.
    pub fn immediate() -> Self {
        Self {
            max_jitter: Duration::ZERO,
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn sample_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let micros = self.max_jitter.as_micros() as u64;
        Duration::from_micros(rng.gen_range(0..=micros))
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub participants: usize,
    pub crash_probability: f64,
    pub seed: u64,
    pub network: NetworkConfig,
}

impl ClusterConfig {
    pub fn new(participants: usize) -> Self {
        Self {
            participants,
            crash_probability: 0.0,
            seed: 42,
            network: NetworkConfig::default(),
        }
    }

    pub fn with_crash_probability(mut self, crash_probability: f64) -> Self {
        self.crash_probability = crash_probability;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants == 0 {
            return Err(Error::InvalidConfig("at least one participant is required".into()));
        }
        if !(0.0..=1.0).contains(&self.crash_probability) {
            return Err(Error::InvalidConfig(format!(
                "crash probability {} is outside [0, 1]",
                self.crash_probability
            )));
        }
        Ok(())
    }
}

/// N running participants sharing one membership view and one monitor.
pub struct Cluster {
    peers: Peers,
    monitor: Arc<RunMonitor>,
    handles: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Spawns one task per participant and delivers the membership view to
    /// each before returning. Must be called inside a tokio runtime.
    pub fn spawn(config: &ClusterConfig, monitor: Arc<RunMonitor>) -> Result<Self> {
        config.validate()?;

        let mut members = Vec::with_capacity(config.participants);
        let mut handles = Vec::with_capacity(config.participants);

        for id in 1..=config.participants as ParticipantId {
            let (msg_tx, msg_rx) = unbounded_channel();
            let mut participant = Participant::new(
                ParticipantConfig {
                    id,
                    n: config.participants,
                    crash_probability: config.crash_probability,
                    seed: config.seed,
                    network: config.network.clone(),
                },
                msg_rx,
                monitor.clone(),
            );
            handles.push(tokio::spawn(async move {
                participant.run().await;
            }));
            members.push(Address::new(id, msg_tx));
        }

        let cluster = Cluster {
            peers: Peers::new(members),
            monitor,
            handles,
        };
        cluster.broadcast(Message::Membership(cluster.peers.clone()))?;

        info!(participants = config.participants, "Cluster started");
        Ok(cluster)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn monitor(&self) -> &Arc<RunMonitor> {
        &self.monitor
    }

    /// Sends a driver signal to one participant.
    pub fn send(&self, id: ParticipantId, message: Message) -> Result<()> {
        let address = self.peers.get(id).ok_or(Error::UnknownParticipant(id))?;
        if address.deliver(Envelope::control(message)) {
            Ok(())
        } else {
            Err(Error::MailboxClosed(id))
        }
    }

    /// Sends a driver signal to every participant.
    pub fn broadcast(&self, message: Message) -> Result<()> {
        for id in self.peers.ids() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
        info!("Cluster stopped");
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn test_sample_delay_bounded() {
        let config = NetworkConfig::default().with_max_jitter(Duration::from_millis(3));
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            assert!(config.sample_delay(&mut rng) <= Duration::from_millis(3));
        }
        assert_eq!(NetworkConfig::immediate().sample_delay(&mut rng), Duration::ZERO);
    }

    #[test]
    fn test_invalid_cluster_config() {
        assert!(matches!(ClusterConfig::new(0).validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            ClusterConfig::new(3).with_crash_probability(1.5).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(ClusterConfig::new(3).with_crash_probability(0.1).validate().is_ok());
    }

    #[tokio::test]
    async fn test_three_participants_decide() {
        let monitor = Arc::new(RunMonitor::new());
        let cluster = Cluster::spawn(&ClusterConfig::new(3), monitor.clone()).unwrap();

        monitor.start_run();
        cluster.broadcast(Message::Launch).unwrap();
        cluster.send(1, Message::LeaderElected { leader: 1 }).unwrap();

        assert!(monitor.wait_for_decisions(3, Duration::from_secs(5)).await);
        assert!(monitor.delay().is_some());
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_participant() {
        let monitor = Arc::new(RunMonitor::new());
        let cluster = Cluster::spawn(&ClusterConfig::new(3), monitor).unwrap();
        assert!(matches!(cluster.send(4, Message::Launch), Err(Error::UnknownParticipant(4))));
        cluster.shutdown();
    }
}
