//! Repeated-run experiment driver.
//!
//! Each run marks `f` random participants as crash-prone, launches every
//! participant, and keeps electing a random non-crash-prone leader until
//! some participant reports the consensus delay. After a majority has
//! decided, all participants are restarted so the next run starts clean.

use std::{sync::Arc, time::Duration};

use rand::{seq::index, Rng};
use rand_chacha::ChaCha8Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    common::rng::{rng_for, Stream},
    consensus::{
        message::{Message, ParticipantId},
        monitor::RunMonitor,
        peers::majority,
    },
    error::{Error, Result},
    network::{Cluster, ClusterConfig, NetworkConfig},
};

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Number of participants (N).
    pub participants: usize,
    /// Participants that receive a crash signal each run (f).
    pub faulty: usize,
    /// Per-message crash probability once a participant is crash-prone.
    pub crash_probability: f64,
    /// Interval between leader elections.
    pub leader_election_timeout: Duration,
    /// Pause before and after restarting participants.
    pub delay_between_experiments: Duration,
    pub experiments: usize,
    pub seed: u64,
    pub network: NetworkConfig,
    /// Upper bound on the wait for a majority of decisions in one run.
    pub decision_timeout: Duration,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            participants: 10,
            faulty: 4,
            crash_probability: 0.1,
            leader_election_timeout: Duration::from_millis(500),
            delay_between_experiments: Duration::from_millis(1500),
            experiments: 5,
            seed: 42,
            network: NetworkConfig::default(),
            decision_timeout: Duration::from_secs(10),
        }
    }
}

impl ExperimentConfig {
    pub fn new(participants: usize, faulty: usize) -> Self {
        Self {
            participants,
            faulty,
            ..Self::default()
        }
    }

    pub fn with_crash_probability(mut self, crash_probability: f64) -> Self {
        self.crash_probability = crash_probability;
        self
    }

    pub fn with_leader_election_timeout(mut self, timeout: Duration) -> Self {
        self.leader_election_timeout = timeout;
        self
    }

    pub fn with_delay_between_experiments(mut self, delay: Duration) -> Self {
        self.delay_between_experiments = delay;
        self
    }

    pub fn with_experiments(mut self, experiments: usize) -> Self {
        self.experiments = experiments;
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

    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig::new(self.participants)
            .with_crash_probability(self.crash_probability)
            .with_seed(self.seed)
            .with_network(self.network.clone())
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster_config().validate()?;
        if self.participants - self.faulty.min(self.participants) < majority(self.participants) {
            return Err(Error::InvalidConfig(format!(
                "{} crash-prone participants out of {} leave no majority",
                self.faulty, self.participants
            )));
        }
        if self.experiments == 0 {
            return Err(Error::InvalidConfig("at least one experiment is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run: usize,
    /// Time until the first participant collected a majority of acks.
    /// `None` when the run stalled.
    pub delay: Option<Duration>,
    pub decided: usize,
    pub leaders_elected: usize,
    pub crash_prone: Vec<ParticipantId>,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentReport {
    pub outcomes: Vec<RunOutcome>,
}

impl ExperimentReport {
    /// Mean delay over the runs that reached a decision.
    pub fn average_delay(&self) -> Option<Duration> {
        let delays: Vec<Duration> = self.outcomes.iter().filter_map(|o| o.delay).collect();
        if delays.is_empty() {
            return None;
        }
        Some(delays.iter().sum::<Duration>() / delays.len() as u32)
    }

    pub fn stalled_runs(&self) -> usize {
        self.outcomes.iter().filter(|o| o.delay.is_none()).count()
    }
}

pub struct Experiment {
    config: ExperimentConfig,
    cluster: Cluster,
    rng: ChaCha8Rng,
    runs_done: usize,
}

impl Experiment {
    pub fn start(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let monitor = Arc::new(RunMonitor::new());
        let cluster = Cluster::spawn(&config.cluster_config(), monitor)?;
        let rng = rng_for(config.seed, Stream::Driver, 0);

        info!(
            participants = config.participants,
            faulty = config.faulty,
            crash_probability = config.crash_probability,
            "System started"
        );
        Ok(Experiment {
            config,
            cluster,
            rng,
            runs_done: 0,
        })
    }

    pub fn monitor(&self) -> &Arc<RunMonitor> {
        self.cluster.monitor()
    }

    pub async fn run_all(mut self) -> Result<ExperimentReport> {
        let mut report = ExperimentReport::default();
        for _ in 0..self.config.experiments {
            report.outcomes.push(self.run_once().await?);
        }
        self.shutdown();
        Ok(report)
    }

    pub async fn run_once(&mut self) -> Result<RunOutcome> {
        let run = self.runs_done + 1;
        info!(run, "Starting experiment");

        let crash_prone = self.pick_crash_prone();
        for &id in &crash_prone {
            self.cluster.send(id, Message::CrashSignal)?;
        }

        let monitor = self.cluster.monitor().clone();
        monitor.start_run();
        let deadline = Instant::now() + self.config.decision_timeout;
        self.cluster.broadcast(Message::Launch)?;

        let mut leaders_elected = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = self.config.leader_election_timeout.min(remaining);
            if monitor.wait_for_delay(wait).await || Instant::now() >= deadline {
                break;
            }

            let leader = self.pick_leader(&crash_prone)?;
            info!(run, leader, "Electing new leader");
            self.cluster.send(leader, Message::LeaderElected { leader })?;
            leaders_elected += 1;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let threshold = majority(self.cluster.len());
        if monitor.wait_for_decisions(threshold, remaining).await {
            info!(run, decided = monitor.decided_count(), "Verified majority has decided");
        } else {
            warn!(run, decided = monitor.decided_count(), threshold, "Majority did not decide in time");
        }

        // Let the decide flood reach stragglers before counting.
        tokio::time::sleep(self.config.delay_between_experiments).await;
        let outcome = RunOutcome {
            run,
            delay: monitor.delay(),
            decided: monitor.decided_count(),
            leaders_elected,
            crash_prone,
        };

        self.cluster.broadcast(Message::Restart)?;
        info!(run, "All participants restarted");
        tokio::time::sleep(self.config.delay_between_experiments).await;
        monitor.reset();

        self.runs_done += 1;
        Ok(outcome)
    }

    pub fn shutdown(self) {
        self.cluster.shutdown();
    }

    fn pick_crash_prone(&mut self) -> Vec<ParticipantId> {
        let n = self.cluster.len();
        let mut ids: Vec<ParticipantId> = index::sample(&mut self.rng, n, self.config.faulty.min(n))
            .into_iter()
            .map(|i| i as ParticipantId + 1)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn pick_leader(&mut self, crash_prone: &[ParticipantId]) -> Result<ParticipantId> {
        let candidates: Vec<ParticipantId> = self
            .cluster
            .peers()
            .ids()
            .into_iter()
            .filter(|id| !crash_prone.contains(id))
            .collect();
        if candidates.is_empty() {
            return Err(Error::NoLeaderCandidate);
        }
        Ok(candidates[self.rng.gen_range(0..candidates.len())])
    }
}
