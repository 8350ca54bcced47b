//! Runs repeated consensus experiments and reports the consensus delay.
//!
//! ```bash
//! # 10 participants, 4 of them crash-prone, 5 runs
//! simple-synod -n 10 -f 4 -e 5
//!
//! # 3 participants, no crashes, faster leader election
//! simple-synod -n 3 -f 1 -a 0 --leader-timeout-ms 100
//! ```

use std::{process::ExitCode, time::Duration};

use clap::Parser;
use simple_synod::{
    driver::{Experiment, ExperimentConfig},
    network::NetworkConfig,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ONE_LINE: &str = "--------------------------------------------------";

#[derive(Parser, Debug)]
#[command(name = "simple-synod")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of participants
    #[arg(short = 'n', long, default_value = "10")]
    participants: usize,

    /// Number of participants that may crash
    #[arg(short = 'f', long, default_value = "4")]
    faulty: usize,

    /// Per-message crash probability of a crash-prone participant
    #[arg(short = 'a', long, default_value = "0.1")]
    crash_probability: f64,

    /// Milliseconds between leader elections
    #[arg(long, default_value = "500")]
    leader_timeout_ms: u64,

    /// Milliseconds to pause before and after restarting participants
    #[arg(long, default_value = "1500")]
    pause_ms: u64,

    /// Number of experiments
    #[arg(short = 'e', long, default_value = "5")]
    experiments: usize,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Upper bound of the per-message delivery delay in milliseconds
    #[arg(long, default_value = "5")]
    jitter_ms: u64,

    /// Milliseconds to wait for a majority to decide in one run
    #[arg(long, default_value = "10000")]
    decision_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> ExperimentConfig {
        ExperimentConfig::new(self.participants, self.faulty)
            .with_crash_probability(self.crash_probability)
            .with_leader_election_timeout(Duration::from_millis(self.leader_timeout_ms))
            .with_delay_between_experiments(Duration::from_millis(self.pause_ms))
            .with_experiments(self.experiments)
            .with_seed(self.seed)
            .with_network(NetworkConfig::default().with_max_jitter(Duration::from_millis(self.jitter_ms)))
            .with_decision_timeout(Duration::from_millis(self.decision_timeout_ms))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,simple_synod=info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config();

    let experiment = match Experiment::start(config) {
        Ok(experiment) => experiment,
        Err(e) => {
            error!(error = %e, "Failed to start");
            return ExitCode::FAILURE;
        }
    };

    let report = match experiment.run_all().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Experiment failed");
            return ExitCode::FAILURE;
        }
    };

    for outcome in &report.outcomes {
        match outcome.delay {
            Some(delay) => println!("Experiment {} consensus delay: {} ms", outcome.run, delay.as_millis()),
            None => println!("Experiment {} did not reach consensus", outcome.run),
        }
    }
    println!("{ONE_LINE}");
    match report.average_delay() {
        Some(average) => println!("Average consensus delay: {} ms", average.as_millis()),
        None => println!("No experiment reached consensus"),
    }
    println!("{ONE_LINE}");

    info!(stalled = report.stalled_runs(), "System has terminated");
    ExitCode::SUCCESS
}
