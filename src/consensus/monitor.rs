use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::info;

use super::message::ParticipantId;

/*
    The only state shared between participants. Each participant holds an
    Arc to the same monitor: it bumps the decided count when it enters the
    decided phase, and the first participant to collect a majority of acks
    reports the delay since the run started. The driver waits on the
    notifier instead of spinning on the counter.
*/

#[derive(Debug)]
pub struct RunMonitor {
    decided: AtomicUsize,
    /// Delay and reporter are published together by the first reporter.
    report: Mutex<Option<(Duration, ParticipantId)>>,
    started_at: Mutex<Instant>,
    notify: Notify,
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMonitor {
    pub fn new() -> Self {
        RunMonitor {
            decided: AtomicUsize::new(0),
            report: Mutex::new(None),
            started_at: Mutex::new(Instant::now()),
            notify: Notify::new(),
        }
    }

    pub fn start_run(&self) {
        *self.started_at.lock() = Instant::now();
    }

    /// Clears the counter and the delay flag for the next run.
    pub fn reset(&self) {
        self.decided.store(0, Ordering::SeqCst);
        *self.report.lock() = None;
        self.notify.notify_waiters();
    }

    /// Returns the count after this decision.
    pub fn record_decision(&self) -> usize {
        let count = self.decided.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify.notify_waiters();
        count
    }

    pub fn decided_count(&self) -> usize {
        self.decided.load(Ordering::SeqCst)
    }

    /// Records the delay if nobody has yet. Returns the delay only for the winner.
    pub fn report_delay(&self, id: ParticipantId) -> Option<Duration> {
        let delay = {
            let mut report = self.report.lock();
            if report.is_some() {
                return None;
            }
            let delay = self.started_at.lock().elapsed();
            *report = Some((delay, id));
            delay
        };

        self.notify.notify_waiters();
        info!(id, delay_ms = delay.as_millis() as u64, "Reached decide with consensus delay");
        Some(delay)
    }

    pub fn delay(&self) -> Option<Duration> {
        self.report.lock().map(|(delay, _)| delay)
    }

    pub fn reporter(&self) -> Option<ParticipantId> {
        self.report.lock().map(|(_, id)| id)
    }

    /// The delay and the participant that reported it, read in one step.
    pub fn report(&self) -> Option<(Duration, ParticipantId)> {
        *self.report.lock()
    }

    /// Waits until at least `threshold` participants have decided.
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_decisions(&self, threshold: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.decided_count() >= threshold).await
    }

    /// Waits until a delay has been reported. Returns false on timeout.
    pub async fn wait_for_delay(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.delay().is_some()).await
    }

    async fn wait_until(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent notify is not lost.
            notified.as_mut().enable();

            if condition() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return condition();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_delay_reported_once() {
        let monitor = RunMonitor::new();
        monitor.start_run();

        let delay = monitor.report_delay(2).unwrap();
        assert!(monitor.report_delay(3).is_none());
        assert_eq!(monitor.reporter(), Some(2));
        assert_eq!(monitor.delay(), Some(delay));
        assert_eq!(monitor.report(), Some((delay, 2)));

        monitor.reset();
        assert_eq!(monitor.delay(), None);
        assert_eq!(monitor.reporter(), None);
        assert_eq!(monitor.report(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_report_visible_whole_to_readers() {
        let monitor = Arc::new(RunMonitor::new());
        monitor.start_run();
        std::thread::sleep(Duration::from_millis(2));

        let reader = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                loop {
                    if let Some((delay, id)) = monitor.report() {
                        return (delay, id);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut handles = Vec::new();
        for id in 1..=8u64 {
            let monitor = monitor.clone();
            handles.push(tokio::spawn(async move { monitor.report_delay(id).map(|delay| (delay, id)) }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            winners.extend(handle.await.unwrap());
        }
        assert_eq!(winners.len(), 1);

        let (delay, id) = winners[0];
        assert!(delay >= Duration::from_millis(2));
        assert_eq!(reader.await.unwrap(), (delay, id));
        assert_eq!(monitor.delay(), Some(delay));
        assert_eq!(monitor.reporter(), Some(id));
    }

    #[tokio::test]
    async fn test_concurrent_decisions_counted() {
        let monitor = Arc::new(RunMonitor::new());
        let mut handles = Vec::new();
        for id in 1..=16u64 {
            let monitor = monitor.clone();
            handles.push(tokio::spawn(async move {
                monitor.record_decision();
                monitor.report_delay(id)
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(monitor.decided_count(), 16);
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_wait_for_decisions() {
        let monitor = Arc::new(RunMonitor::new());

        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_for_decisions(2, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.record_decision();
        monitor.record_decision();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let monitor = RunMonitor::new();
        monitor.record_decision();
        assert!(!monitor.wait_for_decisions(2, Duration::from_millis(20)).await);
        assert!(!monitor.wait_for_delay(Duration::from_millis(20)).await);
    }
}
