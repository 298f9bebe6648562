//! Confirmation tracking for broadcast transactions
//!
//! One polling loop per transaction. A loop ends when the ledger's
//! confirmation threshold is reached, the transaction fails or disappears, or
//! [`TransactionMonitor::stop_monitoring`] is called. Finished tasks are
//! removed from the registry right away.

use crate::chain::{ChainState, ChainStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::Ledger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the monitor reads status from and reports outcomes to
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn poll_status(&self, hash: &str) -> PipelineResult<ChainStatus>;

    /// Terminal outcome of a monitored transaction
    async fn settle(&self, hash: &str, outcome: ChainState, confirmations: u64);
}

/// Snapshot of one monitored transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringTask {
    pub hash: String,
    pub ledger: Ledger,
    pub started_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub confirmations: u64,
}

struct TaskEntry {
    id: Uuid,
    task: MonitoringTask,
    started: Instant,
    handle: Option<AbortHandle>,
}

pub struct TransactionMonitor {
    poll_interval: Duration,
    tasks: DashMap<String, TaskEntry>,
}

impl TransactionMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            tasks: DashMap::new(),
        }
    }

    /// Begin polling `hash`. Returns false if it is already monitored.
    pub fn start_monitoring(
        self: &Arc<Self>,
        hash: &str,
        ledger: Ledger,
        source: Arc<dyn StatusSource>,
    ) -> bool {
        let id = Uuid::new_v4();
        let first_poll = Instant::now() + self.poll_interval;

        match self.tasks.entry(hash.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("{} is already monitored", hash);
                return false;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TaskEntry {
                    id,
                    task: MonitoringTask {
                        hash: hash.to_string(),
                        ledger,
                        started_at: Utc::now(),
                        last_checked: None,
                        confirmations: 0,
                    },
                    started: Instant::now(),
                    handle: None,
                });
            }
        }

        let monitor = self.clone();
        let owned_hash = hash.to_string();
        let handle = tokio::spawn(async move {
            monitor.run(id, owned_hash, ledger, source, first_poll).await;
        })
        .abort_handle();

        if let Some(mut entry) = self.tasks.get_mut(hash) {
            if entry.id == id {
                entry.handle = Some(handle);
            }
        }

        crate::metrics::set_monitored_transactions(self.tasks.len());
        info!("Monitoring {} on {}", hash, ledger);
        true
    }

    /// Remove the task and cancel its loop
    pub fn stop_monitoring(&self, hash: &str) -> bool {
        match self.tasks.remove(hash) {
            Some((_, entry)) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                crate::metrics::set_monitored_transactions(self.tasks.len());
                info!("Stopped monitoring {}", hash);
                true
            }
            None => false,
        }
    }

    pub fn task(&self, hash: &str) -> Option<MonitoringTask> {
        self.tasks.get(hash).map(|e| e.task.clone())
    }

    pub fn tasks(&self) -> Vec<MonitoringTask> {
        self.tasks.iter().map(|e| e.task.clone()).collect()
    }

    pub fn is_monitoring(&self, hash: &str) -> bool {
        self.tasks.contains_key(hash)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Record a poll result; None once the task is gone or superseded
    fn record(&self, hash: &str, id: Uuid, status: &ChainStatus) -> Option<u64> {
        let mut entry = self.tasks.get_mut(hash)?;
        if entry.id != id {
            return None;
        }
        let previous = entry.task.confirmations;
        entry.task.confirmations = status.confirmations;
        entry.task.last_checked = Some(Utc::now());
        Some(previous)
    }

    /// Drop the registry entry owned by this loop
    fn finish(&self, hash: &str, id: Uuid) -> Option<Duration> {
        let (_, entry) = self.tasks.remove_if(hash, |_, e| e.id == id)?;
        crate::metrics::set_monitored_transactions(self.tasks.len());
        Some(entry.started.elapsed())
    }

    async fn run(
        self: Arc<Self>,
        id: Uuid,
        hash: String,
        ledger: Ledger,
        source: Arc<dyn StatusSource>,
        first_poll: Instant,
    ) {
        let threshold = ledger.confirmation_threshold();
        let mut next_poll = first_poll;

        loop {
            sleep_until(next_poll).await;
            next_poll = Instant::now() + self.poll_interval;

            let status = match source.poll_status(&hash).await {
                Ok(status) => status,
                Err(PipelineError::TransactionNotFound { .. }) => {
                    debug!("{} is no longer tracked, ending its monitor", hash);
                    self.finish(&hash, id);
                    return;
                }
                Err(e) => {
                    warn!("Status poll for {} failed, will retry: {}", hash, e);
                    continue;
                }
            };

            let Some(previous) = self.record(&hash, id, &status) else {
                return;
            };

            let outcome = match status.state {
                ChainState::Included if status.confirmations >= threshold => ChainState::Included,
                ChainState::Failed => ChainState::Failed,
                ChainState::Dropped if previous > 0 => {
                    warn!(
                        "{} on {} vanished after {} confirmations, treating as reorganised out",
                        hash, ledger, previous
                    );
                    ChainState::Failed
                }
                ChainState::Dropped => ChainState::Dropped,
                ChainState::Included | ChainState::Pending => {
                    debug!(
                        "{} at {}/{} confirmations",
                        hash, status.confirmations, threshold
                    );
                    continue;
                }
            };

            if let Some(elapsed) = self.finish(&hash, id) {
                if outcome == ChainState::Included {
                    crate::metrics::record_confirmation_latency(ledger, elapsed.as_secs_f64());
                }
                info!(
                    "{} on {} settled as {:?} with {} confirmations",
                    hash, ledger, outcome, status.confirmations
                );
                source.settle(&hash, outcome, status.confirmations).await;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const POLL: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<PipelineResult<ChainStatus>>>,
        polls: Mutex<usize>,
        settled: Mutex<Vec<(String, ChainState, u64)>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<PipelineResult<ChainStatus>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            })
        }

        fn polls(&self) -> usize {
            *self.polls.lock().unwrap()
        }

        fn settled(&self) -> Vec<(String, ChainState, u64)> {
            self.settled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn poll_status(&self, _hash: &str) -> PipelineResult<ChainStatus> {
            *self.polls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ChainStatus::pending()))
        }

        async fn settle(&self, hash: &str, outcome: ChainState, confirmations: u64) {
            self.settled
                .lock()
                .unwrap()
                .push((hash.to_string(), outcome, confirmations));
        }
    }

    async fn run_pending() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn tick() {
        tokio::time::advance(POLL).await;
        run_pending().await;
    }

    fn query_error() -> PipelineError {
        PipelineError::StatusQuery {
            ledger: Ledger::Utxo,
            hash: "h".to_string(),
            message: "timeout".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_removed_exactly_at_threshold() {
        let source = ScriptedSource::new(vec![
            Ok(ChainStatus::pending()),
            Ok(ChainStatus::included(1)),
            Ok(ChainStatus::included(5)),
            Ok(ChainStatus::included(6)),
        ]);
        let monitor = Arc::new(TransactionMonitor::new(POLL));
        assert!(monitor.start_monitoring("h", Ledger::Utxo, source.clone()));
        run_pending().await;

        for expected in [0, 1, 5] {
            tick().await;
            let task = monitor.task("h").expect("task removed early");
            assert_eq!(task.confirmations, expected);
            assert!(task.last_checked.is_some());
        }

        tick().await;
        assert!(!monitor.is_monitoring("h"));
        assert_eq!(monitor.active_count(), 0);
        assert_eq!(
            source.settled(),
            vec![("h".to_string(), ChainState::Included, 6)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_are_swallowed() {
        let source = ScriptedSource::new(vec![
            Err(query_error()),
            Err(query_error()),
            Ok(ChainStatus::included(12)),
        ]);
        let monitor = Arc::new(TransactionMonitor::new(POLL));
        monitor.start_monitoring("h", Ledger::Account, source.clone());
        run_pending().await;

        tick().await;
        tick().await;
        assert!(monitor.is_monitoring("h"));
        assert_eq!(source.polls(), 2);

        tick().await;
        assert!(!monitor.is_monitoring("h"));
        assert_eq!(source.settled()[0].1, ChainState::Included);
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_threshold_is_twelve() {
        let source = ScriptedSource::new(vec![
            Ok(ChainStatus::included(11)),
            Ok(ChainStatus::included(12)),
        ]);
        let monitor = Arc::new(TransactionMonitor::new(POLL));
        monitor.start_monitoring("h", Ledger::Account, source.clone());
        run_pending().await;

        tick().await;
        assert!(monitor.is_monitoring("h"));
        tick().await;
        assert!(!monitor.is_monitoring("h"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_loop() {
        let source = ScriptedSource::new(vec![]);
        let monitor = Arc::new(TransactionMonitor::new(POLL));
        monitor.start_monitoring("h", Ledger::Blockhash, source.clone());
        run_pending().await;

        tick().await;
        assert_eq!(source.polls(), 1);

        assert!(monitor.stop_monitoring("h"));
        assert!(!monitor.stop_monitoring("h"));
        tick().await;
        tick().await;
        assert_eq!(source.polls(), 1);
        assert!(source.settled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_and_dropped_outcomes() {
        let failed = ScriptedSource::new(vec![Ok(ChainStatus {
            state: ChainState::Failed,
            confirmations: 0,
        })]);
        let dropped = ScriptedSource::new(vec![Ok(ChainStatus {
            state: ChainState::Dropped,
            confirmations: 0,
        })]);
        let reorged = ScriptedSource::new(vec![
            Ok(ChainStatus::included(2)),
            Ok(ChainStatus {
                state: ChainState::Dropped,
                confirmations: 0,
            }),
        ]);

        let monitor = Arc::new(TransactionMonitor::new(POLL));
        monitor.start_monitoring("failed", Ledger::Account, failed.clone());
        monitor.start_monitoring("dropped", Ledger::Account, dropped.clone());
        monitor.start_monitoring("reorged", Ledger::Account, reorged.clone());
        run_pending().await;

        tick().await;
        tick().await;
        assert_eq!(monitor.active_count(), 0);
        assert_eq!(failed.settled()[0].1, ChainState::Failed);
        assert_eq!(dropped.settled()[0].1, ChainState::Dropped);
        assert_eq!(reorged.settled()[0].1, ChainState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_ignored() {
        let source = ScriptedSource::new(vec![]);
        let monitor = Arc::new(TransactionMonitor::new(POLL));
        assert!(monitor.start_monitoring("h", Ledger::Utxo, source.clone()));
        assert!(!monitor.start_monitoring("h", Ledger::Utxo, source.clone()));
        assert_eq!(monitor.tasks().len(), 1);
        monitor.stop_monitoring("h");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_transaction_ends_loop() {
        let source = ScriptedSource::new(vec![Err(PipelineError::TransactionNotFound {
            hash: "h".to_string(),
        })]);
        let monitor = Arc::new(TransactionMonitor::new(POLL));
        monitor.start_monitoring("h", Ledger::Utxo, source.clone());
        run_pending().await;

        tick().await;
        assert!(!monitor.is_monitoring("h"));
        assert!(source.settled().is_empty());
    }
}
