use crate::error::{IndexError, Result};
use crate::updater::{IncrementalUpdater, UpdateOutcome, UpdateStats};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    NoChanges,
    Discarded,
    Applied,
    LockUnavailable,
    Failed,
}

/// Summary of one update cycle.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateCycle {
    pub completed_at: SystemTime,
    pub duration_ms: u64,
    pub kind: CycleKind,
    pub entries: usize,
    pub stats: Option<UpdateStats>,
    pub error: Option<String>,
}

impl UpdateCycle {
    fn from_outcome(outcome: &UpdateOutcome, duration_ms: u64) -> Self {
        let (kind, entries, stats, error) = match outcome {
            UpdateOutcome::NoChanges => (CycleKind::NoChanges, 0, None, None),
            UpdateOutcome::Discarded { entries } => (CycleKind::Discarded, *entries, None, None),
            UpdateOutcome::Applied(stats) => {
                (CycleKind::Applied, stats.entries, Some(stats.clone()), None)
            }
            UpdateOutcome::LockUnavailable { entries } => (
                CycleKind::LockUnavailable,
                *entries,
                None,
                Some("index lock unavailable".to_string()),
            ),
            UpdateOutcome::Failed { entries, error } => {
                (CycleKind::Failed, *entries, None, Some(error.to_string()))
            }
        };
        Self {
            completed_at: SystemTime::now(),
            duration_ms,
            kind,
            entries,
            stats,
            error,
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        !matches!(self.kind, CycleKind::LockUnavailable | CycleKind::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdaterHealth {
    pub last_success: Option<SystemTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_duration_ms: Option<u64>,
    pub cycles: u64,
    pub entries_applied: u64,
    pub updating: bool,
}

impl UpdaterHealth {
    const fn initial() -> Self {
        Self {
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
            last_duration_ms: None,
            cycles: 0,
            entries_applied: 0,
            updating: false,
        }
    }

    fn record(&mut self, cycle: &UpdateCycle) {
        self.cycles += 1;
        self.updating = false;
        self.last_duration_ms = Some(cycle.duration_ms);
        if cycle.success() {
            self.last_success = Some(cycle.completed_at);
            self.last_error = None;
            self.consecutive_failures = 0;
            if cycle.kind == CycleKind::Applied {
                self.entries_applied += cycle.entries as u64;
            }
        } else {
            self.last_error.clone_from(&cycle.error);
            self.consecutive_failures += 1;
        }
    }
}

enum SchedulerCommand {
    Trigger { reply: oneshot::Sender<UpdateCycle> },
    Shutdown,
}

/// Runs an [`IncrementalUpdater`] periodically on the tokio runtime.
///
/// A cycle that overruns its period delays the next tick instead of
/// overlapping it. Shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    command_tx: mpsc::Sender<SchedulerCommand>,
    update_tx: broadcast::Sender<UpdateCycle>,
    health_tx: watch::Sender<UpdaterHealth>,
}

impl UpdateScheduler {
    /// Must be called from within a tokio runtime.
    pub fn start(updater: Arc<IncrementalUpdater>, interval: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (health_tx, _) = watch::channel(UpdaterHealth::initial());
        let (update_tx, _) = broadcast::channel(32);

        spawn_update_loop(
            updater,
            interval,
            command_rx,
            update_tx.clone(),
            health_tx.clone(),
        );

        Self {
            inner: Arc::new(SchedulerInner {
                command_tx,
                update_tx,
                health_tx,
            }),
        }
    }

    /// Run a cycle now and wait for its result.
    pub async fn trigger(&self) -> Result<UpdateCycle> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(SchedulerCommand::Trigger { reply })
            .await
            .map_err(|e| IndexError::Other(format!("failed to send trigger: {e}")))?;
        rx.await
            .map_err(|e| IndexError::Other(format!("update loop stopped: {e}")))
    }

    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<UpdateCycle> {
        self.inner.update_tx.subscribe()
    }

    #[must_use]
    pub fn health_snapshot(&self) -> UpdaterHealth {
        self.inner.health_tx.borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<UpdaterHealth> {
        self.inner.health_tx.subscribe()
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(SchedulerCommand::Shutdown);
        }
    }
}

fn spawn_update_loop(
    updater: Arc<IncrementalUpdater>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
    update_tx: broadcast::Sender<UpdateCycle>,
    health_tx: watch::Sender<UpdaterHealth>,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = UpdaterHealth::initial();
        info!(
            "Incremental updater for {:?} scheduled every {}ms",
            updater.partition(),
            interval.as_millis()
        );

        loop {
            let reply = tokio::select! {
                _ = ticker.tick() => None,
                cmd = command_rx.recv() => match cmd {
                    Some(SchedulerCommand::Trigger { reply }) => Some(reply),
                    Some(SchedulerCommand::Shutdown) | None => break,
                },
            };

            health.updating = true;
            health_tx.send_replace(health.clone());

            let cycle = run_update_cycle(Arc::clone(&updater)).await;
            health.record(&cycle);
            health_tx.send_replace(health.clone());

            if cycle.kind != CycleKind::NoChanges {
                let _ = update_tx.send(cycle.clone());
            }
            if let Some(reply) = reply {
                let _ = reply.send(cycle);
            }
        }

        info!("Incremental updater for {:?} stopped", updater.partition());
    });
}

async fn run_update_cycle(updater: Arc<IncrementalUpdater>) -> UpdateCycle {
    let started = Instant::now();
    let outcome = match tokio::task::spawn_blocking(move || updater.update()).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Update cycle panicked: {err}");
            UpdateOutcome::Failed {
                entries: 0,
                error: IndexError::WorkerPanicked("incremental-update".to_string()),
            }
        }
    };
    #[allow(clippy::cast_possible_truncation)]
    let duration = started.elapsed().as_millis() as u64;
    if outcome.is_failure() {
        warn!("Update cycle did not complete after {duration}ms");
    }
    UpdateCycle::from_outcome(&outcome, duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::MemoryChangeLog;
    use crate::config::UpdaterConfig;
    use crate::memory_index::MemoryPropertySetIndex;
    use crate::store::MemoryResourceStore;
    use crate::types::{AuthorizedPropertySet, ChangeOperation, PrincipalSet, PropertySet};

    #[tokio::test]
    async fn trigger_runs_a_cycle_and_updates_health() {
        let index = Arc::new(MemoryPropertySetIndex::new("main"));
        let store = Arc::new(MemoryResourceStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        let config = UpdaterConfig::default();
        store
            .put(AuthorizedPropertySet::new(
                PropertySet::new("/a", "file"),
                PrincipalSet::new(),
            ))
            .unwrap();
        log.append(config.partition(), "/a", ChangeOperation::Created, false)
            .unwrap();

        let updater = Arc::new(IncrementalUpdater::new(
            &config,
            index.clone(),
            store,
            log.clone(),
        ));
        let scheduler = UpdateScheduler::start(updater, Duration::from_secs(3600));
        let mut updates = scheduler.subscribe_updates();

        let cycle = scheduler.trigger().await.unwrap();
        assert_eq!(cycle.kind, CycleKind::Applied);
        assert_eq!(cycle.entries, 1);
        assert_eq!(updates.recv().await.unwrap().kind, CycleKind::Applied);

        let health = scheduler.health_snapshot();
        assert_eq!(health.cycles, 1);
        assert_eq!(health.entries_applied, 1);
        assert!(health.last_success.is_some());
        assert!(!health.updating);

        let idle = scheduler.trigger().await.unwrap();
        assert_eq!(idle.kind, CycleKind::NoChanges);
        assert_eq!(index.committed_uris(), vec!["/a"]);
        assert!(log.is_empty(config.partition()).unwrap());
    }

    #[tokio::test]
    async fn ticks_drive_cycles() {
        let index = Arc::new(MemoryPropertySetIndex::new("main"));
        let store = Arc::new(MemoryResourceStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        let updater = Arc::new(IncrementalUpdater::new(
            &UpdaterConfig::default(),
            index,
            store,
            log,
        ));
        let scheduler = UpdateScheduler::start(updater, Duration::from_millis(20));
        let mut health = scheduler.health_stream();

        health
            .wait_for(|h| h.cycles >= 2)
            .await
            .expect("update loop alive");
        assert_eq!(scheduler.health_snapshot().consecutive_failures, 0);
    }
}
