use crate::command::context::CommandContext;
use crate::command::domain::{CommandOutcome, Hint, HintKind};
use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use vtk_indexer::{
    ConsistencyReport, CycleKind, Execution, IndexOperationStatus, Launched, PropertySetIndex,
    UpdateCycle, UpdateScheduler, UpdaterHealth,
};

#[derive(Debug, Serialize)]
struct UpdateResponse {
    cycles: Vec<UpdateCycle>,
    pending_changes: usize,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    report: Option<ConsistencyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repaired: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ReindexResponse {
    thread: String,
    resources: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    index: IndexOperationStatus,
    updater_enabled: bool,
    max_changes_per_update: usize,
    store_resources: usize,
}

#[derive(Debug, Serialize)]
struct WatchResponse {
    cycles: Vec<UpdateCycle>,
    health: UpdaterHealth,
}

pub struct IndexService;

impl IndexService {
    /// Drain the change log, at most `max_cycles` batches.
    pub async fn update(ctx: &CommandContext, max_cycles: usize) -> Result<CommandOutcome> {
        let scheduler = UpdateScheduler::start(ctx.updater.clone(), ctx.config.updater.interval());
        let mut cycles = Vec::new();
        for _ in 0..max_cycles {
            let cycle = scheduler.trigger().await?;
            let stop = matches!(cycle.kind, CycleKind::NoChanges) || !cycle.success();
            cycles.push(cycle);
            if stop {
                break;
            }
        }

        let pending_changes = ctx.pending_changes()?;
        let updated = cycles.iter().any(|c| c.kind == CycleKind::Applied);
        let failure = cycles.iter().rev().find_map(|c| c.error.clone());

        let mut outcome = CommandOutcome::from_value(UpdateResponse {
            cycles,
            pending_changes,
        })?;
        outcome.meta.index_updated = Some(updated);
        outcome.meta.pending_changes = Some(pending_changes);
        if let Some(error) = failure {
            outcome
                .hints
                .push(Hint::new(HintKind::Warn, format!("update cycle failed: {error}")));
        } else if pending_changes > 0 {
            outcome.hints.push(Hint::new(
                HintKind::Action,
                format!("{pending_changes} changes remain, run update again or raise --cycles"),
            ));
        }
        Ok(outcome)
    }

    pub fn check(ctx: &CommandContext, repair: bool) -> Result<CommandOutcome> {
        ctx.manager
            .check_consistency(Execution::Inline)?
            .wait()?;
        if let Some(error) = ctx.manager.last_consistency_check_error() {
            return Err(anyhow!("consistency check failed: {error}"));
        }

        let report = ctx.manager.last_consistency_check_report();
        let needs_repair = report.as_ref().is_some_and(|r| !r.is_consistent());
        let repaired = if repair && needs_repair {
            Some(ctx.manager.repair_consistency_errors()?)
        } else {
            None
        };

        let mut outcome = CommandOutcome::from_value(CheckResponse {
            report: report.as_deref().cloned(),
            repaired,
        })?;
        outcome.meta.index_updated = Some(repaired.is_some());
        if needs_repair && !repair {
            outcome.hints.push(Hint::new(
                HintKind::Action,
                "run `check --repair` to fix the reported errors",
            ));
        }
        Ok(outcome)
    }

    pub fn reindex(ctx: &CommandContext) -> Result<CommandOutcome> {
        let thread = match ctx.manager.reindex(Execution::Background)? {
            Launched::Spawned(task) => {
                let name = task.thread_name().to_string();
                task.join()?;
                name
            }
            Launched::Completed => String::new(),
        };

        if let Some(error) = ctx.manager.last_reindexing_error() {
            return Err(anyhow!("reindexing failed: {error}"));
        }

        let mut outcome = CommandOutcome::from_value(ReindexResponse {
            thread,
            resources: ctx.manager.last_reindexing_count(),
        })?;
        outcome.meta.index_updated = Some(true);
        Ok(outcome)
    }

    pub fn status(ctx: &CommandContext) -> Result<CommandOutcome> {
        let mut outcome = CommandOutcome::from_value(StatusResponse {
            index: ctx.manager.status(),
            updater_enabled: ctx.updater.is_enabled(),
            max_changes_per_update: ctx.updater.max_changes_per_update(),
            store_resources: ctx.store.len()?,
        })?;
        outcome.meta.pending_changes = Some(ctx.pending_changes()?);
        Ok(outcome)
    }

    /// Let the scheduler run on its own interval for `duration`.
    pub async fn watch(ctx: &CommandContext, duration: Duration) -> Result<CommandOutcome> {
        let scheduler = UpdateScheduler::start(ctx.updater.clone(), ctx.config.updater.interval());
        let mut updates = scheduler.subscribe_updates();
        let deadline = Instant::now() + duration;

        let mut cycles = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, updates.recv()).await {
                Ok(Ok(cycle)) => {
                    info!("{:?} cycle: {} entries", cycle.kind, cycle.entries);
                    cycles.push(cycle);
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!("Skipped {skipped} update notifications");
                }
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }

        let updated = cycles.iter().any(|c| c.kind == CycleKind::Applied);
        let mut outcome = CommandOutcome::from_value(WatchResponse {
            cycles,
            health: scheduler.health_snapshot(),
        })?;
        outcome.meta.index_updated = Some(updated);
        outcome.meta.pending_changes = Some(ctx.pending_changes()?);
        Ok(outcome)
    }
}

pub fn index_id(ctx: &CommandContext) -> String {
    ctx.index.id().to_string()
}

/// Entry count of an open index.
pub fn index_entries(ctx: &CommandContext) -> Option<usize> {
    ctx.index.count().ok()
}
