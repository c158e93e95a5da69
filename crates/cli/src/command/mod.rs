mod context;
pub mod domain;
mod services;

pub use context::CommandContext;
pub use domain::CommandResponse;

use anyhow::Result;
use domain::{CommandOutcome, CommandStatus};
use services::IndexService;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Update { cycles: usize },
    Check { repair: bool },
    Reindex,
    Status,
    Watch { duration: Duration },
}

pub struct CommandHandler {
    ctx: CommandContext,
}

impl CommandHandler {
    pub fn new(ctx: CommandContext) -> Self {
        Self { ctx }
    }

    pub async fn execute(&self, action: CommandAction) -> Result<CommandResponse> {
        let started = Instant::now();
        let ctx = &self.ctx;

        let mut outcome: CommandOutcome = match action {
            CommandAction::Update { cycles } => IndexService::update(ctx, cycles).await?,
            CommandAction::Check { repair } => IndexService::check(ctx, repair)?,
            CommandAction::Reindex => IndexService::reindex(ctx)?,
            CommandAction::Status => IndexService::status(ctx)?,
            CommandAction::Watch { duration } => IndexService::watch(ctx, duration).await?,
        };

        outcome.meta.config_path = ctx.config_path.as_ref().map(|p| p.display().to_string());
        outcome.meta.index_id = Some(services::index_id(ctx));
        outcome.meta.index_entries = services::index_entries(ctx);
        outcome.meta.duration_ms = Some(started.elapsed().as_millis() as u64);

        Ok(CommandResponse {
            status: CommandStatus::Ok,
            message: None,
            hints: outcome.hints,
            data: outcome.data,
            meta: outcome.meta,
        })
    }
}
