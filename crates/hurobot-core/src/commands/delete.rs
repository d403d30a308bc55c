use crate::registry::{CommandContext, CommandHandler, CommandSpec};
use anyhow::Result;
use async_trait::async_trait;
use hurobot_config::Role;
use tracing::info;

const DELETE_HELP: &str = "Delete a message by replying to it.
Usage: [Reply to a message] /delete";

pub struct DeleteCommand;

pub(super) fn spec() -> CommandSpec {
    CommandSpec::new("delete", DELETE_HELP, DeleteCommand)
        .with_role(Role::Admin)
        .allow_prefix()
        .min_args(1)
        .max_args(1)
}

#[async_trait]
impl CommandHandler for DeleteCommand {
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<()> {
        match ctx.reply_id() {
            Some(id) => {
                info!("Recalling message {} for user {}", id, ctx.message.user_id);
                ctx.outbox.recall(id);
            }
            None => ctx.notice(
                "Please reply to a message to delete it, and ensure the bot has permission to delete it",
            ),
        }
        Ok(())
    }
}
