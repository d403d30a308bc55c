use crate::registry::{CommandContext, CommandHandler, CommandSpec};
use anyhow::Result;
use async_trait::async_trait;
use hurobot_config::Role;

const HELP_HELP: &str = "List commands, or show how to use one.
Usage: /help [command]";

pub struct HelpCommand;

pub(super) fn spec() -> CommandSpec {
    CommandSpec::new("help", HELP_HELP, HelpCommand)
        .with_role(Role::Guest)
        .max_args(2)
}

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<()> {
        let topic = ctx.text_arg(1).trim_start_matches('/');
        if !topic.is_empty() {
            match ctx.registry.get(topic) {
                Some(spec) => ctx.notice(spec.help.clone()),
                None => ctx.notice(format!("Unknown command: {}", topic)),
            }
            return Ok(());
        }

        let mut text = String::from("Commands:");
        for spec in ctx.registry.iter() {
            let summary = spec.help.lines().next().unwrap_or("");
            text.push_str(&format!("\n/{} - {}", spec.name, summary));
        }
        ctx.notice(text);
        Ok(())
    }
}
