use crate::registry::{CommandContext, CommandHandler, CommandSpec};
use anyhow::Result;
use async_trait::async_trait;
use hurobot_config::Role;
use hurobot_ipc::Segment;

pub(super) const ECHO_HELP: &str = "Echoes messages back to the chat.
Usage: /echo <any>
Example: /echo helloworld";

pub struct EchoCommand;

pub(super) fn spec() -> CommandSpec {
    CommandSpec::new("echo", ECHO_HELP, EchoCommand)
        .with_role(Role::Guest)
        .min_args(2)
}

/// Rejoins split words with single spaces, keeping non-text segments in place.
fn rejoin(args: &[Segment]) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(args.len());
    for arg in args {
        match (out.last_mut(), arg) {
            (Some(Segment::Text(prev)), Segment::Text(word)) => {
                prev.push(' ');
                prev.push_str(word);
            }
            _ => out.push(arg.clone()),
        }
    }
    out
}

#[async_trait]
impl CommandHandler for EchoCommand {
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<()> {
        ctx.outbox.reply(ctx.message, rejoin(&ctx.args[1..]));
        Ok(())
    }
}
