use crate::registry::{CommandContext, CommandHandler, CommandSpec};
use anyhow::Result;
use async_trait::async_trait;
use hurobot_config::Role;
use hurobot_ipc::Segment;
use hurobot_policy::{
    GroupDefault, ListKind, PermissionPolicy, PolicyStore, RoleStore, Scope,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

const PERM_HELP: &str = "Manage command permissions.
Usage: /perm <subcommand> [args...]
Subcommands:
  set <cmd> <key> <value>
    Keys: user_default (guest/admin/master), group_default (enable/disable)
  allow <cmd> <user|group> <add|rm|list> [targets...]
  reject <cmd> <user|group> <add|rm|list> [targets...]
  user <target> <level>
    Levels: 0/guest, 1/admin, 2/master
Examples:
  /perm set draw user_default guest
  /perm set draw group_default enable
  /perm allow draw user add @user
  /perm reject draw group add 123456
  /perm user @user admin";

pub struct PermCommand {
    policies: Arc<dyn PolicyStore>,
    roles: Arc<dyn RoleStore>,
    /// One lock per command name, held from load to save.
    edit_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PermCommand {
    pub fn new(policies: Arc<dyn PolicyStore>, roles: Arc<dyn RoleStore>) -> Self {
        Self {
            policies,
            roles,
            edit_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_command(&self, command: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.edit_locks.lock().await;
            Arc::clone(locks.entry(command.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    async fn load_or_restrictive(&self, command: &str) -> Result<PermissionPolicy> {
        Ok(self
            .policies
            .load_policy(command)
            .await?
            .unwrap_or_else(|| PermissionPolicy::restrictive(command)))
    }

    async fn save(&self, ctx: &CommandContext<'_>, policy: &PermissionPolicy, done: String) -> Result<()> {
        if let Err(e) = self.policies.save_policy(policy).await {
            ctx.notice(format!("Failed to save permission: {}", e));
            return Err(e);
        }
        info!(
            "User {} updated permissions of '{}'",
            ctx.message.user_id, policy.command
        );
        ctx.notice(done);
        Ok(())
    }

    /// `set <cmd> <key> <value>`
    async fn handle_set(&self, ctx: &CommandContext<'_>) -> Result<()> {
        if ctx.args.len() < 5 {
            ctx.notice("Usage: /perm set <cmd> <key> <value>");
            return Ok(());
        }
        let (command, key, value) = (ctx.text_arg(2), ctx.text_arg(3), ctx.text_arg(4));
        if ctx.registry.get(command).is_none() {
            ctx.notice(format!("Unknown command: {}", command));
            return Ok(());
        }

        let _edit = self.lock_command(command).await;
        let mut policy = self.load_or_restrictive(command).await?;
        match key {
            "user_default" => match value.parse::<Role>() {
                Ok(role) => policy.user_default = role,
                Err(_) => {
                    ctx.notice("Invalid user_default. Use 0/guest, 1/admin, 2/master");
                    return Ok(());
                }
            },
            "group_default" => match value.parse::<GroupDefault>() {
                Ok(default) => policy.group_default = default,
                Err(_) => {
                    ctx.notice("Invalid group_default. Use enable or disable");
                    return Ok(());
                }
            },
            _ => {
                ctx.notice(format!("Unknown key: {}", key));
                return Ok(());
            }
        }

        self.save(ctx, &policy, format!("Updated {} {} to {}", command, key, value))
            .await
    }

    /// `allow|reject <cmd> <user|group> <add|rm|list> [targets...]`
    async fn handle_list(&self, ctx: &CommandContext<'_>, kind: ListKind) -> Result<()> {
        let sub = ctx.text_arg(1);
        if ctx.args.len() < 5 {
            ctx.notice(format!(
                "Usage: /perm {} <cmd> <user|group> <add|rm|list> [targets...]",
                sub
            ));
            return Ok(());
        }
        let (command, action) = (ctx.text_arg(2), ctx.text_arg(4));
        if ctx.registry.get(command).is_none() {
            ctx.notice(format!("Unknown command: {}", command));
            return Ok(());
        }
        let Ok(scope) = ctx.text_arg(3).parse::<Scope>() else {
            ctx.notice("Invalid target type. Must be user or group.");
            return Ok(());
        };

        let _edit = self.lock_command(command).await;
        let mut policy = self.load_or_restrictive(command).await?;
        let targets = extract_targets(&ctx.args[5..], scope);
        let list = policy.list_mut(kind, scope);

        let done = match action {
            "list" => {
                if list.is_empty() {
                    ctx.notice("List is empty.");
                } else {
                    let ids: Vec<String> = list.iter().map(|id| id.to_string()).collect();
                    ctx.notice(ids.join(", "));
                }
                return Ok(());
            }
            "add" | "rm" if targets.is_empty() => {
                ctx.notice(format!("No {}s specified.", scope));
                return Ok(());
            }
            "add" => {
                let count = targets.into_iter().filter(|id| list.insert(*id)).count();
                format!("Added {} {}s to the {} list of {}.", count, scope, sub, command)
            }
            "rm" => {
                let count = targets.iter().filter(|id| list.remove(*id)).count();
                format!("Removed {} {}s from the {} list of {}.", count, scope, sub, command)
            }
            _ => {
                ctx.notice(format!("Unknown action: {}", action));
                return Ok(());
            }
        };

        self.save(ctx, &policy, done).await
    }

    /// `user <target> <level>`
    async fn handle_user(&self, ctx: &CommandContext<'_>) -> Result<()> {
        if ctx.args.len() < 4 {
            ctx.notice("Usage: /perm user <target> <level>\nLevels: 0/guest, 1/admin, 2/master");
            return Ok(());
        }
        let target = match &ctx.args[2] {
            Segment::Mention(id) => Some(*id),
            Segment::Text(text) => text.trim().parse::<u64>().ok(),
            _ => None,
        };
        let Some(target) = target.filter(|id| *id != 0) else {
            ctx.notice("Invalid user target.");
            return Ok(());
        };
        let Ok(role) = ctx.text_arg(3).parse::<Role>() else {
            ctx.notice("Invalid level. Usage: 0/guest, 1/admin, 2/master");
            return Ok(());
        };

        if let Err(e) = self.roles.set_user_role(target, role).await {
            ctx.notice(format!("Failed to update user role: {}", e));
            return Err(e);
        }
        info!("User {} set role of {} to {}", ctx.message.user_id, target, role);
        ctx.notice(format!("Updated user {} role to {}", target, role));
        Ok(())
    }
}

pub(super) fn spec(policies: Arc<dyn PolicyStore>, roles: Arc<dyn RoleStore>) -> CommandSpec {
    CommandSpec::new("perm", PERM_HELP, PermCommand::new(policies, roles))
        .with_role(Role::Master)
        .min_args(2)
}

/// User targets come from mentions or numeric words; group targets only from
/// numeric words.
fn extract_targets(args: &[Segment], scope: Scope) -> Vec<u64> {
    let mut targets = Vec::new();
    for arg in args {
        match arg {
            Segment::Mention(id) if scope == Scope::User => targets.push(*id),
            Segment::Text(text) => targets.extend(
                text.split_whitespace()
                    .filter_map(|word| word.parse::<u64>().ok()),
            ),
            _ => {}
        }
    }
    targets
}

#[async_trait]
impl CommandHandler for PermCommand {
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<()> {
        match ctx.text_arg(1) {
            "set" => self.handle_set(ctx).await,
            "allow" => self.handle_list(ctx, ListKind::Allow).await,
            "reject" => self.handle_list(ctx, ListKind::Reject).await,
            "user" => self.handle_user(ctx).await,
            other => {
                ctx.notice(format!("Unknown subcommand: {}", other));
                Ok(())
            }
        }
    }
}
