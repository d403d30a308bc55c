//! Command table built once at startup

use anyhow::Result;
use async_trait::async_trait;
use hurobot_config::Role;
use hurobot_ipc::{Message, MessageId, Outbox, Segment};
use hurobot_policy::{PermissionPolicy, PolicyStore};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

const MAX_COMMAND_NAME_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command {0:?} is already registered")]
    Duplicate(String),

    #[error("invalid command name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// Everything a handler sees for one accepted invocation.
pub struct CommandContext<'a> {
    pub message: &'a Message,
    /// Final argument list, `args[0]` is the command name.
    pub args: Vec<Segment>,
    /// Reply/mention segments that preceded the command text.
    pub prefix: &'a [Segment],
    pub outbox: &'a Outbox,
    pub registry: &'a CommandRegistry,
}

impl CommandContext<'_> {
    /// Trimmed text of argument `index`, empty for non-text or missing
    /// arguments.
    pub fn text_arg(&self, index: usize) -> &str {
        self.args
            .get(index)
            .and_then(Segment::as_text)
            .map_or("", str::trim)
    }

    /// Message referenced by a reply prefix.
    pub fn reply_id(&self) -> Option<MessageId> {
        self.prefix.iter().find_map(|segment| match segment {
            Segment::Reply(id) => Some(*id),
            _ => None,
        })
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.outbox.notice(self.message, text);
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<()>;
}

#[derive(Clone)]
pub struct CommandSpec {
    pub name: String,
    pub help: String,
    pub required_role: Role,
    pub allow_prefix: bool,
    pub need_raw_message: bool,
    pub min_args: usize,
    /// 0 means unbounded.
    pub max_args: usize,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandSpec {
    /// Master-only, no prefix, split arguments, any arity.
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            required_role: Role::Master,
            allow_prefix: false,
            need_raw_message: false,
            min_args: 0,
            max_args: 0,
            handler: Arc::new(handler),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.required_role = role;
        self
    }

    pub fn allow_prefix(mut self) -> Self {
        self.allow_prefix = true;
        self
    }

    pub fn need_raw_message(mut self) -> Self {
        self.need_raw_message = true;
        self
    }

    pub fn min_args(mut self, min: usize) -> Self {
        self.min_args = min;
        self
    }

    pub fn max_args(mut self, max: usize) -> Self {
        self.max_args = max;
        self
    }

    /// `count` includes the command name.
    pub fn accepts_arity(&self, count: usize) -> bool {
        count >= self.min_args && (self.max_args == 0 || count <= self.max_args)
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("required_role", &self.required_role)
            .field("allow_prefix", &self.allow_prefix)
            .field("need_raw_message", &self.need_raw_message)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let invalid = |reason| RegistryError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_COMMAND_NAME_LEN {
        return Err(invalid("too long"));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(invalid("contains whitespace or '/'"));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: CommandSpec) -> Result<(), RegistryError> {
        validate_name(&spec.name)?;
        if self.commands.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        self.commands.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    /// Commands in name order.
    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Stores a starting policy for every command that has none yet, using
    /// the command's declared role and a disabled group default. Returns the
    /// number of policies written.
    pub async fn seed_policies(&self, store: &dyn PolicyStore) -> Result<usize> {
        let mut seeded = 0;
        for spec in self.commands.values() {
            if store.load_policy(&spec.name).await?.is_some() {
                continue;
            }
            store
                .save_policy(&PermissionPolicy::with_user_default(
                    &spec.name,
                    spec.required_role,
                ))
                .await?;
            info!(
                "Initialized permission for command '{}' (user_default: {})",
                spec.name, spec.required_role
            );
            seeded += 1;
        }
        Ok(seeded)
    }
}
