//! Built-in commands

mod delete;
mod echo;
mod help;
mod perm;

pub use delete::DeleteCommand;
pub use echo::EchoCommand;
pub use help::HelpCommand;
pub use perm::PermCommand;

use crate::registry::{CommandRegistry, RegistryError};
use hurobot_policy::{PolicyStore, RoleStore};
use std::sync::Arc;

pub fn register_builtins(
    registry: &mut CommandRegistry,
    policies: Arc<dyn PolicyStore>,
    roles: Arc<dyn RoleStore>,
) -> Result<(), RegistryError> {
    registry.register(echo::spec())?;
    registry.register(help::spec())?;
    registry.register(delete::spec())?;
    registry.register(perm::spec(policies, roles))?;
    Ok(())
}
