//! Hurobot Policy Engine
//!
//! Per-command permission policies and the layered resolver that decides
//! whether a user may run a command in a given group

use anyhow::Result;
use async_trait::async_trait;
use hurobot_config::{PermissionsConfig, Role};
use hurobot_ipc::{GroupId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupDefault {
    Enabled,
    #[default]
    Disabled,
}

impl GroupDefault {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupDefault::Enabled => "enable",
            GroupDefault::Disabled => "disable",
        }
    }
}

impl fmt::Display for GroupDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupDefault {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enable" | "enabled" | "1" | "true" => Ok(GroupDefault::Enabled),
            "disable" | "disabled" | "0" | "false" => Ok(GroupDefault::Disabled),
            _ => anyhow::bail!("invalid group default '{}', expected enable|disable", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Allow,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    User,
    Group,
}

impl FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Scope::User),
            "group" => Ok(Scope::Group),
            _ => anyhow::bail!("invalid target type '{}', expected user|group", s),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::User => f.write_str("user"),
            Scope::Group => f.write_str("group"),
        }
    }
}

/// Stored permission configuration for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub command: String,
    pub user_default: Role,
    pub group_default: GroupDefault,
    #[serde(default)]
    pub allow_users: BTreeSet<UserId>,
    #[serde(default)]
    pub reject_users: BTreeSet<UserId>,
    #[serde(default)]
    pub allow_groups: BTreeSet<GroupId>,
    #[serde(default)]
    pub reject_groups: BTreeSet<GroupId>,
}

impl PermissionPolicy {
    /// Master-only, disabled in every group, no list entries.
    pub fn restrictive(command: impl Into<String>) -> Self {
        Self::with_user_default(command, Role::Master)
    }

    pub fn with_user_default(command: impl Into<String>, user_default: Role) -> Self {
        Self {
            command: command.into(),
            user_default,
            group_default: GroupDefault::Disabled,
            allow_users: BTreeSet::new(),
            reject_users: BTreeSet::new(),
            allow_groups: BTreeSet::new(),
            reject_groups: BTreeSet::new(),
        }
    }

    pub fn list(&self, kind: ListKind, scope: Scope) -> &BTreeSet<u64> {
        match (kind, scope) {
            (ListKind::Allow, Scope::User) => &self.allow_users,
            (ListKind::Reject, Scope::User) => &self.reject_users,
            (ListKind::Allow, Scope::Group) => &self.allow_groups,
            (ListKind::Reject, Scope::Group) => &self.reject_groups,
        }
    }

    pub fn list_mut(&mut self, kind: ListKind, scope: Scope) -> &mut BTreeSet<u64> {
        match (kind, scope) {
            (ListKind::Allow, Scope::User) => &mut self.allow_users,
            (ListKind::Reject, Scope::User) => &mut self.reject_users,
            (ListKind::Allow, Scope::Group) => &mut self.allow_groups,
            (ListKind::Reject, Scope::Group) => &mut self.reject_groups,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Steps 3-8 of permission resolution over already-loaded data.
///
/// The master bypass is not part of this function; callers short-circuit it
/// before any policy is loaded.
pub fn evaluate(policy: &PermissionPolicy, user_id: UserId, group_id: GroupId, role: Role) -> Decision {
    // reject lists only bite below master level
    if policy.user_default < Role::Master && policy.reject_users.contains(&user_id) {
        return Decision::Deny;
    }
    if policy.user_default > Role::Guest && policy.allow_users.contains(&user_id) {
        return Decision::Allow;
    }
    if role < policy.user_default {
        return Decision::Deny;
    }
    if policy.reject_groups.contains(&group_id) {
        return Decision::Deny;
    }
    if policy.allow_groups.contains(&group_id) {
        return Decision::Allow;
    }
    match policy.group_default {
        GroupDefault::Enabled => Decision::Allow,
        GroupDefault::Disabled => Decision::Deny,
    }
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn load_policy(&self, command: &str) -> Result<Option<PermissionPolicy>>;
    async fn save_policy(&self, policy: &PermissionPolicy) -> Result<()>;
}

#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve_user_role(&self, user_id: UserId) -> Result<Role>;
}

/// Persisted per-user role column, written by administrative commands.
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn set_user_role(&self, user_id: UserId, role: Role) -> Result<()>;
}

/// Process-local policy store. Writes take the map's write lock, so a save
/// is visible to every later load.
#[derive(Default)]
pub struct MemoryPolicyStore {
    policies: RwLock<HashMap<String, PermissionPolicy>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn load_policy(&self, command: &str) -> Result<Option<PermissionPolicy>> {
        let policies = self
            .policies
            .read()
            .map_err(|_| anyhow::anyhow!("policy store lock poisoned"))?;
        Ok(policies.get(command).cloned())
    }

    async fn save_policy(&self, policy: &PermissionPolicy) -> Result<()> {
        let mut policies = self
            .policies
            .write()
            .map_err(|_| anyhow::anyhow!("policy store lock poisoned"))?;
        policies.insert(policy.command.clone(), policy.clone());
        Ok(())
    }
}

/// Roles from the config file, with in-process overrides for everyone the
/// config does not name.
#[derive(Debug, Default)]
pub struct MemoryRoles {
    permissions: PermissionsConfig,
    assigned: RwLock<HashMap<UserId, Role>>,
}

impl MemoryRoles {
    pub fn new(permissions: PermissionsConfig) -> Self {
        Self {
            permissions,
            assigned: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RoleResolver for MemoryRoles {
    async fn resolve_user_role(&self, user_id: UserId) -> Result<Role> {
        if let Some(role) = self.permissions.configured_role(user_id) {
            return Ok(role);
        }
        let assigned = self
            .assigned
            .read()
            .map_err(|_| anyhow::anyhow!("role table lock poisoned"))?;
        Ok(assigned.get(&user_id).copied().unwrap_or_default())
    }
}

#[async_trait]
impl RoleStore for MemoryRoles {
    async fn set_user_role(&self, user_id: UserId, role: Role) -> Result<()> {
        let mut assigned = self
            .assigned
            .write()
            .map_err(|_| anyhow::anyhow!("role table lock poisoned"))?;
        assigned.insert(user_id, role);
        Ok(())
    }
}

#[derive(Clone)]
pub struct PermissionResolver {
    master_id: UserId,
    store: Arc<dyn PolicyStore>,
    roles: Arc<dyn RoleResolver>,
}

impl PermissionResolver {
    pub fn new(master_id: UserId, store: Arc<dyn PolicyStore>, roles: Arc<dyn RoleResolver>) -> Self {
        Self {
            master_id,
            store,
            roles,
        }
    }

    /// Resolves a decision, propagating store and role lookup failures.
    pub async fn check(&self, command: &str, user_id: UserId, group_id: GroupId) -> Result<Decision> {
        if user_id == self.master_id {
            return Ok(Decision::Allow);
        }

        let policy = match self.store.load_policy(command).await? {
            Some(policy) => policy,
            None => {
                debug!("No stored policy for '{}', using master-only default", command);
                PermissionPolicy::restrictive(command)
            }
        };
        let role = self.roles.resolve_user_role(user_id).await?;

        Ok(evaluate(&policy, user_id, group_id, role))
    }

    /// Like [`check`](Self::check) but never fails: lookup errors resolve
    /// against the most restrictive policy.
    pub async fn resolve(&self, command: &str, user_id: UserId, group_id: GroupId) -> Decision {
        match self.check(command, user_id, group_id).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    "Permission lookup for '{}' failed, falling back to master-only: {}",
                    command, e
                );
                self.fallback(command, user_id, group_id)
            }
        }
    }

    fn fallback(&self, command: &str, user_id: UserId, group_id: GroupId) -> Decision {
        if user_id == self.master_id {
            return Decision::Allow;
        }
        evaluate(
            &PermissionPolicy::restrictive(command),
            user_id,
            group_id,
            Role::Guest,
        )
    }
}
