//! Hurobot Configuration
//!
//! TOML configuration loading and the role hierarchy shared by every crate

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_DATA_DIR_NAME: &str = ".hurobot";
const DEFAULT_DB_FILE: &str = "hurobot.db";
const DEFAULT_MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub master_id: u64,
    #[serde(default)]
    pub bot_id: Option<u64>,
    #[serde(default)]
    pub admin_ids: Vec<u64>,
}

impl PermissionsConfig {
    pub fn is_master(&self, user_id: u64) -> bool {
        self.master_id != 0 && self.master_id == user_id
    }

    /// Role granted by the config file alone, `None` when the config is silent.
    pub fn configured_role(&self, user_id: u64) -> Option<Role> {
        if self.is_master(user_id) {
            Some(Role::Master)
        } else if self.admin_ids.contains(&user_id) {
            Some(Role::Admin)
        } else {
            None
        }
    }

    pub fn is_bot(&self, user_id: u64) -> bool {
        self.bot_id == Some(user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Three-tier role hierarchy, ordered `Guest < Admin < Master`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Guest,
    Admin,
    Master,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Admin => "admin",
            Role::Master => "master",
        }
    }

    /// Numeric level used by the persisted `perm` columns.
    pub fn level(self) -> i64 {
        match self {
            Role::Guest => 0,
            Role::Admin => 1,
            Role::Master => 2,
        }
    }

    /// `None` for levels outside 0..=2. Callers pick the safe fallback for
    /// what the level guards.
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Role::Guest),
            1 => Some(Role::Admin),
            2 => Some(Role::Master),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRoleError(String);

impl fmt::Display for ParseRoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid role '{}', expected guest|admin|master (or 0|1|2)",
            self.0
        )
    }
}

impl std::error::Error for ParseRoleError {}

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "guest" => Ok(Role::Guest),
            "1" | "admin" => Ok(Role::Admin),
            "2" | "master" => Ok(Role::Master),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hurobot").join("config.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let perms = &self.permissions;
        if perms.master_id == 0 {
            anyhow::bail!("permissions.master_id must be set");
        }
        if perms.admin_ids.contains(&perms.master_id) {
            anyhow::bail!(
                "permissions.admin_ids must not contain the master id {}",
                perms.master_id
            );
        }
        let mut seen = HashSet::new();
        for id in &perms.admin_ids {
            if !seen.insert(*id) {
                anyhow::bail!("Duplicate admin id {}", id);
            }
        }
        if perms.bot_id == Some(perms.master_id) {
            anyhow::bail!("permissions.bot_id must differ from master_id");
        }
        if self.dispatch.max_concurrency == 0 {
            anyhow::bail!("dispatch.max_concurrency must be at least 1");
        }
        if let Some(level) = self.core.log_level.as_deref() {
            if level.trim().is_empty() {
                anyhow::bail!("core.log_level cannot be empty");
            }
        }
        Ok(())
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or("info")
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match self.core.data_dir.as_deref() {
            Some(dir) => Ok(expand_home(dir)),
            None => dirs::home_dir()
                .map(|home| home.join(DEFAULT_DATA_DIR_NAME))
                .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory")),
        }
    }

    /// Database location; relative paths resolve under the data dir.
    pub fn storage_path(&self) -> anyhow::Result<PathBuf> {
        let path = self.storage.path.as_deref().unwrap_or(DEFAULT_DB_FILE);
        let path = expand_home(path);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.data_dir()?.join(path))
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::{Config, Role};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let cfg = parse_config(
            r#"
[permissions]
master_id = 10001
"#,
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.dispatch.max_concurrency, 8);
        assert_eq!(cfg.log_level(), "info");
    }

    #[test]
    fn validate_rejects_missing_master() {
        let cfg = parse_config(
            r#"
[core]
log_level = "debug"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_master_listed_as_admin() {
        let cfg = parse_config(
            r#"
[permissions]
master_id = 10001
admin_ids = [20002, 10001]
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let cfg = parse_config(
            r#"
[permissions]
master_id = 10001

[dispatch]
max_concurrency = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn configured_role_follows_master_and_admin_ids() {
        let cfg = parse_config(
            r#"
[permissions]
master_id = 1
bot_id = 9
admin_ids = [2, 3]
"#,
        );
        let perms = &cfg.permissions;
        assert_eq!(perms.configured_role(1), Some(Role::Master));
        assert_eq!(perms.configured_role(3), Some(Role::Admin));
        assert_eq!(perms.configured_role(4), None);
        assert!(perms.is_bot(9));
        assert!(!perms.is_bot(1));
    }

    #[test]
    fn relative_storage_path_resolves_under_data_dir() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/var/lib/hurobot"

[permissions]
master_id = 1

[storage]
path = "bot.db"
"#,
        );
        let path = cfg.storage_path().expect("storage path");
        assert_eq!(path, std::path::PathBuf::from("/var/lib/hurobot/bot.db"));
    }

    #[test]
    fn role_order_and_parsing() {
        assert!(Role::Guest < Role::Admin);
        assert!(Role::Admin < Role::Master);
        assert_eq!("ADMIN".parse::<Role>(), Ok(Role::Admin));
        assert_eq!("2".parse::<Role>(), Ok(Role::Master));
        assert!("owner".parse::<Role>().is_err());
        assert_eq!(Role::from_level(Role::Admin.level()), Some(Role::Admin));
        assert_eq!(Role::from_level(42), None);
        assert_eq!(Role::from_level(-1), None);
    }
}
