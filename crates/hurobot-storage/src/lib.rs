//! Hurobot Storage
//!
//! SQLite persistence for command policies, user roles, and the message log

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hurobot_config::{PermissionsConfig, Role};
use hurobot_ipc::{Message, UserId};
use hurobot_policy::{GroupDefault, PermissionPolicy, PolicyStore, RoleResolver, RoleStore};
use rusqlite::OptionalExtension;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct Storage {
    conn: rusqlite::Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub msg_id: u64,
    pub user_id: u64,
    pub group_id: u64,
    pub raw: String,
    pub is_cmd: bool,
    pub time: String,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                perm INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                msg_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                raw TEXT NOT NULL,
                is_cmd INTEGER NOT NULL DEFAULT 0,
                time DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id);
            CREATE INDEX IF NOT EXISTS idx_messages_group ON messages(group_id);

            CREATE TABLE IF NOT EXISTS permissions (
                command TEXT PRIMARY KEY,
                user_default TEXT NOT NULL DEFAULT 'master',
                group_default TEXT NOT NULL DEFAULT 'disable',
                allow_users TEXT NOT NULL DEFAULT '',
                reject_users TEXT NOT NULL DEFAULT '',
                allow_groups TEXT NOT NULL DEFAULT '',
                reject_groups TEXT NOT NULL DEFAULT ''
            );
            ",
        )?;

        Ok(Self { conn })
    }

    pub fn get_policy(&self, command: &str) -> Result<Option<PermissionPolicy>> {
        let mut stmt = self.conn.prepare(
            "SELECT command, user_default, group_default, allow_users, reject_users, allow_groups, reject_groups
             FROM permissions WHERE command = ?1",
        )?;
        let row = stmt
            .query_row([command], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;

        let Some((command, user_default, group_default, allow_users, reject_users, allow_groups, reject_groups)) =
            row
        else {
            return Ok(None);
        };

        // Unreadable defaults degrade to the restrictive value.
        let user_default = user_default.parse::<Role>().unwrap_or(Role::Master);
        let group_default = group_default
            .parse::<GroupDefault>()
            .unwrap_or(GroupDefault::Disabled);

        Ok(Some(PermissionPolicy {
            command,
            user_default,
            group_default,
            allow_users: parse_id_list(&allow_users),
            reject_users: parse_id_list(&reject_users),
            allow_groups: parse_id_list(&allow_groups),
            reject_groups: parse_id_list(&reject_groups),
        }))
    }

    pub fn save_policy(&self, policy: &PermissionPolicy) -> Result<()> {
        self.conn.execute(
            "INSERT INTO permissions (command, user_default, group_default, allow_users, reject_users, allow_groups, reject_groups)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(command)
             DO UPDATE SET user_default = excluded.user_default,
                           group_default = excluded.group_default,
                           allow_users = excluded.allow_users,
                           reject_users = excluded.reject_users,
                           allow_groups = excluded.allow_groups,
                           reject_groups = excluded.reject_groups",
            (
                &policy.command,
                policy.user_default.as_str(),
                policy.group_default.as_str(),
                join_id_list(&policy.allow_users),
                join_id_list(&policy.reject_users),
                join_id_list(&policy.allow_groups),
                join_id_list(&policy.reject_groups),
            ),
        )?;
        Ok(())
    }

    pub fn get_user_perm(&self, user_id: UserId) -> Result<Option<Role>> {
        let mut stmt = self
            .conn
            .prepare("SELECT perm FROM users WHERE user_id = ?1")?;
        let level: Option<i64> = stmt
            .query_row([sql_id(user_id)?], |row| row.get(0))
            .optional()?;
        Ok(level.map(|level| {
            Role::from_level(level).unwrap_or_else(|| {
                warn!(
                    "User {} has unreadable perm level {}, treating as guest",
                    user_id, level
                );
                Role::Guest
            })
        }))
    }

    pub fn set_user_perm(&self, user_id: UserId, role: Role) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (user_id, perm) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET perm = excluded.perm",
            (sql_id(user_id)?, role.level()),
        )?;
        Ok(())
    }

    /// Records the message and refreshes the sender's display name.
    pub fn store_message(&self, message: &Message, is_cmd: bool) -> Result<()> {
        let time = chrono::DateTime::from_timestamp(message.time, 0)
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339();
        let user_id = sql_id(message.user_id)?;

        let tx = self.conn.unchecked_transaction()?;
        if !message.nickname.is_empty() {
            tx.execute(
                "INSERT INTO users (user_id, name) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET name = excluded.name
                 WHERE users.name <> excluded.name",
                (user_id, &message.nickname),
            )?;
        }
        tx.execute(
            "INSERT INTO messages (msg_id, user_id, group_id, raw, is_cmd, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                sql_id(message.message_id)?,
                user_id,
                sql_id(message.group_id)?,
                &message.raw,
                if is_cmd { 1 } else { 0 },
                time,
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent log entries first.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT msg_id, user_id, group_id, raw, is_cmd, time
             FROM messages ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], |row| {
            Ok(StoredMessage {
                msg_id: row_id(row, 0)?,
                user_id: row_id(row, 1)?,
                group_id: row_id(row, 2)?,
                raw: row.get(3)?,
                is_cmd: row.get::<_, i64>(4)? != 0,
                time: row.get(5)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| anyhow!("id {} does not fit in an SQLite integer", id))
}

fn row_id(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

/// Parses a comma separated id list, skipping empty and non-numeric parts.
pub fn parse_id_list(s: &str) -> BTreeSet<u64> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

pub fn join_id_list(ids: &BTreeSet<u64>) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// [`Storage`] behind an async lock, serving the policy and role seams.
///
/// Every access takes the same lock, so writes are serialized and visible to
/// the next read from any task.
#[derive(Clone)]
pub struct SqliteStore {
    storage: Arc<Mutex<Storage>>,
    permissions: PermissionsConfig,
}

impl SqliteStore {
    pub fn new(storage: Arc<Mutex<Storage>>, permissions: PermissionsConfig) -> Self {
        Self {
            storage,
            permissions,
        }
    }

    pub fn storage(&self) -> &Arc<Mutex<Storage>> {
        &self.storage
    }
}

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn load_policy(&self, command: &str) -> Result<Option<PermissionPolicy>> {
        self.storage.lock().await.get_policy(command)
    }

    async fn save_policy(&self, policy: &PermissionPolicy) -> Result<()> {
        debug!("Saving policy for '{}'", policy.command);
        self.storage.lock().await.save_policy(policy)
    }
}

#[async_trait]
impl RoleResolver for SqliteStore {
    async fn resolve_user_role(&self, user_id: UserId) -> Result<Role> {
        if let Some(role) = self.permissions.configured_role(user_id) {
            return Ok(role);
        }
        let stored = self.storage.lock().await.get_user_perm(user_id)?;
        Ok(stored.unwrap_or_default())
    }
}

#[async_trait]
impl RoleStore for SqliteStore {
    async fn set_user_role(&self, user_id: UserId, role: Role) -> Result<()> {
        self.storage.lock().await.set_user_perm(user_id, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hurobot_ipc::Segment;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("hurobot-storage-{}-{}.db", name, ts))
    }

    fn sample_policy() -> PermissionPolicy {
        let mut policy = PermissionPolicy::with_user_default("draw", Role::Admin);
        policy.group_default = GroupDefault::Enabled;
        policy.allow_users.extend([10, 11]);
        policy.reject_users.insert(12);
        policy.allow_groups.insert(500);
        policy.reject_groups.extend([600, 601]);
        policy
    }

    #[test]
    fn policy_round_trip() {
        let storage = Storage::new(temp_db_path("policy")).expect("storage init");
        let policy = sample_policy();
        storage.save_policy(&policy).expect("save");
        assert_eq!(storage.get_policy("draw").expect("load"), Some(policy));
        assert_eq!(storage.get_policy("missing").expect("load"), None);
    }

    #[test]
    fn save_policy_overwrites_existing_row() {
        let storage = Storage::new(temp_db_path("overwrite")).expect("storage init");
        let mut policy = sample_policy();
        storage.save_policy(&policy).expect("first save");

        policy.user_default = Role::Guest;
        policy.allow_users.clear();
        storage.save_policy(&policy).expect("second save");

        let loaded = storage.get_policy("draw").expect("load").expect("present");
        assert_eq!(loaded.user_default, Role::Guest);
        assert!(loaded.allow_users.is_empty());
    }

    #[test]
    fn corrupt_policy_columns_fall_back_to_restrictive() {
        let storage = Storage::new(temp_db_path("corrupt")).expect("storage init");
        storage
            .conn
            .execute(
                "INSERT INTO permissions (command, user_default, group_default, allow_users)
                 VALUES ('sh', 'root', 'sometimes', '1,,x,2')",
                [],
            )
            .expect("seed");

        let policy = storage.get_policy("sh").expect("load").expect("present");
        assert_eq!(policy.user_default, Role::Master);
        assert_eq!(policy.group_default, GroupDefault::Disabled);
        assert_eq!(policy.allow_users, BTreeSet::from([1, 2]));
    }

    #[test]
    fn user_roles_upsert() {
        let storage = Storage::new(temp_db_path("roles")).expect("storage init");
        assert_eq!(storage.get_user_perm(7).expect("get"), None);
        storage.set_user_perm(7, Role::Admin).expect("set");
        assert_eq!(storage.get_user_perm(7).expect("get"), Some(Role::Admin));
        storage.set_user_perm(7, Role::Guest).expect("set");
        assert_eq!(storage.get_user_perm(7).expect("get"), Some(Role::Guest));
    }

    #[tokio::test]
    async fn unreadable_perm_level_resolves_to_guest() {
        let storage = Storage::new(temp_db_path("bad-level")).expect("storage init");
        for (user_id, perm) in [(7, 9), (8, -1)] {
            storage
                .conn
                .execute(
                    "INSERT INTO users (user_id, perm) VALUES (?1, ?2)",
                    (user_id, perm),
                )
                .expect("seed");
        }
        assert_eq!(storage.get_user_perm(7).expect("get"), Some(Role::Guest));

        let store = SqliteStore::new(Arc::new(Mutex::new(storage)), PermissionsConfig::default());
        assert_eq!(store.resolve_user_role(7).await.expect("role"), Role::Guest);
        assert_eq!(store.resolve_user_role(8).await.expect("role"), Role::Guest);
    }

    #[test]
    fn negative_ids_in_log_are_rejected() {
        let storage = Storage::new(temp_db_path("negative-id")).expect("storage init");
        storage
            .conn
            .execute(
                "INSERT INTO messages (msg_id, user_id, group_id, raw, is_cmd, time)
                 VALUES (1, -5, 0, 'x', 0, '2024-01-01T00:00:00+00:00')",
                [],
            )
            .expect("seed");
        assert!(storage.recent_messages(10).is_err());
    }

    #[test]
    fn store_message_logs_and_keeps_role() {
        let storage = Storage::new(temp_db_path("messages")).expect("storage init");
        storage.set_user_perm(5, Role::Admin).expect("set");

        let msg = Message::from_segments(vec![Segment::text("/echo hi")])
            .with_sender(5, 500)
            .with_message_id(99)
            .with_nickname("alice")
            .with_time(1_700_000_000);
        storage.store_message(&msg, true).expect("store");

        let logged = storage.recent_messages(10).expect("recent");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].msg_id, 99);
        assert_eq!(logged[0].group_id, 500);
        assert_eq!(logged[0].raw, "/echo hi");
        assert!(logged[0].is_cmd);
        assert!(logged[0].time.starts_with("2023-11-14T22:13:20"));

        let name: String = storage
            .conn
            .query_row("SELECT name FROM users WHERE user_id = 5", [], |row| row.get(0))
            .expect("user");
        assert_eq!(name, "alice");
        assert_eq!(storage.get_user_perm(5).expect("get"), Some(Role::Admin));
    }

    #[test]
    fn id_list_helpers() {
        assert_eq!(parse_id_list(""), BTreeSet::new());
        assert_eq!(parse_id_list(" 3, 1 ,3"), BTreeSet::from([1, 3]));
        assert_eq!(join_id_list(&BTreeSet::from([9, 2])), "2,9");
    }

    #[tokio::test]
    async fn sqlite_store_resolves_config_before_table() {
        let storage = Storage::new(temp_db_path("resolver")).expect("storage init");
        let store = SqliteStore::new(
            Arc::new(Mutex::new(storage)),
            PermissionsConfig {
                master_id: 1,
                bot_id: None,
                admin_ids: vec![2],
            },
        );

        store.set_user_role(2, Role::Guest).await.expect("set");
        store.set_user_role(3, Role::Admin).await.expect("set");

        assert_eq!(store.resolve_user_role(1).await.expect("role"), Role::Master);
        assert_eq!(store.resolve_user_role(2).await.expect("role"), Role::Admin);
        assert_eq!(store.resolve_user_role(3).await.expect("role"), Role::Admin);
        assert_eq!(store.resolve_user_role(4).await.expect("role"), Role::Guest);

        let policy = sample_policy();
        store.save_policy(&policy).await.expect("save");
        assert_eq!(store.load_policy("draw").await.expect("load"), Some(policy));
    }
}
