//! The credential store.
//!
//! Accounts are keyed by the lowercased nickname; the raw nickname is kept
//! for display. The server only ever needs two operations, captured by the
//! [`UserStore`] trait: fetch a record and insert a record. The production
//! implementation talks to MySQL over a single connection guarded by the
//! store's own mutex; the schema (`users(username, username_lower,
//! password_hash, is_admin)` with a unique index on `username_lower`) is
//! provisioned out of band, as is any promotion of the `is_admin` column.

use crate::config::DbConfig;
use ember::logging::{self, Logger};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};
use parking_lot::Mutex;
use thiserror::Error;

/// MySQL error code for a violated unique index.
const ER_DUP_ENTRY: u16 = 1062;

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Raw display nickname.
    pub username: String,
    /// Encoded Argon2id hash.
    pub password_hash: String,
    pub is_admin: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("an account with this name already exists")]
    Duplicate,
    #[error("database error: {0}")]
    Backend(String),
}

/// The seam between the server core and the credential backend.
pub trait UserStore: Send + Sync {
    fn fetch_user(&self, username_lower: &str) -> Result<Option<UserRecord>, StoreError>;

    fn insert_user(
        &self,
        username: &str,
        username_lower: &str,
        password_hash: &str,
    ) -> Result<(), StoreError>;

    /// Called once during graceful shutdown.
    fn disconnect(&self) {}
}

/// MySQL-backed credential store.
pub struct MysqlStore {
    conn: Mutex<Conn>,
    log: Logger,
}

impl MysqlStore {
    /// Connect to the database described by the configuration. A failure here
    /// is fatal to startup; the caller exits.
    pub fn connect(db: &DbConfig, log: &Logger) -> Result<MysqlStore, StoreError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(db.host.clone()))
            .tcp_port(db.port)
            .user(Some(db.user.clone()))
            .pass(Some(db.password.clone()))
            .db_name(Some(db.name.clone()));

        let conn = Conn::new(opts).map_err(|err| StoreError::Backend(err.to_string()))?;

        let log = log.new(logging::o!("mod" => "store"));
        logging::info!(log, "connected to credential store";
                       "host" => db.host.as_str(), "port" => db.port, "db" => db.name.as_str());

        Ok(MysqlStore { conn: Mutex::new(conn), log })
    }
}

impl UserStore for MysqlStore {
    fn fetch_user(&self, username_lower: &str) -> Result<Option<UserRecord>, StoreError> {
        let mut conn = self.conn.lock();

        let row: Option<(String, String, bool)> = conn
            .exec_first(
                "SELECT username, password_hash, is_admin \
                 FROM users WHERE username_lower = ?",
                (username_lower,),
            )
            .map_err(|err| {
                logging::error!(self.log, "user lookup failed";
                                "username_lower" => username_lower, "error" => %err);
                StoreError::Backend(err.to_string())
            })?;

        Ok(row.map(|(username, password_hash, is_admin)| UserRecord {
            username,
            password_hash,
            is_admin,
        }))
    }

    fn insert_user(
        &self,
        username: &str,
        username_lower: &str,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();

        let inserted = conn.exec_drop(
            "INSERT INTO users (username, username_lower, password_hash) VALUES (?, ?, ?)",
            (username, username_lower, password_hash),
        );

        match inserted {
            Ok(()) => {
                logging::info!(self.log, "new user registered"; "username" => username);
                Ok(())
            }
            Err(mysql::Error::MySqlError(ref server_err)) if server_err.code == ER_DUP_ENTRY => {
                logging::warn!(self.log, "registration rejected, name taken";
                               "username" => username);
                Err(StoreError::Duplicate)
            }
            Err(err) => {
                logging::error!(self.log, "user insert failed";
                                "username" => username, "error" => %err);
                Err(StoreError::Backend(err.to_string()))
            }
        }
    }

    fn disconnect(&self) {
        logging::info!(self.log, "credential store disconnected");
    }
}

/// In-memory store used by the auth and dispatcher tests.
#[cfg(test)]
pub struct MemoryStore {
    users: Mutex<hashbrown::HashMap<String, UserRecord>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore { users: Mutex::new(hashbrown::HashMap::new()) }
    }

    /// Stand-in for the out-of-band admin promotion a DBA performs.
    pub fn promote(&self, username_lower: &str) {
        if let Some(record) = self.users.lock().get_mut(username_lower) {
            record.is_admin = true;
        }
    }
}

#[cfg(test)]
impl UserStore for MemoryStore {
    fn fetch_user(&self, username_lower: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.lock().get(username_lower).cloned())
    }

    fn insert_user(
        &self,
        username: &str,
        username_lower: &str,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        let mut users = self.users.lock();
        if users.contains_key(username_lower) {
            return Err(StoreError::Duplicate);
        }
        users.insert(
            username_lower.to_string(),
            UserRecord {
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                is_admin: false,
            },
        );
        Ok(())
    }
}
