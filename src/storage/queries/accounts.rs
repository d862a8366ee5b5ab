//! Registered account persistence.
//!
//! Stores everything about an account except its password, which lives in
//! the keychain under [`KeychainAccess::imap_password_key`].
//!
//! [`KeychainAccess::imap_password_key`]: crate::storage::KeychainAccess::imap_password_key

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{Account, AccountId, Credentials, ServerEndpoint};
use crate::storage::database::{Database, DatabaseError, Result};

/// An account as stored in the database, without its password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAccount {
    pub id: AccountId,
    pub username: String,
    pub endpoint: ServerEndpoint,
    pub folders: Vec<String>,
}

impl StoredAccount {
    /// Builds the runtime account once the password has been looked up.
    pub fn into_account(self, password: String) -> Account {
        Account {
            id: self.id,
            credentials: Credentials {
                username: self.username,
                password,
            },
            endpoint: self.endpoint,
            folders: self.folders,
        }
    }
}

impl From<&Account> for StoredAccount {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            username: account.credentials.username.clone(),
            endpoint: account.endpoint.clone(),
            folders: account.folders.clone(),
        }
    }
}

/// Inserts an account, replacing any previous row with the same id.
pub async fn upsert(db: &Database, account: &StoredAccount) -> Result<()> {
    let account = account.clone();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        let folders = serde_json::to_string(&account.folders)
            .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO accounts (id, username, host, port, use_tls, folders, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                host = excluded.host,
                port = excluded.port,
                use_tls = excluded.use_tls,
                folders = excluded.folders,
                updated_at = excluded.updated_at
            "#,
            params![
                account.id.0,
                account.username,
                account.endpoint.host,
                account.endpoint.port,
                account.endpoint.use_tls as i32,
                folders,
                now,
            ],
        )?;

        Ok(())
    })
    .await
}

/// Retrieves an account by its ID.
pub async fn get_by_id(db: &Database, account_id: &AccountId) -> Result<Option<StoredAccount>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, username, host, port, use_tls, folders FROM accounts WHERE id = ?1",
        )?;
        let result = stmt.query_row([&account_id.0], row_to_account).optional()?;
        Ok(result)
    })
    .await
}

/// Lists all stored accounts ordered by id.
pub async fn list(db: &Database) -> Result<Vec<StoredAccount>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, username, host, port, use_tls, folders FROM accounts ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_account)?;
        let accounts: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(accounts?)
    })
    .await
}

/// Deletes an account. Returns whether a row was removed.
pub async fn delete(db: &Database, account_id: &AccountId) -> Result<bool> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let removed = conn.execute("DELETE FROM accounts WHERE id = ?1", [&account_id.0])?;
        Ok(removed > 0)
    })
    .await
}

fn row_to_account(row: &Row<'_>) -> std::result::Result<StoredAccount, rusqlite::Error> {
    let folders_json: String = row.get(5)?;
    let folders: Vec<String> = serde_json::from_str(&folders_json).unwrap_or_default();

    Ok(StoredAccount {
        id: AccountId(row.get(0)?),
        username: row.get(1)?,
        endpoint: ServerEndpoint {
            host: row.get(2)?,
            port: row.get(3)?,
            use_tls: row.get::<_, i32>(4)? != 0,
        },
        folders,
    })
}
