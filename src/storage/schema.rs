//! SQL schema definitions as const strings.
//!
//! Contains the SQLite schema for the state the pipeline owns: registered
//! accounts, sync cursors and the delivery ledger.

/// SQL to create the accounts table.
///
/// Passwords are kept in the OS keychain, never in this table.
pub const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    use_tls INTEGER NOT NULL DEFAULT 1,
    folders TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the sync cursor table.
pub const CREATE_SYNC_CURSORS: &str = r#"
CREATE TABLE IF NOT EXISTS sync_cursors (
    account_id TEXT NOT NULL,
    folder TEXT NOT NULL,
    uid_validity INTEGER NOT NULL,
    last_uid INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, folder)
)
"#;

/// SQL to create the delivery ledger table.
pub const CREATE_DELIVERIES: &str = r#"
CREATE TABLE IF NOT EXISTS deliveries (
    message_key TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    folder TEXT NOT NULL,
    uid INTEGER NOT NULL,
    indexed INTEGER NOT NULL DEFAULT 0,
    notified INTEGER NOT NULL DEFAULT 0,
    pending_notification TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create delivery ledger indexes.
pub const CREATE_DELIVERY_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_deliveries_account ON deliveries(account_id);
CREATE INDEX IF NOT EXISTS idx_deliveries_pending ON deliveries(indexed)
    WHERE pending_notification IS NOT NULL
"#;

/// Returns all migration statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_ACCOUNTS,
        CREATE_SYNC_CURSORS,
        CREATE_DELIVERIES,
        CREATE_DELIVERY_INDEXES,
    ]
}
