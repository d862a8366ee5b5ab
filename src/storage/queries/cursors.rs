//! Sync cursor operations.
//!
//! Cursors are keyed by (account_id, folder). Within one UIDVALIDITY epoch
//! `last_uid` never decreases, whatever order the writes arrive in.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{AccountId, SyncCursor};
use crate::storage::database::{Database, Result};

/// Retrieves the cursor for a folder.
pub async fn get(db: &Database, account_id: &AccountId, folder: &str) -> Result<Option<SyncCursor>> {
    let account_id = account_id.clone();
    let folder = folder.to_string();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT account_id, folder, uid_validity, last_uid, updated_at
            FROM sync_cursors
            WHERE account_id = ?1 AND folder = ?2
            "#,
        )?;
        let cursor = stmt
            .query_row(params![account_id.0, folder], row_to_cursor)
            .optional()?;
        Ok(cursor)
    })
    .await
}

/// Moves the cursor forward to `uid` and returns the stored cursor.
///
/// A lower `uid` in the same epoch leaves the cursor unchanged. A different
/// `uid_validity` starts a new epoch at `uid`.
pub async fn advance(
    db: &Database,
    account_id: &AccountId,
    folder: &str,
    uid_validity: u32,
    uid: u32,
) -> Result<SyncCursor> {
    let account_id = account_id.clone();
    let folder = folder.to_string();

    db.transaction(move |tx| {
        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            INSERT INTO sync_cursors (account_id, folder, uid_validity, last_uid, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id, folder) DO UPDATE SET
                last_uid = CASE
                    WHEN sync_cursors.uid_validity = excluded.uid_validity
                        THEN MAX(sync_cursors.last_uid, excluded.last_uid)
                    ELSE excluded.last_uid
                END,
                uid_validity = excluded.uid_validity,
                updated_at = excluded.updated_at
            "#,
            params![account_id.0, folder, uid_validity, uid, now],
        )?;

        let cursor = tx.query_row(
            r#"
            SELECT account_id, folder, uid_validity, last_uid, updated_at
            FROM sync_cursors
            WHERE account_id = ?1 AND folder = ?2
            "#,
            params![account_id.0, folder],
            row_to_cursor,
        )?;
        Ok(cursor)
    })
    .await
}

/// Removes the cursor for a folder, forcing a lookback backfill.
pub async fn reset(db: &Database, account_id: &AccountId, folder: &str) -> Result<()> {
    let account_id = account_id.clone();
    let folder = folder.to_string();

    db.with_conn(move |conn| {
        conn.execute(
            "DELETE FROM sync_cursors WHERE account_id = ?1 AND folder = ?2",
            params![account_id.0, folder],
        )?;
        Ok(())
    })
    .await
}

/// Lists the cursors of an account ordered by folder.
pub async fn list_for_account(db: &Database, account_id: &AccountId) -> Result<Vec<SyncCursor>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT account_id, folder, uid_validity, last_uid, updated_at
            FROM sync_cursors
            WHERE account_id = ?1
            ORDER BY folder
            "#,
        )?;
        let rows = stmt.query_map([&account_id.0], row_to_cursor)?;
        let cursors: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(cursors?)
    })
    .await
}

fn row_to_cursor(row: &Row<'_>) -> std::result::Result<SyncCursor, rusqlite::Error> {
    let updated_at: String = row.get(4)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(SyncCursor {
        account_id: AccountId(row.get(0)?),
        folder: row.get(1)?,
        uid_validity: row.get(2)?,
        last_uid: row.get(3)?,
        updated_at,
    })
}
