//! Delivery ledger operations.
//!
//! One row per message identity key, tracking which halves of delivery
//! (index write, notification) have completed.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{AccountId, DeliveryRecord, MessageKey, NotificationRequest};
use crate::storage::database::{Database, DatabaseError, Result};

const SELECT_COLUMNS: &str = r#"
    SELECT account_id, folder, uid, indexed, notified, pending_notification,
           attempts, last_error, updated_at
    FROM deliveries
"#;

/// Retrieves the record for a message.
pub async fn get(db: &Database, key: &MessageKey) -> Result<Option<DeliveryRecord>> {
    let id = key.as_document_id();

    db.with_conn(move |conn| {
        let sql = format!("{} WHERE message_key = ?1", SELECT_COLUMNS);
        let record = conn.query_row(&sql, [&id], row_to_record).optional()?;
        Ok(record)
    })
    .await
}

/// Records the start of a delivery attempt and returns the current record.
///
/// Creates the row on first delivery; increments `attempts` otherwise.
pub async fn begin_attempt(db: &Database, key: &MessageKey) -> Result<DeliveryRecord> {
    let key = key.clone();

    db.transaction(move |tx| {
        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            INSERT INTO deliveries (message_key, account_id, folder, uid, attempts, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            ON CONFLICT(message_key) DO UPDATE SET
                attempts = deliveries.attempts + 1,
                updated_at = excluded.updated_at
            "#,
            params![
                key.as_document_id(),
                key.account_id.0,
                key.folder,
                key.uid,
                now
            ],
        )?;

        let sql = format!("{} WHERE message_key = ?1", SELECT_COLUMNS);
        let record = tx.query_row(&sql, [key.as_document_id()], row_to_record)?;
        Ok(record)
    })
    .await
}

/// Marks the index write as done.
pub async fn mark_indexed(db: &Database, key: &MessageKey) -> Result<()> {
    let id = key.as_document_id();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE deliveries SET indexed = 1, last_error = NULL, updated_at = ?1 WHERE message_key = ?2",
            params![now, id],
        )?;
        Ok(())
    })
    .await
}

/// Stores a notification that still has to be sent.
///
/// Ignored when the message has already been notified.
pub async fn set_pending_notification(
    db: &Database,
    key: &MessageKey,
    request: &NotificationRequest,
) -> Result<()> {
    let id = key.as_document_id();
    let payload =
        serde_json::to_string(request).map_err(|e| DatabaseError::InvalidData(e.to_string()))?;

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            UPDATE deliveries
            SET pending_notification = ?1, updated_at = ?2
            WHERE message_key = ?3 AND notified = 0
            "#,
            params![payload, now, id],
        )?;
        Ok(())
    })
    .await
}

/// Marks the notification as sent and clears the pending payload.
pub async fn mark_notified(db: &Database, key: &MessageKey) -> Result<()> {
    let id = key.as_document_id();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            UPDATE deliveries
            SET notified = 1, pending_notification = NULL, updated_at = ?1
            WHERE message_key = ?2
            "#,
            params![now, id],
        )?;
        Ok(())
    })
    .await
}

/// Records the most recent failure for a message.
pub async fn record_error(db: &Database, key: &MessageKey, error: &str) -> Result<()> {
    let id = key.as_document_id();
    let error = error.to_string();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE deliveries SET last_error = ?1, updated_at = ?2 WHERE message_key = ?3",
            params![error, now, id],
        )?;
        Ok(())
    })
    .await
}

/// Lists indexed messages whose notification has not been sent yet,
/// oldest first.
pub async fn list_pending_notifications(db: &Database, limit: u32) -> Result<Vec<DeliveryRecord>> {
    db.with_conn(move |conn| {
        let sql = format!(
            "{} WHERE indexed = 1 AND pending_notification IS NOT NULL ORDER BY updated_at ASC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], row_to_record)?;
        let records: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(records?)
    })
    .await
}

fn row_to_record(row: &Row<'_>) -> std::result::Result<DeliveryRecord, rusqlite::Error> {
    let pending_json: Option<String> = row.get(5)?;
    let pending_notification = pending_json.and_then(|json| serde_json::from_str(&json).ok());

    let updated_at: String = row.get(8)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(DeliveryRecord {
        message_key: MessageKey::new(AccountId(row.get(0)?), row.get::<_, String>(1)?, row.get(2)?),
        indexed: row.get::<_, i32>(3)? != 0,
        notified: row.get::<_, i32>(4)? != 0,
        pending_notification,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Category, NormalizedMessage};

    fn key(uid: u32) -> MessageKey {
        MessageKey::new(AccountId::from("a@example.com"), "INBOX", uid)
    }

    fn notification(uid: u32) -> NotificationRequest {
        let message = NormalizedMessage {
            account_id: AccountId::from("a@example.com"),
            folder: "INBOX".to_string(),
            server_uid: uid,
            message_id: None,
            subject: "Interested in your profile".to_string(),
            sender: Address::new("lead@corp.com"),
            recipients: vec![],
            sent_at: Utc::now(),
            plain_body: Some("Can we talk?".to_string()),
            html_body: None,
            attachment_refs: vec![],
        };
        NotificationRequest::for_message(&message, Category::Interested)
    }

    #[tokio::test]
    async fn begin_attempt_creates_then_increments() {
        let db = Database::open_in_memory().await.unwrap();

        let first = begin_attempt(&db, &key(1)).await.unwrap();
        assert_eq!(first.attempts, 1);
        assert!(!first.indexed);

        let second = begin_attempt(&db, &key(1)).await.unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.message_key, key(1));
    }

    #[tokio::test]
    async fn indexed_and_notified_flags() {
        let db = Database::open_in_memory().await.unwrap();
        begin_attempt(&db, &key(1)).await.unwrap();

        mark_indexed(&db, &key(1)).await.unwrap();
        set_pending_notification(&db, &key(1), &notification(1)).await.unwrap();

        let record = get(&db, &key(1)).await.unwrap().unwrap();
        assert!(record.indexed);
        assert!(!record.notified);
        assert!(record.pending_notification.is_some());

        mark_notified(&db, &key(1)).await.unwrap();
        let record = get(&db, &key(1)).await.unwrap().unwrap();
        assert!(record.notified);
        assert!(record.pending_notification.is_none());
        assert!(record.is_complete());
    }

    #[tokio::test]
    async fn pending_notification_ignored_once_notified() {
        let db = Database::open_in_memory().await.unwrap();
        begin_attempt(&db, &key(1)).await.unwrap();
        mark_notified(&db, &key(1)).await.unwrap();

        set_pending_notification(&db, &key(1), &notification(1)).await.unwrap();

        let record = get(&db, &key(1)).await.unwrap().unwrap();
        assert!(record.pending_notification.is_none());
    }

    #[tokio::test]
    async fn list_pending_only_returns_indexed_rows() {
        let db = Database::open_in_memory().await.unwrap();

        for uid in 1..=3 {
            begin_attempt(&db, &key(uid)).await.unwrap();
            set_pending_notification(&db, &key(uid), &notification(uid)).await.unwrap();
        }
        mark_indexed(&db, &key(1)).await.unwrap();
        mark_indexed(&db, &key(3)).await.unwrap();
        mark_notified(&db, &key(3)).await.unwrap();

        let pending = list_pending_notifications(&db, 10).await.unwrap();
        let uids: Vec<u32> = pending.iter().map(|r| r.message_key.uid).collect();
        assert_eq!(uids, vec![1]);
    }

    #[tokio::test]
    async fn record_error_and_clear_on_index() {
        let db = Database::open_in_memory().await.unwrap();
        begin_attempt(&db, &key(1)).await.unwrap();

        record_error(&db, &key(1), "index unavailable").await.unwrap();
        let record = get(&db, &key(1)).await.unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("index unavailable"));

        mark_indexed(&db, &key(1)).await.unwrap();
        let record = get(&db, &key(1)).await.unwrap().unwrap();
        assert!(record.last_error.is_none());
    }
}
