use chrono::{DateTime, Utc};
use rusqlite::ffi;
use rusqlite::OptionalExtension;

use super::ProcessedStore;
use crate::error::StoreError;
use crate::rules::ChannelKey;

/// One message that has been handed to the notification sink
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub struct ProcessedMessageRecord {
    pub message_id: i64,
    pub chat_id: i64,
    pub chat_key: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedStore {
    /// Whether an alert was already attempted for this message
    pub async fn has_processed(&self, message_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let found = conn
            .query_row(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1",
                rusqlite::params![message_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a message as processed.
    ///
    /// Fails with [`StoreError::UniqueViolation`] when the message is already
    /// present, which callers treat as "someone else got there first".
    pub async fn mark_processed(
        &self,
        message_id: i64,
        chat_id: i64,
        chat_key: &ChannelKey,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT INTO processed_messages (message_id, chat_id, chat_key, processed_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![message_id, chat_id, chat_key.to_string(), Utc::now()],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(StoreError::UniqueViolation(message_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up the audit record for a message
    #[allow(dead_code)]
    pub async fn get(&self, message_id: i64) -> Result<Option<ProcessedMessageRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT message_id, chat_id, chat_key, processed_at
                 FROM processed_messages WHERE message_id = ?1",
                rusqlite::params![message_id],
                |row| {
                    Ok(ProcessedMessageRecord {
                        message_id: row.get(0)?,
                        chat_id: row.get(1)?,
                        chat_key: row.get(2)?,
                        processed_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
