//! SQLite-backed [`MessageStore`].
//!
//! Rows are ordered by an autoincrement `seq` column so that history keeps
//! insertion order even when two messages share a millisecond timestamp.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tutorchat_proto::ids::{MessageId, RoomId, Timestamp, UserId};
use tutorchat_proto::message::{
    Attachment, BookingAction, BookingContext, MessageBody, MessageKind,
};
use uuid::Uuid;

use crate::store::{
    MarkRead, MessageStore, NewMessage, SenderSummary, StoreError, StoredMessage,
    first_per_sender,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS chat_messages (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    id               TEXT NOT NULL UNIQUE,
    room_id          TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    sender_name      TEXT NOT NULL,
    receiver_id      TEXT,
    message_type     TEXT NOT NULL,
    content          TEXT NOT NULL,
    file_url         TEXT,
    file_name        TEXT,
    file_size        INTEGER,
    client_timestamp INTEGER,
    reply_to         TEXT,
    booking_id       TEXT,
    booking_action   TEXT,
    client_ref       TEXT,
    created_at       INTEGER NOT NULL,
    delivered_at     INTEGER NOT NULL,
    read_at          INTEGER,
    deleted_at       INTEGER
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_room ON chat_messages (room_id, seq);
CREATE INDEX IF NOT EXISTS idx_chat_messages_receiver ON chat_messages (receiver_id, seq);
";

const SELECT_COLUMNS: &str = "id, room_id, sender_id, sender_name, receiver_id, message_type, \
     content, file_url, file_name, file_size, client_timestamp, reply_to, booking_id, \
     booking_action, client_ref, created_at, delivered_at, read_at, deleted_at";

/// Message store persisted in a SQLite database.
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    ///
    /// In-memory URLs are limited to a single pooled connection, since every
    /// SQLite in-memory connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid, the database
    /// cannot be opened, or the schema cannot be applied.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid sqlite url {url}: {e}")))?
            .create_if_missing(true);
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to open {url}: {e}")))?;
        Self::with_pool(pool).await
    }

    /// Wraps an existing pool and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the schema cannot be applied.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to apply schema: {e}")))?;
        Ok(Self { pool })
    }
}

fn to_db_time(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

fn from_db_time(millis: i64) -> Timestamp {
    Timestamp::from_millis(u64::try_from(millis).unwrap_or_default())
}

fn parse_message_id(raw: &str) -> Result<MessageId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("bad message id {raw:?}: {e}")))
}

fn read_err(e: &sqlx::Error) -> StoreError {
    StoreError::ReadFailed(e.to_string())
}

fn write_err(e: &sqlx::Error) -> StoreError {
    StoreError::WriteFailed(e.to_string())
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Corrupt(e.to_string());

    let id: String = row.try_get("id").map_err(get_err)?;
    let kind_raw: String = row.try_get("message_type").map_err(get_err)?;
    let kind = MessageKind::from_str(&kind_raw).map_err(StoreError::Corrupt)?;
    let content: String = row.try_get("content").map_err(get_err)?;

    let attachment = row
        .try_get::<Option<String>, _>("file_url")
        .map_err(get_err)?
        .map(|url| -> Result<Attachment, StoreError> {
            Ok(Attachment {
                url,
                file_name: row.try_get("file_name").map_err(get_err)?,
                file_size: row
                    .try_get::<Option<i64>, _>("file_size")
                    .map_err(get_err)?
                    .and_then(|s| u64::try_from(s).ok()),
            })
        })
        .transpose()?;
    // Length limits apply on append only.
    let body = MessageBody::build(kind, content, attachment, usize::MAX)
        .map_err(|e| StoreError::Corrupt(format!("message {id}: {e}")))?;

    let booking_id: Option<String> = row.try_get("booking_id").map_err(get_err)?;
    let booking_action: Option<String> = row.try_get("booking_action").map_err(get_err)?;
    let booking_context = match (booking_id, booking_action) {
        (Some(booking_id), Some(action)) => Some(BookingContext {
            booking_id,
            action: BookingAction::from_str(&action).map_err(StoreError::Corrupt)?,
        }),
        _ => None,
    };

    let reply_to = row
        .try_get::<Option<String>, _>("reply_to")
        .map_err(get_err)?
        .map(|raw| parse_message_id(&raw))
        .transpose()?;
    let client_ref = row
        .try_get::<Option<String>, _>("client_ref")
        .map_err(get_err)?
        .map(|raw| {
            Uuid::parse_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("bad client ref {raw:?}: {e}")))
        })
        .transpose()?;

    Ok(StoredMessage {
        id: parse_message_id(&id)?,
        room: RoomId::parse(&row.try_get::<String, _>("room_id").map_err(get_err)?)
            .ok_or_else(|| StoreError::Corrupt(format!("message {id} has a blank room")))?,
        sender_id: UserId::new(row.try_get::<String, _>("sender_id").map_err(get_err)?),
        sender_name: row.try_get("sender_name").map_err(get_err)?,
        receiver_id: row
            .try_get::<Option<String>, _>("receiver_id")
            .map_err(get_err)?
            .map(UserId::new),
        body,
        client_timestamp: row
            .try_get::<Option<i64>, _>("client_timestamp")
            .map_err(get_err)?
            .map(from_db_time),
        reply_to,
        booking_context,
        client_ref,
        created_at: from_db_time(row.try_get("created_at").map_err(get_err)?),
        delivered_at: from_db_time(row.try_get("delivered_at").map_err(get_err)?),
        read_at: row
            .try_get::<Option<i64>, _>("read_at")
            .map_err(get_err)?
            .map(from_db_time),
        deleted_at: row
            .try_get::<Option<i64>, _>("deleted_at")
            .map_err(get_err)?
            .map(from_db_time),
    })
}

impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let stored = message.accept(Timestamp::now());
        let attachment = stored.body.attachment();

        sqlx::query(
            r"
            INSERT INTO chat_messages (
                id, room_id, sender_id, sender_name, receiver_id, message_type, content,
                file_url, file_name, file_size, client_timestamp, reply_to,
                booking_id, booking_action, client_ref, created_at, delivered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(stored.id.to_string())
        .bind(stored.room.as_str())
        .bind(stored.sender_id.as_str())
        .bind(&stored.sender_name)
        .bind(stored.receiver_id.as_ref().map(UserId::as_str))
        .bind(stored.body.kind().as_str())
        .bind(stored.body.content())
        .bind(attachment.map(|a| a.url.as_str()))
        .bind(attachment.and_then(|a| a.file_name.as_deref()))
        .bind(attachment.and_then(|a| a.file_size).and_then(|s| i64::try_from(s).ok()))
        .bind(stored.client_timestamp.map(to_db_time))
        .bind(stored.reply_to.map(|id| id.to_string()))
        .bind(stored.booking_context.as_ref().map(|b| b.booking_id.as_str()))
        .bind(stored.booking_context.as_ref().map(|b| b.action.as_str()))
        .bind(stored.client_ref.map(|r| r.to_string()))
        .bind(to_db_time(stored.created_at))
        .bind(to_db_time(stored.delivered_at))
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(&e))?;

        Ok(stored)
    }

    async fn history_for_room(&self, room: &RoomId) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM chat_messages WHERE room_id = $1 ORDER BY seq ASC"
        ))
        .bind(room.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_err(&e))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn mark_read(&self, id: &MessageId, room: &RoomId) -> Result<MarkRead, StoreError> {
        let updated = sqlx::query(
            "UPDATE chat_messages SET read_at = $1 WHERE id = $2 AND room_id = $3 AND read_at IS NULL",
        )
        .bind(to_db_time(Timestamp::now()))
        .bind(id.to_string())
        .bind(room.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(&e))?;

        if updated.rows_affected() > 0 {
            return Ok(MarkRead::Marked);
        }

        let exists = sqlx::query("SELECT 1 FROM chat_messages WHERE id = $1 AND room_id = $2")
            .bind(id.to_string())
            .bind(room.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| read_err(&e))?;

        Ok(if exists.is_some() {
            MarkRead::AlreadyRead
        } else {
            MarkRead::NotFound
        })
    }

    async fn soft_delete(
        &self,
        id: &MessageId,
        room: &RoomId,
        requester: &UserId,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r"
            UPDATE chat_messages SET deleted_at = $1
            WHERE id = $2 AND room_id = $3 AND sender_id = $4 AND deleted_at IS NULL
            ",
        )
        .bind(to_db_time(Timestamp::now()))
        .bind(id.to_string())
        .bind(room.as_str())
        .bind(requester.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(&e))?;

        Ok(updated.rows_affected() > 0)
    }

    async fn recent_senders_to(&self, receiver: &UserId) -> Result<Vec<SenderSummary>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM chat_messages WHERE receiver_id = $1 ORDER BY seq DESC"
        ))
        .bind(receiver.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_err(&e))?;

        let messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(first_per_sender(&messages))
    }
}
