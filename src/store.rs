use crate::{
    chat::{Message, MessagePage, NewMessage, Room},
    entity::Role,
};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};
use uuid::Uuid;

const ROOM_COLUMNS: &str = "id, user_id, vendor_id, created_at, last_message, last_message_at, user_unread, vendor_unread";
const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, sender_role, body, kind, timestamp, seen";

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Private in-memory database with the schema already applied.
    ///
    /// A single pooled connection keeps every caller on the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                vendor_id TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                last_message TEXT,
                last_message_at DATETIME,
                user_unread INTEGER NOT NULL DEFAULT 0,
                vendor_unread INTEGER NOT NULL DEFAULT 0,
                UNIQUE (user_id, vendor_id)
            );
            CREATE INDEX IF NOT EXISTS idx_rooms_user ON rooms(user_id);
            CREATE INDEX IF NOT EXISTS idx_rooms_vendor ON rooms(vendor_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                sender_role TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'text',
                timestamp DATETIME NOT NULL,
                seen BOOLEAN NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_room_timestamp ON messages(room_id, timestamp DESC);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Close the pool. Subsequent calls fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Return the room for this user/vendor pair, creating it if needed.
    ///
    /// The unique index on the pair decides concurrent first contacts: the
    /// losing insert is ignored and everyone reads back the same row.
    pub async fn find_or_create_room(&self, user_id: &str, vendor_id: &str) -> Result<Room> {
        sqlx::query(
            r#"
            INSERT INTO rooms (id, user_id, vendor_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, vendor_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(vendor_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert room")?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM rooms WHERE user_id = ? AND vendor_id = ?",
            ROOM_COLUMNS
        ))
        .bind(user_id)
        .bind(vendor_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read back room")?;

        room_from_row(&row)
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        let row = sqlx::query(&format!("SELECT {} FROM rooms WHERE id = ?", ROOM_COLUMNS))
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch room")?;

        row.as_ref().map(room_from_row).transpose()
    }

    /// Persist a message and update its room in one transaction.
    ///
    /// `bump_unread` names the participant whose unread counter goes up by one.
    /// The increment happens in SQL so concurrent sends never lose a count.
    pub async fn append_message(
        &self,
        draft: &NewMessage,
        preview: &str,
        bump_unread: Option<Role>,
    ) -> Result<(Message, Room)> {
        let (user_inc, vendor_inc): (i64, i64) = match bump_unread {
            Some(Role::User) => (1, 0),
            Some(Role::Vendor) => (0, 1),
            None => (0, 0),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin append transaction")?;

        let updated = sqlx::query(
            r#"
            UPDATE rooms
            SET last_message = ?,
                last_message_at = ?,
                user_unread = user_unread + ?,
                vendor_unread = vendor_unread + ?
            WHERE id = ?
            "#,
        )
        .bind(preview)
        .bind(draft.timestamp)
        .bind(user_inc)
        .bind(vendor_inc)
        .bind(&draft.room_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update room for new message")?;

        if updated.rows_affected() == 0 {
            anyhow::bail!("room {} does not exist", draft.room_id);
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            room_id: draft.room_id.clone(),
            sender_id: draft.sender_id.clone(),
            sender_role: draft.sender_role,
            body: draft.body.clone(),
            kind: draft.kind,
            timestamp: draft.timestamp,
            seen: false,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, room_id, sender_id, sender_role, body, kind, timestamp, seen)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&message.id)
        .bind(&message.room_id)
        .bind(&message.sender_id)
        .bind(message.sender_role.as_str())
        .bind(&message.body)
        .bind(message.kind.as_str())
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await
        .context("Failed to save message")?;

        let row = sqlx::query(&format!("SELECT {} FROM rooms WHERE id = ?", ROOM_COLUMNS))
            .bind(&draft.room_id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to read updated room")?;
        let room = room_from_row(&row)?;

        tx.commit()
            .await
            .context("Failed to commit append transaction")?;

        Ok((message, room))
    }

    /// Retrieve one page of history, newest first. Page 0 is the most recent.
    pub async fn get_messages(&self, room_id: &str, page: u32, page_size: u32) -> Result<MessagePage> {
        let page_size = page_size.max(1);
        let offset = i64::from(page) * i64::from(page_size);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM messages
            WHERE room_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(room_id)
        .bind(i64::from(page_size) + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat history")?;

        let has_more = rows.len() > page_size as usize;
        let messages = rows
            .iter()
            .take(page_size as usize)
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(MessagePage {
            room_id: room_id.to_string(),
            page,
            page_size,
            has_more,
            messages,
        })
    }

    /// Rooms the participant belongs to, most recently active first.
    pub async fn list_rooms_for_participant(&self, participant_id: &str) -> Result<Vec<Room>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM rooms
            WHERE user_id = ? OR vendor_id = ?
            ORDER BY COALESCE(last_message_at, created_at) DESC
            "#,
            ROOM_COLUMNS
        ))
        .bind(participant_id)
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list rooms")?;

        rows.iter().map(room_from_row).collect()
    }

    /// Reset the reader's unread counter and flag the peer's messages as seen.
    /// Returns the updated room and how many messages flipped to seen.
    pub async fn mark_seen(&self, room_id: &str, reader_role: Role) -> Result<(Room, u64)> {
        let reset = match reader_role {
            Role::User => "UPDATE rooms SET user_unread = 0 WHERE id = ?",
            Role::Vendor => "UPDATE rooms SET vendor_unread = 0 WHERE id = ?",
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin mark-seen transaction")?;

        let updated = sqlx::query(reset)
            .bind(room_id)
            .execute(&mut *tx)
            .await
            .context("Failed to reset unread counter")?;
        if updated.rows_affected() == 0 {
            anyhow::bail!("room {} does not exist", room_id);
        }

        let flipped = sqlx::query(
            "UPDATE messages SET seen = 1 WHERE room_id = ? AND sender_role != ? AND seen = 0",
        )
        .bind(room_id)
        .bind(reader_role.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to mark messages seen")?
        .rows_affected();

        let row = sqlx::query(&format!("SELECT {} FROM rooms WHERE id = ?", ROOM_COLUMNS))
            .bind(room_id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to read room after mark-seen")?;
        let room = room_from_row(&row)?;

        tx.commit()
            .await
            .context("Failed to commit mark-seen transaction")?;

        Ok((room, flipped))
    }
}

fn room_from_row(row: &SqliteRow) -> Result<Room> {
    Ok(Room {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        vendor_id: row.try_get("vendor_id")?,
        created_at: row.try_get("created_at")?,
        last_message: row.try_get("last_message")?,
        last_message_at: row.try_get("last_message_at")?,
        user_unread: row.try_get("user_unread")?,
        vendor_unread: row.try_get("vendor_unread")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let sender_role: String = row.try_get("sender_role")?;
    let kind: String = row.try_get("kind")?;

    Ok(Message {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        sender_id: row.try_get("sender_id")?,
        sender_role: sender_role.parse()?,
        body: row.try_get("body")?,
        kind: kind.parse()?,
        timestamp: row.try_get("timestamp")?,
        seen: row.try_get("seen")?,
    })
}
