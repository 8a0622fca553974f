use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};

use crate::models::{ChatMessage, Session, SessionType, UserId};

pub type DbPool = Pool<Sqlite>;

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

#[derive(FromRow)]
struct MessageRow {
    msg_id: String,
    from_user: i64,
    session_type: String,
    target_id: i64,
    content: String,
    created_at: String,
}

#[derive(FromRow)]
struct SessionRow {
    user_id: i64,
    peer_id: i64,
    session_type: String,
    last_msg_id: Option<String>,
    last_msg_content: Option<String>,
    last_msg_at: Option<String>,
    unread: i64,
    is_top: bool,
    is_mute: bool,
}

/// A receipt that an ack moved to read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadMark {
    pub msg_id: String,
    /// Original sender of the message.
    pub from: UserId,
    pub peer_id: i64,
    pub session_type: SessionType,
}

/// Storage timestamp format; fixed width so text comparison follows time.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let memory = is_memory_url(database_url);

        // Create database file if it doesn't exist
        if !memory {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !std::path::Path::new(db_path).exists() {
                std::fs::File::create(db_path)?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .busy_timeout(Duration::from_secs(5));

        // every connection to :memory: is a separate database
        let pool = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ---- messages -------------------------------------------------------

    /// Insert-or-ignore keyed by message id. Returns true if the row is new.
    pub async fn persist_message(&self, message: &ChatMessage) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (msg_id, from_user, session_type, target_id, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.msg_id)
        .bind(message.from)
        .bind(message.session_type.to_string())
        .bind(message.target_id)
        .bind(&message.content)
        .bind(ts(&message.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_message(&self, msg_id: &str) -> Result<Option<ChatMessage>, sqlx::Error> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            SELECT msg_id, from_user, session_type, target_id, content, created_at
            FROM messages WHERE msg_id = ?
            "#,
        )
        .bind(msg_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_message).transpose()
    }

    // ---- receipts, unread counters, summaries ---------------------------

    /// Record that `user` was a recipient of `message`.
    ///
    /// The receipt insert, the unread increment and the summary merge share a
    /// transaction. If a receipt already existed nothing changes and false is
    /// returned, so replays of the same record never double count.
    pub async fn record_delivery(
        &self,
        message: &ChatMessage,
        user: UserId,
    ) -> Result<bool, sqlx::Error> {
        let peer = message.peer_for(user);
        let session_type = message.session_type.to_string();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_receipts (msg_id, user_id, peer_id, session_type, delivered_at, read_at)
            VALUES (?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&message.msg_id)
        .bind(user)
        .bind(peer)
        .bind(&session_type)
        .bind(ts(&Utc::now()))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query(
                r#"
                INSERT INTO unread_counters (user_id, peer_id, session_type, unread) VALUES (?, ?, ?, 1)
                ON CONFLICT(user_id, peer_id, session_type) DO UPDATE SET unread = unread + 1
                "#,
            )
            .bind(user)
            .bind(peer)
            .bind(&session_type)
            .execute(&mut *tx)
            .await?;

            Self::merge_summary_in(&mut tx, user, peer, message).await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Move the conversation summary forward to `message` unless it already
    /// shows something newer.
    pub async fn merge_summary(
        &self,
        user: UserId,
        message: &ChatMessage,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        Self::merge_summary_in(&mut tx, user, message.peer_for(user), message).await?;
        tx.commit().await
    }

    async fn merge_summary_in(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        user: UserId,
        peer: i64,
        message: &ChatMessage,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sessions (user_id, peer_id, session_type, last_msg_id, last_msg_content, last_msg_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, peer_id, session_type) DO UPDATE SET
                last_msg_id = excluded.last_msg_id,
                last_msg_content = excluded.last_msg_content,
                last_msg_at = excluded.last_msg_at
            WHERE sessions.last_msg_at IS NULL OR sessions.last_msg_at <= excluded.last_msg_at
            "#,
        )
        .bind(user)
        .bind(peer)
        .bind(message.session_type.to_string())
        .bind(&message.msg_id)
        .bind(&message.content)
        .bind(ts(&message.timestamp))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Mark `msg_ids` read for `user`, creating the receipt if the fanout
    /// consumer has not recorded it yet. Unknown ids, the user's own messages
    /// and messages `user` was never a recipient of are skipped.
    pub async fn mark_read(
        &self,
        user: UserId,
        msg_ids: &[String],
    ) -> Result<Vec<ReadMark>, sqlx::Error> {
        let now = ts(&Utc::now());
        let mut marks = Vec::new();
        let mut tx = self.pool.begin().await?;

        for msg_id in msg_ids {
            let row: Option<MessageRow> = sqlx::query_as(
                r#"
                SELECT msg_id, from_user, session_type, target_id, content, created_at
                FROM messages WHERE msg_id = ?
                "#,
            )
            .bind(msg_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(message) = row.map(Self::row_to_message).transpose()? else {
                continue;
            };
            if message.from == user || !Self::is_recipient(&mut tx, &message, user).await? {
                continue;
            }

            let peer = message.peer_for(user);
            sqlx::query(
                r#"
                INSERT INTO message_receipts (msg_id, user_id, peer_id, session_type, delivered_at, read_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(msg_id, user_id) DO UPDATE SET read_at = COALESCE(read_at, excluded.read_at)
                "#,
            )
            .bind(&message.msg_id)
            .bind(user)
            .bind(peer)
            .bind(message.session_type.to_string())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            marks.push(ReadMark {
                msg_id: message.msg_id,
                from: message.from,
                peer_id: peer,
                session_type: message.session_type,
            });
        }

        tx.commit().await?;
        Ok(marks)
    }

    /// A receipt already exists for anyone the message was delivered to. Before
    /// that, only the addressee of a single chat or a member of the group counts.
    async fn is_recipient(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        message: &ChatMessage,
        user: UserId,
    ) -> Result<bool, sqlx::Error> {
        let receipts: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM message_receipts WHERE msg_id = ? AND user_id = ?",
        )
        .bind(&message.msg_id)
        .bind(user)
        .fetch_one(&mut **tx)
        .await?;
        if receipts > 0 {
            return Ok(true);
        }

        match message.session_type {
            SessionType::Single => Ok(message.target_id == user),
            SessionType::Group => {
                let members: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM group_members WHERE group_id = ? AND user_id = ?",
                )
                .bind(message.target_id)
                .bind(user)
                .fetch_one(&mut **tx)
                .await?;
                Ok(members > 0)
            }
            SessionType::System => Ok(false),
        }
    }

    /// Reset the unread counter of a conversation to its number of unread
    /// receipts.
    pub async fn recount_unread(
        &self,
        user: UserId,
        peer: i64,
        session_type: SessionType,
    ) -> Result<i64, sqlx::Error> {
        let session_type = session_type.to_string();
        let mut tx = self.pool.begin().await?;

        let unread: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM message_receipts
            WHERE user_id = ? AND peer_id = ? AND session_type = ? AND read_at IS NULL
            "#,
        )
        .bind(user)
        .bind(peer)
        .bind(&session_type)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO unread_counters (user_id, peer_id, session_type, unread) VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, peer_id, session_type) DO UPDATE SET unread = excluded.unread
            "#,
        )
        .bind(user)
        .bind(peer)
        .bind(&session_type)
        .bind(unread)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(unread)
    }

    pub async fn unread(
        &self,
        user: UserId,
        peer: i64,
        session_type: SessionType,
    ) -> Result<i64, sqlx::Error> {
        let unread: Option<i64> = sqlx::query_scalar(
            "SELECT unread FROM unread_counters WHERE user_id = ? AND peer_id = ? AND session_type = ?",
        )
        .bind(user)
        .bind(peer)
        .bind(session_type.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(unread.unwrap_or(0))
    }

    pub async fn list_sessions(&self, user: UserId) -> Result<Vec<Session>, sqlx::Error> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT s.user_id, s.peer_id, s.session_type, s.last_msg_id, s.last_msg_content,
                   s.last_msg_at, COALESCE(u.unread, 0) AS unread, s.is_top, s.is_mute
            FROM sessions s
            LEFT JOIN unread_counters u
              ON u.user_id = s.user_id AND u.peer_id = s.peer_id AND u.session_type = s.session_type
            WHERE s.user_id = ?
            ORDER BY s.is_top DESC, s.last_msg_at DESC
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_session).collect()
    }

    /// Unread messages of `user` in arrival order.
    pub async fn backlog(&self, user: UserId, limit: i64) -> Result<Vec<ChatMessage>, sqlx::Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT m.msg_id, m.from_user, m.session_type, m.target_id, m.content, m.created_at
            FROM message_receipts r
            JOIN messages m ON m.msg_id = r.msg_id
            WHERE r.user_id = ? AND r.read_at IS NULL
            ORDER BY m.seq
            LIMIT ?
            "#,
        )
        .bind(user)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    // ---- groups ---------------------------------------------------------

    pub async fn add_group_member(&self, group_id: i64, user: UserId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(group_id)
        .bind(user)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_group_member(
        &self,
        group_id: i64,
        user: UserId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn group_members(&self, group_id: i64) -> Result<Vec<UserId>, sqlx::Error> {
        sqlx::query_scalar("SELECT user_id FROM group_members WHERE group_id = ? ORDER BY user_id")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn set_read_marker(
        &self,
        group_id: i64,
        user: UserId,
        msg_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO group_read_markers (group_id, user_id, last_read_msg_id, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(group_id, user_id) DO UPDATE SET
                last_read_msg_id = excluded.last_read_msg_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(group_id)
        .bind(user)
        .bind(msg_id)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_marker(
        &self,
        group_id: i64,
        user: UserId,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT last_read_msg_id FROM group_read_markers WHERE group_id = ? AND user_id = ?",
        )
        .bind(group_id)
        .bind(user)
        .fetch_optional(&self.pool)
        .await
    }

    // ---- row conversion -------------------------------------------------

    fn row_to_message(row: MessageRow) -> Result<ChatMessage, sqlx::Error> {
        Ok(ChatMessage {
            msg_id: row.msg_id,
            from: row.from_user,
            session_type: row
                .session_type
                .parse::<SessionType>()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            target_id: row.target_id,
            content: row.content,
            timestamp: row
                .created_at
                .parse::<DateTime<Utc>>()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        })
    }

    fn row_to_session(row: SessionRow) -> Result<Session, sqlx::Error> {
        let last_msg_at = row
            .last_msg_at
            .map(|at| at.parse::<DateTime<Utc>>())
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Session {
            user_id: row.user_id,
            peer_id: row.peer_id,
            session_type: row
                .session_type
                .parse::<SessionType>()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            last_msg_id: row.last_msg_id,
            last_msg_content: row.last_msg_content,
            last_msg_at,
            unread_count: row.unread,
            is_top: row.is_top,
            is_mute: row.is_mute,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_persist_is_insert_or_ignore() {
        let db = db().await;
        let message = ChatMessage::new(1, SessionType::Single, 2, "hi".into());

        assert!(db.persist_message(&message).await.unwrap());
        assert!(!db.persist_message(&message).await.unwrap());
        assert_eq!(db.get_message(&message.msg_id).await.unwrap(), Some(message));
        assert!(db.get_message("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_delivery_counts_once() {
        let db = db().await;
        let message = ChatMessage::new(1, SessionType::Single, 2, "hi".into());
        db.persist_message(&message).await.unwrap();

        assert!(db.record_delivery(&message, 2).await.unwrap());
        assert!(!db.record_delivery(&message, 2).await.unwrap());
        assert_eq!(db.unread(2, 1, SessionType::Single).await.unwrap(), 1);

        let sessions = db.list_sessions(2).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].peer_id, 1);
        assert_eq!(sessions[0].last_msg_content.as_deref(), Some("hi"));
        assert_eq!(sessions[0].unread_count, 1);
    }

    #[tokio::test]
    async fn test_summary_never_moves_backwards() {
        let db = db().await;
        let mut older = ChatMessage::new(1, SessionType::Single, 2, "first".into());
        older.timestamp -= chrono::Duration::seconds(10);
        let newer = ChatMessage::new(1, SessionType::Single, 2, "second".into());

        db.merge_summary(2, &newer).await.unwrap();
        db.merge_summary(2, &older).await.unwrap();

        let sessions = db.list_sessions(2).await.unwrap();
        assert_eq!(sessions[0].last_msg_content.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_mark_read_before_delivery_is_not_counted() {
        let db = db().await;
        let message = ChatMessage::new(1, SessionType::Single, 2, "hi".into());
        db.persist_message(&message).await.unwrap();

        let marks = db.mark_read(2, &[message.msg_id.clone()]).await.unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].from, 1);

        // the consumer arrives late
        assert!(!db.record_delivery(&message, 2).await.unwrap());
        assert_eq!(db.recount_unread(2, 1, SessionType::Single).await.unwrap(), 0);
        assert!(db.backlog(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_requires_membership_before_delivery() {
        let db = db().await;
        db.add_group_member(9, 1).await.unwrap();
        db.add_group_member(9, 2).await.unwrap();
        let message = ChatMessage::new(1, SessionType::Group, 9, "members only".into());
        db.persist_message(&message).await.unwrap();

        assert!(db.mark_read(5, &[message.msg_id.clone()]).await.unwrap().is_empty());
        assert_eq!(db.mark_read(2, &[message.msg_id.clone()]).await.unwrap().len(), 1);

        // a former member keeps the receipt it was delivered
        let later = ChatMessage::new(1, SessionType::Group, 9, "after leaving".into());
        db.persist_message(&later).await.unwrap();
        db.record_delivery(&later, 2).await.unwrap();
        db.remove_group_member(9, 2).await.unwrap();
        assert_eq!(db.mark_read(2, &[later.msg_id.clone()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backlog_in_arrival_order() {
        let db = db().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let message = ChatMessage::new(1, SessionType::Single, 2, format!("m{i}"));
            db.persist_message(&message).await.unwrap();
            db.record_delivery(&message, 2).await.unwrap();
            ids.push(message.msg_id);
        }

        let backlog = db.backlog(2, 2).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].msg_id, ids[0]);
        assert_eq!(backlog[1].content, "m1");
    }

    #[tokio::test]
    async fn test_group_members_and_markers() {
        let db = db().await;
        assert!(db.add_group_member(9, 1).await.unwrap());
        assert!(!db.add_group_member(9, 1).await.unwrap());
        db.add_group_member(9, 2).await.unwrap();
        assert_eq!(db.group_members(9).await.unwrap(), vec![1, 2]);

        assert!(db.remove_group_member(9, 1).await.unwrap());
        assert_eq!(db.group_members(9).await.unwrap(), vec![2]);

        db.set_read_marker(9, 2, "m1").await.unwrap();
        db.set_read_marker(9, 2, "m2").await.unwrap();
        assert_eq!(db.read_marker(9, 2).await.unwrap().as_deref(), Some("m2"));
    }
}
