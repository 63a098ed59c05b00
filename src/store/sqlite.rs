//! SQLite-backed store adapter.
//!
//! Five tables back the five logical collections, with an FTS5 shadow table
//! kept in sync by explicit dual-write for lexical search over message text,
//! and `conversation_tags`/`summary_tags` companion tables kept in sync the
//! same way to give the JSON-encoded, multi-valued `tags` column an indexed
//! lookup path instead of a full scan. A single connection behind a
//! `tokio::sync::Mutex` serializes writes; reads share the same connection
//! since `rusqlite` connections are not `Sync`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::model::{
    ConversationMessage, Scope, SourceCollection, Speaker, Summary, TimeRange, UserProfileItem,
    VectorIndexEntry, VectorIndexMetadata,
};

use super::{ConversationSummaryRow, MessageFilter, StoreAdapter, StoreStats};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        }

        let conn = Connection::open(&path).map_err(EngineError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(EngineError::from)?;
        Self::init_schema(&conn)?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(EngineError::from)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(EngineError::from)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> Result<(), EngineError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_history (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                speaker TEXT NOT NULL,
                text TEXT NOT NULL,
                scope TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conv_history_conv_ts
                ON conversation_history(conversation_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_conv_history_scope ON conversation_history(scope);
            CREATE INDEX IF NOT EXISTS idx_conv_history_ts ON conversation_history(timestamp DESC);

            CREATE TABLE IF NOT EXISTS conversation_tags (
                message_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (message_id, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_tags_tag ON conversation_tags(tag);

            CREATE VIRTUAL TABLE IF NOT EXISTS conversation_history_fts USING fts5(
                id UNINDEXED,
                text,
                tokenize = 'porter unicode61'
            );

            CREATE TABLE IF NOT EXISTS summaries (
                id TEXT PRIMARY KEY,
                conversation_id TEXT,
                topic_id TEXT,
                summary_text TEXT NOT NULL,
                scope TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                timestamp TEXT NOT NULL,
                time_from TEXT NOT NULL,
                time_to TEXT NOT NULL,
                message_refs TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_conv ON summaries(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_summaries_topic ON summaries(topic_id);
            CREATE INDEX IF NOT EXISTS idx_summaries_scope ON summaries(scope);

            CREATE TABLE IF NOT EXISTS summary_tags (
                summary_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (summary_id, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_summary_tags_tag ON summary_tags(tag);

            CREATE TABLE IF NOT EXISTS memory_index (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL UNIQUE,
                source_collection TEXT NOT NULL,
                scope TEXT NOT NULL,
                embedding BLOB NOT NULL,
                text_preview TEXT NOT NULL DEFAULT '',
                entry_timestamp TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_memory_index_scope ON memory_index(scope);
            CREATE INDEX IF NOT EXISTS idx_memory_index_source_collection
                ON memory_index(source_collection);

            CREATE TABLE IF NOT EXISTS metadata_scopes (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL DEFAULT 'scope',
                scope_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                related_keywords TEXT NOT NULL DEFAULT '[]',
                parent_scope TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_metadata_scope_name
                ON metadata_scopes(scope_name) WHERE type = 'scope';

            CREATE TABLE IF NOT EXISTS user_profile (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'facts'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_user_profile_user_id
                ON user_profile(user_id, key);
            "#,
        )
        .map_err(EngineError::from)?;
        Ok(())
    }

    fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(embedding.len() * 4);
        for val in embedding {
            blob.extend_from_slice(&val.to_le_bytes());
        }
        blob
    }

    fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|bytes| f32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])))
            .collect()
    }

    fn tags_to_json(tags: &BTreeSet<String>) -> String {
        serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
    }

    /// Replaces `conversation_tags` rows for `message_id` with `tags`, keeping
    /// the indexed multi-key lookup in sync with the JSON column it mirrors.
    fn sync_message_tags(conn: &Connection, message_id: &str, tags: &BTreeSet<String>) -> rusqlite::Result<()> {
        conn.execute("DELETE FROM conversation_tags WHERE message_id = ?1", params![message_id])?;
        for tag in tags {
            conn.execute(
                "INSERT OR IGNORE INTO conversation_tags (message_id, tag) VALUES (?1, ?2)",
                params![message_id, tag],
            )?;
        }
        Ok(())
    }

    /// Replaces `summary_tags` rows for `summary_id` with `tags`.
    fn sync_summary_tags(conn: &Connection, summary_id: &str, tags: &BTreeSet<String>) -> rusqlite::Result<()> {
        conn.execute("DELETE FROM summary_tags WHERE summary_id = ?1", params![summary_id])?;
        for tag in tags {
            conn.execute(
                "INSERT OR IGNORE INTO summary_tags (summary_id, tag) VALUES (?1, ?2)",
                params![summary_id, tag],
            )?;
        }
        Ok(())
    }

    fn tags_from_json(raw: &str) -> BTreeSet<String> {
        serde_json::from_str(raw).unwrap_or_default()
    }

    fn parse_ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<ConversationMessage> {
        let tags_raw: String = row.get("tags")?;
        let speaker_raw: String = row.get("speaker")?;
        let ts_raw: String = row.get("timestamp")?;
        Ok(ConversationMessage {
            id: row.get("id")?,
            conversation_id: row.get("conversation_id")?,
            speaker: speaker_raw.parse().unwrap_or(Speaker::User),
            text: row.get("text")?,
            scope: row.get("scope")?,
            tags: Self::tags_from_json(&tags_raw),
            timestamp: Self::parse_ts(&ts_raw),
        })
    }
}

impl StoreAdapter for SqliteStore {
    async fn insert_message(&self, msg: ConversationMessage) -> Result<ConversationMessage, EngineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversation_history (id, conversation_id, speaker, text, scope, tags, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.id,
                msg.conversation_id,
                msg.speaker.to_string(),
                msg.text,
                msg.scope,
                Self::tags_to_json(&msg.tags),
                msg.timestamp.to_rfc3339(),
            ],
        )
        .map_err(EngineError::from)?;
        conn.execute(
            "INSERT INTO conversation_history_fts (id, text) VALUES (?1, ?2)",
            params![msg.id, msg.text],
        )
        .map_err(EngineError::from)?;
        Self::sync_message_tags(&conn, &msg.id, &msg.tags).map_err(EngineError::from)?;
        Ok(msg)
    }

    async fn update_message(&self, msg: ConversationMessage) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE conversation_history SET text = ?2, scope = ?3, tags = ?4, timestamp = ?5
                 WHERE id = ?1",
                params![
                    msg.id,
                    msg.text,
                    msg.scope,
                    Self::tags_to_json(&msg.tags),
                    msg.timestamp.to_rfc3339(),
                ],
            )
            .map_err(EngineError::from)?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("message {}", msg.id)));
        }
        conn.execute(
            "UPDATE conversation_history_fts SET text = ?2 WHERE id = ?1",
            params![msg.id, msg.text],
        )
        .map_err(EngineError::from)?;
        Self::sync_message_tags(&conn, &msg.id, &msg.tags).map_err(EngineError::from)?;
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<ConversationMessage>, EngineError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, conversation_id, speaker, text, scope, tags, timestamp
             FROM conversation_history WHERE id = ?1",
            params![id],
            Self::row_to_message,
        )
        .optional()
        .map_err(EngineError::from)
    }

    async fn delete_message(&self, id: &str) -> Result<bool, EngineError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute("DELETE FROM conversation_history WHERE id = ?1", params![id])
            .map_err(EngineError::from)?;
        conn.execute("DELETE FROM conversation_history_fts WHERE id = ?1", params![id])
            .map_err(EngineError::from)?;
        conn.execute("DELETE FROM memory_index WHERE source_id = ?1", params![id])
            .map_err(EngineError::from)?;
        conn.execute("DELETE FROM conversation_tags WHERE message_id = ?1", params![id])
            .map_err(EngineError::from)?;
        Ok(changed > 0)
    }

    async fn find_messages(&self, filter: &MessageFilter) -> Result<Vec<ConversationMessage>, EngineError> {
        let conn = self.conn.lock().await;

        // When a tag filter is present, join against the indexed
        // conversation_tags table rather than scanning every row's JSON
        // `tags` column; `matches_filter` below still re-checks everything
        // else as cheap insurance on the (now already tag-narrowed) rows.
        if let Some(text) = &filter.text_contains {
            let mut stmt = if filter.tag.is_some() {
                conn.prepare(
                    "SELECT ch.id, ch.conversation_id, ch.speaker, ch.text, ch.scope, ch.tags, ch.timestamp
                     FROM conversation_history ch
                     JOIN conversation_history_fts fts ON fts.id = ch.id
                     JOIN conversation_tags ct ON ct.message_id = ch.id AND ct.tag = ?2
                     WHERE conversation_history_fts MATCH ?1
                     ORDER BY ch.timestamp DESC",
                )
            } else {
                conn.prepare(
                    "SELECT ch.id, ch.conversation_id, ch.speaker, ch.text, ch.scope, ch.tags, ch.timestamp
                     FROM conversation_history ch
                     JOIN conversation_history_fts fts ON fts.id = ch.id
                     WHERE conversation_history_fts MATCH ?1
                     ORDER BY ch.timestamp DESC",
                )
            }
            .map_err(EngineError::from)?;
            let fts_query = sanitize_fts_query(text);
            let rows = stmt
                .query_map(params![fts_query, filter.tag], Self::row_to_message)
                .map_err(EngineError::from)?;
            let mut out = Vec::new();
            for row in rows {
                let msg = row.map_err(EngineError::from)?;
                if matches_filter(&msg, filter) {
                    out.push(msg);
                }
            }
            return Ok(out);
        }

        let mut stmt = if filter.tag.is_some() {
            conn.prepare(
                "SELECT ch.id, ch.conversation_id, ch.speaker, ch.text, ch.scope, ch.tags, ch.timestamp
                 FROM conversation_history ch
                 JOIN conversation_tags ct ON ct.message_id = ch.id AND ct.tag = ?1
                 ORDER BY ch.timestamp DESC",
            )
        } else {
            conn.prepare(
                "SELECT id, conversation_id, speaker, text, scope, tags, timestamp
                 FROM conversation_history ORDER BY timestamp DESC",
            )
        }
        .map_err(EngineError::from)?;
        let rows = if filter.tag.is_some() {
            stmt.query_map(params![filter.tag], Self::row_to_message)
        } else {
            stmt.query_map([], Self::row_to_message)
        }
        .map_err(EngineError::from)?;
        let mut out = Vec::new();
        for row in rows {
            let msg = row.map_err(EngineError::from)?;
            if matches_filter(&msg, filter) {
                out.push(msg);
            }
        }
        Ok(out)
    }

    async fn delete_messages_by_scope(&self, scope: &str) -> Result<u64, EngineError> {
        let conn = self.conn.lock().await;
        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT id FROM conversation_history WHERE scope = ?1")
                .map_err(EngineError::from)?;
            let rows = stmt.query_map(params![scope], |r| r.get(0)).map_err(EngineError::from)?;
            rows.collect::<Result<_, _>>().map_err(EngineError::from)?
        };
        for id in &ids {
            conn.execute("DELETE FROM conversation_history_fts WHERE id = ?1", params![id])
                .map_err(EngineError::from)?;
            conn.execute("DELETE FROM memory_index WHERE source_id = ?1", params![id])
                .map_err(EngineError::from)?;
            conn.execute("DELETE FROM conversation_tags WHERE message_id = ?1", params![id])
                .map_err(EngineError::from)?;
        }
        let changed = conn
            .execute("DELETE FROM conversation_history WHERE scope = ?1", params![scope])
            .map_err(EngineError::from)?;
        Ok(changed as u64)
    }

    async fn delete_messages_by_tag(&self, tag: &str) -> Result<u64, EngineError> {
        let conn = self.conn.lock().await;
        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT message_id FROM conversation_tags WHERE tag = ?1")
                .map_err(EngineError::from)?;
            let rows = stmt.query_map(params![tag], |r| r.get(0)).map_err(EngineError::from)?;
            rows.collect::<Result<_, _>>().map_err(EngineError::from)?
        };
        let mut deleted = 0u64;
        for id in ids {
            let changed = conn
                .execute("DELETE FROM conversation_history WHERE id = ?1", params![id])
                .map_err(EngineError::from)?;
            conn.execute("DELETE FROM conversation_history_fts WHERE id = ?1", params![id])
                .map_err(EngineError::from)?;
            conn.execute("DELETE FROM memory_index WHERE source_id = ?1", params![id])
                .map_err(EngineError::from)?;
            conn.execute("DELETE FROM conversation_tags WHERE message_id = ?1", params![id])
                .map_err(EngineError::from)?;
            if changed > 0 {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn conversation_history(
        &self,
        conversation_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ConversationMessage>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, speaker, text, scope, tags, timestamp
                 FROM conversation_history WHERE conversation_id = ?1
                 ORDER BY timestamp ASC LIMIT ?2 OFFSET ?3",
            )
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![conversation_id, limit as i64, offset as i64], Self::row_to_message)
            .map_err(EngineError::from)?;
        rows.collect::<Result<_, _>>().map_err(EngineError::from)
    }

    async fn list_conversations(
        &self,
        limit: u64,
        scope: Option<&str>,
        include_messages: bool,
    ) -> Result<Vec<ConversationSummaryRow>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, MIN(timestamp) AS first_ts, MAX(timestamp) AS last_ts,
                        COUNT(*) AS cnt, scope
                 FROM conversation_history
                 WHERE (?1 IS NULL OR scope = ?1)
                 GROUP BY conversation_id
                 ORDER BY last_ts DESC
                 LIMIT ?2",
            )
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![scope, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(EngineError::from)?;

        let mut out = Vec::new();
        for row in rows {
            let (conversation_id, first_ts, last_ts, count, scope) = row.map_err(EngineError::from)?;

            let first_message: Option<ConversationMessage> = conn
                .query_row(
                    "SELECT id, conversation_id, speaker, text, scope, tags, timestamp
                     FROM conversation_history WHERE conversation_id = ?1
                     ORDER BY timestamp ASC LIMIT 1",
                    params![conversation_id],
                    Self::row_to_message,
                )
                .optional()
                .map_err(EngineError::from)?;

            let preview_messages = if include_messages {
                let mut pstmt = conn
                    .prepare(
                        "SELECT id, conversation_id, speaker, text, scope, tags, timestamp
                         FROM conversation_history WHERE conversation_id = ?1
                         ORDER BY timestamp ASC LIMIT 3",
                    )
                    .map_err(EngineError::from)?;
                let prows = pstmt
                    .query_map(params![conversation_id], Self::row_to_message)
                    .map_err(EngineError::from)?;
                prows.collect::<Result<_, _>>().map_err(EngineError::from)?
            } else {
                Vec::new()
            };

            out.push(ConversationSummaryRow {
                conversation_id,
                first_timestamp: Self::parse_ts(&first_ts),
                last_timestamp: Self::parse_ts(&last_ts),
                message_count: count as u64,
                scope,
                first_message,
                preview_messages,
            });
        }
        Ok(out)
    }

    async fn insert_summary(&self, summary: Summary) -> Result<Summary, EngineError> {
        let conn = self.conn.lock().await;
        let refs = serde_json::to_string(&summary.message_refs).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT INTO summaries (id, conversation_id, topic_id, summary_text, scope, tags,
                                     timestamp, time_from, time_to, message_refs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                summary.id,
                summary.conversation_id,
                summary.topic_id,
                summary.summary_text,
                summary.scope,
                Self::tags_to_json(&summary.tags),
                summary.timestamp.to_rfc3339(),
                summary.time_range.from.to_rfc3339(),
                summary.time_range.to.to_rfc3339(),
                refs,
            ],
        )
        .map_err(EngineError::from)?;
        Self::sync_summary_tags(&conn, &summary.id, &summary.tags).map_err(EngineError::from)?;
        Ok(summary)
    }

    async fn summaries_by_conversation(&self, conversation_id: &str) -> Result<Vec<Summary>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, topic_id, summary_text, scope, tags, timestamp,
                        time_from, time_to, message_refs
                 FROM summaries WHERE conversation_id = ?1 ORDER BY timestamp DESC",
            )
            .map_err(EngineError::from)?;
        let rows = stmt.query_map(params![conversation_id], row_to_summary).map_err(EngineError::from)?;
        rows.collect::<Result<_, _>>().map_err(EngineError::from)
    }

    async fn latest_summaries(&self, limit: u64, scope: Option<&str>) -> Result<Vec<Summary>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, topic_id, summary_text, scope, tags, timestamp,
                        time_from, time_to, message_refs
                 FROM summaries WHERE (?1 IS NULL OR scope = ?1)
                 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![scope, limit as i64], row_to_summary)
            .map_err(EngineError::from)?;
        rows.collect::<Result<_, _>>().map_err(EngineError::from)
    }

    async fn upsert_vector_entry(&self, entry: VectorIndexEntry) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO memory_index (id, source_id, source_collection, scope, embedding,
                                        text_preview, entry_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source_id) DO UPDATE SET
                embedding = excluded.embedding,
                scope = excluded.scope,
                text_preview = excluded.text_preview,
                entry_timestamp = excluded.entry_timestamp",
            params![
                entry.id,
                entry.source_id,
                entry.source_collection.as_str(),
                entry.scope,
                Self::embedding_to_blob(&entry.embedding),
                entry.metadata.text_preview,
                entry.metadata.timestamp.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(EngineError::from)?;
        Ok(())
    }

    async fn delete_vector_entry_by_source(&self, source_id: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM memory_index WHERE source_id = ?1", params![source_id])
            .map_err(EngineError::from)?;
        Ok(())
    }

    async fn vector_entries(
        &self,
        source_collection: SourceCollection,
        scope: Option<&str>,
    ) -> Result<Vec<VectorIndexEntry>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, source_id, source_collection, scope, embedding, text_preview, entry_timestamp
                 FROM memory_index WHERE source_collection = ?1 AND (?2 IS NULL OR scope = ?2)",
            )
            .map_err(EngineError::from)?;
        let rows = stmt
            .query_map(params![source_collection.as_str(), scope], |row| {
                let blob: Vec<u8> = row.get("embedding")?;
                let ts_raw: Option<String> = row.get("entry_timestamp")?;
                Ok(VectorIndexEntry {
                    id: row.get("id")?,
                    embedding: Self::blob_to_embedding(&blob),
                    source_collection,
                    source_id: row.get("source_id")?,
                    scope: row.get("scope")?,
                    metadata: VectorIndexMetadata {
                        text_preview: row.get("text_preview")?,
                        timestamp: ts_raw.map(|s| Self::parse_ts(&s)),
                    },
                })
            })
            .map_err(EngineError::from)?;
        rows.collect::<Result<_, _>>().map_err(EngineError::from)
    }

    async fn get_scope(&self, scope_name: &str) -> Result<Option<Scope>, EngineError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, scope_name, description, created_at, active, related_keywords, parent_scope
             FROM metadata_scopes WHERE scope_name = ?1 AND type = 'scope'",
            params![scope_name],
            row_to_scope,
        )
        .optional()
        .map_err(EngineError::from)
    }

    async fn create_scope(&self, scope: Scope) -> Result<Scope, EngineError> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO metadata_scopes (id, type, scope_name, description, created_at, active,
                                           related_keywords, parent_scope)
             VALUES (?1, 'scope', ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scope.id,
                scope.scope_name,
                scope.description,
                scope.created_at.to_rfc3339(),
                scope.active as i64,
                serde_json::to_string(&scope.related_keywords).unwrap_or_else(|_| "[]".to_string()),
                scope.parent_scope,
            ],
        );

        match result {
            Ok(_) => Ok(scope),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Scope auto-creation race: the unique index is the arbiter.
                // The losing insert is treated as success, returning the
                // winner's row.
                conn.query_row(
                    "SELECT id, scope_name, description, created_at, active, related_keywords, parent_scope
                     FROM metadata_scopes WHERE scope_name = ?1 AND type = 'scope'",
                    params![scope.scope_name],
                    row_to_scope,
                )
                .map_err(EngineError::from)
            }
            Err(e) => Err(EngineError::from(e)),
        }
    }

    async fn all_scopes(&self) -> Result<Vec<Scope>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, scope_name, description, created_at, active, related_keywords, parent_scope
                 FROM metadata_scopes WHERE type = 'scope'",
            )
            .map_err(EngineError::from)?;
        let rows = stmt.query_map([], row_to_scope).map_err(EngineError::from)?;
        rows.collect::<Result<_, _>>().map_err(EngineError::from)
    }

    async fn upsert_user_profile_item(&self, item: UserProfileItem) -> Result<UserProfileItem, EngineError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_profile (id, user_id, key, value, category)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value, category = excluded.category",
            params![
                item.id,
                item.user_id,
                item.key,
                item.value.to_string(),
                item.category,
            ],
        )
        .map_err(EngineError::from)?;
        Ok(item)
    }

    async fn stats(&self) -> Result<StoreStats, EngineError> {
        let conn = self.conn.lock().await;
        let total_messages: u64 = conn
            .query_row("SELECT COUNT(*) FROM conversation_history", [], |r| r.get::<_, i64>(0))
            .map_err(EngineError::from)? as u64;
        let total_summaries: u64 = conn
            .query_row("SELECT COUNT(*) FROM summaries", [], |r| r.get::<_, i64>(0))
            .map_err(EngineError::from)? as u64;
        let total_vector_entries: u64 = conn
            .query_row("SELECT COUNT(*) FROM memory_index", [], |r| r.get::<_, i64>(0))
            .map_err(EngineError::from)? as u64;

        let mut messages_per_scope = std::collections::BTreeMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT scope, COUNT(*) FROM conversation_history GROUP BY scope")
                .map_err(EngineError::from)?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64)))
                .map_err(EngineError::from)?;
            for row in rows {
                let (scope, count) = row.map_err(EngineError::from)?;
                messages_per_scope.insert(scope, count);
            }
        }

        let mut tag_counts: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT tags FROM conversation_history").map_err(EngineError::from)?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0)).map_err(EngineError::from)?;
            for row in rows {
                let tags_raw = row.map_err(EngineError::from)?;
                for tag in Self::tags_from_json(&tags_raw) {
                    *tag_counts.entry(tag).or_insert(0) += 1;
                }
            }
        }
        let mut top_tags: Vec<(String, u64)> = tag_counts.into_iter().collect();
        top_tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_tags.truncate(10);

        Ok(StoreStats {
            total_messages,
            total_summaries,
            total_vector_entries,
            messages_per_scope,
            top_tags,
        })
    }

    async fn optimize(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("VACUUM; ANALYZE;").map_err(EngineError::from)?;
        Ok(vec!["vacuum".to_string(), "analyze".to_string(), "summarize_old: not implemented".to_string()])
    }
}

fn sanitize_fts_query(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn matches_filter(msg: &ConversationMessage, filter: &MessageFilter) -> bool {
    if let Some(conv) = &filter.conversation_id {
        if &msg.conversation_id != conv {
            return false;
        }
    }
    if let Some(scope) = &filter.scope {
        if &msg.scope != scope {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if !msg.tags.contains(tag) {
            return false;
        }
    }
    if let Some(text) = &filter.text_contains {
        if !msg.text.to_lowercase().contains(&text.to_lowercase()) {
            return false;
        }
    }
    if let Some(from) = filter.from {
        if msg.timestamp < from {
            return false;
        }
    }
    if let Some(to) = filter.to {
        if msg.timestamp > to {
            return false;
        }
    }
    true
}

fn row_to_scope(row: &rusqlite::Row) -> rusqlite::Result<Scope> {
    let keywords_raw: String = row.get("related_keywords")?;
    let created_raw: String = row.get("created_at")?;
    Ok(Scope {
        id: row.get("id")?,
        scope_name: row.get("scope_name")?,
        description: row.get("description")?,
        created_at: SqliteStore::parse_ts(&created_raw),
        active: row.get::<_, i64>("active")? != 0,
        related_keywords: serde_json::from_str(&keywords_raw).unwrap_or_default(),
        parent_scope: row.get("parent_scope")?,
    })
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<Summary> {
    let tags_raw: String = row.get("tags")?;
    let refs_raw: String = row.get("message_refs")?;
    let ts_raw: String = row.get("timestamp")?;
    let from_raw: String = row.get("time_from")?;
    let to_raw: String = row.get("time_to")?;
    Ok(Summary {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        topic_id: row.get("topic_id")?,
        summary_text: row.get("summary_text")?,
        scope: row.get("scope")?,
        tags: SqliteStore::tags_from_json(&tags_raw),
        timestamp: SqliteStore::parse_ts(&ts_raw),
        time_range: TimeRange {
            from: SqliteStore::parse_ts(&from_raw),
            to: SqliteStore::parse_ts(&to_raw),
        },
        message_refs: serde_json::from_str(&refs_raw).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::new_id;

    fn sample_message(scope: &str, text: &str) -> ConversationMessage {
        ConversationMessage {
            id: new_id(),
            conversation_id: new_id(),
            speaker: Speaker::User,
            text: text.to_string(),
            scope: scope.to_string(),
            tags: BTreeSet::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trips() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let msg = sample_message("Work", "The deadline for Project Alpha is May 15th");
        let inserted = store.insert_message(msg.clone()).await.unwrap();
        let fetched = store.get_message(&inserted.id).await.unwrap().unwrap();
        assert_eq!(fetched.text, msg.text);
    }

    #[tokio::test]
    async fn delete_removes_message_and_index() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let msg = sample_message("Work", "Alice's birthday is Friday");
        let inserted = store.insert_message(msg).await.unwrap();
        let deleted = store.delete_message(&inserted.id).await.unwrap();
        assert!(deleted);
        assert!(store.get_message(&inserted.id).await.unwrap().is_none());
        let second = store.delete_message(&inserted.id).await.unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn scope_auto_creation_race_is_idempotent() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let scope_a = Scope::new_active("Work", "first insert");
        let scope_b = Scope::new_active("Work", "second insert, should lose");
        let winner_a = store.create_scope(scope_a.clone()).await.unwrap();
        let winner_b = store.create_scope(scope_b).await.unwrap();
        assert_eq!(winner_a.id, winner_b.id);
    }

    #[tokio::test]
    async fn find_messages_by_tag_uses_indexed_lookup() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut urgent = sample_message("Work", "renew the contract");
        urgent.tags = BTreeSet::from(["urgent".to_string(), "billing".to_string()]);
        let mut other = sample_message("Work", "unrelated note");
        other.tags = BTreeSet::from(["billing".to_string()]);
        store.insert_message(urgent.clone()).await.unwrap();
        store.insert_message(other).await.unwrap();

        let filter = MessageFilter {
            conversation_id: None,
            scope: None,
            tag: Some("urgent".to_string()),
            text_contains: None,
            from: None,
            to: None,
        };
        let found = store.find_messages(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, urgent.id);
    }

    #[tokio::test]
    async fn delete_messages_by_tag_removes_only_tagged_rows() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut tagged = sample_message("Work", "drop me");
        tagged.tags = BTreeSet::from(["stale".to_string()]);
        let keep = sample_message("Work", "keep me");
        store.insert_message(tagged.clone()).await.unwrap();
        let keep = store.insert_message(keep).await.unwrap();

        let deleted = store.delete_messages_by_tag("stale").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_message(&tagged.id).await.unwrap().is_none());
        assert!(store.get_message(&keep.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_counts_messages_per_scope() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.insert_message(sample_message("Work", "a")).await.unwrap();
        store.insert_message(sample_message("Work", "b")).await.unwrap();
        store.insert_message(sample_message("Personal", "c")).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.messages_per_scope.get("Work"), Some(&2));
        assert_eq!(stats.messages_per_scope.get("Personal"), Some(&1));
    }
}
