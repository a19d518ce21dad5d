//! SQLite storage implementation.
//!
//! This module provides a SQLite-based implementation of the `SupervisorStorage`
//! trait. It uses rusqlite for database access and stores vectors as little-endian
//! f32 BLOBs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{StorageError, StorageResult, SupervisorStorage};
use crate::models::{Abstract, EmbeddingConfig, Researcher, SupervisorTopic, Topic, Vector};

const CONFIG_KEY: &str = "embedding_config";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS config (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS supervisor (
        uuid      TEXT PRIMARY KEY,
        name      TEXT,
        email     TEXT,
        keywords  TEXT NOT NULL,
        topic_ids TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS supervisor_embedding (
        uuid    TEXT NOT NULL REFERENCES supervisor(uuid) ON DELETE CASCADE,
        variant TEXT NOT NULL,
        vector  BLOB NOT NULL,
        PRIMARY KEY (uuid, variant)
    );
    CREATE TABLE IF NOT EXISTS supervisor_abstract (
        researcher_uuid TEXT NOT NULL REFERENCES supervisor(uuid) ON DELETE CASCADE,
        position        INTEGER NOT NULL,
        uuid            TEXT NOT NULL,
        title           TEXT NOT NULL,
        url             TEXT,
        text            TEXT NOT NULL,
        embedding       BLOB,
        topics          TEXT NOT NULL,
        PRIMARY KEY (researcher_uuid, position)
    );
    CREATE TABLE IF NOT EXISTS topic (
        topic_id INTEGER PRIMARY KEY,
        label    TEXT NOT NULL UNIQUE,
        keywords TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS supervisor_topic (
        uuid     TEXT NOT NULL,
        topic_id INTEGER NOT NULL REFERENCES topic(topic_id),
        score    REAL NOT NULL,
        PRIMARY KEY (uuid, topic_id)
    );
";

/// SQLite-based snapshot storage.
///
/// # Schema
/// - `config`: embedding configuration as JSON
/// - `supervisor`: one row per researcher (keywords and topic ids as JSON)
/// - `supervisor_embedding`: one row per (researcher, variant)
/// - `supervisor_abstract`: abstracts in researcher order
/// - `topic`, `supervisor_topic`: the catalog, replaced each run
pub struct SqliteStorage {
    /// Path to the SQLite database file (`:memory:` for an in-memory database)
    db_path: String,

    /// Open connection, set by `initialize`
    connection: Option<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance. Call `initialize` before use.
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            connection: None,
        }
    }

    /// Open and initialize a database in one step.
    pub async fn open(db_path: impl Into<String>) -> StorageResult<Self> {
        let mut storage = Self::new(db_path);
        storage.initialize().await?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.connection
            .as_ref()
            .ok_or_else(|| StorageError::ConnectionError("storage not initialized".to_string()))?
            .lock()
            .map_err(|e| StorageError::ConnectionError(format!("connection lock poisoned: {}", e)))
    }

    /// Serialize a vector as little-endian f32 bytes.
    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Deserialize little-endian f32 bytes.
    ///
    /// # Errors
    /// Returns `StorageError::SerializationError` if the length is not a multiple of 4
    /// or a value is not finite
    fn deserialize_embedding(bytes: &[u8]) -> StorageResult<Vector> {
        if bytes.len() % 4 != 0 {
            return Err(StorageError::SerializationError(format!(
                "vector blob of {} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }
        let vector: Vector = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(StorageError::SerializationError(
                "vector contains non-finite values".to_string(),
            ));
        }
        Ok(vector)
    }

    fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
        serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> StorageResult<T> {
        serde_json::from_str(raw).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    fn write_researcher(tx: &rusqlite::Transaction<'_>, researcher: &Researcher) -> StorageResult<()> {
        let query_err = |e: rusqlite::Error| StorageError::QueryError(e.to_string());

        tx.execute(
            "INSERT INTO supervisor (uuid, name, email, keywords, topic_ids)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uuid) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                keywords = excluded.keywords,
                topic_ids = excluded.topic_ids",
            params![
                researcher.uuid,
                researcher.name,
                researcher.email,
                Self::to_json(&researcher.keywords)?,
                Self::to_json(&researcher.topic_ids)?,
            ],
        )
        .map_err(query_err)?;

        tx.execute("DELETE FROM supervisor_embedding WHERE uuid = ?1", params![researcher.uuid])
            .map_err(query_err)?;
        tx.execute(
            "DELETE FROM supervisor_abstract WHERE researcher_uuid = ?1",
            params![researcher.uuid],
        )
        .map_err(query_err)?;

        for (variant, vector) in &researcher.embeddings {
            tx.execute(
                "INSERT INTO supervisor_embedding (uuid, variant, vector) VALUES (?1, ?2, ?3)",
                params![researcher.uuid, variant, Self::serialize_embedding(vector)],
            )
            .map_err(query_err)?;
        }

        for (position, abs) in researcher.abstracts.iter().enumerate() {
            tx.execute(
                "INSERT INTO supervisor_abstract
                    (researcher_uuid, position, uuid, title, url, text, embedding, topics)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    researcher.uuid,
                    position as i64,
                    abs.uuid,
                    abs.title,
                    abs.url,
                    abs.text,
                    abs.embedding.as_deref().map(Self::serialize_embedding),
                    Self::to_json(&abs.topics)?,
                ],
            )
            .map_err(query_err)?;
        }
        Ok(())
    }

    fn load_embeddings(conn: &Connection, uuid: &str) -> StorageResult<BTreeMap<String, Vector>> {
        let mut stmt = conn
            .prepare("SELECT variant, vector FROM supervisor_embedding WHERE uuid = ?1 ORDER BY variant")
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        let rows = stmt
            .query_map(params![uuid], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        let mut embeddings = BTreeMap::new();
        for row in rows {
            let (variant, blob) = row.map_err(|e| StorageError::QueryError(e.to_string()))?;
            match Self::deserialize_embedding(&blob) {
                Ok(vector) => {
                    embeddings.insert(variant, vector);
                }
                Err(e) => warn!(researcher = uuid, variant = %variant, error = %e, "Skipping unparseable vector"),
            }
        }
        Ok(embeddings)
    }

    fn load_abstracts(conn: &Connection, uuid: &str) -> StorageResult<Vec<Abstract>> {
        let mut stmt = conn
            .prepare(
                "SELECT uuid, title, url, text, embedding, topics
                 FROM supervisor_abstract WHERE researcher_uuid = ?1 ORDER BY position",
            )
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        let rows = stmt
            .query_map(params![uuid], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        let mut abstracts = Vec::new();
        for row in rows {
            let (abs_uuid, title, url, text, blob, topics) =
                row.map_err(|e| StorageError::QueryError(e.to_string()))?;
            let mut abs = Abstract::new(abs_uuid, title, url, text);
            abs.embedding = match blob.map(|b| Self::deserialize_embedding(&b)) {
                Some(Ok(vector)) => Some(vector),
                Some(Err(e)) => {
                    warn!(abstract_uuid = %abs.uuid, error = %e, "Skipping unparseable abstract vector");
                    None
                }
                None => None,
            };
            abs.topics = Self::from_json(&topics)?;
            abstracts.push(abs);
        }
        Ok(abstracts)
    }
}

#[async_trait]
impl SupervisorStorage for SqliteStorage {
    async fn initialize(&mut self) -> StorageResult<()> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .map_err(|e| StorageError::ConnectionError(format!("{}: {}", self.db_path, e)))?;
            self.connection = Some(Mutex::new(conn));
        }
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StorageError::SchemaError(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StorageError::SchemaError(e.to_string()))?;
        debug!(path = %self.db_path, "SQLite schema ready");
        Ok(())
    }

    async fn store_config(&mut self, config: &EmbeddingConfig) -> StorageResult<()> {
        let value = Self::to_json(config)?;
        self.conn()?
            .execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![CONFIG_KEY, value],
            )
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        Ok(())
    }

    async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![CONFIG_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        raw.map(|raw| Self::from_json(&raw)).transpose()
    }

    async fn upsert_researchers(&mut self, batch: &[Researcher]) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        for researcher in batch {
            Self::write_researcher(&tx, researcher)?;
        }
        tx.commit().map_err(|e| StorageError::QueryError(e.to_string()))?;
        debug!(count = batch.len(), "Upserted researcher batch");
        Ok(())
    }

    async fn replace_topic_catalog(
        &mut self,
        topics: &[Topic],
        supervisor_topics: &[SupervisorTopic],
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        let query_err = |e: rusqlite::Error| StorageError::QueryError(e.to_string());

        tx.execute("DELETE FROM supervisor_topic", []).map_err(query_err)?;
        tx.execute("DELETE FROM topic", []).map_err(query_err)?;

        let mut labels = BTreeSet::new();
        for topic in topics {
            if !labels.insert(topic.label.as_str()) {
                return Err(StorageError::InvalidRecord(format!(
                    "duplicate topic label '{}'",
                    topic.label
                )));
            }
            tx.execute(
                "INSERT INTO topic (topic_id, label, keywords) VALUES (?1, ?2, ?3)",
                params![topic.topic_id, topic.label, Self::to_json(&topic.keywords)?],
            )
            .map_err(query_err)?;
        }

        for row in supervisor_topics {
            let Some(topic_id) = row.topic_id else {
                return Err(StorageError::InvalidRecord(format!(
                    "association for '{}' has no topic id",
                    row.uuid
                )));
            };
            if !row.score.is_finite() {
                return Err(StorageError::InvalidRecord(format!(
                    "association ({}, {}) has non-finite score",
                    row.uuid, topic_id
                )));
            }
            tx.execute(
                "INSERT INTO supervisor_topic (uuid, topic_id, score) VALUES (?1, ?2, ?3)",
                params![row.uuid, topic_id, row.score],
            )
            .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        debug!(
            topics = topics.len(),
            associations = supervisor_topics.len(),
            "Replaced topic catalog"
        );
        Ok(())
    }

    async fn load_researchers(&self) -> StorageResult<Vec<Researcher>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT uuid, name, email, keywords, topic_ids FROM supervisor ORDER BY rowid")
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| StorageError::QueryError(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        let mut researchers = Vec::with_capacity(rows.len());
        for (uuid, name, email, keywords, topic_ids) in rows {
            let mut researcher = Researcher::new(uuid);
            researcher.name = name;
            researcher.email = email;
            researcher.keywords = Self::from_json(&keywords)?;
            researcher.topic_ids = Self::from_json(&topic_ids)?;
            researcher.embeddings = Self::load_embeddings(&conn, &researcher.uuid)?;
            researcher.abstracts = Self::load_abstracts(&conn, &researcher.uuid)?;
            researchers.push(researcher);
        }
        Ok(researchers)
    }

    async fn load_topics(&self) -> StorageResult<Vec<Topic>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT topic_id, label, keywords FROM topic ORDER BY topic_id")
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        let mut topics = Vec::new();
        for row in rows {
            let (topic_id, label, keywords) = row.map_err(|e| StorageError::QueryError(e.to_string()))?;
            topics.push(Topic {
                topic_id,
                label,
                keywords: Self::from_json(&keywords)?,
            });
        }
        Ok(topics)
    }

    async fn load_supervisor_topics(&self) -> StorageResult<Vec<SupervisorTopic>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT uuid, topic_id, score FROM supervisor_topic ORDER BY rowid")
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SupervisorTopic {
                    uuid: row.get(0)?,
                    topic_id: row.get(1)?,
                    score: row.get(2)?,
                })
            })
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::QueryError(e.to_string()))
    }

    async fn count_researchers(&self) -> StorageResult<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM supervisor", [], |row| row.get(0))
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelKind;

    fn researcher(uuid: &str) -> Researcher {
        let mut r = Researcher::new(uuid);
        r.name = Some(format!("Name {}", uuid));
        r.keywords.insert("robotics".to_string());
        r.embeddings.insert("bert_averaged_embedding".to_string(), vec![0.5, -1.0]);
        let mut abs = Abstract::new(format!("{}-a", uuid), "Title".into(), Some("https://x".into()), "Text".into());
        abs.embedding = Some(vec![1.0, 2.0]);
        abs.topics.insert(3, 0.75);
        r.abstracts.push(abs);
        r.topic_ids = vec![3];
        r
    }

    async fn storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.db");
        let storage = SqliteStorage::open(path.to_string_lossy().to_string()).await.unwrap();
        (dir, storage)
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let v = vec![0.25, -3.5, 1e-6];
        let bytes = SqliteStorage::serialize_embedding(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(SqliteStorage::deserialize_embedding(&bytes).unwrap(), v);
        assert!(SqliteStorage::deserialize_embedding(&bytes[..5]).is_err());
        let nan = SqliteStorage::serialize_embedding(&[f32::NAN]);
        assert!(SqliteStorage::deserialize_embedding(&nan).is_err());
    }

    #[tokio::test]
    async fn test_uninitialized_storage_errors() {
        let storage = SqliteStorage::new(":memory:");
        assert!(matches!(
            storage.count_researchers().await,
            Err(StorageError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (_dir, mut storage) = storage().await;
        storage.initialize().await.unwrap();
        assert_eq!(storage.count_researchers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let (_dir, mut storage) = storage().await;
        assert!(storage.get_config().await.unwrap().is_none());

        let config = EmbeddingConfig {
            primary_model: ModelKind::Specter2,
            dimension: 768,
            serving_variant: "specter2_averaged_embedding_with_keywords".to_string(),
            variants: vec!["specter2_averaged_embedding_with_keywords".to_string()],
        };
        storage.store_config(&config).await.unwrap();
        storage.store_config(&config).await.unwrap();
        assert_eq!(storage.get_config().await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_upsert_replaces_wholesale() {
        let (_dir, mut storage) = storage().await;
        storage.upsert_researchers(&[researcher("r1"), researcher("r2")]).await.unwrap();

        let mut updated = researcher("r1");
        updated.embeddings.clear();
        updated.embeddings.insert("bert_concatenated_embedding".to_string(), vec![9.0]);
        updated.abstracts.clear();
        storage.upsert_researchers(&[updated]).await.unwrap();

        let loaded = storage.load_researchers().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].uuid, "r1");
        assert_eq!(loaded[0].embeddings.len(), 1);
        assert!(loaded[0].embedding("bert_concatenated_embedding").is_some());
        assert!(loaded[0].abstracts.is_empty());
        assert_eq!(loaded[1], researcher("r2"));
    }

    #[tokio::test]
    async fn test_unparseable_vector_is_skipped_on_load() {
        let (_dir, mut storage) = storage().await;
        storage.upsert_researchers(&[researcher("r1")]).await.unwrap();
        storage
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO supervisor_embedding (uuid, variant, vector) VALUES ('r1', 'broken', x'0102')",
                [],
            )
            .unwrap();

        let loaded = storage.load_researchers().await.unwrap();
        assert_eq!(loaded[0].embeddings.len(), 1);
        assert!(loaded[0].embedding("broken").is_none());
    }

    #[tokio::test]
    async fn test_replace_topic_catalog() {
        let (_dir, mut storage) = storage().await;
        let topics = vec![
            Topic { topic_id: 0, label: "Robotics".into(), keywords: vec!["robotics".into()] },
            Topic { topic_id: 1, label: "Graphs".into(), keywords: vec!["graphs".into()] },
        ];
        let rows = vec![SupervisorTopic::new("r1", 0, 1.5), SupervisorTopic::new("r1", 1, 0.0)];
        storage.replace_topic_catalog(&topics, &rows).await.unwrap();

        let replacement = vec![Topic { topic_id: 7, label: "Vision".into(), keywords: vec![] }];
        storage
            .replace_topic_catalog(&replacement, &[SupervisorTopic::new("r2", 7, 0.4)])
            .await
            .unwrap();

        assert_eq!(storage.load_topics().await.unwrap(), replacement);
        let loaded_rows = storage.load_supervisor_topics().await.unwrap();
        assert_eq!(loaded_rows, vec![SupervisorTopic::new("r2", 7, 0.4)]);
    }

    #[tokio::test]
    async fn test_replace_topic_catalog_rejects_invalid_rows_atomically() {
        let (_dir, mut storage) = storage().await;
        let topics = vec![Topic { topic_id: 0, label: "Robotics".into(), keywords: vec![] }];
        storage
            .replace_topic_catalog(&topics, &[SupervisorTopic::new("r1", 0, 1.0)])
            .await
            .unwrap();

        let duplicate_pair = vec![SupervisorTopic::new("r1", 0, 1.0), SupervisorTopic::new("r1", 0, 2.0)];
        assert!(storage.replace_topic_catalog(&topics, &duplicate_pair).await.is_err());

        let unknown_topic = vec![SupervisorTopic::new("r1", 42, 1.0)];
        assert!(storage.replace_topic_catalog(&topics, &unknown_topic).await.is_err());

        let nan = vec![SupervisorTopic::new("r1", 0, f64::NAN)];
        assert!(matches!(
            storage.replace_topic_catalog(&topics, &nan).await,
            Err(StorageError::InvalidRecord(_))
        ));

        // The previous catalog survives every failed replacement.
        assert_eq!(storage.load_supervisor_topics().await.unwrap().len(), 1);
    }
}
