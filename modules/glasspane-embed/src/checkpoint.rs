//! Per-stream and global embedding checkpoints in the broker.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use glasspane_common::GlasspaneError;

const CHECKPOINT_PREFIX: &str = "checkpoint:";
const GLOBAL_KEY: &str = "checkpoint:global";

type Result<T> = std::result::Result<T, GlasspaneError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub offset: i64,
    pub total: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalCheckpoint {
    pub tables_completed: i64,
    pub total_embedded: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn set(&self, table: &str, offset: i64, total: i64) -> Result<()>;
    async fn get(&self, table: &str) -> Result<Option<Checkpoint>>;
    async fn all(&self) -> Result<HashMap<String, Checkpoint>>;
    async fn set_global(&self, tables_completed: i64, total_embedded: i64) -> Result<()>;
    async fn get_global(&self) -> Result<Option<GlobalCheckpoint>>;
    async fn delete(&self, table: &str) -> Result<()>;
    /// Drop every checkpoint, global included. Returns the key count removed.
    async fn reset_all(&self) -> Result<usize>;
}

#[derive(Clone)]
pub struct RedisCheckpointStore {
    conn: ConnectionManager,
}

impl RedisCheckpointStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn store_err(e: impl std::fmt::Display) -> GlasspaneError {
        GlasspaneError::Queue(e.to_string())
    }

    async fn scan_keys(&self) -> Result<Vec<String>> {
        let mut scan_conn = self.conn.clone();
        let mut iter = scan_conn
            .scan_match::<_, String>(format!("{CHECKPOINT_PREFIX}*"))
            .await
            .map_err(Self::store_err)?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn set(&self, table: &str, offset: i64, total: i64) -> Result<()> {
        let checkpoint = Checkpoint {
            offset,
            total,
            updated_at: Utc::now(),
        };
        let payload = serde_json::to_string(&checkpoint).map_err(Self::store_err)?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .set(format!("{CHECKPOINT_PREFIX}{table}"), payload)
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    async fn get(&self, table: &str) -> Result<Option<Checkpoint>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(format!("{CHECKPOINT_PREFIX}{table}"))
            .await
            .map_err(Self::store_err)?;
        Ok(payload.and_then(|p| serde_json::from_str(&p).ok()))
    }

    async fn all(&self) -> Result<HashMap<String, Checkpoint>> {
        let keys = self.scan_keys().await?;
        let mut conn = self.conn.clone();
        let mut checkpoints = HashMap::new();

        for key in keys {
            if key == GLOBAL_KEY {
                continue;
            }
            let payload: Option<String> = conn.get(&key).await.map_err(Self::store_err)?;
            if let Some(checkpoint) = payload.and_then(|p| serde_json::from_str(&p).ok()) {
                checkpoints.insert(key.trim_start_matches(CHECKPOINT_PREFIX).to_string(), checkpoint);
            }
        }

        Ok(checkpoints)
    }

    async fn set_global(&self, tables_completed: i64, total_embedded: i64) -> Result<()> {
        let global = GlobalCheckpoint {
            tables_completed,
            total_embedded,
            updated_at: Some(Utc::now()),
        };
        let payload = serde_json::to_string(&global).map_err(Self::store_err)?;

        let mut conn = self.conn.clone();
        let _: () = conn.set(GLOBAL_KEY, payload).await.map_err(Self::store_err)?;
        Ok(())
    }

    async fn get_global(&self) -> Result<Option<GlobalCheckpoint>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(GLOBAL_KEY).await.map_err(Self::store_err)?;
        Ok(payload.and_then(|p| serde_json::from_str(&p).ok()))
    }

    async fn delete(&self, table: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(format!("{CHECKPOINT_PREFIX}{table}"))
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    async fn reset_all(&self) -> Result<usize> {
        let keys = self.scan_keys().await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len();
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await.map_err(Self::store_err)?;
        Ok(count)
    }
}
