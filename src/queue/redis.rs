//! Redis list queue (`LPUSH` / `BRPOP`)

use super::{ExecuteJob, JobQueue};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ::redis::aio::ConnectionManager;

const QUEUE_KEY: &str = "stepiq:queue:execute";

/// How long a single `BRPOP` blocks before returning empty
const POLL_TIMEOUT_SECS: f64 = 1.0;

pub struct RedisQueue {
    conn: ConnectionManager,
    key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self {
            conn,
            key: QUEUE_KEY.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: ExecuteJob) -> Result<()> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        ::redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .context("Failed to enqueue job")?;
        Ok(())
    }

    async fn next_job(&self) -> Result<Option<ExecuteJob>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = ::redis::cmd("BRPOP")
            .arg(&self.key)
            .arg(POLL_TIMEOUT_SECS)
            .query_async(&mut conn)
            .await
            .context("Failed to read job")?;

        match popped {
            Some((_, payload)) => Ok(Some(
                serde_json::from_str(&payload).context("Malformed execute job")?,
            )),
            None => Ok(None),
        }
    }
}
