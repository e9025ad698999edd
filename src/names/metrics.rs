use std::collections::HashMap;

use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::name_crc32;
use crate::db::DbPool;
use crate::errors::ResolveError;

/// Write-through cache of `metric name -> id` over the `metrics` table.
///
/// Entries are monotone: once a name is published with an id, it is never
/// re-published with a different one. First-sight resolution is
/// single-flight: the write lock is held across the database round trip,
/// so N racing callers for the same unknown name produce one lookup and
/// at most one insert.
pub struct MetricNames {
    pool: DbPool,
    cache: RwLock<HashMap<String, i32>>,
}

impl MetricNames {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Bulk-loads the whole names table, skipping names the reject pattern
    /// matches. Called once at startup; a failure here is fatal.
    pub async fn warm_up(&self, reject: &Regex) -> Result<usize, ResolveError> {
        let client = self.pool.get_client().await?;
        let rows = client.query("SELECT id, name FROM metrics", &[]).await?;

        let mut cache = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i32 = row.get("id");
            let name: String = row.get("name");
            if reject.is_match(&name) {
                debug!(metric = %name, "skipping rejected metric name at warm-up");
                continue;
            }
            cache.insert(name, id);
        }
        let count = cache.len();
        *self.cache.write().await = cache;
        info!(metrics = count, "metric name cache warmed up");
        Ok(count)
    }

    pub async fn resolve(&self, name: &str) -> Result<i32, ResolveError> {
        if let Some(id) = self.cache.read().await.get(name).copied() {
            return Ok(id);
        }

        let mut cache = self.cache.write().await;
        // Another caller may have resolved the name while we waited.
        if let Some(id) = cache.get(name).copied() {
            return Ok(id);
        }

        let id = self.resolve_in_db(name).await?;
        if id <= 0 {
            return Err(ResolveError::InvalidId {
                name: name.to_string(),
                id,
            });
        }
        cache.insert(name.to_string(), id);
        debug!(metric = %name, id, "resolved new metric name");
        Ok(id)
    }

    async fn resolve_in_db(&self, name: &str) -> Result<i32, ResolveError> {
        let crc = name_crc32(name);
        let client = self.pool.get_client().await?;

        if let Some(row) = client
            .query_opt(
                "SELECT id FROM metrics WHERE name_crc_32 = $1 AND name = $2",
                &[&crc, &name],
            )
            .await?
        {
            return Ok(row.get(0));
        }

        if let Some(row) = client
            .query_opt(
                "INSERT INTO metrics (name, name_crc_32) VALUES ($1, $2) \
                 ON CONFLICT (name) DO NOTHING RETURNING id",
                &[&name, &crc],
            )
            .await?
        {
            return Ok(row.get(0));
        }

        // Lost the insert race to another process; the row exists now.
        let row = client
            .query_opt("SELECT id FROM metrics WHERE name = $1", &[&name])
            .await?
            .ok_or_else(|| ResolveError::MissingAfterInsert(name.to_string()))?;
        Ok(row.get(0))
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, name: &str, id: i32) {
        self.cache.write().await.insert(name.to_string(), id);
    }
}
