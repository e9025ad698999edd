use std::collections::HashMap;

use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::name_crc32;
use crate::db::DbPool;
use crate::errors::ResolveError;

/// Write-through cache of `(category, name) -> slice id` over the `slices`
/// table. Same single-flight and monotonicity contract as [`MetricNames`].
///
/// [`MetricNames`]: crate::names::metrics::MetricNames
pub struct SliceNames {
    pool: DbPool,
    cache: RwLock<HashMap<(String, String), i32>>,
}

impl SliceNames {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn warm_up(&self, reject: &Regex) -> Result<usize, ResolveError> {
        let client = self.pool.get_client().await?;
        let rows = client
            .query("SELECT id, category, name FROM slices", &[])
            .await?;

        let mut cache = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i32 = row.get("id");
            let category: String = row.get("category");
            let name: String = row.get("name");
            if reject.is_match(&name) {
                debug!(category = %category, slice = %name, "skipping rejected slice name at warm-up");
                continue;
            }
            cache.insert((category, name), id);
        }
        let count = cache.len();
        *self.cache.write().await = cache;
        info!(slices = count, "slice name cache warmed up");
        Ok(count)
    }

    pub async fn resolve(&self, category: &str, name: &str) -> Result<i32, ResolveError> {
        let key = (category.to_string(), name.to_string());
        if let Some(id) = self.cache.read().await.get(&key).copied() {
            return Ok(id);
        }

        let mut cache = self.cache.write().await;
        if let Some(id) = cache.get(&key).copied() {
            return Ok(id);
        }

        let id = self.resolve_in_db(category, name).await?;
        if id <= 0 {
            return Err(ResolveError::InvalidId {
                name: format!("{category}/{name}"),
                id,
            });
        }
        cache.insert(key, id);
        debug!(category = %category, slice = %name, id, "resolved new slice name");
        Ok(id)
    }

    async fn resolve_in_db(&self, category: &str, name: &str) -> Result<i32, ResolveError> {
        let category_crc = name_crc32(category);
        let crc = name_crc32(name);
        let client = self.pool.get_client().await?;

        if let Some(row) = client
            .query_opt(
                "SELECT id FROM slices \
                 WHERE category_crc_32 = $1 AND name_crc_32 = $2 AND category = $3 AND name = $4",
                &[&category_crc, &crc, &category, &name],
            )
            .await?
        {
            return Ok(row.get(0));
        }

        if let Some(row) = client
            .query_opt(
                "INSERT INTO slices (category, name, category_crc_32, name_crc_32) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (category, name) DO NOTHING RETURNING id",
                &[&category, &name, &category_crc, &crc],
            )
            .await?
        {
            return Ok(row.get(0));
        }

        let row = client
            .query_opt(
                "SELECT id FROM slices WHERE category = $1 AND name = $2",
                &[&category, &name],
            )
            .await?
            .ok_or_else(|| ResolveError::MissingAfterInsert(format!("{category}/{name}")))?;
        Ok(row.get(0))
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, category: &str, name: &str, id: i32) {
        self.cache
            .write()
            .await
            .insert((category.to_string(), name.to_string()), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;

    fn offline_pool() -> DbPool {
        DbPool::new(&DbConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "nobody".to_string(),
            password: "".to_string(),
            database: "none".to_string(),
            pool_size: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn cached_pairs_resolve_without_touching_the_database() {
        let names = SliceNames::new(offline_pool());
        names.seed("country", "US", 3).await;
        assert_eq!(names.resolve("country", "US").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn category_and_name_are_distinct_key_parts() {
        let names = SliceNames::new(offline_pool());
        names.seed("country", "US", 3).await;
        names.seed("device", "US", 4).await;
        assert_eq!(names.resolve("country", "US").await.unwrap(), 3);
        assert_eq!(names.resolve("device", "US").await.unwrap(), 4);
    }
}
