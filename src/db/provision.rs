use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tracing::info;

use crate::aggregate::table::TableFamily;
use crate::clock::DateKey;
use crate::db::DbPool;
use crate::errors::DbError;

/// Creates the per-day aggregate tables on demand.
///
/// DDL for a `(family, date)` pair is sent at most once per process; the
/// statements are `IF NOT EXISTS` so restarts and other processes are
/// harmless. Concurrent calls for the same family coalesce on one lock.
pub struct SchemaProvisioner {
    pool: DbPool,
    ensured: DashSet<(&'static str, DateKey)>,
    family_locks: DashMap<&'static str, Arc<Mutex<()>>>,
}

impl SchemaProvisioner {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            ensured: DashSet::new(),
            family_locks: DashMap::new(),
        }
    }

    pub async fn ensure(
        &self,
        family: &'static TableFamily,
        date: &DateKey,
    ) -> Result<(), DbError> {
        if self.ensured.contains(&(family.prefix, date.clone())) {
            return Ok(());
        }

        let lock = self
            .family_locks
            .entry(family.prefix)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        // A racing caller may have finished while we waited for the lock.
        if self.ensured.contains(&(family.prefix, date.clone())) {
            return Ok(());
        }

        let client = self.pool.get_client().await?;
        client
            .execute(family.create_table_sql(date).as_str(), &[])
            .await?;
        if let Some(index_sql) = family.create_index_sql(date) {
            client.execute(index_sql.as_str(), &[]).await?;
        }
        info!(table = %family.table_name(date), "ensured aggregate table");

        self.ensured.insert((family.prefix, date.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::table::MINUTE_METRICS;
    use crate::clock::Clock;
    use crate::config::DbConfig;

    fn offline_pool() -> DbPool {
        // Deadpool opens connections lazily, so an unreachable address is
        // fine as long as no client is requested.
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
    async fn already_ensured_pairs_skip_the_database() {
        let provisioner = SchemaProvisioner::new(offline_pool());
        let date = Clock::new("UTC").unwrap().date_key(1_700_000_000).unwrap();
        provisioner.ensured.insert((MINUTE_METRICS.prefix, date.clone()));
        provisioner.ensure(&MINUTE_METRICS, &date).await.unwrap();
    }
}
