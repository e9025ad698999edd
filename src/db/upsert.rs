use tokio_postgres::types::ToSql;
use tracing::error;

use crate::aggregate::table::{CounterKey, TableFamily};
use crate::clock::DateKey;
use crate::db::DbPool;
use crate::errors::DbError;

/// Bind-parameter budget per statement. Rows are chunked so that
/// `rows * columns` never exceeds it (Postgres caps a statement at 65 535
/// parameters; this stays well under while keeping statements large).
pub const MAX_BIND_PARAMS: usize = 40_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub rows_attempted: usize,
    pub rows_acknowledged: usize,
}

/// Merges counter snapshots into a per-day table with add-on-conflict
/// semantics: an existing row for the same logical key absorbs the incoming
/// value by addition.
pub struct BatchedUpserter {
    pool: DbPool,
    max_bind_params: usize,
}

impl BatchedUpserter {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            max_bind_params: MAX_BIND_PARAMS,
        }
    }

    pub fn rows_per_statement(&self, family: &TableFamily) -> usize {
        (self.max_bind_params / family.column_count()).max(1)
    }

    fn statement_sql(family: &TableFamily, table: &str, row_count: usize) -> String {
        let columns = family.column_count();
        let key_columns = family.key_columns.join(", ");
        let mut sql = format!("INSERT INTO {table} AS t ({key_columns}, value) VALUES ");
        for row in 0..row_count {
            if row > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for field in 0..columns {
                if field > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&format!("${}", row * columns + field + 1));
            }
            sql.push(')');
        }
        sql.push_str(&format!(
            " ON CONFLICT ({key_columns}) DO UPDATE SET value = t.value + EXCLUDED.value"
        ));
        sql
    }

    /// Upserts `rows` into the family's table for `date`. A failed chunk is
    /// logged with its bounds and skipped; the remaining chunks still run.
    pub async fn submit<K: CounterKey>(
        &self,
        date: &DateKey,
        rows: &[(K, i32)],
    ) -> Result<UpsertOutcome, DbError> {
        let mut outcome = UpsertOutcome {
            rows_attempted: rows.len(),
            rows_acknowledged: 0,
        };
        if rows.is_empty() {
            return Ok(outcome);
        }

        let family = K::FAMILY;
        let table = family.table_name(date);
        let per_statement = self.rows_per_statement(family);
        let client = self.pool.get_client().await?;

        for (index, chunk) in rows.chunks(per_statement).enumerate() {
            let sql = Self::statement_sql(family, &table, chunk.len());
            let mut params: Vec<&(dyn ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * family.column_count());
            for (key, value) in chunk {
                key.push_params(&mut params);
                params.push(value);
            }
            match client.execute(sql.as_str(), &params).await {
                Ok(_) => outcome.rows_acknowledged += chunk.len(),
                Err(e) => {
                    error!(
                        table = %table,
                        offset = index * per_statement,
                        rows = chunk.len(),
                        error = %e,
                        "upsert chunk failed"
                    );
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::table::{METRIC_TOTALS, MINUTE_METRICS, MINUTE_SLICES, SLICE_TOTALS};
    use pretty_assertions::assert_eq;

    #[test]
    fn single_row_statement() {
        let sql = BatchedUpserter::statement_sql(&MINUTE_METRICS, "daily_metrics_2023_11_14", 1);
        assert_eq!(
            sql,
            "INSERT INTO daily_metrics_2023_11_14 AS t (metric_id, minute, value) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (metric_id, minute) DO UPDATE SET value = t.value + EXCLUDED.value"
        );
    }

    #[test]
    fn multi_row_statement_replicates_the_placeholder_block() {
        let sql =
            BatchedUpserter::statement_sql(&SLICE_TOTALS, "daily_slice_totals_2023_11_14", 3);
        assert!(sql.contains("($1, $2, $3), ($4, $5, $6), ($7, $8, $9)"));
        assert_eq!(sql.matches('$').count(), 9);
        assert!(sql.ends_with(
            "ON CONFLICT (metric_id, slice_id) DO UPDATE SET value = t.value + EXCLUDED.value"
        ));
    }

    #[test]
    fn chunk_size_divides_the_parameter_budget_by_column_count() {
        let upserter = BatchedUpserter {
            pool: test_pool(),
            max_bind_params: MAX_BIND_PARAMS,
        };
        assert_eq!(upserter.rows_per_statement(&MINUTE_METRICS), 40_000 / 3);
        assert_eq!(upserter.rows_per_statement(&METRIC_TOTALS), 20_000);
        assert_eq!(upserter.rows_per_statement(&MINUTE_SLICES), 10_000);
        assert_eq!(upserter.rows_per_statement(&SLICE_TOTALS), 40_000 / 3);
    }

    #[test]
    fn chunk_size_never_drops_to_zero() {
        let upserter = BatchedUpserter {
            pool: test_pool(),
            max_bind_params: 1,
        };
        assert_eq!(upserter.rows_per_statement(&MINUTE_SLICES), 1);
    }

    fn test_pool() -> DbPool {
        DbPool::new(&crate::config::DbConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "nobody".to_string(),
            password: "".to_string(),
            database: "none".to_string(),
            pool_size: None,
        })
        .unwrap()
    }
}
