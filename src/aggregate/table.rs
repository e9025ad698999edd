use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_postgres::types::ToSql;

use crate::clock::{Clock, DateKey};

/// One of the four per-day table families. The prefix plus a [`DateKey`]
/// yields the physical table name, so both sides of the flush (DDL and
/// upsert) derive it from the same place.
pub struct TableFamily {
    pub prefix: &'static str,
    /// Key columns in insert order; `value` is always appended last.
    pub key_columns: &'static [&'static str],
    /// Non-unique lookup index created alongside the table, if any.
    pub lookup_index: Option<&'static [&'static str]>,
}

pub static MINUTE_METRICS: TableFamily = TableFamily {
    prefix: "daily_metrics",
    key_columns: &["metric_id", "minute"],
    lookup_index: Some(&["metric_id"]),
};

pub static METRIC_TOTALS: TableFamily = TableFamily {
    prefix: "daily_metric_totals",
    key_columns: &["metric_id"],
    lookup_index: None,
};

pub static MINUTE_SLICES: TableFamily = TableFamily {
    prefix: "daily_slices",
    key_columns: &["metric_id", "slice_id", "minute"],
    lookup_index: Some(&["metric_id", "slice_id"]),
};

pub static SLICE_TOTALS: TableFamily = TableFamily {
    prefix: "daily_slice_totals",
    key_columns: &["metric_id", "slice_id"],
    lookup_index: None,
};

impl TableFamily {
    pub fn table_name(&self, date: &DateKey) -> String {
        format!("{}_{}", self.prefix, date)
    }

    /// Key columns plus the value column.
    pub fn column_count(&self) -> usize {
        self.key_columns.len() + 1
    }

    fn column_type(column: &str) -> &'static str {
        if column == "minute" {
            "SMALLINT"
        } else {
            "INTEGER"
        }
    }

    pub fn create_table_sql(&self, date: &DateKey) -> String {
        let table = self.table_name(date);
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {table} (id BIGSERIAL PRIMARY KEY");
        for column in self.key_columns {
            sql.push_str(&format!(
                ", {column} {} NOT NULL",
                Self::column_type(column)
            ));
        }
        sql.push_str(", value INTEGER NOT NULL");
        sql.push_str(&format!(
            ", CONSTRAINT {table}_key UNIQUE ({})",
            self.key_columns.join(", ")
        ));
        sql.push(')');
        sql
    }

    pub fn create_index_sql(&self, date: &DateKey) -> Option<String> {
        self.lookup_index.map(|columns| {
            let table = self.table_name(date);
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_{}_idx ON {table} ({})",
                columns.join("_"),
                columns.join(", ")
            )
        })
    }
}

/// A counter key knows which family it belongs to and how to bind its
/// fields, in `key_columns` order, as SQL parameters.
pub trait CounterKey: Copy + Eq + Hash + Send + Sync + 'static {
    const FAMILY: &'static TableFamily;

    fn push_params<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricMinuteKey {
    pub metric_id: i32,
    pub minute: i16,
}

impl CounterKey for MetricMinuteKey {
    const FAMILY: &'static TableFamily = &MINUTE_METRICS;

    fn push_params<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>) {
        params.push(&self.metric_id);
        params.push(&self.minute);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricDayKey {
    pub metric_id: i32,
}

impl CounterKey for MetricDayKey {
    const FAMILY: &'static TableFamily = &METRIC_TOTALS;

    fn push_params<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>) {
        params.push(&self.metric_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceMinuteKey {
    pub metric_id: i32,
    pub slice_id: i32,
    pub minute: i16,
}

impl CounterKey for SliceMinuteKey {
    const FAMILY: &'static TableFamily = &MINUTE_SLICES;

    fn push_params<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>) {
        params.push(&self.metric_id);
        params.push(&self.slice_id);
        params.push(&self.minute);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceDayKey {
    pub metric_id: i32,
    pub slice_id: i32,
}

impl CounterKey for SliceDayKey {
    const FAMILY: &'static TableFamily = &SLICE_TOTALS;

    fn push_params<'a>(&'a self, params: &mut Vec<&'a (dyn ToSql + Sync)>) {
        params.push(&self.metric_id);
        params.push(&self.slice_id);
    }
}

pub type Snapshot<K> = HashMap<DateKey, HashMap<K, i64>>;

/// In-memory counter cells for one table family: `date -> key -> sum`.
///
/// `increment` and `snapshot_and_clear` share one mutex; the snapshot swaps
/// the whole outer map out, so the flusher iterates a map it owns and the
/// lock is never held across I/O.
pub struct CounterTable<K: CounterKey> {
    clock: Arc<Clock>,
    cells: Mutex<Snapshot<K>>,
}

impl<K: CounterKey> CounterTable<K> {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self {
            clock,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `value` to the cell for `(date(unix_time), key)`, creating it on
    /// first sight. Returns false only when the timestamp has no
    /// representable date.
    pub fn increment(&self, key: K, value: i64, unix_time: i64) -> bool {
        let Some(date) = self.clock.date_key(unix_time) else {
            return false;
        };
        if value == 0 {
            return true;
        }
        let mut cells = self.cells.lock();
        *cells.entry(date).or_default().entry(key).or_insert(0) += value;
        true
    }

    /// Moves the whole counter map out and installs a fresh empty one.
    /// Increments racing with this call land on one side or the other,
    /// never both.
    pub fn snapshot_and_clear(&self) -> Snapshot<K> {
        std::mem::take(&mut *self.cells.lock())
    }
}
