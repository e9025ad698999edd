use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::aggregate::aggregator::Aggregator;
use crate::aggregate::table::{CounterKey, CounterTable};
use crate::db::provision::SchemaProvisioner;
use crate::db::upsert::BatchedUpserter;

/// Which pair of counter tables a flush loop owns.
#[derive(Debug, Clone, Copy)]
enum FlushSet {
    Minutes,
    Totals,
}

impl FlushSet {
    fn label(self) -> &'static str {
        match self {
            FlushSet::Minutes => "minute tables",
            FlushSet::Totals => "totals tables",
        }
    }
}

/// Two periodic flush tasks: one for the per-minute tables, one for the
/// daily totals. Each drains its tables with snapshot-and-clear and merges
/// the snapshots into the database outside any lock. On the shutdown
/// signal both run one final flush before exiting.
pub struct FlushScheduler {
    minute_task: JoinHandle<()>,
    totals_task: JoinHandle<()>,
}

impl FlushScheduler {
    pub fn start(
        aggregator: Arc<Aggregator>,
        provisioner: Arc<SchemaProvisioner>,
        upserter: Arc<BatchedUpserter>,
        flush_interval: Duration,
        totals_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let minute_task = tokio::spawn(flush_loop(
            FlushSet::Minutes,
            flush_interval,
            Arc::clone(&aggregator),
            Arc::clone(&provisioner),
            Arc::clone(&upserter),
            shutdown.clone(),
        ));
        let totals_task = tokio::spawn(flush_loop(
            FlushSet::Totals,
            totals_interval,
            aggregator,
            provisioner,
            upserter,
            shutdown,
        ));
        Self {
            minute_task,
            totals_task,
        }
    }

    /// Waits for both loops to finish their final flush.
    pub async fn join(self) {
        let _ = self.minute_task.await;
        let _ = self.totals_task.await;
    }
}

async fn flush_loop(
    set: FlushSet,
    interval: Duration,
    aggregator: Arc<Aggregator>,
    provisioner: Arc<SchemaProvisioner>,
    upserter: Arc<BatchedUpserter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // A flush that overruns its interval must not be re-entered; ticks that
    // fire while one is in progress are dropped.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush_set(set, &aggregator, &provisioner, &upserter).await;
            }
            _ = shutdown.changed() => {
                info!(set = set.label(), "final flush before shutdown");
                flush_set(set, &aggregator, &provisioner, &upserter).await;
                break;
            }
        }
    }
}

async fn flush_set(
    set: FlushSet,
    aggregator: &Aggregator,
    provisioner: &SchemaProvisioner,
    upserter: &BatchedUpserter,
) {
    match set {
        FlushSet::Minutes => {
            flush_table(&aggregator.minute_metrics, provisioner, upserter).await;
            flush_table(&aggregator.minute_slices, provisioner, upserter).await;
        }
        FlushSet::Totals => {
            flush_table(&aggregator.metric_totals, provisioner, upserter).await;
            flush_table(&aggregator.slice_totals, provisioner, upserter).await;
        }
    }
}

/// Drains one counter table. Per date: ensure the target table exists,
/// then upsert the snapshot rows. A date whose DDL fails is skipped and its
/// counters are lost; nothing is rolled back into memory.
async fn flush_table<K: CounterKey>(
    table: &CounterTable<K>,
    provisioner: &SchemaProvisioner,
    upserter: &BatchedUpserter,
) -> usize {
    let snapshot = table.snapshot_and_clear();
    if snapshot.is_empty() {
        debug!(family = K::FAMILY.prefix, "nothing to flush");
        return 0;
    }

    let mut acknowledged = 0;
    for (date, cells) in snapshot {
        let table_name = K::FAMILY.table_name(&date);

        if let Err(e) = provisioner.ensure(K::FAMILY, &date).await {
            error!(
                table = %table_name,
                rows = cells.len(),
                error = %e,
                "cannot ensure aggregate table, dropping snapshot rows"
            );
            continue;
        }

        let rows: Vec<(K, i32)> = cells
            .into_iter()
            .map(|(key, value)| (key, value as i32))
            .collect();
        match upserter.submit(&date, &rows).await {
            Ok(outcome) => {
                info!(
                    table = %table_name,
                    rows = outcome.rows_attempted,
                    acknowledged = outcome.rows_acknowledged,
                    "flushed"
                );
                acknowledged += outcome.rows_acknowledged;
            }
            Err(e) => {
                error!(
                    table = %table_name,
                    rows = rows.len(),
                    error = %e,
                    "flush failed, dropping snapshot rows"
                );
            }
        }
    }
    acknowledged
}
