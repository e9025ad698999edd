use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::aggregate::event::Event;
use crate::aggregate::table::{
    CounterTable, MetricDayKey, MetricMinuteKey, SliceDayKey, SliceMinuteKey,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::errors::ConfigError;
use crate::names::metrics::MetricNames;
use crate::names::slices::SliceNames;

/// Fans one accepted event out to the four counter tables.
pub struct Aggregator {
    clock: Arc<Clock>,
    metric_names: Arc<MetricNames>,
    slice_names: Arc<SliceNames>,
    metric_reject: Regex,
    slice_reject: Regex,
    pub minute_metrics: CounterTable<MetricMinuteKey>,
    pub metric_totals: CounterTable<MetricDayKey>,
    pub minute_slices: CounterTable<SliceMinuteKey>,
    pub slice_totals: CounterTable<SliceDayKey>,
}

impl Aggregator {
    pub fn new(
        clock: Arc<Clock>,
        metric_names: Arc<MetricNames>,
        slice_names: Arc<SliceNames>,
        config: &Config,
    ) -> Result<Self, ConfigError> {
        let metric_reject =
            Regex::new(&config.metric_name_validation_regexp).map_err(|source| {
                ConfigError::Regex {
                    which: "metric name validation",
                    pattern: config.metric_name_validation_regexp.clone(),
                    source,
                }
            })?;
        let slice_reject =
            Regex::new(&config.slice_name_validation_regexp).map_err(|source| {
                ConfigError::Regex {
                    which: "slice name validation",
                    pattern: config.slice_name_validation_regexp.clone(),
                    source,
                }
            })?;

        Ok(Self {
            minute_metrics: CounterTable::new(Arc::clone(&clock)),
            metric_totals: CounterTable::new(Arc::clone(&clock)),
            minute_slices: CounterTable::new(Arc::clone(&clock)),
            slice_totals: CounterTable::new(Arc::clone(&clock)),
            clock,
            metric_names,
            slice_names,
            metric_reject,
            slice_reject,
        })
    }

    /// Names matching this pattern never become metrics.
    pub fn metric_reject(&self) -> &Regex {
        &self.metric_reject
    }

    pub fn slice_reject(&self) -> &Regex {
        &self.slice_reject
    }

    /// Returns the number of accepted events.
    pub async fn ingest_batch(&self, events: &[Event]) -> usize {
        let mut created = 0;
        for event in events {
            if self.ingest(event).await {
                created += 1;
            }
        }
        created
    }

    /// Counts an event into the metric tables and, per attached slice, into
    /// the slice tables. The event is accepted iff both metric tables took
    /// the increment; slice failures are logged and never unaccept it.
    pub async fn ingest(&self, event: &Event) -> bool {
        if self.metric_reject.is_match(&event.metric) {
            debug!(metric = %event.metric, "skipping rejected metric name");
            return false;
        }

        let Some(minute) = self.clock.minute_of_day(event.time) else {
            warn!(metric = %event.metric, time = event.time, "event time out of range");
            return false;
        };
        let minute = minute as i16;

        let metric_id = match self.metric_names.resolve(&event.metric).await {
            Ok(id) => id,
            Err(e) => {
                warn!(metric = %event.metric, error = %e, "cannot resolve metric id");
                return false;
            }
        };

        let value = i64::from(event.value);
        let in_minutes =
            self.minute_metrics
                .increment(MetricMinuteKey { metric_id, minute }, value, event.time);
        let in_totals = self
            .metric_totals
            .increment(MetricDayKey { metric_id }, value, event.time);
        let created = in_minutes && in_totals;

        for (category, name) in &event.slices {
            if self.slice_reject.is_match(name) {
                debug!(category = %category, slice = %name, "skipping rejected slice name");
                continue;
            }
            let slice_id = match self.slice_names.resolve(category, name).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(category = %category, slice = %name, error = %e, "cannot resolve slice id");
                    continue;
                }
            };
            self.minute_slices.increment(
                SliceMinuteKey {
                    metric_id,
                    slice_id,
                    minute,
                },
                value,
                event.time,
            );
            self.slice_totals.increment(
                SliceDayKey {
                    metric_id,
                    slice_id,
                },
                value,
                event.time,
            );
        }

        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbConfig, HttpConfig, ServerMode};
    use crate::db::DbPool;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    // 2023-11-14 22:13:20 UTC, minute 1333.
    const T0: i64 = 1_700_000_000;

    fn test_config() -> Config {
        Config {
            db: DbConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                user: "nobody".to_string(),
                password: "".to_string(),
                database: "none".to_string(),
                pool_size: None,
            },
            metric_name_validation_regexp: "^tmp_".to_string(),
            slice_name_validation_regexp: "^tmp_".to_string(),
            time_zone: "UTC".to_string(),
            flush_to_db_interval: 10,
            flush_totals_interval: 60,
            http: HttpConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                mode: ServerMode::Release,
                user: "ingest".to_string(),
                password: "secret".to_string(),
                tls_enabled: false,
                tls_cert_file_path: None,
                tls_key_file_path: None,
            },
        }
    }

    async fn seeded_aggregator() -> Aggregator {
        let config = test_config();
        let pool = DbPool::new(&config.db).unwrap();
        let clock = Arc::new(Clock::new(&config.time_zone).unwrap());
        let metric_names = Arc::new(MetricNames::new(pool.clone()));
        let slice_names = Arc::new(SliceNames::new(pool));
        metric_names.seed("checkout", 7).await;
        slice_names.seed("country", "US", 3).await;
        slice_names.seed("device", "mobile", 4).await;
        Aggregator::new(clock, metric_names, slice_names, &config).unwrap()
    }

    fn event(metric: &str, value: i32, slices: &[(&str, &str)]) -> Event {
        Event {
            metric: metric.to_string(),
            value,
            time: T0,
            slices: slices
                .iter()
                .map(|(c, n)| (c.to_string(), n.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn counts_into_both_metric_tables() {
        let aggregator = seeded_aggregator().await;
        assert!(aggregator.ingest(&event("checkout", 3, &[])).await);

        let minutes = aggregator.minute_metrics.snapshot_and_clear();
        let totals = aggregator.metric_totals.snapshot_and_clear();
        let date = Clock::new("UTC").unwrap().date_key(T0).unwrap();
        assert_eq!(
            minutes[&date][&MetricMinuteKey {
                metric_id: 7,
                minute: 1333
            }],
            3
        );
        assert_eq!(totals[&date][&MetricDayKey { metric_id: 7 }], 3);
        assert!(aggregator.minute_slices.snapshot_and_clear().is_empty());
        assert!(aggregator.slice_totals.snapshot_and_clear().is_empty());
    }

    #[tokio::test]
    async fn ingesting_twice_doubles_the_cell() {
        let aggregator = seeded_aggregator().await;
        let e = event("checkout", 3, &[]);
        assert_eq!(aggregator.ingest_batch(&[e.clone(), e]).await, 2);

        let totals = aggregator.metric_totals.snapshot_and_clear();
        let date = Clock::new("UTC").unwrap().date_key(T0).unwrap();
        assert_eq!(totals[&date][&MetricDayKey { metric_id: 7 }], 6);
    }

    #[tokio::test]
    async fn rejected_metric_is_dropped_entirely() {
        let aggregator = seeded_aggregator().await;
        assert!(!aggregator.ingest(&event("tmp_scratch", 5, &[])).await);
        assert!(aggregator.minute_metrics.snapshot_and_clear().is_empty());
        assert!(aggregator.metric_totals.snapshot_and_clear().is_empty());
    }

    #[tokio::test]
    async fn slices_fan_out_without_touching_created_count() {
        let aggregator = seeded_aggregator().await;
        let accepted = aggregator
            .ingest(&event(
                "checkout",
                1,
                &[("country", "US"), ("device", "mobile")],
            ))
            .await;
        assert!(accepted);

        let date = Clock::new("UTC").unwrap().date_key(T0).unwrap();
        let minute_slices = aggregator.minute_slices.snapshot_and_clear();
        let slice_totals = aggregator.slice_totals.snapshot_and_clear();
        assert_eq!(minute_slices[&date].len(), 2);
        assert_eq!(slice_totals[&date].len(), 2);
        assert_eq!(
            slice_totals[&date][&SliceDayKey {
                metric_id: 7,
                slice_id: 3
            }],
            1
        );
    }

    #[tokio::test]
    async fn rejected_slice_does_not_unaccept_the_event() {
        let aggregator = seeded_aggregator().await;
        let accepted = aggregator
            .ingest(&event("checkout", 1, &[("country", "tmp_zz")]))
            .await;
        assert!(accepted);
        assert!(aggregator.minute_slices.snapshot_and_clear().is_empty());
        assert!(!aggregator.metric_totals.snapshot_and_clear().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_time_is_dropped() {
        let aggregator = seeded_aggregator().await;
        let mut e = event("checkout", 1, &[]);
        e.time = i64::MAX;
        assert!(!aggregator.ingest(&e).await);
    }
}
