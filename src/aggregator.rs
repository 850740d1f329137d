// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `TimeBucket`, a per-entry expiring map, and the receiver-side `Aggregator`
//! built on top of it that groups records by program name or by host.

use std::collections::HashMap;
use std::hash::Hash;

use crate::constants::INTERVAL_FACTOR;
use crate::errors::BucketError;

struct Entry<V> {
    timestamp: i64,
    interval: i64,
    value: V,
}

/// A map whose entries expire relative to their own recorded interval
/// rather than a single fixed TTL. Each entry remembers the timestamp and
/// interval it was inserted with; a read prunes every entry whose
/// `timestamp + factor * interval < now` and fails outright if `now` is
/// older than the bucket's own retention horizon
/// (`last_timestamp - factor * last_interval`).
pub struct TimeBucket<K, V> {
    entries: HashMap<K, Entry<V>>,
    last_timestamp: i64,
    last_interval: i64,
    factor: f64,
}

impl<K: Eq + Hash + Clone, V> TimeBucket<K, V> {
    pub fn new() -> Self {
        Self::with_factor(INTERVAL_FACTOR)
    }

    /// Construct a bucket with a non-default prune factor. The receiver
    /// uses this to give ordinary internal-type buckets a `2x` TTL and the
    /// synthesised process-count bucket a wider `5x` TTL, both expressed on
    /// top of this same prune-on-read mechanism.
    pub fn with_factor(factor: f64) -> Self {
        TimeBucket {
            entries: HashMap::new(),
            last_timestamp: 0,
            last_interval: 0,
            factor,
        }
    }

    fn horizon(&self) -> i64 {
        (self.last_interval as f64 * self.factor) as i64
    }

    fn check_and_advance(&mut self, timestamp: i64, interval: Option<i64>) -> Result<(), BucketError> {
        if self.last_interval != 0 && timestamp < self.last_timestamp - self.horizon() {
            return Err(BucketError::StaleRead {
                timestamp,
                last_timestamp: self.last_timestamp,
                horizon: self.horizon(),
            });
        }
        if let Some(interval) = interval {
            self.last_interval = interval;
        }
        self.last_timestamp = timestamp;
        let factor = self.factor;
        self.entries
            .retain(|_, e| (e.timestamp as f64 + e.interval as f64 * factor) as i64 >= timestamp);
        Ok(())
    }

    pub fn put(&mut self, timestamp: i64, interval: i64, key: K, value: V) -> Result<(), BucketError> {
        self.check_and_advance(timestamp, Some(interval))?;
        self.entries.insert(key, Entry { timestamp, interval, value });
        Ok(())
    }

    pub fn get(&mut self, timestamp: i64, key: &K) -> Result<Option<&V>, BucketError> {
        self.check_and_advance(timestamp, None)?;
        Ok(self.entries.get(key).map(|e| &e.value))
    }

    /// All live entries as of `timestamp`, pruning stale ones first.
    pub fn snapshot(&mut self, timestamp: i64) -> Result<Vec<(&K, &V)>, BucketError> {
        self.check_and_advance(timestamp, None)?;
        Ok(self.entries.iter().map(|(k, e)| (k, &e.value)).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V> Default for TimeBucket<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod bucket_tests {
    use super::*;

    #[test]
    fn entry_is_readable_within_its_retention_window() {
        let mut bucket: TimeBucket<&str, i64> = TimeBucket::new();
        bucket.put(100, 10, "k", 1).unwrap();
        // 1.2 * 10 = 12, so reads up to t=112 should still see it.
        assert_eq!(*bucket.get(111, &"k").unwrap().unwrap(), 1);
    }

    #[test]
    fn entry_is_pruned_after_its_retention_window() {
        let mut bucket: TimeBucket<&str, i64> = TimeBucket::new();
        bucket.put(100, 10, "k", 1).unwrap();
        assert_eq!(bucket.get(113, &"k").unwrap(), None);
    }

    #[test]
    fn a_read_older_than_the_retention_horizon_fails() {
        let mut bucket: TimeBucket<&str, i64> = TimeBucket::new();
        bucket.put(100, 10, "k", 1).unwrap();
        let err = bucket.get(80, &"k").unwrap_err();
        assert!(matches!(err, BucketError::StaleRead { .. }));
    }
}

/// Keys an internal-type record by the (hostname, program name, process
/// token) triple a sender stamps on every outbound record.
pub type InternalKey = (String, String, String);

/// Receiver-side store of internal-type records, grouped into one
/// `TimeBucket` per internal type name.
#[derive(Default)]
pub struct Aggregator {
    buckets: HashMap<String, TimeBucket<InternalKey, crate::protocol::Values>>,
}

impl Aggregator {
    pub fn new(bucket_factors: impl IntoIterator<Item = (String, f64)>) -> Self {
        let buckets = bucket_factors
            .into_iter()
            .map(|(name, factor)| (name, TimeBucket::with_factor(factor)))
            .collect();
        Aggregator { buckets }
    }

    pub fn set_stats(
        &mut self,
        bucket_name: &str,
        key: InternalKey,
        values: crate::protocol::Values,
    ) -> Result<(), BucketError> {
        let timestamp = values.time.unwrap_or(0);
        let interval = values.interval;
        let bucket = self
            .buckets
            .entry(bucket_name.to_string())
            .or_insert_with(TimeBucket::new);
        bucket.put(timestamp, interval, key, values)
    }

    /// Sum every live record for `bucket_name`, grouped by (host, program),
    /// discarding the process token from the key.
    pub fn by_program(
        &mut self,
        bucket_name: &str,
        now: i64,
    ) -> Result<Vec<crate::protocol::Values>, BucketError> {
        self.group_by(bucket_name, now, |(host, program, _pid)| {
            (host.clone(), program.clone())
        })
    }

    /// Sum every live record for `bucket_name`, grouped by host alone.
    pub fn by_host(
        &mut self,
        bucket_name: &str,
        now: i64,
    ) -> Result<Vec<crate::protocol::Values>, BucketError> {
        let grouped = self.group_by(bucket_name, now, |(host, _program, _pid)| host.clone())?;
        Ok(grouped
            .into_iter()
            .map(|v| v.with_plugin_instance(Some("host".to_string())))
            .collect())
    }

    fn group_by<G: Eq + Hash>(
        &mut self,
        bucket_name: &str,
        now: i64,
        group_key: impl Fn(&InternalKey) -> G,
    ) -> Result<Vec<crate::protocol::Values>, BucketError> {
        let bucket = match self.buckets.get_mut(bucket_name) {
            Some(b) => b,
            None => return Ok(Vec::new()),
        };
        let entries = bucket.snapshot(now)?;
        let mut groups: HashMap<G, crate::protocol::Values> = HashMap::new();
        for (key, values) in entries {
            let g = group_key(key);
            groups
                .entry(g)
                .and_modify(|acc| *acc = std::mem::take(acc).merge_sum(values.clone()))
                .or_insert_with(|| values.clone());
        }
        let mut out: Vec<crate::protocol::Values> = groups.into_values().collect();
        for v in out.iter_mut() {
            v.time = Some(now);
        }
        out.sort_by(|a, b| a.host.cmp(&b.host).then(a.plugin_instance.cmp(&b.plugin_instance)));
        Ok(out)
    }

    pub fn bucket_len(&self, bucket_name: &str) -> usize {
        self.buckets.get(bucket_name).map(|b| b.len()).unwrap_or(0)
    }
}

impl crate::protocol::Values {
    /// Helper used by group-by folds: sums two records the way `Add` does,
    /// but keeps the accumulator's own interval (the bucket's interval, set
    /// by the caller after folding) rather than either operand's.
    fn merge_sum(self, other: crate::protocol::Values) -> crate::protocol::Values {
        let interval = self.interval;
        let mut merged = self + other;
        merged.interval = interval;
        merged
    }
}

#[cfg(test)]
mod aggregator_tests {
    use super::*;
    use crate::protocol::Values;

    fn values(host: &str, program: &str, n: f64) -> Values {
        Values::new()
            .with_host(host)
            .with_plugin("sqlalchemy")
            .with_plugin_instance(Some(program.to_string()))
            .with_time(100)
            .with_interval(10)
            .with_values(vec![n])
    }

    #[test]
    fn by_program_sums_records_across_processes() {
        let mut agg = Aggregator::new([("sqlalchemy_pool".to_string(), 2.0)]);
        agg.set_stats(
            "sqlalchemy_pool",
            ("h1".into(), "app".into(), "1:aaa".into()),
            values("h1", "app", 1.0),
        )
        .unwrap();
        agg.set_stats(
            "sqlalchemy_pool",
            ("h1".into(), "app".into(), "2:bbb".into()),
            values("h1", "app", 4.0),
        )
        .unwrap();
        let rows = agg.by_program("sqlalchemy_pool", 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![5.0]);
    }

    #[test]
    fn by_host_sums_across_programs_and_sets_plugin_instance_host() {
        let mut agg = Aggregator::new([("sqlalchemy_pool".to_string(), 2.0)]);
        agg.set_stats(
            "sqlalchemy_pool",
            ("h1".into(), "app-a".into(), "1:aaa".into()),
            values("h1", "app-a", 1.0),
        )
        .unwrap();
        agg.set_stats(
            "sqlalchemy_pool",
            ("h1".into(), "app-b".into(), "2:bbb".into()),
            values("h1", "app-b", 4.0),
        )
        .unwrap();
        let rows = agg.by_host("sqlalchemy_pool", 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![5.0]);
        assert_eq!(rows[0].plugin_instance.as_deref(), Some("host"));
    }

    #[test]
    fn records_older_than_the_bucket_ttl_drop_out_of_group_sums() {
        let mut agg = Aggregator::new([("sqlalchemy_pool".to_string(), 2.0)]);
        agg.set_stats(
            "sqlalchemy_pool",
            ("h1".into(), "app".into(), "1:aaa".into()),
            values("h1", "app", 1.0),
        )
        .unwrap();
        // TTL factor 2.0 * interval 10 = 20; at t=130 (30s later) it's gone.
        let rows = agg.by_program("sqlalchemy_pool", 130).unwrap();
        assert!(rows.is_empty());
    }
}
