// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The dashboard-side model: per (host, program) rows derived from the
//! external `count`/`derive` stream, with rate derivation and TTL-based
//! zeroing/dropping of rows that stop reporting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::constants::{STAT_DROP_FACTOR, STAT_SWEEP_TICK, STAT_ZERO_FACTOR};
use crate::protocol::Values;

/// One row of the dashboard: the latest known numbers for a single
/// (hostname, program name) pair, plus the running maxima a terminal
/// display uses to size its columns.
#[derive(Debug, Clone)]
pub struct HostProg {
    pub hostname: String,
    pub program_name: Option<String>,
    /// Timestamp of the most recent record ingested for this row, of any
    /// stat kind. Drives `age()`/`sweep()`'s zero-then-drop TTL.
    last_time: i64,
    /// Timestamp of the last `checkouts` sample specifically, used only to
    /// compute the rate's own `Δt`.
    last_checkouts_sample_time: i64,
    total_checkouts: Option<u64>,
    pub process_count: f64,
    pub connection_count: f64,
    pub checkout_count: f64,
    pub connects_count: f64,
    pub max_process_count: f64,
    pub max_connections: f64,
    pub max_checkedout: f64,
    pub checkouts_per_second: Option<f64>,
}

impl HostProg {
    fn new(hostname: String, program_name: Option<String>) -> Self {
        HostProg {
            hostname,
            program_name,
            last_time: 0,
            last_checkouts_sample_time: 0,
            total_checkouts: None,
            process_count: 0.0,
            connection_count: 0.0,
            checkout_count: 0.0,
            connects_count: 0.0,
            max_process_count: 0.0,
            max_connections: 0.0,
            max_checkedout: 0.0,
            checkouts_per_second: None,
        }
    }

    fn kill(&mut self) {
        self.process_count = 0.0;
        self.connection_count = 0.0;
        self.checkout_count = 0.0;
        self.checkouts_per_second = Some(0.0);
    }

    fn update_numprocs(&mut self, value: f64) {
        self.process_count = value;
        self.max_process_count = self.max_process_count.max(value);
    }

    fn update_connections(&mut self, value: f64) {
        self.connection_count = value;
        self.max_connections = self.max_connections.max(value);
    }

    fn update_checkedout(&mut self, value: f64) {
        self.checkout_count = value;
        self.max_checkedout = self.max_checkedout.max(value);
    }

    fn update_connects(&mut self, value: f64) {
        self.connects_count = value;
    }

    /// Derives checkouts-per-second from a monotonic `checkouts` counter.
    /// The first sample just seeds the running total; subsequent samples
    /// only update the rate once at least one full interval has elapsed and
    /// the counter has actually advanced (a restarted or rolled-over
    /// counter leaves the previous rate in place rather than reporting a
    /// bogus negative rate).
    fn update_checkouts(&mut self, timestamp: i64, interval: i64, total_checkouts: f64) {
        let total = total_checkouts as u64;
        match self.total_checkouts {
            None => {
                self.total_checkouts = Some(total);
                self.last_checkouts_sample_time = timestamp;
            }
            Some(prev) => {
                let time_delta = timestamp - self.last_checkouts_sample_time;
                if time_delta >= interval && total > prev {
                    self.checkouts_per_second = Some((total - prev) as f64 / time_delta as f64);
                    self.last_checkouts_sample_time = timestamp;
                    self.total_checkouts = Some(total);
                }
            }
        }
    }

    fn age(&self, now: i64) -> i64 {
        now - self.last_time
    }
}

/// Named dispatch over the five external-stream statistics the dashboard
/// understands, keyed by the `type_instance` field the stream translator
/// stamped on each single-valued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatName {
    NumProcs,
    CheckedOut,
    Connections,
    Connects,
    Checkouts,
}

impl StatName {
    fn from_type_instance(s: &str) -> Option<Self> {
        match s {
            "numprocs" => Some(StatName::NumProcs),
            "checkedout" => Some(StatName::CheckedOut),
            "connections" => Some(StatName::Connections),
            "connects" => Some(StatName::Connects),
            "checkouts" => Some(StatName::Checkouts),
            _ => None,
        }
    }
}

/// The aggregate row summing every program on a host, and the process-wide
/// row summing every host, both recomputed on each sweep.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub host_count: usize,
    pub process_count: f64,
    pub connection_count: f64,
    pub checkout_count: f64,
    pub checkouts_per_second: f64,
    pub max_process_count: f64,
    pub max_connections: f64,
    pub max_checkedout: f64,
}

/// Source-of-truth model for the terminal dashboard: ingests external
/// `count`/`derive` records and maintains one `HostProg` row per (host,
/// program), recomputing the aggregate across all rows on each sweep.
#[derive(Default)]
pub struct Stat {
    rows: HashMap<(String, Option<String>), HostProg>,
    pub aggregate: Aggregate,
}

impl Stat {
    pub fn new() -> Self {
        Self::default()
    }

    fn row_mut(&mut self, hostname: &str, program_name: Option<&str>) -> &mut HostProg {
        let key = (hostname.to_string(), program_name.map(|s| s.to_string()));
        self.rows
            .entry(key)
            .or_insert_with(|| HostProg::new(hostname.to_string(), program_name.map(|s| s.to_string())))
    }

    /// Ingest one external single-valued record, dispatching to the named
    /// updater matching its `type_instance`. Unrecognized stat names are
    /// ignored rather than rejected — the external catalogue is meant to be
    /// forward-compatible with fields this dashboard doesn't chart yet.
    pub fn ingest(&mut self, record: &Values) {
        let Some(stat_name) = record.type_instance.as_deref().and_then(StatName::from_type_instance) else {
            return;
        };
        let Some(hostname) = record.host.clone() else {
            return;
        };
        let program_name = record.plugin_instance.clone().filter(|p| p.as_str() != "host");
        let Some(&value) = record.values.first() else {
            return;
        };
        let timestamp = record.time.unwrap_or(0);
        let interval = record.interval;
        let row = self.row_mut(&hostname, program_name.as_deref());
        row.last_time = timestamp;
        match stat_name {
            StatName::NumProcs => row.update_numprocs(value),
            StatName::CheckedOut => row.update_checkedout(value),
            StatName::Connections => row.update_connections(value),
            StatName::Connects => row.update_connects(value),
            StatName::Checkouts => row.update_checkouts(timestamp, interval, value),
        }
    }

    /// One dashboard tick: drop rows that have been idle past
    /// `interval * STAT_DROP_FACTOR`, zero the live counts of rows idle past
    /// `interval * STAT_ZERO_FACTOR`, then recompute the cross-row
    /// aggregate.
    pub fn sweep(&mut self, now: i64, interval: i64) {
        self.rows.retain(|_, row| row.age(now) <= interval * STAT_DROP_FACTOR);
        for row in self.rows.values_mut() {
            if row.age(now) > interval * STAT_ZERO_FACTOR {
                row.kill();
            }
        }
        self.recompute_aggregate();
    }

    fn recompute_aggregate(&mut self) {
        let mut aggregate = Aggregate {
            host_count: self.rows.values().map(|r| &r.hostname).collect::<std::collections::HashSet<_>>().len(),
            ..Aggregate::default()
        };
        for row in self.rows.values() {
            aggregate.process_count += row.process_count;
            aggregate.connection_count += row.connection_count;
            aggregate.checkout_count += row.checkout_count;
            aggregate.checkouts_per_second += row.checkouts_per_second.unwrap_or(0.0);
            aggregate.max_process_count = aggregate.max_process_count.max(row.max_process_count);
            aggregate.max_connections = aggregate.max_connections.max(row.max_connections);
            aggregate.max_checkedout = aggregate.max_checkedout.max(row.max_checkedout);
        }
        self.aggregate = aggregate;
    }

    pub fn rows(&self) -> impl Iterator<Item = &HostProg> {
        self.rows.values()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Background sweep loop for a shared `Stat`: wakes every `STAT_SWEEP_TICK`
/// and applies TTL-based zeroing/dropping against `interval`, the nominal
/// reporting interval rows are expected to keep up with. Runs until
/// `shutdown` is set, mirroring `worker::run` and `Receiver::run`.
pub fn run(stat: &Mutex<Stat>, shutdown: &AtomicBool, interval: i64) {
    while !shutdown.load(Ordering::Relaxed) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64;
        stat.lock().expect("stat lock poisoned").sweep(now, interval);
        std::thread::sleep(STAT_SWEEP_TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, program: &str, stat: &str, value: f64, time: i64, interval: i64) -> Values {
        Values::new()
            .with_host(host)
            .with_plugin_instance(Some(program.to_string()))
            .with_type_instance(Some(stat.to_string()))
            .with_time(time)
            .with_interval(interval)
            .with_values(vec![value])
    }

    #[test]
    fn ingest_creates_a_row_and_tracks_running_max() {
        let mut stat = Stat::new();
        stat.ingest(&record("h1", "app", "connections", 3.0, 100, 10));
        stat.ingest(&record("h1", "app", "connections", 1.0, 110, 10));
        let row = stat.rows().find(|r| r.hostname == "h1").unwrap();
        assert_eq!(row.connection_count, 1.0);
        assert_eq!(row.max_connections, 3.0);
    }

    #[test]
    fn checkouts_per_second_only_updates_after_an_interval_has_elapsed() {
        let mut stat = Stat::new();
        stat.ingest(&record("h1", "app", "checkouts", 100.0, 100, 10));
        stat.ingest(&record("h1", "app", "checkouts", 105.0, 105, 10));
        let row = stat.rows().next().unwrap();
        assert_eq!(row.checkouts_per_second, None, "interval has not elapsed yet");

        stat.ingest(&record("h1", "app", "checkouts", 150.0, 115, 10));
        let row = stat.rows().next().unwrap();
        assert_eq!(row.checkouts_per_second, Some((150.0 - 100.0) / 15.0));
    }

    #[test]
    fn checkouts_per_second_derivation_matches_two_sample_scenario() {
        let mut stat = Stat::new();
        stat.ingest(&record("h1", "app", "checkouts", 100.0, 1000, 10));
        stat.ingest(&record("h1", "app", "checkouts", 130.0, 1010, 10));
        let row = stat.rows().next().unwrap();
        assert_eq!(row.checkouts_per_second, Some(3.0));
    }

    #[test]
    fn sweep_zeroes_idle_rows_and_drops_very_stale_ones() {
        let mut stat = Stat::new();
        stat.ingest(&record("h1", "app", "connections", 3.0, 100, 10));
        stat.sweep(121, 10); // age 21 > 2*10
        assert_eq!(stat.rows().next().unwrap().connection_count, 0.0);
        assert_eq!(stat.row_count(), 1);

        stat.sweep(151, 10); // age 51 > 5*10
        assert_eq!(stat.row_count(), 0);
    }

    #[test]
    fn run_loop_sweeps_until_shutdown_is_signalled() {
        let stat = Mutex::new(Stat::new());
        stat.lock().unwrap().ingest(&record("h1", "app", "connections", 3.0, 0, 10));
        let shutdown = AtomicBool::new(false);

        // `run` reads wall-clock time itself, so a stale row ingested at
        // t=0 is immediately past both TTL thresholds and the very first
        // sweep both zeroes and, on a later tick, drops it. Flip `shutdown`
        // from a second thread once the row has been dropped.
        std::thread::scope(|scope| {
            scope.spawn(|| run(&stat, &shutdown, 10));
            loop {
                std::thread::sleep(std::time::Duration::from_millis(20));
                if stat.lock().unwrap().row_count() == 0 {
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });

        assert_eq!(stat.lock().unwrap().row_count(), 0);
    }

    #[test]
    fn aggregate_sums_every_row() {
        let mut stat = Stat::new();
        stat.ingest(&record("h1", "app-a", "connections", 3.0, 100, 10));
        stat.ingest(&record("h1", "app-b", "connections", 4.0, 100, 10));
        stat.sweep(100, 10);
        assert_eq!(stat.aggregate.connection_count, 7.0);
        assert_eq!(stat.aggregate.host_count, 1);
    }
}
