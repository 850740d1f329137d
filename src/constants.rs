// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed constants governing wire limits, cadences and TTL multipliers.

/// Nominal seconds between emissions when a `Values` record carries no
/// explicit interval.
pub const DEFAULT_INTERVAL: i64 = 10;

/// Collectd packets must never exceed this many bytes.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Default target UDP port for a standard collectd server.
pub const DEFAULT_COLLECTD_PORT: u16 = 25826;

/// Default UDP port for this system's own server plugin.
pub const DEFAULT_SERVER_PORT: u16 = 25827;

/// Default UDP port the terminal dashboard listens on.
pub const DEFAULT_DASHBOARD_PORT: u16 = 25828;

/// Worker wakeup cadence.
pub const WORKER_TICK: std::time::Duration = std::time::Duration::from_millis(200);

/// Default seconds between sends for a given (target, sender) pair.
pub const DEFAULT_SEND_INTERVAL_SECS: i64 = 2;

/// `TimeBucket`'s default prune factor: an entry is readable through
/// `timestamp + INTERVAL_FACTOR * interval`.
pub const INTERVAL_FACTOR: f64 = 1.2;

/// TTL factor the receiver applies to ordinary internal-type buckets
/// (pool, totals): `2 * interval`.
pub const RECEIVER_BUCKET_FACTOR: f64 = 2.0;

/// TTL factor applied to the synthesised `sqlalchemy_process` bucket, wider
/// than ordinary buckets so the process count doesn't flicker between ticks.
pub const PROCESS_BUCKET_FACTOR: f64 = 5.0;

/// Dashboard model sweep cadence.
pub const STAT_SWEEP_TICK: std::time::Duration = std::time::Duration::from_millis(500);

/// Dashboard rows idle longer than `interval * this` have their live counts
/// zeroed but are retained.
pub const STAT_ZERO_FACTOR: i64 = 2;

/// Dashboard rows idle longer than `interval * this` are dropped entirely.
pub const STAT_DROP_FACTOR: i64 = 5;

/// Identifies records originating from this system on the wire.
pub const PLUGIN_NAME: &str = "sqlalchemy";
