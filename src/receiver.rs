// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The server-side reader thread: decodes inbound packets, files each
//! record into the aggregator, synthesises a process-count record per
//! (host, program), and optionally forwards a copy of the raw datagram to a
//! second destination for a standalone collectd daemon to also consume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::aggregator::Aggregator;
use crate::constants::{PROCESS_BUCKET_FACTOR, RECEIVER_BUCKET_FACTOR};
use crate::errors::{BucketError, DecodeError, IngestError};
use crate::protocol::{decode_packet, Values};
use crate::transport::{ClientConnection, ServerConnection};
use crate::types::{InternalTypes, PROCESS};

/// Forwards every raw datagram the receiver sees to a second UDP
/// destination, unmodified. Supplements the distilled design with the
/// packet fan-out the original server offered for feeding a standalone
/// collectd daemon the same stream this system consumes.
pub struct Monitor {
    connection: Arc<ClientConnection>,
}

impl Monitor {
    pub fn forward(&self, packet: &[u8]) {
        if let Err(err) = self.connection.send(packet) {
            tracing::warn!(error = %err, "failed to forward packet to monitor destination");
        }
    }
}

/// Splits a decoded record's identity fields into the tuple the aggregator
/// keys its buckets by, defaulting any missing scalar field to an empty
/// string the way an absent wire part already decodes to `None`.
fn key_of(values: &Values) -> (String, String, String) {
    (
        values.host.clone().unwrap_or_default(),
        values.plugin_instance.clone().unwrap_or_default(),
        values.type_instance.clone().unwrap_or_default(),
    )
}

pub struct Receiver {
    types: InternalTypes,
    aggregator: Mutex<Aggregator>,
    monitor: Mutex<Option<Monitor>>,
}

impl Receiver {
    pub fn new() -> Self {
        let types = InternalTypes::new();
        let bucket_factors = [
            (crate::types::POOL.to_string(), RECEIVER_BUCKET_FACTOR),
            (crate::types::TOTALS.to_string(), RECEIVER_BUCKET_FACTOR),
            (PROCESS.to_string(), PROCESS_BUCKET_FACTOR),
        ];
        Receiver {
            types,
            aggregator: Mutex::new(Aggregator::new(bucket_factors)),
            monitor: Mutex::new(None),
        }
    }

    pub fn set_monitor(&self, connection: Arc<ClientConnection>) {
        *self.monitor.lock().expect("monitor lock poisoned") = Some(Monitor { connection });
    }

    /// Decode one packet and file it into the aggregator. Forwards the raw
    /// bytes to the monitor destination, if any, regardless of whether
    /// decoding succeeds — a monitor's job is to mirror the wire stream,
    /// not to validate it.
    pub fn ingest(&self, packet: &[u8]) -> Result<(), IngestError> {
        if let Some(monitor) = self.monitor.lock().expect("monitor lock poisoned").as_ref() {
            monitor.forward(packet);
        }
        let values = decode_packet(packet, &self.types)?;
        self.file(values)?;
        Ok(())
    }

    fn file(&self, values: Values) -> Result<(), BucketError> {
        let bucket_name = values
            .metric_type
            .clone()
            .unwrap_or_default();
        let key = key_of(&values);
        let process_token_present = values.type_instance.is_some();
        let process_key = key.clone();
        let timestamp = values.time.unwrap_or(0);
        let interval = values.interval;
        let mut aggregator = self.aggregator.lock().expect("aggregator lock poisoned");
        aggregator.set_stats(&bucket_name, key, values)?;
        if process_token_present {
            let process_record = Values::new()
                .with_type(PROCESS)
                .with_host(process_key.0.clone())
                .with_plugin_instance(Some(process_key.1.clone()))
                .with_time(timestamp)
                .with_interval(interval)
                .with_values(vec![1.0]);
            aggregator.set_stats(PROCESS, process_key, process_record)?;
        }
        Ok(())
    }

    pub fn by_program(&self, bucket_name: &str, now: i64) -> Result<Vec<Values>, BucketError> {
        self.aggregator.lock().expect("aggregator lock poisoned").by_program(bucket_name, now)
    }

    pub fn by_host(&self, bucket_name: &str, now: i64) -> Result<Vec<Values>, BucketError> {
        self.aggregator.lock().expect("aggregator lock poisoned").by_host(bucket_name, now)
    }

    /// The process-count synthesis, summed across all distinct process
    /// tokens seen for a (host, program) pair within the wider process TTL.
    pub fn process_counts(&self, now: i64) -> Result<Vec<Values>, BucketError> {
        self.by_program(PROCESS, now)
    }

    /// Blocking read loop: receive a datagram, decode and file it, log and
    /// continue on a decode failure, exit on socket-level I/O failure.
    pub fn run(&self, connection: &ServerConnection, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            match connection.receive() {
                Ok((packet, _from)) => {
                    if let Err(err) = self.ingest(&packet) {
                        tracing::error!(error = %err, "error decoding inbound packet");
                    }
                }
                Err(err) => {
                    tracing::info!(error = %err, "receiver thread exiting");
                    break;
                }
            }
        }
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_packet;

    fn pool_packet(host: &str, program: &str, token: &str, values: Vec<f64>) -> Vec<u8> {
        let types = InternalTypes::new();
        let record = Values::new()
            .with_type(crate::types::POOL)
            .with_host(host)
            .with_plugin(types.plugin_name())
            .with_plugin_instance(Some(program.to_string()))
            .with_type_instance(Some(token.to_string()))
            .with_time(1000)
            .with_interval(10)
            .with_values(values);
        encode_packet(&record, &types.pool).unwrap()
    }

    #[test]
    fn ingest_files_a_record_and_synthesises_a_process_count() {
        let receiver = Receiver::new();
        let packet = pool_packet("h1", "app", "123:aaa", vec![1.0, 0.0, 0.0, 0.0, 1.0]);
        receiver.ingest(&packet).unwrap();

        let pool_rows = receiver.by_program(crate::types::POOL, 1005).unwrap();
        assert_eq!(pool_rows.len(), 1);
        assert_eq!(pool_rows[0].values, vec![1.0, 0.0, 0.0, 0.0, 1.0]);

        let process_rows = receiver.process_counts(1005).unwrap();
        assert_eq!(process_rows.len(), 1);
        assert_eq!(process_rows[0].values, vec![1.0]);
    }

    #[test]
    fn two_processes_for_the_same_program_both_count_toward_numprocs() {
        let receiver = Receiver::new();
        receiver
            .ingest(&pool_packet("h1", "app", "1:aaa", vec![1.0, 0.0, 0.0, 0.0, 1.0]))
            .unwrap();
        receiver
            .ingest(&pool_packet("h1", "app", "2:bbb", vec![1.0, 0.0, 0.0, 0.0, 1.0]))
            .unwrap();
        let process_rows = receiver.process_counts(1005).unwrap();
        assert_eq!(process_rows.len(), 1);
        assert_eq!(process_rows[0].values, vec![2.0]);
    }

    #[test]
    fn decoding_garbage_reports_an_error_without_panicking() {
        let receiver = Receiver::new();
        let err = receiver.ingest(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            IngestError::Decode(DecodeError::Truncated { .. } | DecodeError::MissingType)
        ));
    }
}
