// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Translating a `CollectionTarget`'s accumulated state into outbound
//! collectd packets, one per registered internal type, on every worker tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::collector::CollectionTarget;
use crate::errors::{ConfigError, SendError};
use crate::protocol::{encode_packet, Values};
use crate::transport::ClientConnection;
use crate::types::InternalTypes;
use crate::worker::MetricsSender;

/// The closed set of internal metrics a `Sender` emits per tick. A tagged
/// enum rather than a registered-callback list: this catalogue is fixed and
/// rarely extended, so matching over it is simpler than indirecting through
/// function pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalMetric {
    Pool,
    Totals,
}

impl InternalMetric {
    const ALL: [InternalMetric; 2] = [InternalMetric::Pool, InternalMetric::Totals];

    fn name(self) -> &'static str {
        match self {
            InternalMetric::Pool => crate::types::POOL,
            InternalMetric::Totals => crate::types::TOTALS,
        }
    }

    /// Resolves a requested type name to the metric that emits it. Used at
    /// `Sender` construction time so a caller naming a type this system
    /// doesn't know how to produce (a typo, or `sqlalchemy_process`, which
    /// only the receiver ever synthesises) fails immediately rather than
    /// silently emitting nothing for it on every tick.
    fn from_name(name: &str) -> Option<Self> {
        InternalMetric::ALL.into_iter().find(|m| m.name() == name)
    }

    fn snapshot(self, target: &CollectionTarget) -> (&'static str, Vec<f64>) {
        match self {
            InternalMetric::Pool => (
                crate::types::POOL,
                vec![
                    target.num_pools() as f64,
                    target.num_checkedout() as f64,
                    target.num_checkedin() as f64,
                    target.num_detached() as f64,
                    target.num_connections() as f64,
                ],
            ),
            InternalMetric::Totals => (
                crate::types::TOTALS,
                vec![
                    target.total_checkouts() as f64,
                    target.total_invalidated() as f64,
                    target.total_connects() as f64,
                    target.total_disconnects() as f64,
                ],
            ),
        }
    }
}

/// Ships one `CollectionTarget`'s state to one destination host/port as one
/// or more collectd packets per tick.
pub struct Sender {
    hostname: String,
    program_name: String,
    types: InternalTypes,
    metrics: Vec<InternalMetric>,
    connection: Arc<ClientConnection>,
}

impl Sender {
    /// Builds a `Sender` that emits every internal type this system knows
    /// how to produce (`sqlalchemy_pool`, `sqlalchemy_totals`). Infallible,
    /// since the requested set is fixed rather than caller-supplied.
    pub fn new(hostname: impl Into<String>, program_name: impl Into<String>, connection: Arc<ClientConnection>) -> Self {
        Sender {
            hostname: hostname.into(),
            program_name: program_name.into(),
            types: InternalTypes::new(),
            metrics: InternalMetric::ALL.to_vec(),
            connection,
        }
    }

    /// Builds a `Sender` restricted to a caller-supplied set of internal
    /// type names (e.g. from configuration). Resolves each name against the
    /// internal type catalogue at construction time; a name this system
    /// cannot produce is a fatal configuration error raised immediately to
    /// the caller rather than discovered silently on the first tick.
    pub fn with_types(
        hostname: impl Into<String>,
        program_name: impl Into<String>,
        connection: Arc<ClientConnection>,
        requested_types: &[&str],
    ) -> Result<Self, ConfigError> {
        let metrics = requested_types
            .iter()
            .map(|name| {
                InternalMetric::from_name(name)
                    .ok_or_else(|| ConfigError::UnknownInternalType(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Sender {
            hostname: hostname.into(),
            program_name: program_name.into(),
            types: InternalTypes::new(),
            metrics,
            connection,
        })
    }
}

impl MetricsSender for Sender {
    fn send(
        &self,
        target: &CollectionTarget,
        now: i64,
        interval: i64,
        process_token: &str,
    ) -> Result<(), SendError> {
        let base = Values::new()
            .with_host(self.hostname.clone())
            .with_plugin(self.types.plugin_name())
            .with_plugin_instance(Some(self.program_name.clone()))
            .with_type_instance(Some(process_token.to_string()))
            .with_time(now)
            .with_interval(interval);

        for metric in &self.metrics {
            let metric = *metric;
            let (type_name, values) = metric.snapshot(target);
            let ty = match metric {
                InternalMetric::Pool => &self.types.pool,
                InternalMetric::Totals => &self.types.totals,
            };
            debug_assert_eq!(ty.name(), type_name);
            let record = base.build().with_type(type_name).with_values(values);
            let packet = encode_packet(&record, ty)
                .map_err(|e| SendError::Recoverable(Box::new(e)))?;
            self.connection
                .send(&packet)
                .map_err(|e| SendError::Recoverable(Box::new(e)))?;
        }
        Ok(())
    }
}

/// Process-global cache of `Sender`s keyed by (hostname, program name,
/// collectd host, collectd port), so repeated lookups for the same
/// destination reuse both the sender and its underlying socket.
#[derive(Default)]
pub struct SenderRegistry {
    senders: Mutex<HashMap<(String, String, String, u16), Arc<Sender>>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_sender(
        &self,
        hostname: &str,
        program_name: &str,
        collectd_host: &str,
        collectd_port: u16,
    ) -> std::io::Result<Arc<Sender>> {
        let key = (
            hostname.to_string(),
            program_name.to_string(),
            collectd_host.to_string(),
            collectd_port,
        );
        let mut senders = self.senders.lock().expect("sender registry lock poisoned");
        if let Some(existing) = senders.get(&key) {
            return Ok(existing.clone());
        }
        let connection = crate::transport::global_client_connections()
            .for_host_port(collectd_host, collectd_port)?;
        let sender = Arc::new(Sender::new(hostname, program_name, connection));
        senders.insert(key, sender.clone());
        Ok(sender)
    }
}

static GLOBAL_SENDERS: OnceLock<SenderRegistry> = OnceLock::new();

pub fn global_senders() -> &'static SenderRegistry {
    GLOBAL_SENDERS.get_or_init(SenderRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::PoolEventSink;
    use crate::transport::ServerConnection;

    fn target() -> Arc<crate::collector::CollectionTarget> {
        crate::collector::global_targets().target_for_name("sender-test-target")
    }

    #[test]
    fn send_emits_one_packet_per_internal_type() {
        let server = ServerConnection::bind("127.0.0.1", 0).unwrap();
        let addr = server.local_addr().unwrap();
        let registry = crate::transport::ClientConnectionRegistry::new();
        let connection = registry
            .for_host_port(&addr.ip().to_string(), addr.port())
            .unwrap();
        let t = target();
        let engine = t.attach_engine();
        engine.on_connect(1);
        engine.on_checkout(1);

        let sender = Sender::new("myhost", "myprogram", connection);
        sender.send(&t, 1_700_000_000, 10, "123:abcdef").unwrap();
        sender.send(&t, 1_700_000_000, 10, "123:abcdef").unwrap();

        let (first, _) = server.receive().unwrap();
        let (second, _) = server.receive().unwrap();
        assert!(!first.is_empty());
        assert!(!second.is_empty());
    }

    #[test]
    fn with_types_accepts_a_known_subset() {
        let server = ServerConnection::bind("127.0.0.1", 0).unwrap();
        let addr = server.local_addr().unwrap();
        let registry = crate::transport::ClientConnectionRegistry::new();
        let connection = registry
            .for_host_port(&addr.ip().to_string(), addr.port())
            .unwrap();
        let sender = Sender::with_types("myhost", "myprogram", connection, &[crate::types::POOL]).unwrap();
        sender.send(&target(), 1_700_000_000, 10, "1:abcdef").unwrap();
        let (packet, _) = server.receive().unwrap();
        assert!(!packet.is_empty());
    }

    #[test]
    fn with_types_rejects_an_unknown_type_name_at_construction() {
        let registry = crate::transport::ClientConnectionRegistry::new();
        let connection = registry.for_host_port("127.0.0.1", 25826).unwrap();
        let err = Sender::with_types("myhost", "myprogram", connection, &["sqlalchemy_bogus"])
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownInternalType("sqlalchemy_bogus".to_string()));
    }
}
