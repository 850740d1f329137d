// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use collectd_pool_metrics::collector::{self, PoolEventSink};
use collectd_pool_metrics::receiver::Receiver;
use collectd_pool_metrics::sender::Sender;
use collectd_pool_metrics::stat::{self, Stat};
use collectd_pool_metrics::transport::ServerConnection;
use collectd_pool_metrics::translator::StreamTranslator;
use collectd_pool_metrics::types::{InternalTypes, POOL};
use collectd_pool_metrics::worker;

/// A minimal end-to-end demonstration: one in-process "client" driving a
/// handful of fake pool events, sending over loopback UDP to one
/// in-process "server" that aggregates and translates them.
fn main() {
    tracing_subscriber::fmt::init();

    let server = ServerConnection::bind("127.0.0.1", 0).expect("bind server socket");
    let server_addr = server.local_addr().expect("local addr");
    let receiver = Arc::new(Receiver::new());

    let shutdown = Arc::new(AtomicBool::new(false));
    let receiver_thread = {
        let receiver = receiver.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || receiver.run(&server, &shutdown))
    };

    let target = collector::global_targets().target_for_name("demo-app");
    let engine = target.attach_engine();
    engine.on_connect(1);
    engine.on_connect(2);
    engine.on_checkout(1);

    let connection = collectd_pool_metrics::transport::global_client_connections()
        .for_host_port(&server_addr.ip().to_string(), server_addr.port())
        .expect("resolve server address");
    let sender: Arc<dyn worker::MetricsSender> =
        Arc::new(Sender::new("demo-host", "demo-app", connection));
    worker::global_worker().add_target(target.clone(), sender, 2);

    let dashboard = Arc::new(Mutex::new(Stat::new()));
    let stat_shutdown = Arc::new(AtomicBool::new(false));
    let stat_thread = {
        let dashboard = dashboard.clone();
        let stat_shutdown = stat_shutdown.clone();
        thread::spawn(move || stat::run(&dashboard, &stat_shutdown, 2))
    };

    thread::sleep(Duration::from_millis(500));

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64;
    let pool_rows = receiver.by_program(POOL, now).unwrap_or_default();
    let translator = StreamTranslator::new(&InternalTypes::new());
    for row in &pool_rows {
        for stat in translator.break_into_individual_values(row) {
            tracing::info!(
                host = ?stat.host,
                program = ?stat.plugin_instance,
                stat = ?stat.type_instance,
                value = ?stat.values.first(),
                "observed stat"
            );
            dashboard.lock().expect("dashboard lock poisoned").ingest(&stat);
        }
    }

    for row in dashboard.lock().expect("dashboard lock poisoned").rows() {
        tracing::info!(host = %row.hostname, program = ?row.program_name, connections = row.connection_count, "dashboard row");
    }

    stat_shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    drop(engine);
    // The receiver thread is blocked in a blocking recv_from; in a real
    // deployment it exits when the process does. For this short demo we
    // simply let the process end rather than inject a self-wakeup.
    let _ = receiver_thread;
    let _ = stat_thread;
}
