// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serde-deserializable configuration for the client and server halves of
//! the pipeline, plus the logging levels the host process can select.

use serde::Deserialize;

use crate::constants::{
    DEFAULT_COLLECTD_PORT, DEFAULT_DASHBOARD_PORT, DEFAULT_SEND_INTERVAL_SECS, DEFAULT_SERVER_PORT,
};

/// Verbosity the host process should configure its `tracing` subscriber
/// with. A thin, serializable mirror of `tracing::Level` so configuration
/// files don't need to know about the `tracing` crate's own types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

fn default_collectd_host() -> String {
    "127.0.0.1".to_string()
}

fn default_collectd_port() -> u16 {
    DEFAULT_COLLECTD_PORT
}

fn default_send_interval() -> i64 {
    DEFAULT_SEND_INTERVAL_SECS
}

/// Configuration for the instrumented side: which connection pools to
/// report, under what name, and where to send packets.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Reported `host` field. Defaults to the machine's own hostname if
    /// absent at load time (the loader, not this struct, fills that in).
    pub report_host: Option<String>,
    /// Reported `pluginInstance` field, identifying this program among
    /// others emitting to the same collectd endpoint.
    pub program_name: String,
    #[serde(default = "default_collectd_host")]
    pub collectd_host: String,
    #[serde(default = "default_collectd_port")]
    pub collectd_port: u16,
    #[serde(default = "default_send_interval")]
    pub send_interval_secs: i64,
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_dashboard_port() -> u16 {
    DEFAULT_DASHBOARD_PORT
}

/// Configuration for the aggregating server side: where to listen, and
/// optionally where to mirror raw packets for a standalone collectd daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    pub monitor_host: Option<String>,
    #[serde(default = "default_dashboard_port")]
    pub monitor_port: u16,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_server_host(),
            port: default_server_port(),
            monitor_host: None,
            monitor_port: default_dashboard_port(),
            log_level: LogLevel::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_fills_in_defaults() {
        let json = r#"{"program_name": "myapp"}"#;
        let cfg: ClientConfig = serde_json::from_str(json).expect("valid config");
        assert_eq!(cfg.program_name, "myapp");
        assert_eq!(cfg.collectd_host, "127.0.0.1");
        assert_eq!(cfg.collectd_port, DEFAULT_COLLECTD_PORT);
        assert_eq!(cfg.send_interval_secs, DEFAULT_SEND_INTERVAL_SECS);
    }

    #[test]
    fn server_config_default_matches_documented_ports() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, DEFAULT_SERVER_PORT);
        assert_eq!(cfg.monitor_port, DEFAULT_DASHBOARD_PORT);
    }
}
