// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for each concern in the pipeline. Kept as small, per-domain
//! enums rather than one crate-wide type, mirroring how the rest of this
//! crate scopes errors to the module that raises them.

use std::net::SocketAddr;

/// Failures decoding a raw collectd packet into a [`crate::protocol::Values`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("part of kind {0:#06x} declared a length shorter than its header")]
    InvalidPartLength(u16),

    #[error("VALUES part declared {declared} value slots but carried {actual}")]
    ValueCountMismatch { declared: usize, actual: usize },

    #[error("VALUES part referenced unknown value-kind tag {0}")]
    UnknownValueKind(u8),

    #[error("packet carried no TYPE part, cannot resolve a type definition")]
    MissingType,

    #[error("packet referenced type {0:?} which is not in the registry")]
    UnregisteredType(String),

    #[error("string part was not valid UTF-8 after its NUL terminator")]
    InvalidString,
}

/// Failures constructing a [`crate::protocol::Type`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("type {0:?} must declare at least one value field")]
    NoFields(String),

    #[error("type {name:?} expected {expected} values but received {actual}")]
    ValueCountMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Failures reading or writing a [`crate::aggregator::TimeBucket`] entry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BucketError {
    #[error(
        "read at timestamp {timestamp} is older than the bucket's retention horizon \
         ({last_timestamp} - {horizon})"
    )]
    StaleRead {
        timestamp: i64,
        last_timestamp: i64,
        horizon: i64,
    },
}

/// Failures sending or receiving a UDP datagram.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send datagram to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to receive datagram: {0}")]
    Receive(#[source] std::io::Error),

    #[error("packet of {0} bytes exceeds the {1} byte transport limit")]
    PacketTooLarge(usize, usize),
}

/// Outcome of a single worker-driven send attempt, distinguishing a
/// recoverable failure (logged, the worker keeps ticking) from a fatal one
/// (logged, the worker thread exits).
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("error sending stats: {0}")]
    Recoverable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("message sender thread caught a fatal exception, exiting: {0}")]
    Fatal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failures handling one inbound packet end-to-end: decoding it, or filing
/// the decoded record into the aggregator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Bucket(#[from] BucketError),
}

/// Failures constructing a [`crate::sender::Sender`] or loading
/// configuration that names a type by string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sender was asked to emit unknown internal type {0:?}")]
    UnknownInternalType(String),
}
