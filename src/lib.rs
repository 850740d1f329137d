// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod constants;
pub mod errors;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod transport;
pub mod translator;
pub mod types;
pub mod worker;
pub mod stat;
