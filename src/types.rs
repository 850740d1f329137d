// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fixed catalogue of internal and external type definitions. Internal
//! types describe what a client sends over the wire; external types are
//! what the stream translator produces for a downstream collectd-compatible
//! consumer that only understands single-valued `count`/`derive` records.

use crate::constants::PLUGIN_NAME;
use crate::protocol::{Type, TypeLookup, ValueKind};

/// Name of the internal type carrying live connection-pool gauges.
pub const POOL: &str = "sqlalchemy_pool";
/// Name of the internal type carrying monotonic lifetime counters.
pub const TOTALS: &str = "sqlalchemy_totals";
/// Name of the internal type synthesised by the receiver to track the
/// number of distinct reporting processes for a (host, program) pair.
pub const PROCESS: &str = "sqlalchemy_process";

/// Name of the external type used for gauge-valued records.
pub const EXTERNAL_COUNT: &str = "count";
/// Name of the external type used for derive-valued records.
pub const EXTERNAL_DERIVE: &str = "derive";

fn build_pool_type() -> Type {
    Type::new(
        POOL,
        vec![
            ("numpools".into(), ValueKind::Gauge),
            ("checkedout".into(), ValueKind::Gauge),
            ("checkedin".into(), ValueKind::Gauge),
            ("detached".into(), ValueKind::Gauge),
            ("connections".into(), ValueKind::Gauge),
        ],
    )
    .expect("pool type has a fixed, non-empty field list")
}

fn build_totals_type() -> Type {
    Type::new(
        TOTALS,
        vec![
            ("checkouts".into(), ValueKind::Derive),
            ("invalidated".into(), ValueKind::Derive),
            ("connects".into(), ValueKind::Derive),
            ("disconnects".into(), ValueKind::Derive),
        ],
    )
    .expect("totals type has a fixed, non-empty field list")
}

fn build_process_type() -> Type {
    Type::new(PROCESS, vec![("numprocs".into(), ValueKind::Gauge)])
        .expect("process type has a fixed, non-empty field list")
}

fn build_count_type() -> Type {
    Type::new(EXTERNAL_COUNT, vec![("value".into(), ValueKind::Gauge)])
        .expect("count type has a fixed, non-empty field list")
}

fn build_derive_type() -> Type {
    Type::new(EXTERNAL_DERIVE, vec![("value".into(), ValueKind::Derive)])
        .expect("derive type has a fixed, non-empty field list")
}

/// The closed catalogue of internal types this system speaks on the wire.
///
/// Closed and rarely extended, so it's modeled as a small fixed struct
/// rather than an open, runtime-registered map the way a general-purpose
/// collectd client's type database would be.
#[derive(Debug, Clone)]
pub struct InternalTypes {
    pub pool: Type,
    pub totals: Type,
    pub process: Type,
}

impl Default for InternalTypes {
    fn default() -> Self {
        InternalTypes {
            pool: build_pool_type(),
            totals: build_totals_type(),
            process: build_process_type(),
        }
    }
}

impl InternalTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> [&Type; 3] {
        [&self.pool, &self.totals, &self.process]
    }

    pub fn plugin_name(&self) -> &'static str {
        PLUGIN_NAME
    }
}

impl TypeLookup for InternalTypes {
    fn lookup(&self, name: &str) -> Option<&Type> {
        self.all().into_iter().find(|t| t.name() == name)
    }
}

/// The two external types a stream translator emits: one gauge-valued
/// record per source field (`count`) and one derive-valued record per
/// source field (`derive`).
#[derive(Debug, Clone)]
pub struct ExternalTypes {
    pub count: Type,
    pub derive: Type,
}

impl Default for ExternalTypes {
    fn default() -> Self {
        ExternalTypes {
            count: build_count_type(),
            derive: build_derive_type(),
        }
    }
}

impl ExternalTypes {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TypeLookup for ExternalTypes {
    fn lookup(&self, name: &str) -> Option<&Type> {
        if name == self.count.name() {
            Some(&self.count)
        } else if name == self.derive.name() {
            Some(&self.derive)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_fields_match_the_documented_order() {
        let types = InternalTypes::new();
        let names: Vec<&str> = types.pool.fields().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["numpools", "checkedout", "checkedin", "detached", "connections"]
        );
    }

    #[test]
    fn totals_fields_are_all_derive() {
        let types = InternalTypes::new();
        assert!(types
            .totals
            .fields()
            .iter()
            .all(|(_, k)| *k == ValueKind::Derive));
    }

    #[test]
    fn lookup_finds_registered_types_only() {
        let types = InternalTypes::new();
        assert!(types.lookup(POOL).is_some());
        assert!(types.lookup("not_a_real_type").is_none());
    }
}
