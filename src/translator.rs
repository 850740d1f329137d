// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Converts an internal, multi-value composite record into one
//! single-valued external record per field, the shape a generic
//! collectd-compatible consumer expects.

use crate::protocol::{ValueKind, Values};
use crate::types::{ExternalTypes, InternalTypes, EXTERNAL_COUNT, EXTERNAL_DERIVE};

/// Precomputed per-field mapping from an internal type's field name to the
/// external type name (`count` for gauges, `derive` for derive fields) it
/// becomes once split out.
struct FieldMapping {
    field_name: String,
    field_index: usize,
    external_type_name: &'static str,
}

/// Builds the field-to-external-type mapping once per internal type and
/// reuses it for every record, mirroring the Python original's
/// `external_type_to_internal` precomputation at construction time rather
/// than resolving kinds on every call.
pub struct StreamTranslator {
    external: ExternalTypes,
    mappings: std::collections::HashMap<String, Vec<FieldMapping>>,
}

impl StreamTranslator {
    pub fn new(internal: &InternalTypes) -> Self {
        let mut mappings = std::collections::HashMap::new();
        for ty in internal.all() {
            let fields = ty
                .fields()
                .iter()
                .enumerate()
                .map(|(index, (name, kind))| FieldMapping {
                    field_name: name.clone(),
                    field_index: index,
                    external_type_name: match kind {
                        ValueKind::Gauge => EXTERNAL_COUNT,
                        ValueKind::Derive => EXTERNAL_DERIVE,
                        ValueKind::Counter | ValueKind::Absolute => EXTERNAL_COUNT,
                    },
                })
                .collect();
            mappings.insert(ty.name().to_string(), fields);
        }
        StreamTranslator {
            external: ExternalTypes::new(),
            mappings,
        }
    }

    /// Splits one internal composite record into one external record per
    /// field, each carrying that field's single value and named by the
    /// field (placed into `type_instance`, the way a per-stat metric name
    /// is conventionally carried on this wire format).
    pub fn break_into_individual_values(&self, record: &Values) -> Vec<Values> {
        let Some(type_name) = record.metric_type.as_deref() else {
            return Vec::new();
        };
        let Some(fields) = self.mappings.get(type_name) else {
            return Vec::new();
        };
        fields
            .iter()
            .filter_map(|mapping| {
                record.values.get(mapping.field_index).map(|value| {
                    record
                        .build()
                        .with_type(mapping.external_type_name)
                        .with_type_instance(Some(mapping.field_name.clone()))
                        .with_values(vec![*value])
                })
            })
            .collect()
    }

    pub fn external_types(&self) -> &ExternalTypes {
        &self.external
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_record_splits_into_one_count_record_per_field() {
        let internal = InternalTypes::new();
        let translator = StreamTranslator::new(&internal);
        let record = Values::new()
            .with_type("sqlalchemy_pool")
            .with_host("h")
            .with_plugin("sqlalchemy")
            .with_plugin_instance(Some("app".to_string()))
            .with_time(100)
            .with_interval(10)
            .with_values(vec![1.0, 2.0, 3.0, 0.0, 4.0]);
        let split = translator.break_into_individual_values(&record);
        assert_eq!(split.len(), 5);
        assert_eq!(split[0].metric_type.as_deref(), Some("count"));
        assert_eq!(split[0].type_instance.as_deref(), Some("numpools"));
        assert_eq!(split[0].values, vec![1.0]);
        assert_eq!(split[1].type_instance.as_deref(), Some("checkedout"));
        assert_eq!(split[1].values, vec![2.0]);
    }

    #[test]
    fn totals_record_splits_into_derive_records() {
        let internal = InternalTypes::new();
        let translator = StreamTranslator::new(&internal);
        let record = Values::new()
            .with_type("sqlalchemy_totals")
            .with_values(vec![10.0, 1.0, 5.0, 2.0]);
        let split = translator.break_into_individual_values(&record);
        assert!(split.iter().all(|v| v.metric_type.as_deref() == Some("derive")));
        assert_eq!(split[0].type_instance.as_deref(), Some("checkouts"));
    }

    #[test]
    fn unknown_type_splits_into_nothing() {
        let internal = InternalTypes::new();
        let translator = StreamTranslator::new(&internal);
        let record = Values::new().with_type("not_registered").with_values(vec![1.0]);
        assert!(translator.break_into_individual_values(&record).is_empty());
    }
}
