// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The collectd binary wire codec: value kinds, type definitions, the
//! `Values` record, and the packer/unpacker that turn one into the other.

use crate::errors::{DecodeError, TypeError};

/// Part-kind tags as they appear in a collectd packet's 4-byte part header.
mod part_kind {
    pub const HOST: u16 = 0x0000;
    pub const TIME: u16 = 0x0001;
    pub const PLUGIN: u16 = 0x0002;
    pub const PLUGIN_INSTANCE: u16 = 0x0003;
    pub const TYPE: u16 = 0x0004;
    pub const TYPE_INSTANCE: u16 = 0x0005;
    pub const VALUES: u16 = 0x0006;
    pub const INTERVAL: u16 = 0x0007;
}

/// The kind tag collectd stamps on each slot of a VALUES part, and the
/// on-wire width/endianness used to encode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Counter,
    Gauge,
    Derive,
    Absolute,
}

impl ValueKind {
    fn wire_tag(self) -> u8 {
        match self {
            ValueKind::Counter => 0,
            ValueKind::Gauge => 1,
            ValueKind::Derive => 2,
            ValueKind::Absolute => 3,
        }
    }

    fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ValueKind::Counter),
            1 => Some(ValueKind::Gauge),
            2 => Some(ValueKind::Derive),
            3 => Some(ValueKind::Absolute),
            _ => None,
        }
    }

    fn encode(self, value: f64, out: &mut Vec<u8>) {
        match self {
            ValueKind::Counter | ValueKind::Absolute => {
                out.extend_from_slice(&(value as u64).to_be_bytes());
            }
            ValueKind::Gauge => {
                out.extend_from_slice(&value.to_le_bytes());
            }
            ValueKind::Derive => {
                out.extend_from_slice(&(value as i64).to_be_bytes());
            }
        }
    }

    fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            ValueKind::Counter | ValueKind::Absolute => {
                u64::from_be_bytes(bytes.try_into().expect("8-byte slice")) as f64
            }
            ValueKind::Gauge => f64::from_le_bytes(bytes.try_into().expect("8-byte slice")),
            ValueKind::Derive => {
                i64::from_be_bytes(bytes.try_into().expect("8-byte slice")) as f64
            }
        }
    }
}

/// A named, ordered collection of value-kind fields — collectd's "type
/// definition". Types are immutable once built and are looked up by name
/// when decoding a packet's VALUES part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    name: String,
    fields: Vec<(String, ValueKind)>,
}

impl Type {
    pub fn new(name: impl Into<String>, fields: Vec<(String, ValueKind)>) -> Result<Self, TypeError> {
        let name = name.into();
        if fields.is_empty() {
            return Err(TypeError::NoFields(name));
        }
        Ok(Type { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[(String, ValueKind)] {
        &self.fields
    }

    /// Index of `field_name` within this type's value slots, used to read a
    /// named statistic back out of a decoded `Values.values` vector.
    pub fn field_index(&self, field_name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == field_name)
    }

    fn kind_tags(&self) -> Vec<u8> {
        self.fields.iter().map(|(_, k)| k.wire_tag()).collect()
    }

    /// Encode the VALUES part body (count, kind tags, packed values) for the
    /// given value slots. `values.len()` must equal this type's field count.
    fn encode_values_part(&self, values: &[f64]) -> Result<Vec<u8>, TypeError> {
        if values.len() != self.fields.len() {
            return Err(TypeError::ValueCountMismatch {
                name: self.name.clone(),
                expected: self.fields.len(),
                actual: values.len(),
            });
        }
        let count = self.fields.len() as u16;
        let body_len = 2 + self.fields.len() + self.fields.len() * 8;
        let part_len = 4 + body_len;
        let mut out = Vec::with_capacity(part_len);
        out.extend_from_slice(&part_kind::VALUES.to_be_bytes());
        out.extend_from_slice(&(part_len as u16).to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        out.extend_from_slice(&self.kind_tags());
        for (value, (_, kind)) in values.iter().zip(self.fields.iter()) {
            kind.encode(*value, &mut out);
        }
        Ok(out)
    }

    /// Decode a VALUES part body (without its 4-byte header) into this
    /// type's value slots, in field order.
    fn decode_values_part(&self, body: &[u8]) -> Result<Vec<f64>, DecodeError> {
        if body.len() < 2 {
            return Err(DecodeError::Truncated {
                expected: 2,
                found: body.len(),
            });
        }
        let count = u16::from_be_bytes([body[0], body[1]]) as usize;
        if count != self.fields.len() {
            return Err(DecodeError::ValueCountMismatch {
                declared: self.fields.len(),
                actual: count,
            });
        }
        let tags_start = 2;
        let tags_end = tags_start + count;
        let values_start = tags_end;
        let values_end = values_start + count * 8;
        if body.len() < values_end {
            return Err(DecodeError::Truncated {
                expected: values_end,
                found: body.len(),
            });
        }
        let tags = &body[tags_start..tags_end];
        let mut out = Vec::with_capacity(count);
        for (i, (_, declared_kind)) in self.fields.iter().enumerate() {
            // The wire tag is validated against a known kind but decoding
            // uses this type's declared kind for the slot, matching collectd
            // servers that trust their own type database over the tag byte.
            ValueKind::from_wire_tag(tags[i]).ok_or(DecodeError::UnknownValueKind(tags[i]))?;
            let slot = &body[values_start + i * 8..values_start + i * 8 + 8];
            out.push(declared_kind.decode(slot));
        }
        Ok(out)
    }
}

/// A single collectd record: the scalar identity fields (host, plugin,
/// type, ...) plus one or more packed numeric values.
///
/// Every scalar-string field is nullable, matching the wire format (absent
/// parts decode to `None`) and the addition semantics below (disagreeing
/// fields become `None`, not a panic).
#[derive(Debug, Clone, PartialEq)]
pub struct Values {
    pub metric_type: Option<String>,
    pub type_instance: Option<String>,
    pub plugin: Option<String>,
    pub plugin_instance: Option<String>,
    pub host: Option<String>,
    pub time: Option<i64>,
    pub interval: i64,
    pub values: Vec<f64>,
}

impl Default for Values {
    fn default() -> Self {
        Values {
            metric_type: None,
            type_instance: None,
            plugin: None,
            plugin_instance: None,
            host: None,
            time: None,
            interval: crate::constants::DEFAULT_INTERVAL,
            values: Vec::new(),
        }
    }
}

impl Values {
    pub fn new() -> Self {
        Values::default()
    }

    /// Clone-with-overrides, used the way the Python original's
    /// `Values.build(**kw)` was: take an existing record as a template and
    /// replace a handful of fields for an outgoing emission.
    pub fn build(&self) -> Self {
        self.clone()
    }

    pub fn with_type(mut self, v: impl Into<String>) -> Self {
        self.metric_type = Some(v.into());
        self
    }

    pub fn with_type_instance(mut self, v: Option<String>) -> Self {
        self.type_instance = v;
        self
    }

    pub fn with_plugin(mut self, v: impl Into<String>) -> Self {
        self.plugin = Some(v.into());
        self
    }

    pub fn with_plugin_instance(mut self, v: Option<String>) -> Self {
        self.plugin_instance = v;
        self
    }

    pub fn with_host(mut self, v: impl Into<String>) -> Self {
        self.host = Some(v.into());
        self
    }

    pub fn with_time(mut self, v: i64) -> Self {
        self.time = Some(v);
        self
    }

    pub fn with_interval(mut self, v: i64) -> Self {
        self.interval = v;
        self
    }

    pub fn with_values(mut self, v: Vec<f64>) -> Self {
        self.values = v;
        self
    }
}

/// Merges two string fields the way a `Values` addition treats its scalar
/// fields: keep the value when both sides agree, null it out otherwise.
fn merge_field(a: &Option<String>, b: &Option<String>) -> Option<String> {
    if a == b {
        a.clone()
    } else {
        None
    }
}

impl std::ops::Add for Values {
    type Output = Values;

    /// Element-wise sum of `values`; every scalar-string field is retained
    /// only where both operands agree, otherwise nulled. `time`/`interval`
    /// are taken from `self` — callers that group records together
    /// (the aggregator's byProgram/byHost folds) overwrite both explicitly
    /// with the bucket's own timestamp and interval after summing.
    fn add(self, rhs: Values) -> Values {
        let values = if self.values.len() == rhs.values.len() {
            self.values
                .iter()
                .zip(rhs.values.iter())
                .map(|(a, b)| a + b)
                .collect()
        } else {
            // Mismatched shapes never occur within one bucket (all entries
            // for a given internal type share that type's field count), but
            // fall back to the longer of the two sides rather than panic.
            if self.values.len() >= rhs.values.len() {
                self.values.clone()
            } else {
                rhs.values.clone()
            }
        };
        Values {
            metric_type: merge_field(&self.metric_type, &rhs.metric_type),
            type_instance: merge_field(&self.type_instance, &rhs.type_instance),
            plugin: merge_field(&self.plugin, &rhs.plugin),
            plugin_instance: merge_field(&self.plugin_instance, &rhs.plugin_instance),
            host: merge_field(&self.host, &rhs.host),
            time: self.time,
            interval: self.interval,
            values,
        }
    }
}

fn encode_string_part(kind: u16, value: Option<&str>, out: &mut Vec<u8>) {
    let s = value.unwrap_or("");
    let body_len = s.len() + 1;
    let part_len = 4 + body_len;
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&(part_len as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn encode_integer_part(kind: u16, value: i64, out: &mut Vec<u8>) {
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&12u16.to_be_bytes());
    out.extend_from_slice(&value.to_be_bytes());
}

/// Encodes one full collectd packet: HOST, TIME, PLUGIN, PLUGIN_INSTANCE,
/// TYPE, INTERVAL, TYPE_INSTANCE, VALUES, in that order.
pub fn encode_packet(values: &Values, ty: &Type) -> Result<Vec<u8>, TypeError> {
    let mut out = Vec::with_capacity(crate::constants::MAX_PACKET_SIZE);
    encode_string_part(part_kind::HOST, values.host.as_deref(), &mut out);
    encode_integer_part(part_kind::TIME, values.time.unwrap_or(0), &mut out);
    encode_string_part(part_kind::PLUGIN, values.plugin.as_deref(), &mut out);
    encode_string_part(
        part_kind::PLUGIN_INSTANCE,
        values.plugin_instance.as_deref(),
        &mut out,
    );
    encode_string_part(part_kind::TYPE, Some(ty.name()), &mut out);
    encode_integer_part(part_kind::INTERVAL, values.interval, &mut out);
    encode_string_part(
        part_kind::TYPE_INSTANCE,
        values.type_instance.as_deref(),
        &mut out,
    );
    out.extend_from_slice(&ty.encode_values_part(&values.values)?);
    Ok(out)
}

/// Looks up a type definition by name, the way the unpacker resolves the
/// TYPE part of an incoming packet before it can decode the VALUES part.
pub trait TypeLookup {
    fn lookup(&self, name: &str) -> Option<&Type>;
}

/// Decodes one full collectd packet into a `Values` record, resolving the
/// VALUES part's field layout via `registry`.
///
/// Unknown part kinds are skipped (forward-compatible with future collectd
/// part types), matching the wire format's own tolerance for this. A packet
/// that never carries a TYPE part, or whose TYPE part names an
/// unregistered type, is rejected — there is no way to decode VALUES
/// without knowing its shape.
pub fn decode_packet(bytes: &[u8], registry: &dyn TypeLookup) -> Result<Values, DecodeError> {
    let mut values = Values::new();
    let mut type_name: Option<String> = None;
    let mut pending_values_body: Option<&[u8]> = None;

    let mut pos = 0usize;
    while pos + 4 <= bytes.len() {
        let kind = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
        let part_len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if part_len < 4 {
            return Err(DecodeError::InvalidPartLength(kind));
        }
        if pos + part_len > bytes.len() {
            return Err(DecodeError::Truncated {
                expected: pos + part_len,
                found: bytes.len(),
            });
        }
        let body = &bytes[pos + 4..pos + part_len];
        match kind {
            part_kind::HOST => values.host = decode_string(body)?,
            part_kind::TIME => values.time = Some(decode_integer(body, kind)?),
            part_kind::PLUGIN => values.plugin = decode_string(body)?,
            part_kind::PLUGIN_INSTANCE => values.plugin_instance = decode_string(body)?,
            part_kind::TYPE => type_name = decode_string(body)?,
            part_kind::TYPE_INSTANCE => values.type_instance = decode_string(body)?,
            part_kind::INTERVAL => values.interval = decode_integer(body, kind)?,
            part_kind::VALUES => pending_values_body = Some(body),
            _ => {}
        }
        pos += part_len;
    }

    let type_name = type_name.ok_or(DecodeError::MissingType)?;
    let ty = registry
        .lookup(&type_name)
        .ok_or_else(|| DecodeError::UnregisteredType(type_name.clone()))?;
    values.metric_type = Some(type_name);
    let body = pending_values_body.ok_or(DecodeError::MissingType)?;
    values.values = ty.decode_values_part(body)?;
    Ok(values)
}

fn decode_string(body: &[u8]) -> Result<Option<String>, DecodeError> {
    let raw = body.strip_suffix(&[0u8]).unwrap_or(body);
    if raw.is_empty() {
        return Ok(None);
    }
    std::str::from_utf8(raw)
        .map(|s| Some(s.to_string()))
        .map_err(|_| DecodeError::InvalidString)
}

fn decode_integer(body: &[u8], kind: u16) -> Result<i64, DecodeError> {
    if body.len() != 8 {
        return Err(DecodeError::InvalidPartLength(kind));
    }
    Ok(i64::from_be_bytes(body.try_into().expect("8-byte slice")))
}
