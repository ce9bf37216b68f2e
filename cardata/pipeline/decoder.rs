//! Confluent-framed Avro decoding of telemetry records.
//!
//! Each queue message carries a 5-byte header (magic byte plus a big-endian
//! schema id) followed by one Avro binary datum. The decoder strips the
//! header, reads the datum against the schema loaded at startup, and widens
//! the int-typed tire pressure and firmware fields to `f64`.

use std::{fs, path::Path};

use apache_avro::{types::Value, Schema};
use once_cell::sync::OnceCell;

use crate::{
    config::DecoderConfig,
    error::DecodeError,
    normalizer::FEATURE_DIM,
    record::{RawMessage, Record, FAILURE_FIELD, FEATURE_FIELDS},
};

/// Length of the framing header stripped from every payload.
pub const FRAMING_PREFIX_LEN: usize = 5;

const MAGIC_BYTE: u8 = 0;

const DEFAULT_SCHEMA_JSON: &str = include_str!("schema/cardata-v1.avsc");

static DEFAULT_SCHEMA: OnceCell<Schema> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireKind {
    Double,
    Int,
    Text,
}

impl WireKind {
    const fn avro_name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::Int => "int",
            Self::Text => "string",
        }
    }

    fn matches(self, schema: &Schema) -> bool {
        matches!(
            (self, schema),
            (Self::Double, Schema::Double) | (Self::Int, Schema::Int) | (Self::Text, Schema::String)
        )
    }
}

/// Expected wire type of each feature field, in feature order.
const FEATURE_KINDS: [WireKind; FEATURE_DIM] = {
    use WireKind::{Double, Int};
    [
        Double, Double, Double, Double, Double, Double, Double, Double, Double, Int, Int, Int, Int,
        Double, Double, Double, Double, Int,
    ]
};

/// Stateless decoder bound to one validated schema.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    schema: Schema,
    verify_magic_byte: bool,
}

impl RecordDecoder {
    /// Decoder for the embedded `cardata-v1` schema.
    pub fn with_default_schema() -> Result<Self, DecodeError> {
        let schema = DEFAULT_SCHEMA
            .get_or_try_init(|| Schema::parse_str(DEFAULT_SCHEMA_JSON))?
            .clone();
        Self::new(schema)
    }

    /// Decoder for an `.avsc` file on disk.
    pub fn from_schema_file(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            DecodeError::Schema(format!("reading schema {}: {err}", path.display()))
        })?;
        Self::new(Schema::parse_str(&raw)?)
    }

    /// Builds the decoder described by configuration.
    pub fn from_config(config: &DecoderConfig) -> Result<Self, DecodeError> {
        let decoder = match &config.schema_path {
            Some(path) => Self::from_schema_file(path)?,
            None => Self::with_default_schema()?,
        };
        Ok(decoder.verify_magic_byte(config.verify_magic_byte))
    }

    /// Validates that `schema` describes the 19-field telemetry record.
    pub fn new(schema: Schema) -> Result<Self, DecodeError> {
        validate_schema(&schema)?;
        Ok(Self {
            schema,
            verify_magic_byte: false,
        })
    }

    /// Rejects frames whose first byte is not the zero magic byte.
    #[must_use]
    pub const fn verify_magic_byte(mut self, enabled: bool) -> Self {
        self.verify_magic_byte = enabled;
        self
    }

    /// Schema the decoder reads with.
    #[must_use]
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decodes one framed message.
    pub fn decode(&self, message: &RawMessage) -> Result<Record, DecodeError> {
        self.decode_bytes(&message.payload)
    }

    /// Decodes one framed payload.
    pub fn decode_bytes(&self, payload: &[u8]) -> Result<Record, DecodeError> {
        if payload.len() < FRAMING_PREFIX_LEN {
            return Err(DecodeError::Truncated {
                len: payload.len(),
                prefix: FRAMING_PREFIX_LEN,
            });
        }
        if self.verify_magic_byte && payload[0] != MAGIC_BYTE {
            return Err(DecodeError::Framing(payload[0]));
        }
        let mut body = &payload[FRAMING_PREFIX_LEN..];
        let datum = apache_avro::from_avro_datum(&self.schema, &mut body, None)?;
        if !body.is_empty() {
            return Err(DecodeError::TrailingBytes { len: body.len() });
        }
        let fields = match datum {
            Value::Record(fields) => fields,
            other => {
                return Err(DecodeError::Schema(format!(
                    "expected a record datum, found {}",
                    value_kind(&other)
                )))
            }
        };

        let mut features: [Option<f64>; FEATURE_DIM] = [None; FEATURE_DIM];
        let mut failure = None;
        for (name, value) in fields {
            if name == FAILURE_FIELD {
                failure = Some(read_text(FAILURE_FIELD, value)?);
            } else if let Some(index) = FEATURE_FIELDS.iter().position(|field| *field == name) {
                features[index] = Some(read_number(
                    FEATURE_FIELDS[index],
                    FEATURE_KINDS[index],
                    &value,
                )?);
            }
        }

        let mut values = [0.0; FEATURE_DIM];
        for (index, slot) in features.iter().enumerate() {
            values[index] = slot.ok_or(DecodeError::MissingField(FEATURE_FIELDS[index]))?;
        }
        let failure = failure.ok_or(DecodeError::MissingField(FAILURE_FIELD))?;
        Ok(Record::from_features(values, failure))
    }

    /// Frames and encodes a record; the inverse of [`Self::decode_bytes`].
    ///
    /// Int-typed fields are rounded to the nearest integer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, record: &Record, schema_id: u32) -> Result<Vec<u8>, DecodeError> {
        let Schema::Record(record_schema) = &self.schema else {
            return Err(DecodeError::Schema("schema is not a record".into()));
        };
        let features = record.features();
        let mut fields = Vec::with_capacity(record_schema.fields.len());
        for field in &record_schema.fields {
            let value = if field.name == FAILURE_FIELD {
                Value::String(record.failure_occurred.clone())
            } else {
                let index = FEATURE_FIELDS
                    .iter()
                    .position(|name| *name == field.name)
                    .ok_or_else(|| {
                        DecodeError::Schema(format!("cannot encode unknown field '{}'", field.name))
                    })?;
                match FEATURE_KINDS[index] {
                    WireKind::Int => Value::Int(features[index].round() as i32),
                    _ => Value::Double(features[index]),
                }
            };
            fields.push((field.name.clone(), value));
        }
        let datum = apache_avro::to_avro_datum(&self.schema, Value::Record(fields))?;
        let mut framed = Vec::with_capacity(FRAMING_PREFIX_LEN + datum.len());
        framed.push(MAGIC_BYTE);
        framed.extend_from_slice(&schema_id.to_be_bytes());
        framed.extend_from_slice(&datum);
        Ok(framed)
    }
}

fn validate_schema(schema: &Schema) -> Result<(), DecodeError> {
    let Schema::Record(record) = schema else {
        return Err(DecodeError::Schema("top-level schema must be a record".into()));
    };
    let expected = FEATURE_FIELDS
        .iter()
        .zip(FEATURE_KINDS)
        .map(|(name, kind)| (*name, kind))
        .chain(std::iter::once((FAILURE_FIELD, WireKind::Text)));
    for (name, kind) in expected {
        let field = record
            .fields
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| DecodeError::Schema(format!("schema lacks field '{name}'")))?;
        if !kind.matches(&field.schema) {
            return Err(DecodeError::Schema(format!(
                "field '{name}' must be {}, schema declares {:?}",
                kind.avro_name(),
                field.schema
            )));
        }
    }
    Ok(())
}

fn read_number(field: &'static str, kind: WireKind, value: &Value) -> Result<f64, DecodeError> {
    match (kind, value) {
        (WireKind::Double, Value::Double(v)) => Ok(*v),
        (WireKind::Int, Value::Int(v)) => Ok(f64::from(*v)),
        _ => Err(DecodeError::FieldType {
            field,
            expected: kind.avro_name(),
            found: value_kind(value),
        }),
    }
}

fn read_text(field: &'static str, value: Value) -> Result<String, DecodeError> {
    match value {
        Value::String(text) => Ok(text),
        other => Err(DecodeError::FieldType {
            field,
            expected: WireKind::Text.avro_name(),
            found: value_kind(&other),
        }),
    }
}

fn value_kind(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Boolean(_) => "boolean",
        Value::Int(_) => "int",
        Value::Long(_) => "long",
        Value::Float(_) => "float",
        Value::Double(_) => "double",
        Value::Bytes(_) => "bytes",
        Value::String(_) => "string",
        Value::Record(_) => "record",
        Value::Union(..) => "union",
        _ => "complex value",
    }
    .to_string()
}
