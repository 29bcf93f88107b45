//! Conversion between protobuf messages and generic values.
//!
//! Messages are only known through their runtime descriptors, so both
//! directions walk the descriptor's fields. Encoding follows the protobuf
//! JSON mapping: 64-bit integers may arrive as strings, bytes as base64,
//! enums as names or numbers, and field names as declared or camelCase.

use crate::error::CodecError;
use crate::value::{GenericValue, Payload};
use base64::Engine;
use prost::bytes::{Buf, Bytes};
use prost_reflect::{
    DynamicMessage, EnumDescriptor, FieldDescriptor, Kind, MapKey, MessageDescriptor,
    ReflectMessage, Value,
};
use std::collections::HashMap;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Decode a message into a payload mapping.
///
/// Singular fields appear only when set; repeated and map fields always
/// appear, even when empty.
pub fn decode(message: &DynamicMessage) -> Payload {
    let descriptor = message.descriptor();
    let mut payload = Payload::new();

    for field in descriptor.fields() {
        if field.is_list() || field.is_map() || message.has_field(&field) {
            let value = message.get_field(&field);
            payload.insert(field.name().to_string(), decode_field(&field, &value));
        }
    }

    payload
}

/// Decode raw wire bytes against `descriptor`.
pub fn decode_bytes(descriptor: &MessageDescriptor, bytes: &[u8]) -> Result<Payload, CodecError> {
    let message = DynamicMessage::decode(descriptor.clone(), bytes)
        .map_err(|e| CodecError::Wire(e.to_string()))?;
    Ok(decode(&message))
}

fn decode_field(field: &FieldDescriptor, value: &Value) -> GenericValue {
    match value {
        Value::List(items) => GenericValue::List(
            items
                .iter()
                .map(|item| decode_single(&field.kind(), item))
                .collect(),
        ),
        Value::Map(entries) => {
            let value_kind = match field.kind() {
                Kind::Message(entry) => entry.map_entry_value_field().kind(),
                other => other,
            };
            GenericValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (map_key_to_string(k), decode_single(&value_kind, v)))
                    .collect(),
            )
        }
        other => decode_single(&field.kind(), other),
    }
}

fn decode_single(kind: &Kind, value: &Value) -> GenericValue {
    match value {
        Value::Bool(b) => GenericValue::Bool(*b),
        Value::I32(i) => GenericValue::Int(i64::from(*i)),
        Value::I64(i) => GenericValue::Int(*i),
        Value::U32(u) => GenericValue::Uint(u64::from(*u)),
        Value::U64(u) => GenericValue::Uint(*u),
        Value::F32(f) => GenericValue::Float(f64::from(*f)),
        Value::F64(f) => GenericValue::Float(*f),
        Value::String(s) => GenericValue::String(s.clone()),
        Value::Bytes(b) => GenericValue::Bytes(b.to_vec()),
        Value::EnumNumber(n) => match kind {
            Kind::Enum(e) => e
                .get_value(*n)
                .map(|v| GenericValue::String(v.name().to_string()))
                .unwrap_or(GenericValue::Int(i64::from(*n))),
            _ => GenericValue::Int(i64::from(*n)),
        },
        Value::Message(m) => GenericValue::Map(decode(m)),
        Value::List(items) => {
            GenericValue::List(items.iter().map(|v| decode_single(kind, v)).collect())
        }
        Value::Map(entries) => GenericValue::Map(
            entries
                .iter()
                .map(|(k, v)| (map_key_to_string(k), decode_single(kind, v)))
                .collect(),
        ),
    }
}

fn map_key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(i) => i.to_string(),
        MapKey::I64(i) => i.to_string(),
        MapKey::U32(u) => u.to_string(),
        MapKey::U64(u) => u.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

/// Build a message conforming to `descriptor` from a payload.
///
/// Fields are looked up by declared name, then by JSON name. A name the
/// descriptor does not know is an error; `Null` leaves a field unset.
pub fn encode(payload: &Payload, descriptor: &MessageDescriptor) -> Result<DynamicMessage, CodecError> {
    let mut message = DynamicMessage::new(descriptor.clone());

    for (name, value) in payload {
        let field = descriptor
            .get_field_by_name(name)
            .or_else(|| descriptor.get_field_by_json_name(name))
            .ok_or_else(|| CodecError::UnknownField {
                message: descriptor.full_name().to_string(),
                field: name.clone(),
            })?;

        if value.is_null() {
            continue;
        }

        let encoded = encode_field(&field, value)?;
        message
            .try_set_field(&field, encoded)
            .map_err(|e| CodecError::KindMismatch {
                field: field.name().to_string(),
                expected: e.to_string(),
                found: value.kind_name(),
            })?;
    }

    Ok(message)
}

fn encode_field(field: &FieldDescriptor, value: &GenericValue) -> Result<Value, CodecError> {
    let name = field.name();

    if field.is_map() {
        let GenericValue::Map(entries) = value else {
            return Err(mismatch(name, "map", value));
        };
        let Kind::Message(entry) = field.kind() else {
            return Err(mismatch(name, "map", value));
        };
        let key_kind = entry.map_entry_key_field().kind();
        let value_kind = entry.map_entry_value_field().kind();

        let mut out = HashMap::with_capacity(entries.len());
        for (k, v) in entries {
            out.insert(
                encode_map_key(name, &key_kind, k)?,
                encode_single(name, &value_kind, v)?,
            );
        }
        return Ok(Value::Map(out));
    }

    if field.is_list() {
        let GenericValue::List(items) = value else {
            return Err(mismatch(name, "list", value));
        };
        let kind = field.kind();
        let encoded = items
            .iter()
            .map(|item| encode_single(name, &kind, item))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::List(encoded));
    }

    encode_single(name, &field.kind(), value)
}

fn encode_single(field: &str, kind: &Kind, value: &GenericValue) -> Result<Value, CodecError> {
    match kind {
        Kind::Bool => match value {
            GenericValue::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(mismatch(field, "bool", other)),
        },
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            let n = integer(field, value, "int32")?;
            i32::try_from(n)
                .map(Value::I32)
                .map_err(|_| out_of_range(field, n, "int32"))
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            let n = integer(field, value, "int64")?;
            i64::try_from(n)
                .map(Value::I64)
                .map_err(|_| out_of_range(field, n, "int64"))
        }
        Kind::Uint32 | Kind::Fixed32 => {
            let n = integer(field, value, "uint32")?;
            u32::try_from(n)
                .map(Value::U32)
                .map_err(|_| out_of_range(field, n, "uint32"))
        }
        Kind::Uint64 | Kind::Fixed64 => {
            let n = integer(field, value, "uint64")?;
            u64::try_from(n)
                .map(Value::U64)
                .map_err(|_| out_of_range(field, n, "uint64"))
        }
        Kind::Float => {
            let f = float(field, value, "float")?;
            if f.is_finite() && f.abs() > f64::from(f32::MAX) {
                return Err(out_of_range(field, f, "float"));
            }
            Ok(Value::F32(f as f32))
        }
        Kind::Double => float(field, value, "double").map(Value::F64),
        Kind::String => match value {
            GenericValue::String(s) => Ok(Value::String(s.clone())),
            other => Err(mismatch(field, "string", other)),
        },
        Kind::Bytes => match value {
            GenericValue::Bytes(b) => Ok(Value::Bytes(Bytes::from(b.clone()))),
            GenericValue::String(s) => decode_base64(field, s).map(|b| Value::Bytes(Bytes::from(b))),
            other => Err(mismatch(field, "bytes", other)),
        },
        Kind::Enum(e) => encode_enum(field, e, value),
        Kind::Message(m) => match value {
            GenericValue::Map(payload) => encode(payload, m).map(Value::Message),
            other => Err(mismatch(field, m.full_name(), other)),
        },
    }
}

fn encode_enum(field: &str, e: &EnumDescriptor, value: &GenericValue) -> Result<Value, CodecError> {
    match value {
        GenericValue::String(name) => e
            .get_value_by_name(name)
            .map(|v| Value::EnumNumber(v.number()))
            .ok_or_else(|| CodecError::UnknownEnumValue {
                field: field.to_string(),
                enum_name: e.full_name().to_string(),
                value: name.clone(),
            }),
        other => match other.as_i128() {
            Some(n) => i32::try_from(n)
                .map(Value::EnumNumber)
                .map_err(|_| out_of_range(field, n, "enum")),
            None => Err(mismatch(field, e.full_name(), other)),
        },
    }
}

fn encode_map_key(field: &str, kind: &Kind, key: &str) -> Result<MapKey, CodecError> {
    let invalid = |kind_name: &'static str| CodecError::InvalidMapKey {
        field: field.to_string(),
        key: key.to_string(),
        kind: kind_name,
    };

    match kind {
        Kind::String => Ok(MapKey::String(key.to_string())),
        Kind::Bool => key.parse().map(MapKey::Bool).map_err(|_| invalid("bool")),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            key.parse().map(MapKey::I32).map_err(|_| invalid("int32"))
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            key.parse().map(MapKey::I64).map_err(|_| invalid("int64"))
        }
        Kind::Uint32 | Kind::Fixed32 => key.parse().map(MapKey::U32).map_err(|_| invalid("uint32")),
        Kind::Uint64 | Kind::Fixed64 => key.parse().map(MapKey::U64).map_err(|_| invalid("uint64")),
        _ => Err(invalid("map key")),
    }
}

/// Integer from any numeric variant or a decimal string.
fn integer(field: &str, value: &GenericValue, kind: &'static str) -> Result<i128, CodecError> {
    if let Some(n) = value.as_i128() {
        return Ok(n);
    }
    if let Some(n) = value.as_str().and_then(integer_from_text) {
        return Ok(n);
    }
    Err(mismatch(field, kind, value))
}

/// Integer written as a decimal string, as the JSON mapping allows for
/// 64-bit fields.
pub(crate) fn integer_from_text(text: &str) -> Option<i128> {
    let text = text.trim();
    text.parse::<i128>().ok().or_else(|| {
        text.parse::<f64>()
            .ok()
            .and_then(|f| GenericValue::Float(f).as_i128())
    })
}

fn float(field: &str, value: &GenericValue, kind: &'static str) -> Result<f64, CodecError> {
    if let Some(f) = value.as_f64() {
        return Ok(f);
    }
    if let GenericValue::String(s) = value {
        return match s.trim() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other.parse().map_err(|_| mismatch(field, kind, value)),
        };
    }
    Err(mismatch(field, kind, value))
}

/// Bytes written as standard or URL-safe base64, padded or not.
pub(crate) fn bytes_from_text(text: &str) -> Option<Vec<u8>> {
    decode_base64("", text).ok()
}

fn decode_base64(field: &str, s: &str) -> Result<Vec<u8>, CodecError> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    STANDARD
        .decode(s)
        .or_else(|_| URL_SAFE.decode(s))
        .or_else(|_| STANDARD_NO_PAD.decode(s))
        .or_else(|_| URL_SAFE_NO_PAD.decode(s))
        .map_err(|e| CodecError::InvalidBase64 {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

fn mismatch(field: &str, expected: &str, found: &GenericValue) -> CodecError {
    CodecError::KindMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        found: found.kind_name(),
    }
}

fn out_of_range(field: &str, value: impl ToString, kind: &'static str) -> CodecError {
    CodecError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        kind,
    }
}

/// gRPC codec for messages known only by descriptor.
///
/// Encodes any [`DynamicMessage`]; decodes with the descriptor given at
/// construction (the method input on a server, the output on a client).
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    decode_as: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(decode_as: MessageDescriptor) -> Self {
        Self { decode_as }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.decode_as.clone(),
        }
    }
}

/// Server-side gRPC codec: hands request bytes through undecoded so the
/// dispatcher can resolve the method before decoding, and encodes
/// [`DynamicMessage`] responses.
#[derive(Debug, Clone, Default)]
pub struct RequestCodec;

impl Codec for RequestCodec {
    type Encode = DynamicMessage;
    type Decode = Bytes;
    type Encoder = DynamicEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        prost::Message::encode(&item, dst)
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct DynamicDecoder {
    descriptor: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.descriptor.clone(), src)
            .map(Some)
            .map_err(|e| Status::internal(format!("failed to decode message: {e}")))
    }
}
