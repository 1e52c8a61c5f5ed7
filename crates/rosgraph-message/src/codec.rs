//! Binary message codec.
//!
//! Scalars are fixed-width little-endian. Strings and variable-length arrays
//! carry a u32 element count; fixed-length arrays carry none. Nested messages
//! are encoded inline.

use crate::descriptor::TypeDescriptor;
use crate::field::{Cardinality, FieldSpec, FieldType, PrimitiveType};
use crate::message::RuntimeMessage;
use crate::time::{Duration, Time};
use crate::value::FieldValue;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rosgraph_types::{RosError, RosResult};
use std::sync::Arc;

/// What queues, publishers, subscribers and services need from a message.
pub trait MessageCodec: Send + Sync + Sized + 'static {
    /// Layout this value conforms to.
    fn descriptor(&self) -> &Arc<TypeDescriptor>;

    /// Exact encoded length, computed without encoding.
    fn serialized_size(&self) -> usize;

    /// Append the encoding to `buf`.
    fn encode(&self, buf: &mut BytesMut) -> RosResult<()>;

    /// Decode exactly `bytes` as a value of `descriptor`.
    fn decode(descriptor: &Arc<TypeDescriptor>, bytes: &[u8]) -> RosResult<Self>;

    fn to_bytes(&self) -> RosResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Encode a message to a fresh buffer.
pub fn serialize<M: MessageCodec>(message: &M) -> RosResult<Bytes> {
    message.to_bytes()
}

/// Decode `bytes` as a message of `descriptor`.
pub fn deserialize<M: MessageCodec>(bytes: &[u8], descriptor: &Arc<TypeDescriptor>) -> RosResult<M> {
    M::decode(descriptor, bytes)
}

impl MessageCodec for RuntimeMessage {
    fn descriptor(&self) -> &Arc<TypeDescriptor> {
        RuntimeMessage::descriptor(self)
    }

    fn serialized_size(&self) -> usize {
        message_size(self)
    }

    fn encode(&self, buf: &mut BytesMut) -> RosResult<()> {
        buf.reserve(self.serialized_size());
        encode_message(self, buf)
    }

    fn decode(descriptor: &Arc<TypeDescriptor>, bytes: &[u8]) -> RosResult<Self> {
        let mut cursor = bytes;
        let message = decode_message(descriptor, &mut cursor)?;
        if cursor.has_remaining() {
            return Err(RosError::Serialization(format!(
                "{} trailing bytes after {}",
                cursor.remaining(),
                descriptor.name()
            )));
        }
        Ok(message)
    }
}

fn message_size(message: &RuntimeMessage) -> usize {
    message
        .descriptor()
        .fields()
        .iter()
        .zip(message.values())
        .map(|(spec, value)| field_size(spec, value))
        .sum()
}

fn field_size(spec: &FieldSpec, value: &FieldValue) -> usize {
    match (spec.cardinality, value) {
        (Cardinality::Single, v) => element_size(v),
        (Cardinality::Variable, FieldValue::Array(items)) => {
            4 + items.iter().map(element_size).sum::<usize>()
        }
        (Cardinality::Fixed(_), FieldValue::Array(items)) => {
            items.iter().map(element_size).sum::<usize>()
        }
        _ => 0,
    }
}

fn element_size(value: &FieldValue) -> usize {
    match value {
        FieldValue::Bool(_) | FieldValue::Int8(_) | FieldValue::UInt8(_) => 1,
        FieldValue::Int16(_) | FieldValue::UInt16(_) => 2,
        FieldValue::Int32(_) | FieldValue::UInt32(_) | FieldValue::Float32(_) => 4,
        FieldValue::Int64(_)
        | FieldValue::UInt64(_)
        | FieldValue::Float64(_)
        | FieldValue::Time(_)
        | FieldValue::Duration(_) => 8,
        FieldValue::String(s) => 4 + s.len(),
        FieldValue::Message(m) => message_size(m),
        FieldValue::Array(items) => 4 + items.iter().map(element_size).sum::<usize>(),
    }
}

fn encode_message(message: &RuntimeMessage, buf: &mut BytesMut) -> RosResult<()> {
    for (spec, value) in message.descriptor().fields().iter().zip(message.values()) {
        match (spec.cardinality, value) {
            (Cardinality::Single, v) => encode_element(v, buf)?,
            (Cardinality::Variable, FieldValue::Array(items)) => {
                buf.put_u32_le(length_prefix(items.len())?);
                for item in items {
                    encode_element(item, buf)?;
                }
            }
            (Cardinality::Fixed(n), FieldValue::Array(items)) if items.len() == n => {
                for item in items {
                    encode_element(item, buf)?;
                }
            }
            _ => {
                return Err(RosError::Serialization(format!(
                    "{}.{} does not match its declared type {}",
                    message.type_name(),
                    spec.name,
                    spec.type_token
                )))
            }
        }
    }
    Ok(())
}

fn length_prefix(len: usize) -> RosResult<u32> {
    u32::try_from(len)
        .map_err(|_| RosError::Serialization(format!("length {len} exceeds u32 range")))
}

fn encode_element(value: &FieldValue, buf: &mut BytesMut) -> RosResult<()> {
    match value {
        FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
        FieldValue::Int8(v) => buf.put_i8(*v),
        FieldValue::UInt8(v) => buf.put_u8(*v),
        FieldValue::Int16(v) => buf.put_i16_le(*v),
        FieldValue::UInt16(v) => buf.put_u16_le(*v),
        FieldValue::Int32(v) => buf.put_i32_le(*v),
        FieldValue::UInt32(v) => buf.put_u32_le(*v),
        FieldValue::Int64(v) => buf.put_i64_le(*v),
        FieldValue::UInt64(v) => buf.put_u64_le(*v),
        FieldValue::Float32(v) => buf.put_f32_le(*v),
        FieldValue::Float64(v) => buf.put_f64_le(*v),
        FieldValue::String(s) => {
            buf.put_u32_le(length_prefix(s.len())?);
            buf.put_slice(s.as_bytes());
        }
        FieldValue::Time(t) => {
            buf.put_u32_le(t.secs);
            buf.put_u32_le(t.nsecs);
        }
        FieldValue::Duration(d) => {
            buf.put_i32_le(d.secs);
            buf.put_i32_le(d.nsecs);
        }
        FieldValue::Message(m) => encode_message(m, buf)?,
        FieldValue::Array(_) => {
            return Err(RosError::Serialization(
                "nested arrays are not representable".into(),
            ))
        }
    }
    Ok(())
}

fn need(cursor: &&[u8], n: usize) -> RosResult<()> {
    if cursor.remaining() < n {
        Err(RosError::truncated(n, cursor.remaining()))
    } else {
        Ok(())
    }
}

fn decode_message(descriptor: &Arc<TypeDescriptor>, cursor: &mut &[u8]) -> RosResult<RuntimeMessage> {
    let mut values = Vec::with_capacity(descriptor.fields().len());
    for spec in descriptor.fields() {
        let value = match spec.cardinality {
            Cardinality::Single => decode_element(&spec.field_type, cursor)?,
            Cardinality::Variable => {
                need(cursor, 4)?;
                let count = cursor.get_u32_le() as usize;
                decode_array(&spec.field_type, count, cursor)?
            }
            Cardinality::Fixed(n) => decode_array(&spec.field_type, n, cursor)?,
        };
        values.push(value);
    }
    RuntimeMessage::from_values(Arc::clone(descriptor), values)
}

/// Upper bound on elements that take no bytes on the wire (`std_msgs/Empty[]`),
/// whose count the remaining input cannot bound.
pub const MAX_ZERO_WIDTH_ELEMENTS: usize = 1 << 16;

/// Fewest bytes one value of `field_type` can occupy.
fn min_width(field_type: &FieldType) -> usize {
    match field_type {
        FieldType::Primitive(p) => p.fixed_size().unwrap_or(4),
        FieldType::Message(nested) => nested
            .fields()
            .iter()
            .map(|spec| match spec.cardinality {
                Cardinality::Single => min_width(&spec.field_type),
                Cardinality::Variable => 4,
                Cardinality::Fixed(n) => n.saturating_mul(min_width(&spec.field_type)),
            })
            .fold(0usize, usize::saturating_add),
    }
}

fn decode_array(field_type: &FieldType, count: usize, cursor: &mut &[u8]) -> RosResult<FieldValue> {
    let width = min_width(field_type);
    if width > 0 {
        need(cursor, count.saturating_mul(width))?;
    } else if count > MAX_ZERO_WIDTH_ELEMENTS {
        return Err(RosError::Serialization(format!(
            "{count} zero-width elements exceeds limit of {MAX_ZERO_WIDTH_ELEMENTS}"
        )));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(decode_element(field_type, cursor)?);
    }
    Ok(FieldValue::Array(items))
}

fn decode_element(field_type: &FieldType, cursor: &mut &[u8]) -> RosResult<FieldValue> {
    let primitive = match field_type {
        FieldType::Message(nested) => {
            return Ok(FieldValue::Message(decode_message(nested, cursor)?));
        }
        FieldType::Primitive(p) => *p,
    };
    if let Some(width) = primitive.fixed_size() {
        need(cursor, width)?;
    }
    Ok(match primitive {
        PrimitiveType::Bool => FieldValue::Bool(cursor.get_u8() != 0),
        PrimitiveType::Int8 => FieldValue::Int8(cursor.get_i8()),
        PrimitiveType::UInt8 => FieldValue::UInt8(cursor.get_u8()),
        PrimitiveType::Int16 => FieldValue::Int16(cursor.get_i16_le()),
        PrimitiveType::UInt16 => FieldValue::UInt16(cursor.get_u16_le()),
        PrimitiveType::Int32 => FieldValue::Int32(cursor.get_i32_le()),
        PrimitiveType::UInt32 => FieldValue::UInt32(cursor.get_u32_le()),
        PrimitiveType::Int64 => FieldValue::Int64(cursor.get_i64_le()),
        PrimitiveType::UInt64 => FieldValue::UInt64(cursor.get_u64_le()),
        PrimitiveType::Float32 => FieldValue::Float32(cursor.get_f32_le()),
        PrimitiveType::Float64 => FieldValue::Float64(cursor.get_f64_le()),
        PrimitiveType::Time => {
            let secs = cursor.get_u32_le();
            FieldValue::Time(Time::new(secs, cursor.get_u32_le()))
        }
        PrimitiveType::Duration => {
            let secs = cursor.get_i32_le();
            FieldValue::Duration(Duration::new(secs, cursor.get_i32_le()))
        }
        PrimitiveType::String => {
            need(cursor, 4)?;
            let len = cursor.get_u32_le() as usize;
            need(cursor, len)?;
            let text = std::str::from_utf8(&cursor[..len])
                .map_err(|e| RosError::Serialization(format!("string is not UTF-8: {e}")))?
                .to_string();
            cursor.advance(len);
            FieldValue::String(text)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MessageRegistry;

    fn registry() -> MessageRegistry {
        let registry = MessageRegistry::with_std_msgs();
        registry
            .register("test_ros/Point", "float64 x\nfloat64 y")
            .unwrap();
        registry
            .register(
                "test_ros/Everything",
                "bool b\nint8 i8\nuint8 u8\nint16 i16\nuint16 u16\nint32 i32\nuint32 u32\n\
                 int64 i64\nuint64 u64\nfloat32 f32\nfloat64 f64\nstring s\ntime t\nduration d\n\
                 Header header\nPoint p\nPoint[] path\nPoint[2] segment\nint32[] ints\n\
                 string[] names\nuint8[4] raw",
            )
            .unwrap();
        registry
            .register("test_ros/Deep", "Everything inner\nEverything[] many")
            .unwrap();
        registry
    }

    fn point(registry: &MessageRegistry, x: f64, y: f64) -> RuntimeMessage {
        registry
            .new_message("test_ros/Point")
            .unwrap()
            .with("x", x)
            .unwrap()
            .with("y", y)
            .unwrap()
    }

    fn everything(registry: &MessageRegistry) -> RuntimeMessage {
        let mut header = registry.new_message("std_msgs/Header").unwrap();
        header.set("seq", 9u32).unwrap();
        header.set("stamp", Time::new(10, 20)).unwrap();
        header.set("frame_id", "map").unwrap();

        registry
            .new_message("test_ros/Everything")
            .unwrap()
            .with("b", true).unwrap()
            .with("i8", -8i8).unwrap()
            .with("u8", 8u8).unwrap()
            .with("i16", -16i16).unwrap()
            .with("u16", 16u16).unwrap()
            .with("i32", -32i32).unwrap()
            .with("u32", 32u32).unwrap()
            .with("i64", -64i64).unwrap()
            .with("u64", 64u64).unwrap()
            .with("f32", 3.5f32).unwrap()
            .with("f64", -2.25f64).unwrap()
            .with("s", "héllo").unwrap()
            .with("t", Time::new(1, 2)).unwrap()
            .with("d", Duration::new(-3, 4)).unwrap()
            .with("header", header).unwrap()
            .with("p", point(registry, 1.0, 2.0)).unwrap()
            .with("path", vec![point(registry, 0.0, 0.0), point(registry, 5.0, 6.0)]).unwrap()
            .with("segment", vec![point(registry, 7.0, 8.0), point(registry, 9.0, 10.0)]).unwrap()
            .with("ints", vec![1i32, -2, 3]).unwrap()
            .with("names", vec!["a", "bc"]).unwrap()
            .with("raw", vec![1u8, 2, 3, 4]).unwrap()
    }

    #[test]
    fn test_round_trip_all_field_types() {
        let registry = registry();
        let msg = everything(&registry);
        let bytes = serialize(&msg).unwrap();
        assert_eq!(bytes.len(), msg.serialized_size());
        let back: RuntimeMessage = deserialize(&bytes, msg.descriptor()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_round_trip_nested_depth() {
        let registry = registry();
        let deep = registry
            .new_message("test_ros/Deep")
            .unwrap()
            .with("inner", everything(&registry))
            .unwrap()
            .with("many", vec![everything(&registry), everything(&registry)])
            .unwrap();
        let bytes = serialize(&deep).unwrap();
        assert_eq!(bytes.len(), deep.serialized_size());
        let back: RuntimeMessage = deserialize(&bytes, deep.descriptor()).unwrap();
        assert_eq!(back, deep);
    }

    #[test]
    fn test_string_layout() {
        let registry = registry();
        let msg = registry
            .new_message("std_msgs/String")
            .unwrap()
            .with("data", "Hello, ROS!")
            .unwrap();
        let bytes = serialize(&msg).unwrap();
        assert_eq!(&bytes[..4], &11u32.to_le_bytes());
        assert_eq!(&bytes[4..], b"Hello, ROS!");
    }

    #[test]
    fn test_fixed_array_has_no_prefix() {
        let registry = MessageRegistry::new();
        let descriptor = registry.register("test_ros/Raw", "uint8[3] raw").unwrap();
        let msg = RuntimeMessage::new(descriptor).with("raw", vec![7u8, 8, 9]).unwrap();
        assert_eq!(serialize(&msg).unwrap().as_ref(), &[7, 8, 9]);
    }

    #[test]
    fn test_truncated_and_trailing_input() {
        let registry = registry();
        let msg = everything(&registry);
        let bytes = serialize(&msg).unwrap();

        let truncated = deserialize::<RuntimeMessage>(&bytes[..bytes.len() - 1], msg.descriptor());
        assert!(matches!(truncated, Err(RosError::Serialization(_))));

        let mut padded = bytes.to_vec();
        padded.push(0);
        let trailing = deserialize::<RuntimeMessage>(&padded, msg.descriptor());
        assert!(matches!(trailing, Err(RosError::Serialization(_))));
    }

    #[test]
    fn test_absurd_count_is_rejected_without_allocating() {
        let registry = registry();
        let descriptor = registry.get("test_ros/Point").unwrap();
        let ints = registry.register("test_ros/Ints", "int32[] data").unwrap();
        assert!(deserialize::<RuntimeMessage>(&[0xff, 0xff, 0xff, 0xff], &ints).is_err());
        assert!(deserialize::<RuntimeMessage>(&[], &descriptor).is_err());
    }

    #[test]
    fn test_empty_element_count_is_bounded() {
        let registry = registry();
        let bag = registry
            .register("test_ros/Bag", "std_msgs/Empty[] items")
            .unwrap();
        let started = std::time::Instant::now();
        let result = deserialize::<RuntimeMessage>(&20_000_000u32.to_le_bytes(), &bag);
        assert!(matches!(result, Err(RosError::Serialization(_))));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert!(deserialize::<RuntimeMessage>(&u32::MAX.to_le_bytes(), &bag).is_err());

        let few = deserialize::<RuntimeMessage>(&3u32.to_le_bytes(), &bag).unwrap();
        match few.get("items").unwrap() {
            FieldValue::Array(items) => assert_eq!(items.len(), 3),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_count_checked_against_min_width() {
        let registry = registry();
        let path = registry.register("test_ros/Path", "Point[] points").unwrap();
        // Each Point needs 16 bytes; a million of them cannot fit in 4.
        let result = deserialize::<RuntimeMessage>(&1_000_000u32.to_le_bytes(), &path);
        assert!(matches!(result, Err(RosError::Serialization(_))));
    }

    #[test]
    fn test_invalid_utf8() {
        let registry = registry();
        let descriptor = registry.get("std_msgs/String").unwrap();
        let bytes = [2, 0, 0, 0, 0xff, 0xfe];
        assert!(matches!(
            deserialize::<RuntimeMessage>(&bytes, &descriptor),
            Err(RosError::Serialization(_))
        ));
    }
}
