//! Dynamically typed field values.

use crate::message::RuntimeMessage;
use crate::time::{Duration, Time};

/// The value held by one field of a [`RuntimeMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Time(Time),
    Duration(Duration),
    Message(RuntimeMessage),
    /// Elements of a `T[]` or `T[N]` field, all of the element type.
    Array(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer field widened to i64; `None` for u64 values that do not fit.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Int8(v) => Some(v as i64),
            FieldValue::UInt8(v) => Some(v as i64),
            FieldValue::Int16(v) => Some(v as i64),
            FieldValue::UInt16(v) => Some(v as i64),
            FieldValue::Int32(v) => Some(v as i64),
            FieldValue::UInt32(v) => Some(v as i64),
            FieldValue::Int64(v) => Some(v),
            FieldValue::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Float32(v) => Some(v as f64),
            FieldValue::Float64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<Time> {
        match self {
            FieldValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            FieldValue::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&RuntimeMessage> {
        match self {
            FieldValue::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> Self {
                    FieldValue::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    String => String,
    Time => Time,
    Duration => Duration,
    RuntimeMessage => Message,
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(items: Vec<T>) -> Self {
        FieldValue::Array(items.into_iter().map(Into::into).collect())
    }
}
