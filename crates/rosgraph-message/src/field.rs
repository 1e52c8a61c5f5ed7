//! Field layout of a message type.

use crate::descriptor::TypeDescriptor;
use crate::message::RuntimeMessage;
use crate::time::{Duration, Time};
use crate::value::FieldValue;
use std::sync::Arc;

/// Built-in scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Time,
    Duration,
}

impl PrimitiveType {
    /// Look up a primitive by its definition-file spelling.
    ///
    /// `byte` and `char` are the legacy aliases of `int8` and `uint8`.
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "bool" => PrimitiveType::Bool,
            "int8" | "byte" => PrimitiveType::Int8,
            "uint8" | "char" => PrimitiveType::UInt8,
            "int16" => PrimitiveType::Int16,
            "uint16" => PrimitiveType::UInt16,
            "int32" => PrimitiveType::Int32,
            "uint32" => PrimitiveType::UInt32,
            "int64" => PrimitiveType::Int64,
            "uint64" => PrimitiveType::UInt64,
            "float32" => PrimitiveType::Float32,
            "float64" => PrimitiveType::Float64,
            "string" => PrimitiveType::String,
            "time" => PrimitiveType::Time,
            "duration" => PrimitiveType::Duration,
            _ => return None,
        })
    }

    /// Encoded width in bytes, `None` for strings.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            PrimitiveType::Bool | PrimitiveType::Int8 | PrimitiveType::UInt8 => Some(1),
            PrimitiveType::Int16 | PrimitiveType::UInt16 => Some(2),
            PrimitiveType::Int32 | PrimitiveType::UInt32 | PrimitiveType::Float32 => Some(4),
            PrimitiveType::Int64
            | PrimitiveType::UInt64
            | PrimitiveType::Float64
            | PrimitiveType::Time
            | PrimitiveType::Duration => Some(8),
            PrimitiveType::String => None,
        }
    }

    /// Zero value of this type.
    pub fn default_value(&self) -> FieldValue {
        match self {
            PrimitiveType::Bool => FieldValue::Bool(false),
            PrimitiveType::Int8 => FieldValue::Int8(0),
            PrimitiveType::UInt8 => FieldValue::UInt8(0),
            PrimitiveType::Int16 => FieldValue::Int16(0),
            PrimitiveType::UInt16 => FieldValue::UInt16(0),
            PrimitiveType::Int32 => FieldValue::Int32(0),
            PrimitiveType::UInt32 => FieldValue::UInt32(0),
            PrimitiveType::Int64 => FieldValue::Int64(0),
            PrimitiveType::UInt64 => FieldValue::UInt64(0),
            PrimitiveType::Float32 => FieldValue::Float32(0.0),
            PrimitiveType::Float64 => FieldValue::Float64(0.0),
            PrimitiveType::String => FieldValue::String(String::new()),
            PrimitiveType::Time => FieldValue::Time(Time::default()),
            PrimitiveType::Duration => FieldValue::Duration(Duration::default()),
        }
    }

    /// Whether `value` is a scalar of exactly this type.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (PrimitiveType::Bool, FieldValue::Bool(_))
                | (PrimitiveType::Int8, FieldValue::Int8(_))
                | (PrimitiveType::UInt8, FieldValue::UInt8(_))
                | (PrimitiveType::Int16, FieldValue::Int16(_))
                | (PrimitiveType::UInt16, FieldValue::UInt16(_))
                | (PrimitiveType::Int32, FieldValue::Int32(_))
                | (PrimitiveType::UInt32, FieldValue::UInt32(_))
                | (PrimitiveType::Int64, FieldValue::Int64(_))
                | (PrimitiveType::UInt64, FieldValue::UInt64(_))
                | (PrimitiveType::Float32, FieldValue::Float32(_))
                | (PrimitiveType::Float64, FieldValue::Float64(_))
                | (PrimitiveType::String, FieldValue::String(_))
                | (PrimitiveType::Time, FieldValue::Time(_))
                | (PrimitiveType::Duration, FieldValue::Duration(_))
        )
    }
}

/// Element type of a field.
#[derive(Debug, Clone)]
pub enum FieldType {
    Primitive(PrimitiveType),
    Message(Arc<TypeDescriptor>),
}

impl FieldType {
    fn default_element(&self) -> FieldValue {
        match self {
            FieldType::Primitive(p) => p.default_value(),
            FieldType::Message(descriptor) => {
                FieldValue::Message(RuntimeMessage::new(Arc::clone(descriptor)))
            }
        }
    }

    fn accepts_element(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldType::Primitive(p), v) => p.accepts(v),
            (FieldType::Message(descriptor), FieldValue::Message(m)) => {
                m.descriptor().fingerprint() == descriptor.fingerprint()
            }
            _ => false,
        }
    }
}

/// Whether a field holds one element or an array of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    /// `T[]`: count-prefixed on the wire.
    Variable,
    /// `T[N]`: exactly N elements, no prefix.
    Fixed(usize),
}

/// One named field of a message layout.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    /// Type as written in the definition, used for fingerprinting.
    pub type_token: String,
    pub field_type: FieldType,
    pub cardinality: Cardinality,
}

impl FieldSpec {
    /// Default value for a freshly created message.
    pub fn default_value(&self) -> FieldValue {
        match self.cardinality {
            Cardinality::Single => self.field_type.default_element(),
            Cardinality::Variable => FieldValue::Array(Vec::new()),
            Cardinality::Fixed(n) => {
                FieldValue::Array((0..n).map(|_| self.field_type.default_element()).collect())
            }
        }
    }

    /// Whether `value` can be stored in this field.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (self.cardinality, value) {
            (Cardinality::Single, v) => self.field_type.accepts_element(v),
            (Cardinality::Variable, FieldValue::Array(items)) => {
                items.iter().all(|v| self.field_type.accepts_element(v))
            }
            (Cardinality::Fixed(n), FieldValue::Array(items)) => {
                items.len() == n && items.iter().all(|v| self.field_type.accepts_element(v))
            }
            _ => false,
        }
    }
}

/// A named constant declared in a definition (`int32 MAX=10`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constant {
    pub name: String,
    pub type_token: String,
    pub primitive: PrimitiveType,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases() {
        assert_eq!(PrimitiveType::from_token("byte"), Some(PrimitiveType::Int8));
        assert_eq!(PrimitiveType::from_token("char"), Some(PrimitiveType::UInt8));
        assert_eq!(PrimitiveType::from_token("std_msgs/String"), None);
    }

    #[test]
    fn test_fixed_array_default_and_accepts() {
        let spec = FieldSpec {
            name: "xyz".into(),
            type_token: "float64[3]".into(),
            field_type: FieldType::Primitive(PrimitiveType::Float64),
            cardinality: Cardinality::Fixed(3),
        };
        let default = spec.default_value();
        assert!(spec.accepts(&default));
        assert!(!spec.accepts(&FieldValue::Array(vec![FieldValue::Float64(1.0)])));
        assert!(!spec.accepts(&FieldValue::Float64(1.0)));
    }

    #[test]
    fn test_scalar_type_is_exact() {
        assert!(PrimitiveType::Int32.accepts(&FieldValue::Int32(1)));
        assert!(!PrimitiveType::Int32.accepts(&FieldValue::Int64(1)));
    }
}
