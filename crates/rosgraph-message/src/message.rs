//! Runtime field-map message representation.

use crate::descriptor::TypeDescriptor;
use crate::value::FieldValue;
use rosgraph_types::{RosError, RosResult};
use std::sync::Arc;

/// A message whose layout is known only at runtime.
///
/// Values are stored in field order. Every stored value conforms to the
/// descriptor's layout; [`RuntimeMessage::set`] rejects anything else.
#[derive(Debug, Clone)]
pub struct RuntimeMessage {
    descriptor: Arc<TypeDescriptor>,
    values: Vec<FieldValue>,
}

impl RuntimeMessage {
    /// A message with every field at its default value.
    pub fn new(descriptor: Arc<TypeDescriptor>) -> Self {
        let values = descriptor.fields().iter().map(|f| f.default_value()).collect();
        Self { descriptor, values }
    }

    /// Build from values already in field order, checking each one.
    pub fn from_values(descriptor: Arc<TypeDescriptor>, values: Vec<FieldValue>) -> RosResult<Self> {
        if values.len() != descriptor.fields().len() {
            return Err(RosError::Field(format!(
                "{} has {} fields, got {} values",
                descriptor.name(),
                descriptor.fields().len(),
                values.len()
            )));
        }
        for (spec, value) in descriptor.fields().iter().zip(&values) {
            if !spec.accepts(value) {
                return Err(type_error(&descriptor, &spec.name, &spec.type_token));
            }
        }
        Ok(Self { descriptor, values })
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    /// Values in field order.
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get(&self, field: &str) -> RosResult<&FieldValue> {
        let idx = self.index_of(field)?;
        Ok(&self.values[idx])
    }

    /// Replace the value of `field`.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> RosResult<()> {
        let idx = self.index_of(field)?;
        let value = value.into();
        let spec = &self.descriptor.fields()[idx];
        if !spec.accepts(&value) {
            return Err(type_error(&self.descriptor, field, &spec.type_token));
        }
        self.values[idx] = value;
        Ok(())
    }

    /// Builder form of [`RuntimeMessage::set`].
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> RosResult<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Mutable access to a nested message field.
    pub fn message_mut(&mut self, field: &str) -> RosResult<&mut RuntimeMessage> {
        let idx = self.index_of(field)?;
        match &mut self.values[idx] {
            FieldValue::Message(m) => Ok(m),
            _ => Err(RosError::Field(format!(
                "{}.{field} is not a nested message",
                self.descriptor.name()
            ))),
        }
    }

    fn index_of(&self, field: &str) -> RosResult<usize> {
        self.descriptor.field_index(field).ok_or_else(|| {
            RosError::Field(format!("{} has no field '{field}'", self.descriptor.name()))
        })
    }
}

fn type_error(descriptor: &TypeDescriptor, field: &str, expected: &str) -> RosError {
    RosError::Field(format!(
        "{}.{field} expects {expected}",
        descriptor.name()
    ))
}

impl PartialEq for RuntimeMessage {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor.fingerprint() == other.descriptor.fingerprint()
            && self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(def: &str) -> Arc<TypeDescriptor> {
        Arc::new(TypeDescriptor::parse("test_ros/Sample", def, |_| None).unwrap())
    }

    #[test]
    fn test_defaults() {
        let msg = RuntimeMessage::new(descriptor("int32 a\nstring s\nuint8[2] raw\nfloat64[] v"));
        assert_eq!(msg.get("a").unwrap(), &FieldValue::Int32(0));
        assert_eq!(msg.get("s").unwrap().as_str(), Some(""));
        assert_eq!(msg.get("raw").unwrap().as_array().map(|a| a.len()), Some(2));
        assert_eq!(msg.get("v").unwrap().as_array().map(|a| a.len()), Some(0));
    }

    #[test]
    fn test_set_is_type_checked() {
        let mut msg = RuntimeMessage::new(descriptor("int32 a\nuint8[2] raw"));
        msg.set("a", 5i32).unwrap();
        assert_eq!(msg.get("a").unwrap().as_i64(), Some(5));
        assert!(matches!(msg.set("a", 5i64), Err(RosError::Field(_))));
        assert!(msg.set("raw", vec![1u8, 2, 3]).is_err());
        assert!(msg.set("raw", vec![1u8, 2]).is_ok());
        assert!(matches!(msg.get("missing"), Err(RosError::Field(_))));
    }

    #[test]
    fn test_from_values_checks_arity() {
        let d = descriptor("int32 a\nint32 b");
        assert!(RuntimeMessage::from_values(Arc::clone(&d), vec![FieldValue::Int32(1)]).is_err());
        let msg = RuntimeMessage::from_values(d, vec![1i32.into(), 2i32.into()]).unwrap();
        assert_eq!(msg.get("b").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn test_equality() {
        let d = descriptor("string data");
        let a = RuntimeMessage::new(Arc::clone(&d)).with("data", "x").unwrap();
        let b = RuntimeMessage::new(Arc::clone(&d)).with("data", "x").unwrap();
        let c = RuntimeMessage::new(d).with("data", "y").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
