//! Runtime message representation and binary codec.
//!
//! Definitions are parsed at runtime into [`TypeDescriptor`]s held by a
//! [`MessageRegistry`]. [`RuntimeMessage`] is the field-map message those
//! descriptors produce; [`MessageCodec`] is the capability set the transport
//! layer is generic over.

pub mod codec;
pub mod definition;
pub mod descriptor;
pub mod field;
pub mod lazy;
pub mod message;
pub mod registry;
pub mod time;
pub mod value;

pub use codec::{deserialize, serialize, MessageCodec};
pub use descriptor::{ServiceDescriptor, TypeDescriptor};
pub use field::{Cardinality, Constant, FieldSpec, FieldType, PrimitiveType};
pub use lazy::LazyMessage;
pub use message::RuntimeMessage;
pub use registry::MessageRegistry;
pub use time::{Duration, Time};
pub use value::FieldValue;
