//! Type descriptors and their fingerprints.

use crate::definition::{self, Declaration};
use crate::field::{Constant, FieldSpec, FieldType, PrimitiveType};
use rosgraph_types::{RosError, RosResult};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Immutable description of one message type: its name, definition text,
/// field layout and fingerprint.
///
/// Two descriptors are wire-compatible iff their fingerprints are equal.
#[derive(Clone)]
pub struct TypeDescriptor {
    name: String,
    definition: String,
    fields: Vec<FieldSpec>,
    constants: Vec<Constant>,
    fingerprint: String,
}

impl TypeDescriptor {
    /// Parse `definition` for type `name`, resolving nested message types
    /// through `resolve`.
    pub fn parse<F>(name: &str, definition: &str, resolve: F) -> RosResult<Self>
    where
        F: Fn(&str) -> Option<Arc<TypeDescriptor>>,
    {
        let mut fields = Vec::new();
        let mut constants = Vec::new();

        for decl in definition::parse_definition(name, definition)? {
            match decl {
                Declaration::Constant {
                    primitive,
                    type_token,
                    name,
                    value,
                } => constants.push(Constant {
                    name,
                    type_token,
                    primitive,
                    value,
                }),
                Declaration::Field {
                    base_type,
                    type_token,
                    cardinality,
                    name: field_name,
                } => {
                    let field_type = match PrimitiveType::from_token(&base_type) {
                        Some(p) => FieldType::Primitive(p),
                        None => FieldType::Message(
                            resolve(&base_type)
                                .ok_or_else(|| RosError::UnknownType(base_type.clone()))?,
                        ),
                    };
                    fields.push(FieldSpec {
                        name: field_name,
                        type_token,
                        field_type,
                        cardinality,
                    });
                }
            }
        }

        let fingerprint = digest(&fingerprint_text(&fields, &constants));
        Ok(Self {
            name: name.to_string(),
            definition: definition.to_string(),
            fields,
            constants,
            fingerprint,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Hex digest of the field layout.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Position of `name` in the field layout.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn constant(&self, name: &str) -> Option<&Constant> {
        self.constants.iter().find(|c| c.name == name)
    }

    /// The normalized text the fingerprint is computed from.
    pub fn fingerprint_text(&self) -> String {
        fingerprint_text(&self.fields, &self.constants)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fingerprint == other.fingerprint
    }
}

/// Constants first, then fields; nested message fields contribute their own
/// fingerprint in place of the type name.
fn fingerprint_text(fields: &[FieldSpec], constants: &[Constant]) -> String {
    let mut lines = Vec::with_capacity(fields.len() + constants.len());
    for c in constants {
        lines.push(format!("{} {}={}", c.type_token, c.name, c.value));
    }
    for f in fields {
        match &f.field_type {
            FieldType::Primitive(_) => lines.push(format!("{} {}", f.type_token, f.name)),
            FieldType::Message(nested) => {
                lines.push(format!("{} {}", nested.fingerprint(), f.name))
            }
        }
    }
    lines.join("\n")
}

fn digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// A service type: request and response layouts under one fingerprint.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    request: Arc<TypeDescriptor>,
    response: Arc<TypeDescriptor>,
    fingerprint: String,
}

impl ServiceDescriptor {
    pub fn new(name: &str, request: Arc<TypeDescriptor>, response: Arc<TypeDescriptor>) -> Self {
        let fingerprint = digest(&format!(
            "{}{}",
            request.fingerprint_text(),
            response.fingerprint_text()
        ));
        Self {
            name: name.to_string(),
            request,
            response,
            fingerprint,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> &Arc<TypeDescriptor> {
        &self.request
    }

    pub fn response(&self) -> &Arc<TypeDescriptor> {
        &self.response
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
