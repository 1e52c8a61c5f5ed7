//! Explicit map from type name to descriptor, populated at startup.

use crate::definition::split_service;
use crate::descriptor::{ServiceDescriptor, TypeDescriptor};
use crate::message::RuntimeMessage;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rosgraph_types::{RosError, RosResult};
use std::sync::Arc;
use tracing::debug;

/// The `std_msgs` basics, in dependency order.
const STD_MSGS: &[(&str, &str)] = &[
    ("std_msgs/Header", "uint32 seq\ntime stamp\nstring frame_id"),
    ("std_msgs/String", "string data"),
    ("std_msgs/Bool", "bool data"),
    ("std_msgs/Int32", "int32 data"),
    ("std_msgs/Int64", "int64 data"),
    ("std_msgs/UInt8", "uint8 data"),
    ("std_msgs/UInt32", "uint32 data"),
    ("std_msgs/Float32", "float32 data"),
    ("std_msgs/Float64", "float64 data"),
    ("std_msgs/Time", "time data"),
    ("std_msgs/Duration", "duration data"),
    ("std_msgs/Empty", ""),
];

const STD_SRVS: &[(&str, &str)] = &[("std_srvs/Empty", "---")];

/// Registered message and service types.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    types: DashMap<String, Arc<TypeDescriptor>>,
    services: DashMap<String, Arc<ServiceDescriptor>>,
}

impl MessageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with `std_msgs` and `std_srvs` basics.
    pub fn with_std_msgs() -> Self {
        let registry = Self::new();
        for (name, definition) in STD_MSGS {
            if let Err(e) = registry.register(name, definition) {
                debug!(type_name = %name, error = %e, "Skipping built-in type");
            }
        }
        for (name, definition) in STD_SRVS {
            if let Err(e) = registry.register_service(name, definition) {
                debug!(type_name = %name, error = %e, "Skipping built-in service");
            }
        }
        registry
    }

    /// Parse and register a message type.
    ///
    /// Nested types must already be registered. Registering the same name
    /// again with an identical layout returns the existing descriptor; a
    /// different layout is rejected.
    pub fn register(&self, name: &str, definition: &str) -> RosResult<Arc<TypeDescriptor>> {
        let descriptor = TypeDescriptor::parse(name, definition, |nested| self.lookup(nested))?;
        let result = match self.types.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                if existing.get().fingerprint() != descriptor.fingerprint() {
                    return Err(RosError::InvalidDefinition {
                        type_name: name.to_string(),
                        reason: "already registered with a different layout".into(),
                    });
                }
                Arc::clone(existing.get())
            }
            Entry::Vacant(slot) => {
                let descriptor = Arc::new(descriptor);
                slot.insert(Arc::clone(&descriptor));
                debug!(type_name = name, fingerprint = %descriptor.fingerprint(), "Registered message type");
                descriptor
            }
        };
        Ok(result)
    }

    /// Parse and register a service type; its halves are registered as
    /// `<name>Request` and `<name>Response`.
    pub fn register_service(&self, name: &str, definition: &str) -> RosResult<Arc<ServiceDescriptor>> {
        let (request_text, response_text) = split_service(name, definition)?;
        let request = self.register(&format!("{name}Request"), &request_text)?;
        let response = self.register(&format!("{name}Response"), &response_text)?;
        let service = Arc::new(ServiceDescriptor::new(name, request, response));
        self.services
            .insert(name.to_string(), Arc::clone(&service));
        debug!(service_type = name, fingerprint = %service.fingerprint(), "Registered service type");
        Ok(service)
    }

    pub fn get(&self, name: &str) -> RosResult<Arc<TypeDescriptor>> {
        self.lookup(name)
            .ok_or_else(|| RosError::UnknownType(name.to_string()))
    }

    pub fn service(&self, name: &str) -> RosResult<Arc<ServiceDescriptor>> {
        self.services
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RosError::UnknownType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// A default-valued message of a registered type.
    pub fn new_message(&self, name: &str) -> RosResult<RuntimeMessage> {
        Ok(RuntimeMessage::new(self.get(name)?))
    }

    /// Registered message type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.types.get(name).map(|e| Arc::clone(e.value()))
    }
}
