//! Deferred decoding of received payloads.

use crate::codec::MessageCodec;
use crate::descriptor::TypeDescriptor;
use bytes::Bytes;
use rosgraph_types::{RosError, RosResult};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A received payload plus the layout to decode it with.
///
/// Decoding happens on the first call to [`LazyMessage::get`] and never
/// again; later calls return the cached message (or the cached error).
pub struct LazyMessage<M> {
    bytes: Bytes,
    descriptor: Arc<TypeDescriptor>,
    decoded: OnceLock<Result<Arc<M>, String>>,
}

impl<M: MessageCodec> LazyMessage<M> {
    pub fn new(bytes: Bytes, descriptor: Arc<TypeDescriptor>) -> Self {
        Self {
            bytes,
            descriptor,
            decoded: OnceLock::new(),
        }
    }

    /// The raw payload.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }

    /// Decode (once) and return the message.
    pub fn get(&self) -> RosResult<Arc<M>> {
        self.decoded
            .get_or_init(|| {
                M::decode(&self.descriptor, &self.bytes)
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .clone()
            .map_err(RosError::Serialization)
    }
}

impl<M> fmt::Debug for LazyMessage<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyMessage")
            .field("type", &self.descriptor.name())
            .field("len", &self.bytes.len())
            .field("decoded", &self.decoded.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RuntimeMessage;
    use crate::registry::MessageRegistry;

    #[test]
    fn test_decodes_once() {
        let registry = MessageRegistry::with_std_msgs();
        let msg = registry
            .new_message("std_msgs/String")
            .unwrap()
            .with("data", "hi")
            .unwrap();
        let lazy: LazyMessage<RuntimeMessage> =
            LazyMessage::new(msg.to_bytes().unwrap(), Arc::clone(msg.descriptor()));
        assert!(!lazy.is_decoded());
        let first = lazy.get().unwrap();
        let second = lazy.get().unwrap();
        assert!(lazy.is_decoded());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, msg);
    }

    #[test]
    fn test_decode_error_is_cached() {
        let registry = MessageRegistry::with_std_msgs();
        let descriptor = registry.get("std_msgs/Int32").unwrap();
        let lazy: LazyMessage<RuntimeMessage> = LazyMessage::new(Bytes::from_static(&[1]), descriptor);
        assert!(matches!(lazy.get(), Err(RosError::Serialization(_))));
        assert!(lazy.is_decoded());
        assert!(lazy.get().is_err());
    }
}
