use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::{Message, Protocol, TypeId};
use crate::error::{Error, Result};

/// Builds a fresh message from one frame's payload.
pub type DecodeFn = fn(&mut Bytes) -> Result<Box<dyn Message>>;

struct Entry {
    name: &'static str,
    max_size: usize,
    decode: DecodeFn,
}

/// Immutable map from type id to size policy and decoder.
///
/// Populated once through [`RegistryBuilder`] before the reactor starts and
/// shared read-only afterwards.
pub struct ProtocolRegistry {
    entries: HashMap<TypeId, Entry>,
}

impl ProtocolRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Maximum payload size for `type_id`; `None` means the type is unknown.
    pub fn policy_max_size(&self, type_id: TypeId) -> Option<usize> {
        self.entries.get(&type_id).map(|entry| entry.max_size)
    }

    /// Whether `type_id` is known and `size` is within its limit.
    pub fn check_policy(&self, type_id: TypeId, size: u64) -> bool {
        self.policy_max_size(type_id)
            .is_some_and(|max| size <= max as u64)
    }

    pub fn name(&self, type_id: TypeId) -> Option<&'static str> {
        self.entries.get(&type_id).map(|entry| entry.name)
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.entries.contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn unpack(&self, type_id: TypeId, payload: &mut Bytes) -> Option<Result<Box<dyn Message>>> {
        self.entries
            .get(&type_id)
            .map(|entry| (entry.decode)(payload))
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<TypeId, Entry>,
}

impl RegistryBuilder {
    /// Registers a decoder for `type_id`. A type can only be registered once.
    pub fn register_type(
        &mut self,
        type_id: TypeId,
        name: &'static str,
        max_size: usize,
        decode: DecodeFn,
    ) -> Result<&mut Self> {
        if self.entries.contains_key(&type_id) {
            return Err(Error::DuplicateRegistration(type_id));
        }
        debug!(type_id, name, max_size, "registered protocol");
        self.entries.insert(
            type_id,
            Entry {
                name,
                max_size,
                decode,
            },
        );
        Ok(self)
    }

    pub fn register<P: Protocol>(&mut self) -> Result<&mut Self> {
        self.register_type(P::TYPE, P::NAME, P::MAX_SIZE, decode_as::<P>)
    }

    pub fn build(self) -> Arc<ProtocolRegistry> {
        Arc::new(ProtocolRegistry {
            entries: self.entries,
        })
    }
}

fn decode_as<P: Protocol>(payload: &mut Bytes) -> Result<Box<dyn Message>> {
    Ok(Box::new(P::unpack(payload)?))
}
