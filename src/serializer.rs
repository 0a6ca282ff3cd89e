//! STRATA - Key/Value Serialization
//! Keys and values cross into disk segments and WALs as bytes.
//! The default serializer is bincode over serde.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Converts items to and from their stored byte form.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, item: &T) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T>;

    /// Width of every serialized item, if constant.
    /// Disk segments whose key and value are both fixed-size skip the
    /// header stream entirely.
    fn fixed_size(&self) -> Option<usize> {
        None
    }
}

/// Shared serializer handle.
pub type SharedSerializer<T> = Arc<dyn Serializer<T>>;

/// bincode-backed serializer.
///
/// bincode encodes integers with fixed width, so primitive numeric types
/// can declare their size with [`BincodeSerializer::fixed`].
pub struct BincodeSerializer<T> {
    fixed_size: Option<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    /// Variable-size serializer.
    pub fn new() -> Self {
        Self {
            fixed_size: None,
            _marker: PhantomData,
        }
    }

    /// Serializer whose output is always `size` bytes long.
    pub fn fixed(size: usize) -> Self {
        Self {
            fixed_size: Some(size),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, item: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(item)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn fixed_size(&self) -> Option<usize> {
        self.fixed_size
    }
}
