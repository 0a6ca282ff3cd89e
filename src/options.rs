//! STRATA - Engine Options
//! Bundles the [`Config`] with the pluggable collaborators an engine
//! instance is built from: key ordering, tombstone semantics, key/value
//! serialization, device storage and the mutable segment's ordered map.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::comparer::{NaturalComparer, SharedComparer};
use crate::config::Config;
use crate::device::{FileDeviceManager, SharedDeviceManager};
use crate::engine::map::{BTreeMapFactory, SharedMapFactory};
use crate::error::Result;
use crate::serializer::{BincodeSerializer, SharedSerializer};
use crate::types::Record;

/// In-band tombstone semantics of a value type.
pub trait DeletionPolicy<V>: Send + Sync {
    fn is_deleted(&self, value: &V) -> bool;

    fn mark_deleted(&self, value: &mut V);
}

/// Deletion policy built from two closures.
pub struct FnDeletionPolicy<D, M> {
    is_deleted: D,
    mark_deleted: M,
}

impl<D, M> FnDeletionPolicy<D, M> {
    pub fn new(is_deleted: D, mark_deleted: M) -> Self {
        Self {
            is_deleted,
            mark_deleted,
        }
    }
}

impl<V, D, M> DeletionPolicy<V> for FnDeletionPolicy<D, M>
where
    D: Fn(&V) -> bool + Send + Sync,
    M: Fn(&mut V) + Send + Sync,
{
    fn is_deleted(&self, value: &V) -> bool {
        (self.is_deleted)(value)
    }

    fn mark_deleted(&self, value: &mut V) {
        (self.mark_deleted)(value)
    }
}

/// `None` is the tombstone of an `Option<T>` value.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionDeletionPolicy;

impl<T> DeletionPolicy<Option<T>> for OptionDeletionPolicy {
    fn is_deleted(&self, value: &Option<T>) -> bool {
        value.is_none()
    }

    fn mark_deleted(&self, value: &mut Option<T>) {
        *value = None;
    }
}

pub type SharedDeletionPolicy<V> = Arc<dyn DeletionPolicy<V>>;

/// Everything needed to open an engine.
pub struct EngineOptions<K, V> {
    pub config: Config,
    pub comparer: SharedComparer<K>,
    pub key_serializer: SharedSerializer<K>,
    pub value_serializer: SharedSerializer<V>,
    pub deletion: SharedDeletionPolicy<V>,
    pub device_manager: SharedDeviceManager,
    pub map_factory: SharedMapFactory<K, V>,
}

impl<K, V> Clone for EngineOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            comparer: self.comparer.clone(),
            key_serializer: self.key_serializer.clone(),
            value_serializer: self.value_serializer.clone(),
            deletion: self.deletion.clone(),
            device_manager: self.device_manager.clone(),
            map_factory: self.map_factory.clone(),
        }
    }
}

impl<K, V> EngineOptions<K, V>
where
    K: Record + Ord + Serialize + DeserializeOwned,
    V: Record + Default + Serialize + DeserializeOwned,
{
    /// Natural key order, bincode serialization, file devices under
    /// `config.data_dir` and a B-tree backed mutable segment.
    pub fn new(config: Config, deletion: SharedDeletionPolicy<V>) -> Result<Self> {
        let device_manager = Arc::new(FileDeviceManager::new(&config.data_dir)?);
        Ok(Self {
            config,
            comparer: Arc::new(NaturalComparer),
            key_serializer: Arc::new(BincodeSerializer::new()),
            value_serializer: Arc::new(BincodeSerializer::new()),
            deletion,
            device_manager,
            map_factory: Arc::new(BTreeMapFactory),
        })
    }
}

impl<K, V> EngineOptions<K, V> {
    pub fn with_comparer(mut self, comparer: SharedComparer<K>) -> Self {
        self.comparer = comparer;
        self
    }

    pub fn with_key_serializer(mut self, serializer: SharedSerializer<K>) -> Self {
        self.key_serializer = serializer;
        self
    }

    pub fn with_value_serializer(mut self, serializer: SharedSerializer<V>) -> Self {
        self.value_serializer = serializer;
        self
    }

    pub fn with_device_manager(mut self, manager: SharedDeviceManager) -> Self {
        self.device_manager = manager;
        self
    }

    pub fn with_map_factory(mut self, factory: SharedMapFactory<K, V>) -> Self {
        self.map_factory = factory;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_policy() {
        let policy = OptionDeletionPolicy;
        let mut value = Some(3);
        assert!(!policy.is_deleted(&value));
        policy.mark_deleted(&mut value);
        assert!(policy.is_deleted(&value));
    }

    #[test]
    fn test_fn_policy_sentinel() {
        let policy = FnDeletionPolicy::new(|v: &i64| *v == -1, |v: &mut i64| *v = -1);
        let mut value = 10i64;
        assert!(!policy.is_deleted(&value));
        policy.mark_deleted(&mut value);
        assert_eq!(value, -1);
        assert!(policy.is_deleted(&value));
    }
}
