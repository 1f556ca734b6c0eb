use std::marker::PhantomData;

use rand::RngCore;

use crate::store::AnyStore;
use crate::{Buffer, Resource, Store};

/// A type-safe identifier of a [`Resource`] registered in a simulation.
///
/// # Construction
///
/// An ID can be constructed only by registering a resource with
/// [`Simulation::add_resource`](crate::Simulation::add_resource).
/// Additionally, the ID holds a unique hash of the simulation that issued it. This prevents from
/// using it with a different simulation instance. Such operation will panic:
///
/// ```should_panic
/// # use procsim::Simulation;
/// let mut first = Simulation::new();
/// let second = Simulation::new();
/// let id = first.add_resource(1).unwrap();
/// let _ = second.resource(id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    id: usize,
    state_hash: u64,
}

/// A type-safe identifier of a [`Buffer`]. See [`ResourceId`] for how it is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    id: usize,
    state_hash: u64,
}

/// A type-safe identifier of a [`Store`] holding items of type `T`.
///
/// A store ID of one item type cannot be used to access a store of another type:
///
/// ```compile_fail
/// # use procsim::{Simulation, StoreId};
/// let mut sim = Simulation::new();
/// let id: StoreId<String> = sim.add_store(1).unwrap();
/// let _: &procsim::Store<i32> = sim.store(id); // Error!
/// ```
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StoreId<T> {
    id: usize,
    state_hash: u64,
    _marker: PhantomData<T>,
}

impl<T> Clone for StoreId<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state_hash: self.state_hash,
            _marker: PhantomData,
        }
    }
}
impl<T> Copy for StoreId<T> {}

impl<T> StoreId<T> {
    pub(crate) fn index(self) -> usize {
        self.id
    }
}

impl ResourceId {
    pub(crate) fn index(self) -> usize {
        self.id
    }
}

impl BufferId {
    pub(crate) fn index(self) -> usize {
        self.id
    }
}

/// All contention primitives of a simulation.
pub(crate) struct Registry {
    resources: Vec<Resource>,
    buffers: Vec<Buffer>,
    stores: Vec<Box<dyn AnyStore>>,
    state_hash: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            buffers: Vec::new(),
            stores: Vec::new(),
            state_hash: rand::thread_rng().next_u64(),
        }
    }
}

impl Registry {
    fn assert_hash(&self, state_hash: u64) {
        assert_eq!(
            state_hash, self.state_hash,
            "The ID was issued by a different simulation"
        );
    }

    pub(crate) fn insert_resource(&mut self, resource: Resource) -> ResourceId {
        self.resources.push(resource);
        ResourceId {
            id: self.resources.len() - 1,
            state_hash: self.state_hash,
        }
    }

    pub(crate) fn insert_buffer(&mut self, buffer: Buffer) -> BufferId {
        self.buffers.push(buffer);
        BufferId {
            id: self.buffers.len() - 1,
            state_hash: self.state_hash,
        }
    }

    pub(crate) fn insert_store<T: 'static>(&mut self, store: Store<T>) -> StoreId<T> {
        self.stores.push(Box::new(store));
        StoreId {
            id: self.stores.len() - 1,
            state_hash: self.state_hash,
            _marker: PhantomData,
        }
    }

    /// Default name of the next primitive of the given kind.
    pub(crate) fn next_name(&self, kind: &str) -> String {
        let count = match kind {
            "resource" => self.resources.len(),
            "buffer" => self.buffers.len(),
            _ => self.stores.len(),
        };
        format!("{}-{}", kind, count)
    }

    pub(crate) fn resource(&self, id: ResourceId) -> &Resource {
        self.assert_hash(id.state_hash);
        &self.resources[id.id]
    }

    pub(crate) fn resource_mut(&mut self, id: ResourceId) -> &mut Resource {
        self.assert_hash(id.state_hash);
        &mut self.resources[id.id]
    }

    pub(crate) fn buffer(&self, id: BufferId) -> &Buffer {
        self.assert_hash(id.state_hash);
        &self.buffers[id.id]
    }

    pub(crate) fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        self.assert_hash(id.state_hash);
        &mut self.buffers[id.id]
    }

    pub(crate) fn store<T: 'static>(&self, id: StoreId<T>) -> &Store<T> {
        self.assert_hash(id.state_hash);
        self.stores[id.id]
            .as_any()
            .downcast_ref::<Store<T>>()
            .expect("store type does not match its ID")
    }

    /// Checks that `id` belongs to this registry and returns the type-erased store.
    pub(crate) fn store_dyn_mut<T>(&mut self, id: StoreId<T>) -> &mut dyn AnyStore {
        self.assert_hash(id.state_hash);
        self.stores[id.id].as_mut()
    }

    /// Primitives looked up by their position, used for waiters that are withdrawn.
    pub(crate) fn resource_at(&mut self, index: usize) -> &mut Resource {
        &mut self.resources[index]
    }

    pub(crate) fn buffer_at(&mut self, index: usize) -> &mut Buffer {
        &mut self.buffers[index]
    }

    pub(crate) fn store_at(&mut self, index: usize) -> &mut dyn AnyStore {
        self.stores[index].as_mut()
    }

    pub(crate) fn resources_mut(&mut self) -> impl Iterator<Item = &mut Resource> {
        self.resources.iter_mut()
    }

    /// Restores every primitive to its configured initial state.
    pub(crate) fn reset(&mut self) {
        self.resources.iter_mut().for_each(Resource::reset);
        self.buffers.iter_mut().for_each(Buffer::reset);
        self.stores.iter_mut().for_each(|store| store.reset());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{BufferConfig, ResourceConfig, StoreConfig};

    #[test]
    fn test_registry() {
        let mut registry = Registry::default();
        let resource = registry.insert_resource(Resource::new("r".into(), &ResourceConfig::new(2)));
        let buffer = registry.insert_buffer(Buffer::new("b".into(), &BufferConfig::new(10.0)));
        let store: StoreId<String> =
            registry.insert_store(Store::new("s".into(), &StoreConfig::new(3), Vec::new()));
        assert_eq!(registry.resource(resource).capacity(), 2);
        assert_eq!(registry.buffer(buffer).capacity(), 10.0);
        assert_eq!(registry.store(store).capacity(), 3);
        assert_eq!(registry.next_name("resource"), "resource-1");
    }

    #[test]
    #[should_panic(expected = "different simulation")]
    fn test_foreign_id() {
        let mut first = Registry::default();
        let second = Registry::default();
        let id = first.insert_resource(Resource::new("r".into(), &ResourceConfig::new(1)));
        let _ = second.resource(id);
    }
}
