use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::config::StoreConfig;
use crate::process::WaitToken;
use crate::state::Registry;
use crate::{Metric, ProcessId, Step, StoreId, Time, Transfer, Woken};

type Filter<T> = Rc<dyn Fn(&T) -> bool>;
type Slot<T> = Rc<RefCell<Option<T>>>;

struct PendingPut<T> {
    process: ProcessId,
    item: T,
    since: Time,
}

struct PendingGet<T> {
    process: ProcessId,
    filter: Option<Filter<T>>,
    slot: Slot<T>,
    since: Time,
}

impl<T> PendingGet<T> {
    fn accepts(&self, item: &T) -> bool {
        self.filter.as_ref().map_or(true, |f| f(item))
    }
}

/// A container of items with a capacity.
///
/// Gets take the first item accepted by their filter, or the oldest item when no filter is given.
/// Queued gets are matched in arrival order every time the content changes, so the first-arrived
/// get accepting an item wins it, even if a later get would accept it as well. This also holds for
/// filters whose answer changes over time: a new get is only served after the queued ones have
/// been offered the items again.
pub struct Store<T> {
    name: String,
    capacity: usize,
    items: VecDeque<T>,
    puts: VecDeque<PendingPut<T>>,
    gets: VecDeque<PendingGet<T>>,
    initial: Box<dyn Fn() -> VecDeque<T>>,
}

impl<T: 'static> Store<T> {
    pub(crate) fn new(name: String, config: &StoreConfig, items: Vec<T>) -> Self
    where
        T: Clone,
    {
        let items = VecDeque::from(items);
        let initial = items.clone();
        Self {
            name,
            capacity: config.capacity,
            items,
            puts: VecDeque::new(),
            gets: VecDeque::new(),
            initial: Box::new(move || initial.clone()),
        }
    }

    pub(crate) fn empty(name: String, config: &StoreConfig) -> Self {
        Self {
            name,
            capacity: config.capacity,
            items: VecDeque::new(),
            puts: VecDeque::new(),
            gets: VecDeque::new(),
            initial: Box::new(VecDeque::new),
        }
    }
}

impl<T> Store<T> {
    /// Name reported to observers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Checks if the store holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stored items in insertion order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Number of waiting puts.
    #[must_use]
    pub fn put_queue_len(&self) -> usize {
        self.puts.len()
    }

    /// Number of waiting gets.
    #[must_use]
    pub fn get_queue_len(&self) -> usize {
        self.gets.len()
    }

    fn put(&mut self, process: ProcessId, item: T, now: Time) -> Transfer {
        if self.puts.is_empty() && self.items.len() < self.capacity {
            self.items.push_back(item);
            Transfer::done(self.settle(now))
        } else {
            self.puts.push_back(PendingPut {
                process,
                item,
                since: now,
            });
            Transfer::queued()
        }
    }

    fn get(
        &mut self,
        process: ProcessId,
        filter: Option<Filter<T>>,
        slot: Slot<T>,
        now: Time,
    ) -> Transfer {
        self.gets.push_back(PendingGet {
            process,
            filter,
            slot,
            since: now,
        });
        // Filters may change their mind between checks, so the new get is matched behind the
        // queued ones rather than against the items directly.
        let mut woken = self.settle(now);
        match woken.iter().position(|w| w.process == process) {
            Some(pos) => {
                woken.remove(pos);
                Transfer::done(woken)
            }
            None => Transfer {
                done: false,
                woken,
            },
        }
    }

    /// Moves queued puts into the store and hands items over to queued gets until nothing changes.
    fn settle(&mut self, now: Time) -> Vec<Woken> {
        let mut woken = Vec::new();
        loop {
            let before = woken.len();
            while self.items.len() < self.capacity {
                let Some(put) = self.puts.pop_front() else {
                    break;
                };
                self.items.push_back(put.item);
                woken.push(Woken {
                    process: put.process,
                    waited: now - put.since,
                });
            }
            let mut idx = 0;
            while idx < self.gets.len() && !self.items.is_empty() {
                let get = &self.gets[idx];
                match self.items.iter().position(|item| get.accepts(item)) {
                    Some(pos) => {
                        let item = self.items.remove(pos);
                        if let Some(get) = self.gets.remove(idx) {
                            *get.slot.borrow_mut() = item;
                            woken.push(Woken {
                                process: get.process,
                                waited: now - get.since,
                            });
                        }
                    }
                    None => idx += 1,
                }
            }
            if woken.len() == before {
                break;
            }
        }
        woken
    }
}

impl<T> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.items.len())
            .field("puts", &self.puts.len())
            .field("gets", &self.gets.len())
            .finish()
    }
}

/// Type-erased store, as kept in the registry.
pub(crate) trait AnyStore {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn name(&self) -> &str;
    fn len(&self) -> usize;
    fn remove_waiter(&mut self, process: ProcessId, now: Time) -> Vec<Woken>;
    fn reset(&mut self);
}

impl<T: 'static> AnyStore for Store<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn remove_waiter(&mut self, process: ProcessId, now: Time) -> Vec<Woken> {
        self.puts.retain(|p| p.process != process);
        self.gets.retain(|g| g.process != process);
        self.settle(now)
    }

    fn reset(&mut self) {
        self.items = (self.initial)();
        self.puts.clear();
        self.gets.clear();
    }
}

fn downcast<T: 'static>(store: &mut dyn AnyStore) -> &mut Store<T> {
    store
        .as_any_mut()
        .downcast_mut::<Store<T>>()
        .expect("store type does not match its ID")
}

/// A put or a get waiting to be submitted to its store.
pub(crate) trait StoreOp {
    /// Submits the operation, returning the position of the store in the registry.
    fn submit(self: Box<Self>, registry: &mut Registry, process: ProcessId, now: Time)
        -> (usize, Transfer);

    /// Counter reported when the operation is submitted.
    fn metric(&self) -> Metric;
}

struct PutOp<T> {
    store: StoreId<T>,
    item: T,
}

impl<T: 'static> StoreOp for PutOp<T> {
    fn submit(
        self: Box<Self>,
        registry: &mut Registry,
        process: ProcessId,
        now: Time,
    ) -> (usize, Transfer) {
        let PutOp { store, item } = *self;
        let transfer = downcast::<T>(registry.store_dyn_mut(store)).put(process, item, now);
        (store.index(), transfer)
    }

    fn metric(&self) -> Metric {
        Metric::Puts
    }
}

struct GetOp<T> {
    store: StoreId<T>,
    filter: Option<Filter<T>>,
    slot: Slot<T>,
}

impl<T: 'static> StoreOp for GetOp<T> {
    fn submit(
        self: Box<Self>,
        registry: &mut Registry,
        process: ProcessId,
        now: Time,
    ) -> (usize, Transfer) {
        let GetOp {
            store,
            filter,
            slot,
        } = *self;
        let transfer = downcast::<T>(registry.store_dyn_mut(store)).get(process, filter, slot, now);
        (store.index(), transfer)
    }

    fn metric(&self) -> Metric {
        Metric::Gets
    }
}

impl fmt::Debug for dyn StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreOp({})", self.metric())
    }
}

pub(crate) fn put_token<T: 'static>(store: StoreId<T>, item: T) -> WaitToken {
    WaitToken::store(Box::new(PutOp { store, item }))
}

/// A pending get from a [`Store`].
///
/// Yield the step returned by [`StoreGet::step`] and, once the process is resumed with
/// [`Wake::Granted`](crate::Wake::Granted), take the item with [`StoreGet::retrieved_item`].
pub struct StoreGet<T> {
    store: StoreId<T>,
    filter: Option<Filter<T>>,
    slot: Slot<T>,
}

impl<T> Clone for StoreGet<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store,
            filter: self.filter.clone(),
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<T: 'static> StoreGet<T> {
    pub(crate) fn new(store: StoreId<T>, filter: Option<Filter<T>>) -> Self {
        Self {
            store,
            filter,
            slot: Rc::new(RefCell::new(None)),
        }
    }

    /// The suspension request submitting this get.
    #[must_use]
    pub fn step(&self) -> Step {
        Step::Wait(WaitToken::store(Box::new(GetOp {
            store: self.store,
            filter: self.filter.clone(),
            slot: Rc::clone(&self.slot),
        })))
    }

    /// Whether an item has been retrieved and not yet taken.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Takes the retrieved item. Returns `None` until the get has been satisfied.
    #[must_use]
    pub fn retrieved_item(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

impl<T> fmt::Debug for StoreGet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreGet")
            .field("store", &self.store.index())
            .field("filtered", &self.filter.is_some())
            .field("resolved", &self.slot.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    fn pid(id: usize) -> ProcessId {
        ProcessId::from(id)
    }

    fn slot() -> Slot<u32> {
        Rc::new(RefCell::new(None))
    }

    fn filter(f: fn(&u32) -> bool) -> Option<Filter<u32>> {
        Some(Rc::new(f))
    }

    #[fixture]
    fn store() -> Store<u32> {
        Store::empty(String::from("shelf"), &StoreConfig::new(2))
    }

    #[rstest]
    fn test_fifo_get(mut store: Store<u32>) {
        store.put(pid(0), 1, 0.0);
        store.put(pid(0), 2, 0.0);
        let first = slot();
        assert!(store.get(pid(1), None, Rc::clone(&first), 0.0).done);
        assert_eq!(*first.borrow(), Some(1));
        assert_eq!(store.items().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[rstest]
    fn test_filtered_get(mut store: Store<u32>) {
        store.put(pid(0), 1, 0.0);
        store.put(pid(0), 2, 0.0);
        let even = slot();
        assert!(store.get(pid(1), filter(|x| x % 2 == 0), Rc::clone(&even), 0.0).done);
        assert_eq!(*even.borrow(), Some(2));
        let large = slot();
        assert!(!store.get(pid(2), filter(|x| *x > 10), Rc::clone(&large), 0.0).done);
        assert_eq!(store.get_queue_len(), 1);
    }

    #[rstest]
    fn test_queued_get_with_changing_filter_goes_first(mut store: Store<u32>) {
        let open = Rc::new(std::cell::Cell::new(false));
        let gate = Rc::clone(&open);
        let waiting = slot();
        let filter: Filter<u32> = Rc::new(move |_: &u32| gate.get());
        assert!(!store.get(pid(0), Some(filter), Rc::clone(&waiting), 0.0).done);
        store.put(pid(1), 7, 1.0);
        assert_eq!(store.get_queue_len(), 1);
        open.set(true);
        let late = slot();
        let transfer = store.get(pid(2), None, Rc::clone(&late), 2.0);
        assert!(!transfer.done);
        assert_eq!(
            transfer.woken,
            vec![Woken {
                process: pid(0),
                waited: 2.0
            }]
        );
        assert_eq!(*waiting.borrow(), Some(7));
        assert_eq!(*late.borrow(), None);
        assert_eq!(store.get_queue_len(), 1);
    }

    #[rstest]
    fn test_put_waits_for_space(mut store: Store<u32>) {
        store.put(pid(0), 1, 0.0);
        store.put(pid(0), 2, 0.0);
        assert!(!store.put(pid(1), 3, 1.0).done);
        let taken = slot();
        let transfer = store.get(pid(2), None, Rc::clone(&taken), 4.0);
        assert!(transfer.done);
        assert_eq!(
            transfer.woken,
            vec![Woken {
                process: pid(1),
                waited: 3.0
            }]
        );
        assert_eq!(store.items().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[rstest]
    fn test_first_arrived_get_wins(mut store: Store<u32>) {
        let any = slot();
        let small = slot();
        store.get(pid(1), filter(|x| *x < 10), Rc::clone(&small), 0.0);
        store.get(pid(2), None, Rc::clone(&any), 0.0);
        let transfer = store.put(pid(0), 5, 1.0);
        assert_eq!(transfer.woken.len(), 1);
        assert_eq!(transfer.woken[0].process, pid(1));
        assert_eq!(*small.borrow(), Some(5));
        assert_eq!(*any.borrow(), None);
    }

    #[rstest]
    fn test_later_get_served_when_earlier_rejects(mut store: Store<u32>) {
        let big = slot();
        let any = slot();
        store.get(pid(1), filter(|x| *x > 100), Rc::clone(&big), 0.0);
        store.get(pid(2), None, Rc::clone(&any), 0.0);
        let transfer = store.put(pid(0), 5, 1.0);
        assert_eq!(transfer.woken[0].process, pid(2));
        assert_eq!(*any.borrow(), Some(5));
        assert_eq!(store.get_queue_len(), 1);
    }

    #[rstest]
    fn test_remove_waiter(mut store: Store<u32>) {
        store.get(pid(1), None, slot(), 0.0);
        assert_eq!(store.get_queue_len(), 1);
        assert!(AnyStore::remove_waiter(&mut store, pid(1), 1.0).is_empty());
        assert_eq!(store.get_queue_len(), 0);
    }

    #[test]
    fn test_reset_restores_initial_items() {
        let mut store = Store::new(String::from("shelf"), &StoreConfig::new(3), vec![7, 8]);
        store.get(pid(0), None, slot(), 0.0);
        store.put(pid(0), 9, 0.0);
        store.put(pid(0), 10, 0.0);
        AnyStore::reset(&mut store);
        assert_eq!(store.items().copied().collect::<Vec<_>>(), vec![7, 8]);
        assert_eq!(store.put_queue_len(), 0);
    }
}
