use std::cell::Cell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::rc::Rc;

use ordered_float::OrderedFloat;

use crate::error::check_time;
use crate::{EventId, Priority, ProcessId, SimError, Simulation, Time, Wake, DEFAULT_PRIORITY};

/// Simulation clock.
pub type Clock = Rc<Cell<Time>>;

/// A scheduled user callback.
pub(crate) type Callback = Box<dyn FnOnce(&mut Simulation) -> Result<(), SimError>>;

/// What happens when an event is popped.
pub(crate) enum Action {
    /// Resume a process, unless it has moved on since the event was scheduled.
    Resume {
        process: ProcessId,
        epoch: u64,
        wake: Wake,
    },
    /// Re-evaluate the condition a process is waiting for.
    Poll { process: ProcessId, epoch: u64 },
    /// Run a user callback.
    Callback(Callback),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Resume {
                process,
                epoch,
                wake,
            } => write!(f, "Resume({}, epoch {}, {:?})", process, epoch, wake),
            Action::Poll { process, epoch } => write!(f, "Poll({}, epoch {})", process, epoch),
            Action::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Entry type stored in the scheduler: the action and the `(time, priority, sequence)` key
/// deciding when it runs.
#[derive(Debug)]
pub(crate) struct EventEntry {
    time: Reverse<OrderedFloat<Time>>,
    priority: Reverse<Priority>,
    seq: Reverse<u64>,
    pub(crate) action: Action,
}

impl EventEntry {
    pub(crate) fn time(&self) -> Time {
        (self.time.0).0
    }

    pub(crate) fn id(&self) -> EventId {
        EventId::from(self.seq.0)
    }

    fn key(&self) -> (Reverse<OrderedFloat<Time>>, Reverse<Priority>, Reverse<u64>) {
        (self.time, self.priority, self.seq)
    }
}

impl PartialEq for EventEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for EventEntry {}

impl PartialOrd for EventEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// This struct has only immutable access to the simulation clock exposed.
#[derive(Debug, Clone)]
pub struct ClockRef {
    clock: Clock,
}

impl From<Clock> for ClockRef {
    fn from(clock: Clock) -> Self {
        Self { clock }
    }
}

impl ClockRef {
    /// Return the current simulation time.
    #[must_use]
    pub fn time(&self) -> Time {
        self.clock.get()
    }
}

/// Scheduler is used to keep the current time and information about the upcoming events.
///
/// Events are kept in a binary heap ordered by `(time, priority, sequence)`. The sequence number
/// is the insertion order, so events sharing time and priority run first-in, first-out.
pub(crate) struct Scheduler {
    events: BinaryHeap<EventEntry>,
    callbacks: HashSet<EventId>,
    cancelled: HashSet<EventId>,
    clock: Clock,
    next_seq: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            events: BinaryHeap::new(),
            callbacks: HashSet::new(),
            cancelled: HashSet::new(),
            clock: Rc::new(Cell::new(0.0)),
            next_seq: 0,
        }
    }
}

impl Scheduler {
    /// Returns the current simulation time.
    #[must_use]
    pub(crate) fn time(&self) -> Time {
        self.clock.get()
    }

    /// Returns a structure with immutable access to the simulation time.
    #[must_use]
    pub(crate) fn clock(&self) -> ClockRef {
        ClockRef {
            clock: Rc::clone(&self.clock),
        }
    }

    /// Number of pending events, not counting cancelled ones.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.events.len() - self.cancelled.len()
    }

    /// Time of the next pending event, if any.
    #[must_use]
    pub(crate) fn peek_time(&self) -> Option<Time> {
        self.events.peek().map(EventEntry::time)
    }

    /// Checks that `time` can be used as the time of a new event.
    pub(crate) fn check_time(&self, time: Time) -> Result<Time, SimError> {
        let time = check_time(time, "event time")?;
        if time < self.time() {
            Err(SimError::InvalidTime {
                requested: time,
                now: self.time(),
            })
        } else {
            Ok(time)
        }
    }

    /// Schedules `action` at absolute `time`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidTime`] if `time` is in the past, and [`SimError::Validation`] if
    /// it is not a finite number.
    pub(crate) fn schedule(
        &mut self,
        time: Time,
        priority: Priority,
        action: Action,
    ) -> Result<EventId, SimError> {
        let time = self.check_time(time)?;
        Ok(self.push(time, priority, action))
    }

    /// Schedules `action` to run at the current time, after everything already scheduled for now
    /// with the same priority.
    pub(crate) fn schedule_now(&mut self, action: Action) -> EventId {
        self.push(self.time(), DEFAULT_PRIORITY, action)
    }

    /// Schedules `action` at `time`, which the caller has already validated.
    pub(crate) fn push(&mut self, time: Time, priority: Priority, action: Action) -> EventId {
        debug_assert!(time >= self.time());
        let id = EventId::from(self.next_seq);
        self.next_seq += 1;
        if let Action::Callback(_) = action {
            self.callbacks.insert(id);
        }
        self.events.push(EventEntry {
            time: Reverse(OrderedFloat(time)),
            priority: Reverse(priority),
            seq: Reverse(id.into()),
            action,
        });
        id
    }

    /// Discards a pending callback. Returns `false` if `id` does not refer to a pending callback.
    pub(crate) fn cancel(&mut self, id: EventId) -> bool {
        if self.callbacks.remove(&id) {
            self.cancelled.insert(id);
            self.purge();
            true
        } else {
            false
        }
    }

    /// Discards a pending event of any kind. The caller guarantees the event has not run yet.
    pub(crate) fn discard(&mut self, id: EventId) {
        self.callbacks.remove(&id);
        if self.cancelled.insert(id) {
            self.purge();
        }
    }

    /// Removes and returns the next scheduled event if it occurs no later than `until`, advancing
    /// the clock to its time.
    pub(crate) fn pop_until(&mut self, until: Option<Time>) -> Option<EventEntry> {
        match (self.peek_time(), until) {
            (None, _) => None,
            (Some(next), Some(until)) if next > until => None,
            _ => {
                let entry = self.events.pop()?;
                self.callbacks.remove(&entry.id());
                self.clock.set(entry.time());
                self.purge();
                Some(entry)
            }
        }
    }

    /// Moves the clock forward to `time` without running anything.
    pub(crate) fn advance(&mut self, time: Time) {
        if time > self.time() {
            self.clock.set(time);
        }
    }

    /// Drops all events and rewinds the clock to zero.
    pub(crate) fn clear(&mut self) {
        self.events.clear();
        self.callbacks.clear();
        self.cancelled.clear();
        self.clock.set(0.0);
        self.next_seq = 0;
    }

    /// Drops cancelled events sitting at the top of the heap, so that the top is always live.
    fn purge(&mut self) {
        while let Some(id) = self.events.peek().map(EventEntry::id) {
            if self.cancelled.remove(&id) {
                self.events.pop();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn callback() -> Action {
        Action::Callback(Box::new(|_| Ok(())))
    }

    fn pop_all(scheduler: &mut Scheduler) -> Vec<(Time, u64)> {
        std::iter::from_fn(|| scheduler.pop_until(None))
            .map(|e| (e.time(), e.id().into()))
            .collect()
    }

    #[test]
    fn test_event_entry_cmp() {
        let make_entry = |time: Time, priority: Priority, seq: u64| EventEntry {
            time: Reverse(OrderedFloat(time)),
            priority: Reverse(priority),
            seq: Reverse(seq),
            action: callback(),
        };
        // Greater means "runs earlier" in the max-heap.
        assert_eq!(
            make_entry(0.0, 0, 5).cmp(&make_entry(1.0, 0, 0)),
            Ordering::Greater
        );
        assert_eq!(
            make_entry(1.0, -1, 5).cmp(&make_entry(1.0, 0, 0)),
            Ordering::Greater
        );
        assert_eq!(
            make_entry(1.0, 0, 5).cmp(&make_entry(1.0, 0, 0)),
            Ordering::Less
        );
        assert_eq!(make_entry(1.0, 0, 5), make_entry(1.0, 0, 5));
    }

    #[test]
    fn test_scheduler() {
        let mut scheduler = Scheduler::default();
        assert_eq!(scheduler.time(), 0.0);
        assert_eq!(scheduler.len(), 0);

        scheduler.schedule(1.0, 0, callback()).unwrap();
        scheduler.schedule(0.0, 0, callback()).unwrap();
        scheduler.schedule(2.0, 0, callback()).unwrap();
        scheduler.schedule(1.0, -1, callback()).unwrap();
        scheduler.schedule(1.0, 0, callback()).unwrap();
        assert_eq!(scheduler.len(), 5);
        assert_eq!(scheduler.peek_time(), Some(0.0));

        assert_eq!(
            pop_all(&mut scheduler),
            vec![(0.0, 1), (1.0, 3), (1.0, 0), (1.0, 4), (2.0, 2)]
        );
        assert_eq!(scheduler.time(), 2.0);
        assert_eq!(scheduler.len(), 0);
    }

    #[test]
    fn test_clock_ref_follows_scheduler() {
        let mut scheduler = Scheduler::default();
        let clock = scheduler.clock();
        scheduler.schedule(3.5, 0, callback()).unwrap();
        assert_eq!(clock.time(), 0.0);
        let _ = scheduler.pop_until(None);
        assert_eq!(clock.time(), 3.5);
    }

    #[test]
    fn test_schedule_in_the_past() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(2.0, 0, callback()).unwrap();
        let _ = scheduler.pop_until(None);
        assert!(matches!(
            scheduler.schedule(1.0, 0, callback()),
            Err(SimError::InvalidTime { requested, now }) if requested == 1.0 && now == 2.0
        ));
        assert!(matches!(
            scheduler.schedule(f64::NAN, 0, callback()),
            Err(SimError::Validation(_))
        ));
        assert!(scheduler.schedule(2.0, 0, callback()).is_ok());
    }

    #[test]
    fn test_pop_until() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(1.0, 0, callback()).unwrap();
        scheduler.schedule(5.0, 0, callback()).unwrap();
        assert!(scheduler.pop_until(Some(3.0)).is_some());
        assert!(scheduler.pop_until(Some(3.0)).is_none());
        assert_eq!(scheduler.time(), 1.0);
        scheduler.advance(3.0);
        assert_eq!(scheduler.time(), 3.0);
        assert!(scheduler.pop_until(Some(5.0)).is_some());
        assert_eq!(scheduler.time(), 5.0);
    }

    #[test]
    fn test_cancel() {
        let mut scheduler = Scheduler::default();
        let first = scheduler.schedule(1.0, 0, callback()).unwrap();
        let second = scheduler.schedule(2.0, 0, callback()).unwrap();
        let third = scheduler.schedule(3.0, 0, callback()).unwrap();
        assert!(scheduler.cancel(second));
        assert!(!scheduler.cancel(second));
        assert_eq!(scheduler.len(), 2);
        assert!(scheduler.cancel(first));
        assert_eq!(scheduler.peek_time(), Some(3.0));
        assert_eq!(pop_all(&mut scheduler), vec![(3.0, third.into())]);
        assert!(!scheduler.cancel(third));
    }

    #[test]
    fn test_discard_resumption() {
        let mut scheduler = Scheduler::default();
        let resume = scheduler.push(
            100.0,
            0,
            Action::Poll {
                process: ProcessId::from(0),
                epoch: 1,
            },
        );
        scheduler.schedule(1.0, 0, callback()).unwrap();
        scheduler.discard(resume);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(pop_all(&mut scheduler), vec![(1.0, 1)]);
        assert_eq!(scheduler.peek_time(), None);
        assert_eq!(scheduler.time(), 1.0);
    }

    #[test]
    fn test_clear() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(1.0, 0, callback()).unwrap();
        let _ = scheduler.pop_until(None);
        scheduler.schedule(4.0, 0, callback()).unwrap();
        scheduler.clear();
        assert_eq!(scheduler.len(), 0);
        assert_eq!(scheduler.time(), 0.0);
        assert_eq!(scheduler.schedule(0.0, 0, callback()).unwrap(), EventId::from(0));
    }

    #[quickcheck_macros::quickcheck]
    fn events_pop_in_key_order(events: Vec<(u16, i8)>) -> bool {
        let mut scheduler = Scheduler::default();
        for &(time, priority) in &events {
            scheduler
                .schedule(f64::from(time), Priority::from(priority), callback())
                .unwrap();
        }
        let mut popped = Vec::new();
        while let Some(entry) = scheduler.pop_until(None) {
            popped.push((OrderedFloat(entry.time()), entry.priority.0, entry.seq.0));
        }
        popped.len() == events.len() && popped.windows(2).all(|w| w[0] < w[1])
    }
}
