use std::collections::VecDeque;

use log::{debug, info, trace, warn};

use crate::condition::{PendingCondition, Poll};
use crate::config::{BufferConfig, ResourceConfig, StoreConfig};
use crate::error::check_time;
use crate::observe::Observers;
use crate::process::Wait;
use crate::resource::{Grant, Release};
use crate::scheduler::{Action, EventEntry, Scheduler};
use crate::state::Registry;
use crate::{
    Buffer, BufferId, ClockRef, Condition, Context, EventId, Metric, Observer, Preemption,
    Priority, Process, ProcessId, ProcessState, Resource, ResourceId, SimError, Step,
    Store, StoreId, Time, Transfer, Wake, WaitToken, Woken, DEFAULT_PRIORITY,
};

/// A primitive a process may be waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Site {
    Resource(usize),
    Buffer(usize),
    Store(usize),
}

struct ProcessSlot {
    state: ProcessState,
    /// Delegation stack; the innermost frame is on top.
    frames: Vec<Box<dyn Process>>,
    /// Bumped on every suspension and termination. Resume events carrying an older epoch are
    /// stale and get discarded.
    epoch: u64,
    waiting: Option<Site>,
    condition: Option<PendingCondition>,
    /// The event that will resume the process next, if any.
    wakeup: Option<EventId>,
    /// A grant or a preemption has been scheduled but not delivered yet. It must not be replaced,
    /// so preemptions arriving in the meantime are deferred.
    delivering: bool,
    deferred: VecDeque<Wake>,
}

/// The simulation: clock, event queue, processes, and primitives.
///
/// Everything runs on a single thread. Events sharing a time run in the order of their priority
/// and then of their scheduling, so a simulation fed with the same inputs always replays the same
/// way.
///
/// ```
/// # use procsim::*;
/// # fn main() -> Result<(), SimError> {
/// let mut sim = Simulation::new();
/// sim.schedule(5.0, |sim| {
///     assert_eq!(sim.now(), 5.0);
///     Ok(())
/// })?;
/// sim.run_until(3.0)?;
/// assert_eq!(sim.now(), 3.0);
/// assert_eq!(sim.pending_events(), 1);
/// sim.run()?;
/// assert_eq!(sim.now(), 5.0);
/// # Ok(())
/// # }
/// ```
pub struct Simulation {
    scheduler: Scheduler,
    processes: Vec<ProcessSlot>,
    registry: Registry,
    observers: Observers,
    dispatching: bool,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    /// Constructs an empty simulation with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::default(),
            processes: Vec::new(),
            registry: Registry::default(),
            observers: Observers::default(),
            dispatching: false,
        }
    }

    /// Current simulation time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.scheduler.time()
    }

    /// Read-only access to the simulation clock.
    #[must_use]
    pub fn clock(&self) -> ClockRef {
        self.scheduler.clock()
    }

    /// Registers an observer of occupancy, levels, wait times, and counters.
    pub fn add_observer<O: Observer + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    // Events

    /// Schedules `callback` at absolute `time` with the default priority.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidTime`] if `time` is earlier than [`Simulation::now`], and
    /// [`SimError::Validation`] if it is not finite.
    pub fn schedule<F>(&mut self, time: Time, callback: F) -> Result<EventId, SimError>
    where
        F: FnOnce(&mut Simulation) -> Result<(), SimError> + 'static,
    {
        self.schedule_with_priority(time, DEFAULT_PRIORITY, callback)
    }

    /// Schedules `callback` at absolute `time`. Among events at the same time, lower priority
    /// values run first.
    ///
    /// # Errors
    ///
    /// See [`Simulation::schedule`].
    pub fn schedule_with_priority<F>(
        &mut self,
        time: Time,
        priority: Priority,
        callback: F,
    ) -> Result<EventId, SimError>
    where
        F: FnOnce(&mut Simulation) -> Result<(), SimError> + 'static,
    {
        self.scheduler
            .schedule(time, priority, Action::Callback(Box::new(callback)))
    }

    /// Schedules `callback` to run `delay` time units from now.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] if `delay` is negative or not finite.
    pub fn schedule_in<F>(&mut self, delay: Time, callback: F) -> Result<EventId, SimError>
    where
        F: FnOnce(&mut Simulation) -> Result<(), SimError> + 'static,
    {
        let delay = check_time(delay, "delay")?;
        self.schedule(self.now() + delay, callback)
    }

    /// Discards a pending callback. Returns `false` if it already ran or was cancelled.
    pub fn cancel_event(&mut self, id: EventId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Time of the next pending event.
    #[must_use]
    pub fn peek_time(&self) -> Option<Time> {
        self.scheduler.peek_time()
    }

    /// Number of pending events.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.scheduler.len()
    }

    // Processes

    fn spawn(&mut self, body: Box<dyn Process>) -> ProcessId {
        let pid = ProcessId::from(self.processes.len());
        self.processes.push(ProcessSlot {
            state: ProcessState::Scheduled,
            frames: vec![body],
            epoch: 0,
            waiting: None,
            condition: None,
            wakeup: None,
            delivering: false,
            deferred: VecDeque::new(),
        });
        info!("[{}] Spawned process {}", self.now(), pid);
        pid
    }

    /// Creates a process. Its first step runs as an event at the current time, after the events
    /// already scheduled for now.
    pub fn process<P: Process + 'static>(&mut self, body: P) -> ProcessId {
        let pid = self.spawn(Box::new(body));
        self.resume_at(pid, self.now(), Wake::Start);
        pid
    }

    /// Creates a process whose first step runs at `time`.
    ///
    /// # Errors
    ///
    /// Fails if `time` is earlier than [`Simulation::now`] or not finite.
    pub fn process_at<P: Process + 'static>(
        &mut self,
        time: Time,
        body: P,
    ) -> Result<ProcessId, SimError> {
        let time = self.scheduler.check_time(time)?;
        let pid = self.spawn(Box::new(body));
        self.resume_at(pid, time, Wake::Start);
        Ok(pid)
    }

    fn slot(&self, pid: ProcessId) -> &ProcessSlot {
        &self.processes[usize::from(pid)]
    }

    fn slot_mut(&mut self, pid: ProcessId) -> &mut ProcessSlot {
        &mut self.processes[usize::from(pid)]
    }

    /// State of a process, or `None` if no such process exists.
    #[must_use]
    pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.processes.get(usize::from(pid)).map(|slot| slot.state)
    }

    /// Checks if a process has neither completed nor been cancelled.
    #[must_use]
    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.process_state(pid).map_or(false, ProcessState::is_alive)
    }

    /// Cancels a process. Returns `false` if it had already terminated.
    ///
    /// The pending resumption of the process is discarded, and it is removed from the wait queue
    /// of the primitive it waits on, if any. Resources it holds are **not** released: releasing them
    /// is the responsibility of the caller (see [`Simulation::release`]).
    ///
    /// A process cancelling itself finishes its current step first.
    pub fn cancel(&mut self, pid: ProcessId) -> bool {
        if !self.is_alive(pid) {
            return false;
        }
        let slot = self.slot_mut(pid);
        slot.state = ProcessState::Cancelled;
        slot.frames.clear();
        slot.epoch += 1;
        self.settle_slot(pid);
        self.withdraw(pid);
        self.registry
            .resources_mut()
            .for_each(|resource| resource.forget(pid));
        let now = self.now();
        self.observers
            .emit(now, "process", Metric::Cancellations, 1.0);
        info!("[{}] Cancelled process {}", now, pid);
        true
    }

    fn complete(&mut self, pid: ProcessId) {
        let slot = self.slot_mut(pid);
        slot.state = ProcessState::Completed;
        slot.frames.clear();
        slot.epoch += 1;
        self.settle_slot(pid);
        self.registry
            .resources_mut()
            .for_each(|resource| resource.forget(pid));
        info!("[{}] Process {} completed", self.now(), pid);
    }

    fn fail(&mut self, pid: ProcessId, err: SimError) -> SimError {
        let time = self.now();
        warn!("[{}] Process {} failed: {}", time, pid, err);
        self.cancel(pid);
        SimError::ProcessFailed {
            process: pid,
            time,
            source: Box::new(err),
        }
    }

    /// Drops everything still scheduled for a terminated process.
    fn settle_slot(&mut self, pid: ProcessId) {
        self.replace_wakeup(pid, None);
        let slot = self.slot_mut(pid);
        slot.delivering = false;
        slot.deferred.clear();
    }

    /// Records `wakeup` as the next resumption of the process, discarding the previous one.
    fn replace_wakeup(&mut self, pid: ProcessId, wakeup: Option<EventId>) {
        if let Some(previous) = std::mem::replace(&mut self.slot_mut(pid).wakeup, wakeup) {
            self.scheduler.discard(previous);
        }
    }

    /// Schedules the resumption of the process at `time` with its current epoch.
    fn resume_at(&mut self, pid: ProcessId, time: Time, wake: Wake) {
        let epoch = self.slot(pid).epoch;
        let id = self.scheduler.push(
            time,
            DEFAULT_PRIORITY,
            Action::Resume {
                process: pid,
                epoch,
                wake,
            },
        );
        self.replace_wakeup(pid, Some(id));
    }

    /// Marks the process as suspended and returns its new epoch.
    fn suspend(&mut self, pid: ProcessId) -> u64 {
        let slot = self.slot_mut(pid);
        slot.state = ProcessState::Suspended;
        slot.epoch += 1;
        slot.epoch
    }

    fn is_current(&self, pid: ProcessId, epoch: u64) -> bool {
        let slot = self.slot(pid);
        slot.epoch == epoch
            && matches!(
                slot.state,
                ProcessState::Scheduled | ProcessState::Suspended
            )
    }

    /// Runs the process until it suspends or terminates.
    fn drive(&mut self, pid: ProcessId, mut wake: Wake) -> Result<(), SimError> {
        loop {
            let slot = self.slot_mut(pid);
            let Some(mut frame) = slot.frames.pop() else {
                return Ok(());
            };
            slot.state = ProcessState::Running;
            trace!("[{}] Resuming process {} with {:?}", self.now(), pid, wake);
            let result = frame.resume(&mut Context::new(self, pid), wake);
            if self.slot(pid).state == ProcessState::Cancelled {
                return Ok(());
            }
            let outer_frames = !self.slot(pid).frames.is_empty();
            let step = match result {
                Ok(step) => step,
                Err(err) if outer_frames => {
                    wake = Wake::Failed(err);
                    continue;
                }
                Err(err) => return Err(self.fail(pid, err)),
            };
            let next = match step {
                Step::Done | Step::Return(_) if !outer_frames => {
                    self.complete(pid);
                    None
                }
                Step::Done => Some(Wake::Returned(None)),
                Step::Return(value) => Some(Wake::Returned(Some(value))),
                Step::Delegate(inner) => {
                    let slot = self.slot_mut(pid);
                    slot.frames.push(frame);
                    slot.frames.push(inner);
                    Some(Wake::Start)
                }
                Step::Timeout(delay) => {
                    self.slot_mut(pid).frames.push(frame);
                    self.sleep(pid, delay)
                }
                Step::Wait(token) => {
                    self.slot_mut(pid).frames.push(frame);
                    self.submit(pid, token)
                }
                Step::WaitFor(condition) => {
                    self.slot_mut(pid).frames.push(frame);
                    self.await_condition(pid, condition)
                }
            };
            match next {
                Some(next) => wake = next,
                None => return Ok(()),
            }
        }
    }

    /// Schedules the end of a timeout. Returns the wake to continue with right away, if the
    /// timeout is invalid.
    fn sleep(&mut self, pid: ProcessId, delay: Time) -> Option<Wake> {
        let time = match check_time(delay, "timeout delay")
            .and_then(|delay| check_time(self.now() + delay, "timeout end"))
        {
            Ok(time) => time,
            Err(err) => return Some(Wake::Failed(err)),
        };
        self.suspend(pid);
        self.resume_at(pid, time, Wake::Elapsed);
        None
    }

    /// Submits a wait token. Returns the wake to continue with right away if the request was
    /// satisfied immediately.
    fn submit(&mut self, pid: ProcessId, token: WaitToken) -> Option<Wake> {
        let now = self.now();
        match token.0 {
            Wait::Request {
                resource,
                priority,
                preemptive,
            } => {
                let site = Site::Resource(resource.index());
                let grant = self
                    .registry
                    .resource_mut(resource)
                    .request(pid, priority, preemptive, now);
                self.emit(site, Metric::Requests, 1.0);
                let wake = match grant {
                    Grant::Granted => {
                        debug!("[{}] Process {} granted {:?}", now, pid, site);
                        self.emit(site, Metric::WaitTime, 0.0);
                        Some(Wake::Granted)
                    }
                    Grant::Queued => {
                        debug!("[{}] Process {} queued at {:?}", now, pid, site);
                        self.wait_at(pid, site);
                        None
                    }
                    Grant::Preempted(victim) => {
                        debug!(
                            "[{}] Process {} preempted process {} at {:?}",
                            now, pid, victim.process, site
                        );
                        self.emit(site, Metric::Preemptions, 1.0);
                        self.interrupt(
                            victim.process,
                            Wake::Preempted(Preemption {
                                resource,
                                by: pid,
                                priority,
                                since: victim.since,
                            }),
                        );
                        self.emit(site, Metric::WaitTime, 0.0);
                        Some(Wake::Granted)
                    }
                };
                self.emit_state(site);
                wake
            }
            Wait::Put { buffer, amount } => {
                let site = Site::Buffer(buffer.index());
                let transfer = self.registry.buffer_mut(buffer).put(pid, amount, now);
                debug!("[{}] Process {} puts {} into {:?}", now, pid, amount, site);
                self.emit(site, Metric::Puts, 1.0);
                self.finish_transfer(pid, site, transfer)
            }
            Wait::Get { buffer, amount } => {
                let site = Site::Buffer(buffer.index());
                let transfer = self.registry.buffer_mut(buffer).get(pid, amount, now);
                debug!("[{}] Process {} gets {} from {:?}", now, pid, amount, site);
                self.emit(site, Metric::Gets, 1.0);
                self.finish_transfer(pid, site, transfer)
            }
            Wait::Store(op) => {
                let metric = op.metric();
                let (index, transfer) = op.submit(&mut self.registry, pid, now);
                let site = Site::Store(index);
                debug!("[{}] Process {} submits {} to {:?}", now, pid, metric, site);
                self.emit(site, metric, 1.0);
                self.finish_transfer(pid, site, transfer)
            }
        }
    }

    fn finish_transfer(&mut self, pid: ProcessId, site: Site, transfer: Transfer) -> Option<Wake> {
        let Transfer { done, woken } = transfer;
        self.wake_waiters(site, woken);
        self.emit_state(site);
        if done {
            self.emit(site, Metric::WaitTime, 0.0);
            Some(Wake::Granted)
        } else {
            self.wait_at(pid, site);
            None
        }
    }

    fn wait_at(&mut self, pid: ProcessId, site: Site) {
        self.suspend(pid);
        self.slot_mut(pid).waiting = Some(site);
    }

    /// Resumes waiters satisfied by a primitive.
    fn wake_waiters<I: IntoIterator<Item = Woken>>(&mut self, site: Site, woken: I) {
        for Woken { process, waited } in woken {
            let slot = self.slot_mut(process);
            slot.waiting = None;
            slot.delivering = true;
            self.resume_at(process, self.now(), Wake::Granted);
            debug!(
                "[{}] Process {} satisfied at {:?} after {}",
                self.now(),
                process,
                site,
                waited
            );
            self.emit(site, Metric::WaitTime, waited);
        }
    }

    /// Abandons the current wait of `victim` and resumes it with `wake` at the current time.
    ///
    /// If a grant or another interruption is already on its way to the victim, `wake` is deferred
    /// until that one has been handled.
    fn interrupt(&mut self, victim: ProcessId, wake: Wake) {
        if !self.is_alive(victim) {
            return;
        }
        let slot = self.slot_mut(victim);
        if slot.delivering {
            debug!("Deferring {:?} for process {}", wake, victim);
            slot.deferred.push_back(wake);
            return;
        }
        slot.delivering = true;
        self.withdraw(victim);
        self.suspend(victim);
        self.resume_at(victim, self.now(), wake);
    }

    /// Delivers the next deferred interruption once the process has handled its previous wake.
    fn flush_deferred(&mut self, pid: ProcessId) {
        let slot = self.slot_mut(pid);
        if slot.delivering {
            return;
        }
        if let Some(wake) = slot.deferred.pop_front() {
            self.interrupt(pid, wake);
        }
    }

    /// Removes the process from the wait queue it is in and drops its pending condition.
    fn withdraw(&mut self, pid: ProcessId) {
        let now = self.now();
        let slot = self.slot_mut(pid);
        slot.condition = None;
        let Some(site) = slot.waiting.take() else {
            return;
        };
        match site {
            Site::Resource(index) => {
                self.registry.resource_at(index).remove_waiter(pid);
            }
            Site::Buffer(index) => {
                let woken = self.registry.buffer_at(index).remove_waiter(pid, now);
                self.wake_waiters(site, woken);
            }
            Site::Store(index) => {
                let woken = self.registry.store_at(index).remove_waiter(pid, now);
                self.wake_waiters(site, woken);
            }
        }
        self.emit_state(site);
    }

    fn await_condition(&mut self, pid: ProcessId, condition: Condition) -> Option<Wake> {
        let mut pending = PendingCondition::new(condition, self.now());
        match pending.check(self) {
            Poll::Met => Some(Wake::ConditionMet),
            Poll::Exhausted(err) => Some(Wake::Failed(err)),
            Poll::Pending(interval) => {
                let time = match check_time(self.now() + interval, "condition check time") {
                    Ok(time) => time,
                    Err(err) => return Some(Wake::Failed(err)),
                };
                let epoch = self.suspend(pid);
                self.slot_mut(pid).condition = Some(pending);
                self.schedule_poll(pid, epoch, time);
                None
            }
        }
    }

    fn poll(&mut self, pid: ProcessId) -> Result<(), SimError> {
        let Some(mut pending) = self.slot_mut(pid).condition.take() else {
            return Ok(());
        };
        match pending.check(self) {
            Poll::Met => self.drive(pid, Wake::ConditionMet),
            Poll::Exhausted(err) => self.drive(pid, Wake::Failed(err)),
            Poll::Pending(interval) => {
                match check_time(self.now() + interval, "condition check time") {
                    Ok(time) => {
                        let slot = self.slot_mut(pid);
                        slot.condition = Some(pending);
                        let epoch = slot.epoch;
                        self.schedule_poll(pid, epoch, time);
                        Ok(())
                    }
                    Err(err) => self.drive(pid, Wake::Failed(err)),
                }
            }
        }
    }

    fn schedule_poll(&mut self, pid: ProcessId, epoch: u64, time: Time) {
        let id = self.scheduler.push(
            time,
            DEFAULT_PRIORITY,
            Action::Poll {
                process: pid,
                epoch,
            },
        );
        self.replace_wakeup(pid, Some(id));
    }

    // Primitives

    /// Registers a non-preemptive resource with `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] if `capacity` is zero.
    pub fn add_resource(&mut self, capacity: usize) -> Result<ResourceId, SimError> {
        self.add_resource_with(ResourceConfig::new(capacity))
    }

    /// Registers a resource.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] if the configuration is invalid.
    pub fn add_resource_with(&mut self, config: ResourceConfig) -> Result<ResourceId, SimError> {
        config.validate()?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| self.registry.next_name("resource"));
        debug!("Adding resource {} with capacity {}", name, config.capacity);
        Ok(self.registry.insert_resource(Resource::new(name, &config)))
    }

    /// Registers an initially empty buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] if `capacity` is not positive.
    pub fn add_buffer(&mut self, capacity: f64) -> Result<BufferId, SimError> {
        self.add_buffer_with(BufferConfig::new(capacity))
    }

    /// Registers a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] if the configuration is invalid.
    pub fn add_buffer_with(&mut self, config: BufferConfig) -> Result<BufferId, SimError> {
        config.validate()?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| self.registry.next_name("buffer"));
        debug!("Adding buffer {} with capacity {}", name, config.capacity);
        Ok(self.registry.insert_buffer(Buffer::new(name, &config)))
    }

    /// Registers an initially empty store.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] if `capacity` is zero.
    pub fn add_store<T: 'static>(&mut self, capacity: usize) -> Result<StoreId<T>, SimError> {
        let config = StoreConfig::new(capacity);
        config.validate(0)?;
        let name = self.registry.next_name("store");
        debug!("Adding store {} with capacity {}", name, capacity);
        Ok(self.registry.insert_store(Store::empty(name, &config)))
    }

    /// Registers a store holding `items` initially. The items are restored on
    /// [`Simulation::reset`].
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] if the configuration is invalid or the items do not fit.
    pub fn add_store_with<T: Clone + 'static>(
        &mut self,
        config: StoreConfig,
        items: Vec<T>,
    ) -> Result<StoreId<T>, SimError> {
        config.validate(items.len())?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| self.registry.next_name("store"));
        debug!("Adding store {} with capacity {}", name, config.capacity);
        Ok(self.registry.insert_store(Store::new(name, &config, items)))
    }

    /// Inspects a resource.
    ///
    /// # Panics
    ///
    /// Panics if the ID was issued by another simulation.
    #[must_use]
    pub fn resource(&self, id: ResourceId) -> &Resource {
        self.registry.resource(id)
    }

    /// Inspects a buffer.
    ///
    /// # Panics
    ///
    /// Panics if the ID was issued by another simulation.
    #[must_use]
    pub fn buffer(&self, id: BufferId) -> &Buffer {
        self.registry.buffer(id)
    }

    /// Inspects a store.
    ///
    /// # Panics
    ///
    /// Panics if the ID was issued by another simulation.
    #[must_use]
    pub fn store<T: 'static>(&self, id: StoreId<T>) -> &Store<T> {
        self.registry.store(id)
    }

    /// Releases a slot of `resource` held by `pid` and grants it to the next waiter.
    ///
    /// Processes release their own slots with [`Context::release`]; this is meant for cleaning up
    /// after cancelled processes. Returns `false` if `pid` is not a holder.
    pub fn release(&mut self, pid: ProcessId, resource: ResourceId) -> bool {
        let now = self.now();
        let site = Site::Resource(resource.index());
        match self.registry.resource_mut(resource).release(pid, now) {
            Release::NotHolder => {
                debug!("[{}] Process {} does not hold {:?}", now, pid, site);
                false
            }
            Release::Released { granted } => {
                debug!("[{}] Process {} released {:?}", now, pid, site);
                self.wake_waiters(site, granted);
                self.emit_state(site);
                true
            }
        }
    }

    // Observations

    fn emit(&mut self, site: Site, metric: Metric, value: f64) {
        let now = self.now();
        let name = match site {
            Site::Resource(index) => self.registry.resource_at(index).name(),
            Site::Buffer(index) => self.registry.buffer_at(index).name(),
            Site::Store(index) => self.registry.store_at(index).name(),
        };
        self.observers.emit(now, name, metric, value);
    }

    fn emit_state(&mut self, site: Site) {
        let now = self.now();
        match site {
            Site::Resource(index) => {
                let resource = self.registry.resource_at(index);
                let (in_use, queued) = (resource.in_use(), resource.queue_len());
                self.observers
                    .emit(now, resource.name(), Metric::Occupancy, in_use as f64);
                self.observers
                    .emit(now, resource.name(), Metric::QueueLength, queued as f64);
            }
            Site::Buffer(index) => {
                let buffer = self.registry.buffer_at(index);
                self.observers
                    .emit(now, buffer.name(), Metric::Level, buffer.level());
            }
            Site::Store(index) => {
                let store = self.registry.store_at(index);
                self.observers
                    .emit(now, store.name(), Metric::Items, store.len() as f64);
            }
        }
    }

    // Running

    fn dispatch(&mut self, entry: EventEntry) -> Result<(), SimError> {
        trace!(
            "[{}] Dispatching event {}: {:?}",
            entry.time(),
            entry.id(),
            entry.action
        );
        self.dispatching = true;
        let id = entry.id();
        let result = match entry.action {
            Action::Resume {
                process,
                epoch,
                wake,
            } => {
                self.take_wakeup(process, id);
                if self.is_current(process, epoch) {
                    self.slot_mut(process).delivering = false;
                    let result = self.drive(process, wake);
                    if result.is_ok() && self.is_alive(process) {
                        self.flush_deferred(process);
                    }
                    result
                } else {
                    trace!("Discarding stale resumption of process {}", process);
                    Ok(())
                }
            }
            Action::Poll { process, epoch } => {
                self.take_wakeup(process, id);
                if self.is_current(process, epoch) {
                    self.poll(process)
                } else {
                    Ok(())
                }
            }
            Action::Callback(callback) => callback(self),
        };
        self.dispatching = false;
        result
    }

    /// Forgets the wakeup of `pid` that has just been popped from the queue.
    fn take_wakeup(&mut self, pid: ProcessId, id: EventId) {
        let slot = self.slot_mut(pid);
        if slot.wakeup == Some(id) {
            slot.wakeup = None;
        }
    }

    fn check_not_dispatching(&self) -> Result<(), SimError> {
        if self.dispatching {
            Err(SimError::ReentrantRun)
        } else {
            Ok(())
        }
    }

    /// Runs until no events are left.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::ProcessFailed`] if a process fails, or the error of a failing
    /// callback. The events that were not executed stay queued, so the simulation can be
    /// continued. Returns [`SimError::ReentrantRun`] if called from inside a callback.
    pub fn run(&mut self) -> Result<(), SimError> {
        self.check_not_dispatching()?;
        while let Some(entry) = self.scheduler.pop_until(None) {
            self.dispatch(entry)?;
        }
        Ok(())
    }

    /// Runs all events scheduled no later than `until`, and then moves the clock to `until`.
    /// Later events stay queued for a subsequent run.
    ///
    /// # Errors
    ///
    /// Fails if `until` is earlier than [`Simulation::now`] or not finite; otherwise, see
    /// [`Simulation::run`].
    pub fn run_until(&mut self, until: Time) -> Result<(), SimError> {
        self.check_not_dispatching()?;
        let until = self.scheduler.check_time(until)?;
        while let Some(entry) = self.scheduler.pop_until(Some(until)) {
            self.dispatch(entry)?;
        }
        self.scheduler.advance(until);
        Ok(())
    }

    /// Executes a single event. Returns `false` if there were no events.
    ///
    /// # Errors
    ///
    /// See [`Simulation::run`].
    pub fn step(&mut self) -> Result<bool, SimError> {
        self.check_not_dispatching()?;
        match self.scheduler.pop_until(None) {
            Some(entry) => self.dispatch(entry).map(|()| true),
            None => Ok(false),
        }
    }

    /// Prepares the simulation for another run: cancels all live processes, drops all events,
    /// rewinds the clock to zero, and restores all primitives to their initial state.
    ///
    /// Process IDs are never reused, so IDs from before the reset keep reporting the cancelled
    /// processes.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::ReentrantRun`] if called from inside a callback.
    pub fn reset(&mut self) -> Result<(), SimError> {
        self.check_not_dispatching()?;
        let live: Vec<ProcessId> = (0..self.processes.len())
            .map(ProcessId::from)
            .filter(|&pid| self.is_alive(pid))
            .collect();
        for pid in live {
            self.cancel(pid);
        }
        self.scheduler.clear();
        self.registry.reset();
        info!("Simulation reset");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{from_fn, Recorder};
    use rstest::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[fixture]
    fn sim() -> Simulation {
        Simulation::new()
    }

    #[rstest]
    fn test_process_starts_as_event(mut sim: Simulation) {
        let pid = sim.process(from_fn(|_, _| Ok(Step::Done)));
        assert_eq!(sim.process_state(pid), Some(ProcessState::Scheduled));
        assert_eq!(sim.pending_events(), 1);
        sim.run().unwrap();
        assert_eq!(sim.process_state(pid), Some(ProcessState::Completed));
        assert!(!sim.is_alive(pid));
    }

    #[rstest]
    fn test_same_time_fifo(mut sim: Simulation) {
        let order = Rc::new(RefCell::new(Vec::new()));
        for id in 0..5 {
            let order = Rc::clone(&order);
            sim.schedule(1.0, move |_| {
                order.borrow_mut().push(id);
                Ok(())
            })
            .unwrap();
        }
        let first = Rc::clone(&order);
        sim.schedule_with_priority(1.0, -1, move |_| {
            first.borrow_mut().push(-1);
            Ok(())
        })
        .unwrap();
        sim.run().unwrap();
        assert_eq!(*order.borrow(), vec![-1, 0, 1, 2, 3, 4]);
    }

    #[rstest]
    fn test_timeout_in_place(mut sim: Simulation) {
        let pid = sim.process(from_fn(|ctx, wake| match wake {
            Wake::Start => ctx.timeout(0.0),
            Wake::Elapsed => ctx.timeout(2.5),
            _ => Ok(Step::Done),
        }));
        sim.step().unwrap();
        assert_eq!(sim.process_state(pid), Some(ProcessState::Suspended));
        sim.run().unwrap();
        assert_eq!(sim.now(), 2.5);
    }

    #[rstest]
    fn test_stale_resumption_is_discarded(mut sim: Simulation) {
        let steps = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&steps);
        let pid = sim.process(from_fn(move |ctx, _| {
            *counter.borrow_mut() += 1;
            ctx.timeout(10.0)
        }));
        sim.run_until(1.0).unwrap();
        assert!(sim.cancel(pid));
        assert!(!sim.cancel(pid));
        sim.run().unwrap();
        assert_eq!(*steps.borrow(), 1);
        assert_eq!(sim.process_state(pid), Some(ProcessState::Cancelled));
    }

    #[rstest]
    fn test_fast_path_grant_is_inline(mut sim: Simulation) {
        let server = sim.add_resource(1).unwrap();
        let recorder = Recorder::default();
        sim.add_observer(recorder.clone());
        let pid = sim.process(from_fn(move |ctx, wake| match wake {
            Wake::Start => Ok(ctx.request(server)),
            Wake::Granted => {
                assert_eq!(ctx.resource(server).in_use(), 1);
                Ok(Step::Done)
            }
            _ => unreachable!(),
        }));
        assert!(sim.step().unwrap());
        assert_eq!(sim.process_state(pid), Some(ProcessState::Completed));
        assert_eq!(
            recorder.series("resource-0", Metric::WaitTime),
            vec![(0.0, 0.0)]
        );
    }

    #[rstest]
    fn test_callback_errors_propagate(mut sim: Simulation) {
        sim.schedule(1.0, |_| Err(SimError::custom("broken")))
            .unwrap();
        assert!(matches!(sim.run(), Err(SimError::Custom(_))));
        assert_eq!(sim.now(), 1.0);
    }

    #[rstest]
    fn test_cancel_event(mut sim: Simulation) {
        let id = sim.schedule(1.0, |_| Err(SimError::custom("cancelled"))).unwrap();
        sim.schedule(2.0, |_| Ok(())).unwrap();
        assert!(sim.cancel_event(id));
        assert_eq!(sim.peek_time(), Some(2.0));
        assert!(sim.run().is_ok());
    }
}
