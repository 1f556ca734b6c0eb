use std::any::Any;
use std::fmt;
use std::rc::Rc;

use delegate::delegate;
use serde::{Deserialize, Serialize};

use crate::store::{put_token, StoreOp};
use crate::{
    BufferId, ClockRef, Condition, ConditionOptions, EventId, Priority, ProcessId, ResourceId,
    SimError, Simulation, StoreGet, StoreId, Time,
};
use crate::{Buffer, Resource, Store};

/// A suspendable unit of simulated activity.
///
/// A process is an explicit state machine. The kernel calls [`Process::resume`] with the reason
/// of the resumption, and the process answers with the next [`Step`] it wants to take. The first
/// call receives [`Wake::Start`].
///
/// Returning an error terminates the process, unless it runs as a delegate of another process,
/// in which case the outer process is resumed with [`Wake::Failed`].
pub trait Process {
    /// Runs the process until its next suspension point.
    ///
    /// # Errors
    ///
    /// Any error returned here fails the process; see the trait documentation.
    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, SimError>;
}

/// A process implemented by a closure. See [`from_fn`].
pub struct FnProcess<F>(F);

/// Turns a closure into a process.
///
/// ```
/// # use procsim::*;
/// let mut sim = Simulation::new();
/// let mut ticks = 0;
/// sim.process(from_fn(move |ctx, wake| match wake {
///     Wake::Start | Wake::Elapsed if ticks < 3 => {
///         ticks += 1;
///         ctx.timeout(1.0)
///     }
///     _ => Ok(Step::Done),
/// }));
/// sim.run().unwrap();
/// assert_eq!(sim.now(), 3.0);
/// ```
pub fn from_fn<F>(f: F) -> FnProcess<F>
where
    F: FnMut(&mut Context<'_>, Wake) -> Result<Step, SimError>,
{
    FnProcess(f)
}

impl<F> Process for FnProcess<F>
where
    F: FnMut(&mut Context<'_>, Wake) -> Result<Step, SimError>,
{
    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, SimError> {
        (self.0)(ctx, wake)
    }
}

/// Lifecycle state of a process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Created, first step not yet executed.
    Scheduled,
    /// Executing a step.
    Running,
    /// Waiting for a timeout, a primitive, or a condition.
    Suspended,
    /// Finished normally.
    Completed,
    /// Cancelled or failed.
    Cancelled,
}

impl ProcessState {
    /// Whether the process has neither completed nor been cancelled.
    #[must_use]
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Information delivered to a resource holder that lost its slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preemption {
    /// The resource that was taken away.
    pub resource: ResourceId,
    /// The process that took the slot.
    pub by: ProcessId,
    /// Priority of the preempting request.
    pub priority: Priority,
    /// Time at which the victim had been granted the slot.
    pub since: Time,
}

impl Preemption {
    /// How long the victim held the slot before losing it.
    #[must_use]
    pub fn usage(&self, now: Time) -> Time {
        now - self.since
    }
}

/// The reason a process is resumed.
pub enum Wake {
    /// First step of the process (or of a delegate).
    Start,
    /// A timeout has elapsed.
    Elapsed,
    /// A resource request, buffer transfer, or store operation was satisfied.
    Granted,
    /// A resource slot held by the process was given to a higher-priority request.
    ///
    /// The wait the process was suspended on, if any, is abandoned. A wait that was already
    /// satisfied is delivered first as [`Wake::Granted`], and the preemption follows once the
    /// process suspends again.
    Preempted(Preemption),
    /// The awaited condition holds.
    ConditionMet,
    /// A delegate finished, possibly returning a value.
    Returned(Option<Box<dyn Any>>),
    /// The suspension failed, or a delegate returned an error.
    Failed(SimError),
}

impl Wake {
    /// Turns [`Wake::Failed`] into an error, so that it can be propagated with `?`.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error if `self` is [`Wake::Failed`].
    pub fn check(self) -> Result<Self, SimError> {
        match self {
            Self::Failed(err) => Err(err),
            wake => Ok(wake),
        }
    }

    /// Checks if the process was preempted.
    #[must_use]
    pub fn is_preempted(&self) -> bool {
        matches!(self, Self::Preempted(_))
    }

    /// Returns the preemption details, if the process was preempted.
    #[must_use]
    pub fn preemption(&self) -> Option<Preemption> {
        match self {
            Self::Preempted(preemption) => Some(*preemption),
            _ => None,
        }
    }

    /// Takes the value returned by a delegate if it is of type `T`.
    #[must_use]
    pub fn returned<T: 'static>(self) -> Option<T> {
        match self {
            Self::Returned(Some(value)) => value.downcast::<T>().ok().map(|v| *v),
            _ => None,
        }
    }
}

impl fmt::Debug for Wake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("Start"),
            Self::Elapsed => f.write_str("Elapsed"),
            Self::Granted => f.write_str("Granted"),
            Self::Preempted(p) => f.debug_tuple("Preempted").field(p).finish(),
            Self::ConditionMet => f.write_str("ConditionMet"),
            Self::Returned(value) => write!(f, "Returned({})", value.is_some()),
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

/// A request to wait on a resource, a buffer, or a store.
///
/// Tokens are built by [`Context`] and yielded inside [`Step::Wait`].
#[derive(Debug)]
pub struct WaitToken(pub(crate) Wait);

#[derive(Debug)]
pub(crate) enum Wait {
    Request {
        resource: ResourceId,
        priority: Priority,
        preemptive: bool,
    },
    Put {
        buffer: BufferId,
        amount: f64,
    },
    Get {
        buffer: BufferId,
        amount: f64,
    },
    Store(Box<dyn StoreOp>),
}

impl WaitToken {
    pub(crate) fn store(op: Box<dyn StoreOp>) -> Self {
        Self(Wait::Store(op))
    }
}

/// What a process does next.
pub enum Step {
    /// Suspend for the given duration.
    Timeout(Time),
    /// Wait on a resource, a buffer, or a store.
    Wait(WaitToken),
    /// Wait until a condition holds.
    WaitFor(Condition),
    /// Run another process in place of this one; this one resumes with [`Wake::Returned`] when
    /// the delegate finishes.
    Delegate(Box<dyn Process>),
    /// Finish, handing a value to the delegating process, if any.
    Return(Box<dyn Any>),
    /// Finish.
    Done,
}

impl Step {
    /// Delegates to `process`.
    pub fn delegate<P: Process + 'static>(process: P) -> Self {
        Self::Delegate(Box::new(process))
    }

    /// Finishes, returning `value` to the delegating process.
    pub fn returning<T: 'static>(value: T) -> Self {
        Self::Return(Box::new(value))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(delay) => f.debug_tuple("Timeout").field(delay).finish(),
            Self::Wait(token) => f.debug_tuple("Wait").field(token).finish(),
            Self::WaitFor(_) => f.write_str("WaitFor"),
            Self::Delegate(_) => f.write_str("Delegate"),
            Self::Return(_) => f.write_str("Return"),
            Self::Done => f.write_str("Done"),
        }
    }
}

/// The view of the simulation a process gets while it runs.
///
/// It cannot run the simulation; everything else is reachable, including spawning and cancelling
/// processes and scheduling callbacks.
pub struct Context<'a> {
    sim: &'a mut Simulation,
    pid: ProcessId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(sim: &'a mut Simulation, pid: ProcessId) -> Self {
        Self { sim, pid }
    }

    /// ID of the running process.
    #[must_use]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    delegate! {
        to self.sim {
            /// Current simulation time.
            #[must_use]
            pub fn now(&self) -> Time;
            /// Read-only access to the simulation clock.
            #[must_use]
            pub fn clock(&self) -> ClockRef;
            /// State of a process, or `None` if no such process exists.
            #[must_use]
            pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState>;
            /// Checks if a process has neither completed nor been cancelled.
            #[must_use]
            pub fn is_alive(&self, pid: ProcessId) -> bool;
            /// Cancels a process. See [`Simulation::cancel`].
            pub fn cancel(&mut self, pid: ProcessId) -> bool;
            /// Cancels a pending callback.
            pub fn cancel_event(&mut self, id: EventId) -> bool;
            /// Inspects a resource.
            #[must_use]
            pub fn resource(&self, id: ResourceId) -> &Resource;
            /// Inspects a buffer.
            #[must_use]
            pub fn buffer(&self, id: BufferId) -> &Buffer;
        }
    }

    /// Inspects a store.
    #[must_use]
    pub fn store<T: 'static>(&self, id: StoreId<T>) -> &Store<T> {
        self.sim.store(id)
    }

    /// Spawns a new process starting at the current time.
    pub fn process<P: Process + 'static>(&mut self, body: P) -> ProcessId {
        self.sim.process(body)
    }

    /// Spawns a new process starting at `time`. See [`Simulation::process_at`].
    ///
    /// # Errors
    ///
    /// Fails if `time` is invalid or in the past.
    pub fn process_at<P: Process + 'static>(
        &mut self,
        time: Time,
        body: P,
    ) -> Result<ProcessId, SimError> {
        self.sim.process_at(time, body)
    }

    /// Schedules a callback. See [`Simulation::schedule`].
    ///
    /// # Errors
    ///
    /// Fails if `time` is invalid or in the past.
    pub fn schedule<F>(&mut self, time: Time, callback: F) -> Result<EventId, SimError>
    where
        F: FnOnce(&mut Simulation) -> Result<(), SimError> + 'static,
    {
        self.sim.schedule(time, callback)
    }

    /// Releases a slot of `resource` held by this process, granting it to the next waiter.
    ///
    /// Returns `false` if the process was not holding the resource, e.g., after losing it to
    /// preemption.
    pub fn release(&mut self, resource: ResourceId) -> bool {
        self.sim.release(self.pid, resource)
    }

    /// Suspends the process for `delay` time units.
    ///
    /// # Errors
    ///
    /// Fails if `delay` is negative or not finite.
    pub fn timeout(&self, delay: Time) -> Result<Step, SimError> {
        crate::error::check_time(delay, "timeout delay").map(Step::Timeout)
    }

    /// Requests a slot of `resource` with the default priority. The request preempts
    /// lower-priority holders if the resource is configured as preemptive.
    #[must_use]
    pub fn request(&self, resource: ResourceId) -> Step {
        let preemptive = self.sim.resource(resource).is_preemptive();
        self.request_with(resource, crate::DEFAULT_PRIORITY, preemptive)
    }

    /// Requests a slot of `resource` with an explicit priority (lower values go first) and
    /// preemption flag.
    #[must_use]
    pub fn request_with(&self, resource: ResourceId, priority: Priority, preemptive: bool) -> Step {
        Step::Wait(WaitToken(Wait::Request {
            resource,
            priority,
            preemptive,
        }))
    }

    fn check_amount(amount: f64) -> Result<f64, SimError> {
        if amount.is_finite() && amount > 0.0 {
            Ok(amount)
        } else {
            Err(SimError::validation(format!(
                "amount must be positive and finite, got {}",
                amount
            )))
        }
    }

    /// Puts `amount` into `buffer`, waiting for space if needed.
    ///
    /// # Errors
    ///
    /// Fails if `amount` is not positive, or if it exceeds the capacity of the buffer, since such
    /// a put could never be satisfied.
    pub fn put(&self, buffer: BufferId, amount: f64) -> Result<Step, SimError> {
        let amount = Self::check_amount(amount)?;
        let capacity = self.sim.buffer(buffer).capacity();
        if amount > capacity {
            return Err(SimError::validation(format!(
                "cannot put {} into a buffer of capacity {}",
                amount, capacity
            )));
        }
        Ok(Step::Wait(WaitToken(Wait::Put { buffer, amount })))
    }

    /// Gets `amount` from `buffer`, waiting until it is available.
    ///
    /// # Errors
    ///
    /// Fails if `amount` is not positive.
    pub fn get(&self, buffer: BufferId, amount: f64) -> Result<Step, SimError> {
        let amount = Self::check_amount(amount)?;
        Ok(Step::Wait(WaitToken(Wait::Get { buffer, amount })))
    }

    /// Puts `item` into `store`, waiting for space if needed.
    #[must_use]
    pub fn store_put<T: 'static>(&self, store: StoreId<T>, item: T) -> Step {
        Step::Wait(put_token(store, item))
    }

    /// Prepares a get of the oldest item in `store`.
    #[must_use]
    pub fn store_get<T: 'static>(&self, store: StoreId<T>) -> StoreGet<T> {
        StoreGet::new(store, None)
    }

    /// Prepares a get of the oldest item of `store` accepted by `filter`.
    #[must_use]
    pub fn store_get_where<T, F>(&self, store: StoreId<T>, filter: F) -> StoreGet<T>
    where
        T: 'static,
        F: Fn(&T) -> bool + 'static,
    {
        StoreGet::new(store, Some(Rc::new(filter)))
    }

    /// Waits until `predicate` holds, checking it now and then every `options.interval` time
    /// units.
    ///
    /// # Errors
    ///
    /// Fails if `options` are invalid.
    pub fn wait_for<F>(&self, predicate: F, options: ConditionOptions) -> Result<Step, SimError>
    where
        F: FnMut(&Simulation) -> bool + 'static,
    {
        Condition::new(predicate, options).map(Step::WaitFor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wake_check() {
        assert!(matches!(Wake::Granted.check(), Ok(Wake::Granted)));
        assert!(matches!(
            Wake::Failed(SimError::custom("x")).check(),
            Err(SimError::Custom(_))
        ));
    }

    #[test]
    fn test_wake_returned() {
        let wake = Wake::Returned(Some(Box::new(7_u32)));
        assert_eq!(wake.returned::<u32>(), Some(7));
        let wake = Wake::Returned(Some(Box::new(7_u32)));
        assert_eq!(wake.returned::<String>(), None);
        assert_eq!(Wake::Returned(None).returned::<u32>(), None);
    }

    #[test]
    fn test_process_state() {
        assert!(ProcessState::Scheduled.is_alive());
        assert!(ProcessState::Suspended.is_alive());
        assert!(!ProcessState::Completed.is_alive());
        assert!(!ProcessState::Cancelled.is_alive());
        assert_eq!(ProcessState::Suspended.to_string(), "suspended");
    }

    #[test]
    fn test_context_validation() {
        let mut sim = Simulation::new();
        let tank = sim.add_buffer(100.0).unwrap();
        let ctx = Context::new(&mut sim, ProcessId::from(0));
        assert!(matches!(ctx.timeout(-1.0), Err(SimError::Validation(_))));
        assert!(matches!(ctx.timeout(2.0), Ok(Step::Timeout(d)) if d == 2.0));
        assert!(matches!(ctx.put(tank, 150.0), Err(SimError::Validation(_))));
        assert!(matches!(ctx.put(tank, 0.0), Err(SimError::Validation(_))));
        assert!(matches!(ctx.get(tank, -5.0), Err(SimError::Validation(_))));
        assert!(matches!(ctx.get(tank, f64::NAN), Err(SimError::Validation(_))));
        assert!(ctx.put(tank, 100.0).is_ok());
        assert_eq!(ctx.pid(), ProcessId::from(0));
        assert_eq!(ctx.now(), 0.0);
    }
}
