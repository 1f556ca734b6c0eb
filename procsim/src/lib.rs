//! Process-based discrete-event simulation.
//!
//! The kernel drives *processes*: explicit state machines that advance through simulated time
//! and compete for limited *resources*, *buffers*, and *stores*. A process is resumed with a
//! [`Wake`] describing why it was resumed, and answers with a [`Step`] describing how it wants
//! to be suspended next. Nothing happens between events, so idle time costs nothing.
//!
//! # Example
//!
//! Three customers share a single teller. Each one holds the teller for 5 time units.
//!
//! ```
//! # use procsim::*;
//! # fn main() -> Result<(), SimError> {
//! struct Customer {
//!     teller: ResourceId,
//! }
//!
//! impl Process for Customer {
//!     fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, SimError> {
//!         match wake.check()? {
//!             Wake::Start => Ok(ctx.request(self.teller)),
//!             Wake::Granted => ctx.timeout(5.0),
//!             _ => {
//!                 ctx.release(self.teller);
//!                 Ok(Step::Done)
//!             }
//!         }
//!     }
//! }
//!
//! let mut sim = Simulation::new();
//! let teller = sim.add_resource(1)?;
//! for _ in 0..3 {
//!     sim.process(Customer { teller });
//! }
//! sim.run()?;
//! assert_eq!(sim.now(), 15.0);
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::default_trait_access,
    clippy::cast_precision_loss
)]

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

mod buffer;
pub use buffer::Buffer;

mod condition;
pub use condition::Condition;

pub mod config;
pub use config::{BufferConfig, ConditionOptions, ResourceConfig, StoreConfig};

mod error;
pub use error::SimError;

pub mod models;

mod observe;
pub use observe::{spawn_csv_writer, CsvSender, Metric, Observation, Observer, Recorder};

mod process;
pub use process::{
    from_fn, Context, FnProcess, Preemption, Process, ProcessState, Step, Wake, WaitToken,
};

mod resource;
pub use resource::{Holder, Resource};

mod scheduler;
pub use scheduler::{Clock, ClockRef};

mod simulation;
pub use simulation::Simulation;

mod state;
pub use state::{BufferId, ResourceId, StoreId};

mod store;
pub use store::{Store, StoreGet};

/// Simulation time. Any finite, non-negative real number.
pub type Time = f64;

/// Request and event priority. Lower values take precedence.
pub type Priority = i64;

/// Priority used whenever the caller does not provide one.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Process ID, unique within a simulation for its whole lifetime (including resets).
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct ProcessId(usize);

/// ID of a scheduled event. It can be used to cancel a callback before it runs.
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct EventId(u64);

/// A process that a primitive has just satisfied, along with how long it waited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Woken {
    pub(crate) process: ProcessId,
    pub(crate) waited: Time,
}

/// Outcome of submitting a put or get to a buffer or a store.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Transfer {
    /// The submitting process was satisfied right away.
    pub(crate) done: bool,
    /// Other waiters satisfied as a consequence, in the order they must be resumed.
    pub(crate) woken: Vec<Woken>,
}

impl Transfer {
    pub(crate) fn done(woken: Vec<Woken>) -> Self {
        Self { done: true, woken }
    }

    pub(crate) fn queued() -> Self {
        Self::default()
    }
}
