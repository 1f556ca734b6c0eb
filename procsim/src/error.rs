use std::fmt;

use crate::{ProcessId, Time};

/// Errors raised by the simulation kernel.
///
/// Validation errors are returned synchronously by the call that violates a contract; nothing is
/// silently clamped. Errors returned from a process step terminate that process and surface from
/// [`Simulation::run`](crate::Simulation::run) as [`SimError::ProcessFailed`].
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Bad constructor or call arguments, e.g., zero capacity or a negative amount.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// An attempt to schedule an event before the current simulation time.
    #[error("cannot schedule an event at {requested}: the clock is already at {now}")]
    InvalidTime {
        /// Requested time.
        requested: Time,
        /// Simulation time at the moment of the request.
        now: Time,
    },

    /// A condition wait exceeded its check budget.
    #[error("condition still false after {checks} checks ({elapsed} time units)")]
    ConditionTimeout {
        /// How many times the predicate was evaluated.
        checks: usize,
        /// Simulation time spent waiting.
        elapsed: Time,
    },

    /// The run loop was entered from inside an event it is dispatching.
    #[error("the simulation is already dispatching events")]
    ReentrantRun,

    /// A process step returned an error that no enclosing frame handled.
    #[error("process {process} failed at {time}")]
    ProcessFailed {
        /// Failed process.
        process: ProcessId,
        /// Simulation time of the failure.
        time: Time,
        /// The error returned by the process.
        #[source]
        source: Box<SimError>,
    },

    /// An error raised by user process code.
    #[error("{0}")]
    Custom(String),
}

impl SimError {
    pub(crate) fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Wraps any displayable value into a [`SimError::Custom`] error.
    pub fn custom<D: fmt::Display>(message: D) -> Self {
        Self::Custom(message.to_string())
    }

    /// Returns the innermost error, looking through [`SimError::ProcessFailed`] wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &SimError {
        match self {
            Self::ProcessFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Checks that `value` is a usable time value (finite and non-negative).
pub(crate) fn check_time(value: Time, what: &str) -> Result<Time, SimError> {
    if !value.is_finite() {
        Err(SimError::validation(format!("{} must be finite, got {}", what, value)))
    } else if value < 0.0 {
        Err(SimError::validation(format!("{} must be non-negative, got {}", what, value)))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_time() {
        assert_eq!(check_time(0.0, "delay").ok(), Some(0.0));
        assert_eq!(check_time(2.5, "delay").ok(), Some(2.5));
        assert!(matches!(check_time(-1.0, "delay"), Err(SimError::Validation(_))));
        assert!(matches!(check_time(f64::NAN, "delay"), Err(SimError::Validation(_))));
        assert!(matches!(check_time(f64::INFINITY, "delay"), Err(SimError::Validation(_))));
    }

    #[test]
    fn test_root_cause() {
        let err = SimError::ProcessFailed {
            process: ProcessId::from(3),
            time: 1.0,
            source: Box::new(SimError::custom("boom")),
        };
        assert!(matches!(err.root_cause(), SimError::Custom(msg) if msg == "boom"));
        assert_eq!(err.to_string(), "process 3 failed at 1");
    }
}
