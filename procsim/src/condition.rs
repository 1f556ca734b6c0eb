use std::fmt;

use crate::{ConditionOptions, SimError, Simulation, Time};

/// A predicate over the simulation state that a process can wait for.
///
/// The predicate is checked when the wait starts and then every `interval` time units, until it
/// holds or the check budget (`max_iterations`, counting the first check) runs out, in which case
/// the waiting process is resumed with [`SimError::ConditionTimeout`].
pub struct Condition {
    predicate: Box<dyn FnMut(&Simulation) -> bool>,
    options: ConditionOptions,
}

impl Condition {
    /// Constructs a condition.
    ///
    /// # Errors
    ///
    /// Fails if the interval is not positive and finite, or if `max_iterations` is zero.
    pub fn new<F>(predicate: F, options: ConditionOptions) -> Result<Self, SimError>
    where
        F: FnMut(&Simulation) -> bool + 'static,
    {
        options.validate()?;
        Ok(Self {
            predicate: Box::new(predicate),
            options,
        })
    }

    /// Options of this condition.
    #[must_use]
    pub fn options(&self) -> ConditionOptions {
        self.options
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("options", &self.options)
            .finish()
    }
}

/// Outcome of a single check.
#[derive(Debug)]
pub(crate) enum Poll {
    Met,
    Exhausted(SimError),
    /// Check again after the given time.
    Pending(Time),
}

/// A condition some process is waiting for.
#[derive(Debug)]
pub(crate) struct PendingCondition {
    condition: Condition,
    checks: usize,
    since: Time,
}

impl PendingCondition {
    pub(crate) fn new(condition: Condition, now: Time) -> Self {
        Self {
            condition,
            checks: 0,
            since: now,
        }
    }

    pub(crate) fn check(&mut self, sim: &Simulation) -> Poll {
        self.checks += 1;
        if (self.condition.predicate)(sim) {
            Poll::Met
        } else if self
            .condition
            .options
            .max_iterations
            .map_or(false, |max| self.checks >= max)
        {
            Poll::Exhausted(SimError::ConditionTimeout {
                checks: self.checks,
                elapsed: sim.now() - self.since,
            })
        } else {
            Poll::Pending(self.condition.options.interval)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_invalid_options() {
        assert!(Condition::new(|_| true, ConditionOptions::default().interval(-1.0)).is_err());
        assert!(Condition::new(|_| true, ConditionOptions::default().max_iterations(0)).is_err());
    }

    #[test]
    fn test_check_budget() {
        let sim = Simulation::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let condition = Condition::new(
            move |_| {
                counter.set(counter.get() + 1);
                false
            },
            ConditionOptions::default().interval(2.0).max_iterations(3),
        )
        .unwrap();
        let mut pending = PendingCondition::new(condition, 0.0);
        assert!(matches!(pending.check(&sim), Poll::Pending(interval) if interval == 2.0));
        assert!(matches!(pending.check(&sim), Poll::Pending(_)));
        assert!(matches!(
            pending.check(&sim),
            Poll::Exhausted(SimError::ConditionTimeout { checks: 3, .. })
        ));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_met() {
        let sim = Simulation::new();
        let condition = Condition::new(|sim| sim.now() >= 0.0, ConditionOptions::default()).unwrap();
        assert!(matches!(PendingCondition::new(condition, 0.0).check(&sim), Poll::Met));
    }
}
