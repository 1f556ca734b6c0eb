//! Configuration of the contention primitives and condition waits.
//!
//! All structures can be deserialized, e.g., from JSON files; missing fields take their default
//! values.

use serde::{Deserialize, Serialize};

use crate::{SimError, Time};

/// Configuration of a [`Resource`](crate::Resource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Name reported to observers. Generated when missing.
    pub name: Option<String>,
    /// Number of slots. Must be at least 1.
    pub capacity: usize,
    /// Whether plain requests (see [`Context::request`](crate::Context::request)) preempt
    /// lower-priority holders.
    pub preemptive: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            name: None,
            capacity: 1,
            preemptive: false,
        }
    }
}

impl ResourceConfig {
    /// Constructs a configuration of a non-preemptive resource with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Sets the name reported to observers.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Makes plain requests preemptive.
    #[must_use]
    pub fn preemptive(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SimError> {
        if self.capacity < 1 {
            return Err(SimError::validation(format!(
                "resource capacity must be at least 1, got {}",
                self.capacity
            )));
        }
        Ok(())
    }
}

/// Configuration of a [`Buffer`](crate::Buffer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Name reported to observers. Generated when missing.
    pub name: Option<String>,
    /// Maximum level. Must be positive; may be infinite.
    pub capacity: f64,
    /// Level at the start of the simulation and after every reset.
    pub initial: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            name: None,
            capacity: f64::INFINITY,
            initial: 0.0,
        }
    }
}

impl BufferConfig {
    /// Constructs a configuration of an initially empty buffer.
    #[must_use]
    pub fn new(capacity: f64) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Sets the name reported to observers.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the initial level.
    #[must_use]
    pub fn initial(mut self, initial: f64) -> Self {
        self.initial = initial;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SimError> {
        if self.capacity.is_nan() || self.capacity <= 0.0 {
            return Err(SimError::validation(format!(
                "buffer capacity must be positive, got {}",
                self.capacity
            )));
        }
        if !self.initial.is_finite() || self.initial < 0.0 || self.initial > self.capacity {
            return Err(SimError::validation(format!(
                "initial level must be within [0, {}], got {}",
                self.capacity, self.initial
            )));
        }
        Ok(())
    }
}

/// Configuration of a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name reported to observers. Generated when missing.
    pub name: Option<String>,
    /// Maximum number of items. Must be positive.
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: None,
            capacity: usize::MAX,
        }
    }
}

impl StoreConfig {
    /// Constructs a configuration of a store holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Sets the name reported to observers.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn validate(&self, initial_items: usize) -> Result<(), SimError> {
        if self.capacity == 0 {
            return Err(SimError::validation("store capacity must be positive"));
        }
        if initial_items > self.capacity {
            return Err(SimError::validation(format!(
                "{} initial items exceed the store capacity of {}",
                initial_items, self.capacity
            )));
        }
        Ok(())
    }
}

/// Options of a condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionOptions {
    /// Time between two consecutive checks of the predicate.
    pub interval: Time,
    /// Maximum number of checks, including the first one. Unlimited if `None`.
    pub max_iterations: Option<usize>,
}

impl Default for ConditionOptions {
    fn default() -> Self {
        Self {
            interval: 1.0,
            max_iterations: None,
        }
    }
}

impl ConditionOptions {
    /// Sets the time between checks.
    #[must_use]
    pub fn interval(mut self, interval: Time) -> Self {
        self.interval = interval;
        self
    }

    /// Limits the number of checks.
    #[must_use]
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SimError> {
        if !self.interval.is_finite() || self.interval <= 0.0 {
            return Err(SimError::validation(format!(
                "condition interval must be positive and finite, got {}",
                self.interval
            )));
        }
        if self.max_iterations == Some(0) {
            return Err(SimError::validation("max_iterations must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_resource() {
        assert!(ResourceConfig::new(1).validate().is_ok());
        assert!(ResourceConfig::new(0).validate().is_err());
    }

    #[test]
    fn test_validate_buffer() {
        assert!(BufferConfig::new(100.0).validate().is_ok());
        assert!(BufferConfig::default().initial(5.0).validate().is_ok());
        assert!(BufferConfig::new(0.0).validate().is_err());
        assert!(BufferConfig::new(-1.0).validate().is_err());
        assert!(BufferConfig::new(f64::NAN).validate().is_err());
        assert!(BufferConfig::new(10.0).initial(11.0).validate().is_err());
        assert!(BufferConfig::new(10.0).initial(-1.0).validate().is_err());
    }

    #[test]
    fn test_validate_store() {
        assert!(StoreConfig::new(2).validate(2).is_ok());
        assert!(StoreConfig::new(2).validate(3).is_err());
        assert!(StoreConfig::new(0).validate(0).is_err());
    }

    #[test]
    fn test_validate_condition() {
        assert!(ConditionOptions::default().validate().is_ok());
        assert!(ConditionOptions::default().interval(0.0).validate().is_err());
        assert!(ConditionOptions::default().max_iterations(0).validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ResourceConfig = serde_json::from_str(r#"{"capacity": 3}"#).unwrap();
        assert_eq!(config, ResourceConfig::new(3));
        let config: BufferConfig =
            serde_json::from_str(r#"{"name": "tank", "capacity": 50.0, "initial": 10.0}"#).unwrap();
        assert_eq!(config, BufferConfig::new(50.0).name("tank").initial(10.0));
        let options: ConditionOptions = serde_json::from_str(r#"{"interval": 0.5}"#).unwrap();
        assert_eq!(options.max_iterations, None);
    }
}
