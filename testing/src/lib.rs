//! Deterministic distributions and generators for simulation tests.

#![warn(
    missing_docs,
    rust_2018_idioms,
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

use std::cell::Cell;

use rand::distributions::Distribution;
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};

/// This distribution ignores the random number generator and returns the given values in order,
/// starting over after the last one.
///
/// This is meant for testing, e.g., to drive a model with inter-arrival and service times whose
/// outcome can be computed by hand.
pub struct CyclicDistribution<T> {
    values: Vec<T>,
    next: Cell<usize>,
}

impl<T> CyclicDistribution<T> {
    /// Constructs a new distribution cycling through `values`.
    ///
    /// # Panics
    ///
    /// Panics if `values` is empty.
    #[must_use]
    pub fn new(values: Vec<T>) -> Self {
        assert!(!values.is_empty(), "cyclic distribution needs values");
        Self {
            values,
            next: Cell::new(0),
        }
    }
}

impl<T: Copy> Distribution<T> for CyclicDistribution<T> {
    fn sample<R: rand::Rng + ?Sized>(&self, _: &mut R) -> T {
        let idx = self.next.get();
        self.next.set((idx + 1) % self.values.len());
        self.values[idx]
    }
}

/// A distribution always returning the same value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantDistribution(pub f64);

impl Distribution<f64> for ConstantDistribution {
    fn sample<R: rand::Rng + ?Sized>(&self, _: &mut R) -> f64 {
        self.0
    }
}

/// A seeded generator, so that tests using random values replay the same way.
#[must_use]
pub fn seeded(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}
