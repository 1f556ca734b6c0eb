//! Ready-made models built on the public kernel API.

pub mod queueing;
