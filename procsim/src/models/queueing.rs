//! Multi-server queue with a single waiting line (M/M/c when both distributions are
//! exponential).
//!
//! A source process spawns customers separated by inter-arrival times. Each customer requests one
//! of the `servers` slots of a resource, holds it for its service time, and releases it. Waiting
//! times are taken from the [`Metric::WaitTime`] observations of the server resource.

use rand::Rng;
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::{
    Context, Metric, Process, Recorder, ResourceConfig, ResourceId, SimError, Simulation, Step,
    Time, Wake,
};

/// Name of the server resource, as reported to observers.
pub const SERVER: &str = "server";

/// Configuration of an M/M/c queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueingConfig {
    /// Expected number of arrivals per time unit (λ).
    pub arrival_rate: f64,
    /// Expected number of customers served by one server per time unit (μ).
    pub service_rate: f64,
    /// Number of servers (c).
    pub servers: usize,
    /// Number of customers to generate.
    pub customers: usize,
    /// Seed of the random number generator.
    pub seed: u64,
}

impl Default for QueueingConfig {
    fn default() -> Self {
        Self {
            arrival_rate: 0.7,
            service_rate: 1.0,
            servers: 1,
            customers: 10_000,
            seed: 0,
        }
    }
}

impl QueueingConfig {
    /// Checks that the rates are positive and there is at least one server.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Validation`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), SimError> {
        for (name, rate) in [
            ("arrival rate", self.arrival_rate),
            ("service rate", self.service_rate),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(SimError::validation(format!(
                    "{} must be positive, got {}",
                    name, rate
                )));
            }
        }
        if self.servers == 0 {
            return Err(SimError::validation("there must be at least one server"));
        }
        Ok(())
    }

    /// Server utilization ρ = λ / (cμ).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.arrival_rate / (self.servers as f64 * self.service_rate)
    }

    /// Closed-form expected waiting time in the queue, ρ / (μ − λ), available for a single stable
    /// server.
    #[must_use]
    pub fn expected_wait(&self) -> Option<f64> {
        if self.servers == 1 && self.arrival_rate < self.service_rate {
            Some(self.utilization() / (self.service_rate - self.arrival_rate))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Arriving,
    Waiting,
    Serving,
}

/// A customer waiting for and occupying one server.
#[derive(Debug)]
pub struct Customer {
    server: ResourceId,
    service: Time,
    phase: Phase,
}

impl Customer {
    /// Constructs a customer that needs `service` time units of a server.
    #[must_use]
    pub fn new(server: ResourceId, service: Time) -> Self {
        Self {
            server,
            service,
            phase: Phase::Arriving,
        }
    }
}

impl Process for Customer {
    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, SimError> {
        wake.check()?;
        match self.phase {
            Phase::Arriving => {
                self.phase = Phase::Waiting;
                Ok(ctx.request(self.server))
            }
            Phase::Waiting => {
                self.phase = Phase::Serving;
                ctx.timeout(self.service)
            }
            Phase::Serving => {
                ctx.release(self.server);
                Ok(Step::Done)
            }
        }
    }
}

/// Spawns customers separated by inter-arrival times.
pub struct Source<R, A, S> {
    server: ResourceId,
    remaining: usize,
    rng: R,
    interarrival: A,
    service: S,
}

impl<R, A, S> Process for Source<R, A, S>
where
    R: Rng,
    A: Distribution<f64>,
    S: Distribution<f64>,
{
    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, SimError> {
        wake.check()?;
        if self.remaining == 0 {
            return Ok(Step::Done);
        }
        let service = self.service.sample(&mut self.rng);
        ctx.process(Customer::new(self.server, service));
        self.remaining -= 1;
        if self.remaining == 0 {
            Ok(Step::Done)
        } else {
            ctx.timeout(self.interarrival.sample(&mut self.rng))
        }
    }
}

/// Adds a queue with `servers` servers to `sim`, fed by `customers` customers. The first customer
/// arrives at the current time. Returns the server resource.
///
/// # Errors
///
/// Returns [`SimError::Validation`] if `servers` is zero.
pub fn build<R, A, S>(
    sim: &mut Simulation,
    servers: usize,
    customers: usize,
    rng: R,
    interarrival: A,
    service: S,
) -> Result<ResourceId, SimError>
where
    R: Rng + 'static,
    A: Distribution<f64> + 'static,
    S: Distribution<f64> + 'static,
{
    let server = sim.add_resource_with(ResourceConfig::new(servers).name(SERVER))?;
    sim.process(Source {
        server,
        remaining: customers,
        rng,
        interarrival,
        service,
    });
    Ok(server)
}

/// Adds an M/M/c queue described by `config` to `sim`, and returns a recorder collecting the
/// waiting times.
///
/// # Errors
///
/// Returns [`SimError::Validation`] if the configuration is invalid.
pub fn mm_c(sim: &mut Simulation, config: &QueueingConfig) -> Result<Recorder, SimError> {
    config.validate()?;
    let interarrival =
        Exp::new(config.arrival_rate).map_err(|err| SimError::validation(err.to_string()))?;
    let service =
        Exp::new(config.service_rate).map_err(|err| SimError::validation(err.to_string()))?;
    let recorder = Recorder::only(&[Metric::WaitTime]);
    sim.add_observer(recorder.clone());
    build(
        sim,
        config.servers,
        config.customers,
        ChaCha8Rng::seed_from_u64(config.seed),
        interarrival,
        service,
    )?;
    Ok(recorder)
}

/// Summary of a queueing run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueingReport {
    /// Number of customers that got a server.
    pub served: usize,
    /// Average time spent waiting for a server.
    pub average_wait: f64,
    /// Longest time spent waiting for a server.
    pub max_wait: f64,
    /// Closed-form expected wait, if known for the configuration.
    pub expected_wait: Option<f64>,
    /// Utilization ρ of the configuration.
    pub utilization: f64,
    /// Simulation time at which the report was taken.
    pub end_time: Time,
}

impl QueueingReport {
    /// Summarizes the waiting times collected by `recorder`.
    #[must_use]
    pub fn new(config: &QueueingConfig, recorder: &Recorder, end_time: Time) -> Self {
        let waits: Vec<f64> = recorder
            .series(SERVER, Metric::WaitTime)
            .into_iter()
            .map(|(_, wait)| wait)
            .collect();
        let served = waits.len();
        let average_wait = if served == 0 {
            0.0
        } else {
            waits.iter().sum::<f64>() / served as f64
        };
        Self {
            served,
            average_wait,
            max_wait: waits.iter().copied().fold(0.0, f64::max),
            expected_wait: config.expected_wait(),
            utilization: config.utilization(),
            end_time,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn test_closed_form() {
        let config = QueueingConfig::default();
        assert!(approx_eq!(f64, config.utilization(), 0.7));
        assert!(approx_eq!(
            f64,
            config.expected_wait().unwrap(),
            7.0 / 3.0,
            epsilon = 1e-12
        ));
        let unstable = QueueingConfig {
            arrival_rate: 2.0,
            ..QueueingConfig::default()
        };
        assert_eq!(unstable.expected_wait(), None);
        let multi = QueueingConfig {
            servers: 2,
            ..QueueingConfig::default()
        };
        assert!(approx_eq!(f64, multi.utilization(), 0.35));
        assert_eq!(multi.expected_wait(), None);
    }

    #[test]
    fn test_validate() {
        assert!(QueueingConfig::default().validate().is_ok());
        let config = QueueingConfig {
            service_rate: 0.0,
            ..QueueingConfig::default()
        };
        assert!(config.validate().is_err());
        let config = QueueingConfig {
            servers: 0,
            ..QueueingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize() {
        let config: QueueingConfig =
            serde_json::from_str(r#"{"arrival_rate": 0.5, "servers": 3}"#).unwrap();
        assert_eq!(config.servers, 3);
        assert_eq!(config.customers, 10_000);
    }
}
