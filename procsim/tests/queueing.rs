use float_cmp::approx_eq;
use procsim::models::queueing::{self, QueueingConfig, QueueingReport, SERVER};
use procsim::{Metric, Recorder, SimError, Simulation};
use testing::{seeded, ConstantDistribution, CyclicDistribution};

fn replicate(config: &QueueingConfig) -> Result<QueueingReport, SimError> {
    let mut sim = Simulation::new();
    let recorder = queueing::mm_c(&mut sim, config)?;
    sim.run()?;
    Ok(QueueingReport::new(config, &recorder, sim.now()))
}

#[test]
fn test_mm1_average_wait_matches_closed_form() -> Result<(), SimError> {
    let replications = 20;
    let mut total = 0.0;
    for seed in 0..replications {
        let config = QueueingConfig {
            seed,
            ..QueueingConfig::default()
        };
        let report = replicate(&config)?;
        assert_eq!(report.served, config.customers);
        total += report.average_wait;
    }
    let average = total / replications as f64;
    let expected = 7.0 / 3.0;
    assert!(
        (average - expected).abs() / expected < 0.1,
        "average wait {} too far from {}",
        average,
        expected
    );
    Ok(())
}

#[test]
fn test_same_seed_replays() -> Result<(), SimError> {
    let config = QueueingConfig {
        customers: 1_000,
        seed: 17,
        ..QueueingConfig::default()
    };
    assert_eq!(replicate(&config)?, replicate(&config)?);
    let other = QueueingConfig {
        seed: 18,
        ..config.clone()
    };
    assert_ne!(replicate(&config)?, replicate(&other)?);
    Ok(())
}

#[test]
fn test_deterministic_queue() -> Result<(), SimError> {
    let mut sim = Simulation::new();
    let recorder = Recorder::only(&[Metric::WaitTime]);
    sim.add_observer(recorder.clone());
    queueing::build(
        &mut sim,
        1,
        3,
        seeded(0),
        CyclicDistribution::new(vec![1.0]),
        CyclicDistribution::new(vec![2.0]),
    )?;
    sim.run()?;
    assert_eq!(
        recorder.series(SERVER, Metric::WaitTime),
        vec![(0.0, 0.0), (2.0, 1.0), (4.0, 2.0)]
    );
    let report = QueueingReport::new(&QueueingConfig::default(), &recorder, sim.now());
    assert_eq!(report.served, 3);
    assert!(approx_eq!(f64, report.average_wait, 1.0));
    assert!(approx_eq!(f64, report.max_wait, 2.0));
    assert!(approx_eq!(f64, report.end_time, 6.0));
    Ok(())
}

#[test]
fn test_enough_servers_means_no_waiting() -> Result<(), SimError> {
    let mut sim = Simulation::new();
    let recorder = Recorder::only(&[Metric::WaitTime]);
    sim.add_observer(recorder.clone());
    let server = queueing::build(
        &mut sim,
        3,
        30,
        seeded(1),
        ConstantDistribution(1.0),
        ConstantDistribution(2.5),
    )?;
    sim.run()?;
    let waits = recorder.series(SERVER, Metric::WaitTime);
    assert_eq!(waits.len(), 30);
    assert!(waits.iter().all(|&(_, wait)| wait == 0.0));
    assert_eq!(sim.resource(server).in_use(), 0);
    assert!(approx_eq!(f64, sim.now(), 31.5));
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut sim = Simulation::new();
    let config = QueueingConfig {
        arrival_rate: -1.0,
        ..QueueingConfig::default()
    };
    assert!(matches!(
        queueing::mm_c(&mut sim, &config),
        Err(SimError::Validation(_))
    ));
    assert_eq!(sim.pending_events(), 0);
}
