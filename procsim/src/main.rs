//! Runs an M/M/c queueing simulation and prints a summary.
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

use std::fs::File;
use std::io;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use eyre::WrapErr;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use serde::Serialize;

use procsim::models::queueing::{self, QueueingConfig, QueueingReport};
use procsim::{spawn_csv_writer, CsvSender, Simulation};

/// Runs a multi-server queueing simulation.
#[derive(Parser)]
#[command(version, about)]
struct Opt {
    /// JSON file with the queue configuration. Overrides the rate and size options.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Expected number of arrivals per time unit.
    #[arg(long, default_value_t = 0.7)]
    arrival_rate: f64,

    /// Expected number of customers served by one server per time unit.
    #[arg(long, default_value_t = 1.0)]
    service_rate: f64,

    /// Number of servers.
    #[arg(long, default_value_t = 1)]
    servers: usize,

    /// Number of customers.
    #[arg(long, default_value_t = 10_000)]
    customers: usize,

    /// Seed of the first replication; replication `i` uses `seed + i`.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of independent replications.
    #[arg(short, long, default_value_t = 1)]
    replications: u64,

    /// Simulation time between two progress bar updates.
    #[arg(long, default_value_t = 100.0)]
    slice: f64,

    /// Write all observations of the first replication to this CSV file.
    #[arg(long)]
    observations: Option<PathBuf>,

    /// Verbosity.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Store the logs in this file.
    #[arg(long)]
    log_output: Option<PathBuf>,

    /// Do not log to the stderr.
    #[arg(long)]
    no_stderr: bool,
}

impl Opt {
    fn queueing_config(&self) -> eyre::Result<QueueingConfig> {
        if let Some(path) = &self.config {
            let file = File::open(path)
                .wrap_err_with(|| format!("unable to open config: {}", path.display()))?;
            serde_json::from_reader(file).wrap_err("unable to parse config")
        } else {
            Ok(QueueingConfig {
                arrival_rate: self.arrival_rate,
                service_rate: self.service_rate,
                servers: self.servers,
                customers: self.customers,
                seed: self.seed,
            })
        }
    }
}

#[derive(Serialize)]
struct Summary {
    config: QueueingConfig,
    average_wait: f64,
    wait_range: Option<(f64, f64)>,
    expected_wait: Option<f64>,
    replications: Vec<QueueingReport>,
}

/// Runs a single replication, drawing a progress bar unless `quiet`.
fn replicate(
    config: &QueueingConfig,
    slice: f64,
    observations: Option<&PathBuf>,
    quiet: bool,
) -> eyre::Result<QueueingReport> {
    let mut sim = Simulation::new();
    let writer = if let Some(path) = observations {
        let (sender, receiver) = std::sync::mpsc::channel();
        sim.add_observer(CsvSender::new(sender));
        let file = File::create(path)
            .wrap_err_with(|| format!("unable to create {}", path.display()))?;
        Some(spawn_csv_writer(io::BufWriter::new(file), receiver))
    } else {
        None
    };
    let recorder = queueing::mm_c(&mut sim, config)?;

    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(config.customers as u64)
            .with_style(ProgressStyle::default_bar().template("{msg} {wide_bar} {percent}%")?)
    };
    while sim.peek_time().is_some() {
        sim.run_until(sim.now() + slice)?;
        let report = QueueingReport::new(config, &recorder, sim.now());
        pb.set_position(report.served as u64);
        pb.set_message(format!(
            "[t={time:.0}] [S={served}] [W={wait:.3}]",
            time = sim.now(),
            served = report.served,
            wait = report.average_wait,
        ));
    }
    pb.finish_and_clear();
    let report = QueueingReport::new(config, &recorder, sim.now());
    log::info!(
        "Seed {}: {} customers, average wait {:.4}",
        config.seed,
        report.served,
        report.average_wait
    );

    drop(sim);
    if let Some(writer) = writer {
        writer
            .join()
            .map_err(|_| eyre::eyre!("observation writer panicked"))?
            .wrap_err("unable to write observations")?;
    }
    Ok(report)
}

/// Set up a logger based on the given user options.
fn set_up_logger(opt: &Opt) -> Result<(), fern::InitError> {
    let log_level = match opt.verbose {
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        3.. => log::LevelFilter::Trace,
        _ => log::LevelFilter::Warn,
    };
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)))
        .level(log_level);
    let dispatch = if let Some(path) = &opt.log_output {
        let _ = std::fs::remove_file(path);
        dispatch.chain(
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        )
    } else {
        dispatch
    };
    let dispatch = if opt.no_stderr {
        dispatch
    } else {
        dispatch.chain(io::stderr())
    };
    dispatch.apply()?;
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();
    set_up_logger(&opt)?;
    let config = opt.queueing_config()?;
    config.validate()?;
    if !opt.slice.is_finite() || opt.slice <= 0.0 {
        eyre::bail!("slice must be positive, got {}", opt.slice);
    }

    let replications = (0..opt.replications.max(1))
        .map(|i| {
            let config = QueueingConfig {
                seed: config.seed + i,
                ..config.clone()
            };
            let observations = if i == 0 { opt.observations.as_ref() } else { None };
            replicate(&config, opt.slice, observations, opt.no_stderr)
        })
        .collect::<eyre::Result<Vec<_>>>()?;
    let average_wait = replications
        .iter()
        .map(|report| report.average_wait)
        .sum::<f64>()
        / replications.len() as f64;
    let summary = Summary {
        expected_wait: config.expected_wait(),
        config,
        average_wait,
        wait_range: replications
            .iter()
            .map(|report| report.average_wait)
            .minmax()
            .into_option(),
        replications,
    };
    serde_json::to_writer_pretty(io::stdout(), &summary)?;
    println!();
    Ok(())
}
