use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::Time;

/// Kind of value reported by the kernel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Number of held slots of a resource, after every change.
    Occupancy,
    /// Number of waiting requests of a resource, after every change.
    QueueLength,
    /// Level of a buffer, after every change.
    Level,
    /// Number of items in a store, after every change.
    Items,
    /// Time between a request (or transfer) and its satisfaction, reported once per satisfied
    /// request, including the ones satisfied right away.
    WaitTime,
    /// Counter: a resource request was made.
    Requests,
    /// Counter: a resource holder was preempted.
    Preemptions,
    /// Counter: a buffer or store put was submitted.
    Puts,
    /// Counter: a buffer or store get was submitted.
    Gets,
    /// Counter: a process was cancelled.
    Cancellations,
}

/// A single raw `(timestamp, value)` observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// Simulation time of the observation.
    pub time: Time,
    /// Name of the primitive, or `process` for process lifecycle counters.
    pub source: String,
    /// What is observed.
    pub metric: Metric,
    /// The observed value; `1` for counters.
    pub value: f64,
}

impl Observation {
    /// Header line of the CSV format produced by [`Observation::to_csv_record`].
    #[must_use]
    pub fn csv_header() -> &'static str {
        "time,source,metric,value\n"
    }

    /// Formats the observation as a CSV line.
    #[must_use]
    pub fn to_csv_record(&self) -> String {
        format!(
            "{},{},{},{}\n",
            self.time, self.source, self.metric, self.value
        )
    }
}

/// Receives observations as the simulation runs.
///
/// Observers only consume values; aggregations such as time-weighted averages are left to them.
pub trait Observer {
    /// Called for every observation.
    fn observe(&mut self, observation: &Observation);
}

/// An in-memory observer.
///
/// Clones share the same records, so a clone can be registered with the simulation while the
/// original is kept for reading.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    records: Rc<RefCell<Vec<Observation>>>,
    only: Option<Vec<Metric>>,
}

impl Recorder {
    /// Records only the given metrics.
    #[must_use]
    pub fn only(metrics: &[Metric]) -> Self {
        Self {
            records: Rc::default(),
            only: Some(metrics.to_vec()),
        }
    }

    /// All recorded observations.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        self.records.borrow().clone()
    }

    /// `(time, value)` pairs of `metric` reported by `source`.
    #[must_use]
    pub fn series(&self, source: &str, metric: Metric) -> Vec<(Time, f64)> {
        self.records
            .borrow()
            .iter()
            .filter(|o| o.source == source && o.metric == metric)
            .map(|o| (o.time, o.value))
            .collect()
    }

    /// Number of observations of `metric` reported by `source`.
    #[must_use]
    pub fn count(&self, source: &str, metric: Metric) -> usize {
        self.records
            .borrow()
            .iter()
            .filter(|o| o.source == source && o.metric == metric)
            .count()
    }

    /// Drops all records.
    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }
}

impl Observer for Recorder {
    fn observe(&mut self, observation: &Observation) {
        if self
            .only
            .as_ref()
            .map_or(true, |only| only.contains(&observation.metric))
        {
            self.records.borrow_mut().push(observation.clone());
        }
    }
}

/// Sends observations as CSV lines through a channel, e.g., to a writer thread started with
/// [`spawn_csv_writer`].
pub struct CsvSender(Sender<String>);

impl CsvSender {
    /// Creates a new sender and sends the CSV header right away.
    #[must_use]
    pub fn new(sender: Sender<String>) -> Self {
        if sender.send(String::from(Observation::csv_header())).is_err() {
            log::warn!("Observation channel closed before the header was sent");
        }
        Self(sender)
    }
}

impl Observer for CsvSender {
    fn observe(&mut self, observation: &Observation) {
        if self.0.send(observation.to_csv_record()).is_err() {
            log::warn!("Observation channel closed");
        }
    }
}

/// Writes everything received from `receiver` to `writer` on a separate thread.
///
/// The thread finishes once all senders are dropped, handing the writer back.
pub fn spawn_csv_writer<W, T>(mut writer: W, receiver: Receiver<T>) -> JoinHandle<io::Result<W>>
where
    W: io::Write + Send + 'static,
    T: AsRef<[u8]> + Send + 'static,
{
    std::thread::spawn(move || {
        while let Ok(msg) = receiver.recv() {
            writer.write_all(msg.as_ref())?;
        }
        writer.flush()?;
        Ok(writer)
    })
}

/// Observers registered with a simulation.
#[derive(Default)]
pub(crate) struct Observers(Vec<Box<dyn Observer>>);

impl Observers {
    pub(crate) fn push(&mut self, observer: Box<dyn Observer>) {
        self.0.push(observer);
    }

    pub(crate) fn emit(&mut self, time: Time, source: &str, metric: Metric, value: f64) {
        if self.0.is_empty() {
            return;
        }
        let observation = Observation {
            time,
            source: source.to_owned(),
            metric,
            value,
        };
        for observer in &mut self.0 {
            observer.observe(&observation);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn observation(metric: Metric, value: f64) -> Observation {
        Observation {
            time: 1.5,
            source: String::from("server"),
            metric,
            value,
        }
    }

    #[test]
    fn test_csv_record() {
        assert_eq!(
            observation(Metric::WaitTime, 2.0).to_csv_record(),
            "1.5,server,wait_time,2\n"
        );
        assert_eq!(Observation::csv_header(), "time,source,metric,value\n");
    }

    #[test]
    fn test_recorder_filters_metrics() {
        let recorder = Recorder::only(&[Metric::WaitTime]);
        let mut observers = Observers::default();
        observers.push(Box::new(recorder.clone()));
        observers.emit(0.0, "server", Metric::WaitTime, 1.0);
        observers.emit(0.0, "server", Metric::Occupancy, 1.0);
        observers.emit(2.0, "server", Metric::WaitTime, 3.0);
        assert_eq!(
            recorder.series("server", Metric::WaitTime),
            vec![(0.0, 1.0), (2.0, 3.0)]
        );
        assert_eq!(recorder.count("server", Metric::Occupancy), 0);
        recorder.clear();
        assert!(recorder.observations().is_empty());
    }

    #[test]
    fn test_csv_sender_survives_closed_channel() {
        let (sender, receiver) = std::sync::mpsc::channel();
        drop(receiver);
        let mut csv = CsvSender::new(sender);
        csv.observe(&observation(Metric::Gets, 1.0));
    }

    #[test]
    fn test_csv_writer() {
        let (sender, receiver) = std::sync::mpsc::channel();
        let mut csv = CsvSender::new(sender);
        csv.observe(&observation(Metric::Level, 40.0));
        drop(csv);
        let output = spawn_csv_writer(Vec::<u8>::new(), receiver)
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "time,source,metric,value\n1.5,server,level,40\n"
        );
    }
}
