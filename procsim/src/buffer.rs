use std::collections::VecDeque;

use crate::config::BufferConfig;
use crate::{ProcessId, Time, Transfer, Woken};

#[derive(Debug, Clone, Copy)]
struct Pending {
    process: ProcessId,
    amount: f64,
    since: Time,
}

impl Pending {
    fn woken(&self, now: Time) -> Woken {
        Woken {
            process: self.process,
            waited: now - self.since,
        }
    }
}

/// A continuous quantity with a capacity, filled by puts and drained by gets.
///
/// Both queues are strictly first-in, first-out: a request that cannot be satisfied blocks every
/// request behind it, and requests are never partially fulfilled.
#[derive(Debug)]
pub struct Buffer {
    name: String,
    capacity: f64,
    initial: f64,
    level: f64,
    puts: VecDeque<Pending>,
    gets: VecDeque<Pending>,
}

impl Buffer {
    pub(crate) fn new(name: String, config: &BufferConfig) -> Self {
        Self {
            name,
            capacity: config.capacity,
            initial: config.initial,
            level: config.initial,
            puts: VecDeque::new(),
            gets: VecDeque::new(),
        }
    }

    /// Name reported to observers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum level.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Current level.
    #[must_use]
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Number of waiting puts.
    #[must_use]
    pub fn put_queue_len(&self) -> usize {
        self.puts.len()
    }

    /// Number of waiting gets.
    #[must_use]
    pub fn get_queue_len(&self) -> usize {
        self.gets.len()
    }

    pub(crate) fn put(&mut self, process: ProcessId, amount: f64, now: Time) -> Transfer {
        if self.puts.is_empty() && self.level + amount <= self.capacity {
            self.level += amount;
            Transfer::done(self.settle(now))
        } else {
            self.puts.push_back(Pending {
                process,
                amount,
                since: now,
            });
            Transfer::queued()
        }
    }

    pub(crate) fn get(&mut self, process: ProcessId, amount: f64, now: Time) -> Transfer {
        if self.gets.is_empty() && amount <= self.level {
            self.level -= amount;
            Transfer::done(self.settle(now))
        } else {
            self.gets.push_back(Pending {
                process,
                amount,
                since: now,
            });
            Transfer::queued()
        }
    }

    /// Satisfies queued requests until neither queue can make progress.
    fn settle(&mut self, now: Time) -> Vec<Woken> {
        let mut woken = Vec::new();
        loop {
            let before = woken.len();
            while let Some(get) = self.gets.front().copied() {
                if get.amount > self.level {
                    break;
                }
                self.level -= get.amount;
                self.gets.pop_front();
                woken.push(get.woken(now));
            }
            while let Some(put) = self.puts.front().copied() {
                if self.level + put.amount > self.capacity {
                    break;
                }
                self.level += put.amount;
                self.puts.pop_front();
                woken.push(put.woken(now));
            }
            if woken.len() == before {
                break;
            }
        }
        woken
    }

    /// Withdraws a waiting request of `process`. Removing the head of a queue may unblock the
    /// requests behind it, which are returned.
    pub(crate) fn remove_waiter(&mut self, process: ProcessId, now: Time) -> Vec<Woken> {
        self.puts.retain(|p| p.process != process);
        self.gets.retain(|p| p.process != process);
        self.settle(now)
    }

    pub(crate) fn reset(&mut self) {
        self.level = self.initial;
        self.puts.clear();
        self.gets.clear();
    }
}
