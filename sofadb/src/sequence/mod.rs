use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates opaque string ids that are unique and lexicographically
/// non-decreasing within a generator instance: a fixed-width hex timestamp,
/// a per-millisecond counter, and a random suffix.
#[derive(Debug)]
pub struct SequenceIdGenerator {
    last_millis: u64,
    counter: u32,
}

const COUNTER_MAX: u32 = 0xF_FFFF;

impl SequenceIdGenerator {
    pub fn new() -> SequenceIdGenerator {
        SequenceIdGenerator {
            last_millis: 0,
            counter: 0,
        }
    }

    pub fn next(&mut self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        if now > self.last_millis {
            self.last_millis = now;
            self.counter = 0;
        } else if self.counter < COUNTER_MAX {
            // Same millisecond, or the clock went backwards: keep the last
            // timestamp so ids stay ordered.
            self.counter += 1;
        } else {
            self.last_millis += 1;
            self.counter = 0;
        }

        let suffix: u32 = rand::thread_rng().gen();
        format!("{:012x}{:05x}{:08x}", self.last_millis, self.counter, suffix)
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        SequenceIdGenerator::new()
    }
}

/// Produces `(seq_number, seq_id)` pairs for the change log. The counter is
/// recovered from the change log on open; ids come from an embedded
/// [`SequenceIdGenerator`]. Not thread-safe on its own: callers invoke it
/// under the database write lock.
#[derive(Debug)]
pub struct ChangeSequenceGenerator {
    number: i64,
    last_id: String,
    ids: SequenceIdGenerator,
}

impl ChangeSequenceGenerator {
    pub fn new(last_number: i64, last_id: String) -> ChangeSequenceGenerator {
        ChangeSequenceGenerator {
            number: last_number,
            last_id,
            ids: SequenceIdGenerator::new(),
        }
    }

    pub fn next(&mut self) -> (i64, String) {
        self.number += 1;
        self.last_id = self.ids.next();
        (self.number, self.last_id.clone())
    }

    pub fn current(&self) -> (i64, &str) {
        (self.number, &self.last_id)
    }
}

/// Render a change sequence as the wire form `<seq_number>-<seq_id>`.
pub fn format_seq(number: i64, id: &str) -> String {
    format!("{number}-{id}")
}

/// Parse the wire form back into a pair. Unparseable input means "from the
/// beginning".
pub fn parse_seq(s: &str) -> (i64, String) {
    match s.split_once('-') {
        Some((number, id)) => (number.parse().unwrap_or(0), id.to_string()),
        None => (s.parse().unwrap_or(0), String::new()),
    }
}
