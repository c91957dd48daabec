/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::io;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use flexi_logger::{writers::LogWriter, DeferredNow, Level, Record};

use super::stats;

#[derive(Default)]
struct Counter {
    error: AtomicU64,
    warning: AtomicU64,
}

// A writer calculating log count by level without actually writing log
pub struct LogLevelWriter(Arc<Counter>);

impl LogLevelWriter {
    pub fn new() -> (Self, LogLevelCounter) {
        let c = Arc::new(Counter::default());
        (Self(c.clone()), LogLevelCounter(Arc::downgrade(&c)))
    }
}

impl LogWriter for LogLevelWriter {
    fn write(&self, _: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        match record.level() {
            Level::Error => &self.0.error,
            Level::Warn => &self.0.warning,
            _ => return Ok(()),
        }
        .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub struct LogLevelCounter(Weak<Counter>);

impl stats::OwnedCountable for LogLevelCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        match self.0.upgrade() {
            Some(counters) => vec![
                (
                    "error",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counters.error.swap(0, Ordering::Relaxed)),
                ),
                (
                    "warning",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counters.warning.swap(0, Ordering::Relaxed)),
                ),
            ],
            None => vec![],
        }
    }

    fn closed(&self) -> bool {
        self.0.strong_count() == 0
    }
}

pub struct LogWriterAdapter(Vec<Box<dyn LogWriter>>);

impl LogWriterAdapter {
    pub fn new(writers: Vec<Box<dyn LogWriter>>) -> Self {
        Self(writers)
    }
}

impl LogWriter for LogWriterAdapter {
    fn write(&self, now: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        self.0
            .iter()
            .fold(Ok(()), |r, w| r.or(w.write(now, record)))
    }

    fn flush(&self) -> io::Result<()> {
        self.0.iter().fold(Ok(()), |r, w| r.or(w.flush()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use stats::OwnedCountable;

    #[test]
    fn level_writer_counts_warnings_and_errors() {
        let (writer, counter) = LogLevelWriter::new();
        let mut now = DeferredNow::new();
        for (level, times) in [(Level::Error, 3), (Level::Warn, 2), (Level::Info, 5)] {
            for _ in 0..times {
                let record = Record::builder().level(level).build();
                writer.write(&mut now, &record).unwrap();
            }
        }
        let points = counter.get_counters();
        assert_eq!(points[0].0, "error");
        assert_eq!(points[0].2, stats::CounterValue::Unsigned(3));
        assert_eq!(points[1].0, "warning");
        assert_eq!(points[1].2, stats::CounterValue::Unsigned(2));
        // counters reset after read
        assert_eq!(
            counter.get_counters()[0].2,
            stats::CounterValue::Unsigned(0)
        );
        drop(writer);
        assert!(counter.closed());
    }
}
