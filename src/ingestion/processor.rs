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

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use super::{QUEUE_READ_TIMEOUT, STOP_TIMEOUT};
use crate::common::FeatureRecord;
use crate::sink::FeatureSink;
use public::{
    counter::{Counter, CounterType, CounterValue, RefCountable},
    queue::{Error, Receiver},
};

#[derive(Default)]
pub struct RecordProcessorCounter {
    drained: AtomicU64,
    sink_errors: AtomicU64,
}

impl RefCountable for RecordProcessorCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "drained",
                CounterType::Counted,
                CounterValue::Unsigned(self.drained.swap(0, Ordering::Relaxed)),
            ),
            (
                "sink_errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.sink_errors.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// Single consumer behind the ingestion queue.
///
/// Records are handed to the sink one at a time in arrival order. After
/// each record the thread yields briefly so producers never starve while
/// the queue runs hot.
pub struct RecordProcessor {
    input: Arc<Receiver<Box<FeatureRecord>>>,
    sink: Option<Box<dyn FeatureSink>>,
    yield_duration: Duration,

    thread_handle: Option<JoinHandle<()>>,

    running: Arc<AtomicBool>,

    metrics: Arc<RecordProcessorCounter>,
}

impl RecordProcessor {
    pub fn new(
        input: Receiver<Box<FeatureRecord>>,
        sink: Box<dyn FeatureSink>,
        yield_duration: Duration,
    ) -> (Self, Arc<RecordProcessorCounter>) {
        let metrics = Arc::new(RecordProcessorCounter::default());
        (
            Self {
                input: Arc::new(input),
                sink: Some(sink),
                yield_duration,
                thread_handle: None,
                running: Arc::new(AtomicBool::new(false)),
                metrics: metrics.clone(),
            },
            metrics,
        )
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("record processor already started, do nothing.");
            return;
        }

        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => {
                warn!("record processor has no sink to run with, do nothing.");
                self.running.store(false, Ordering::Relaxed);
                return;
            }
        };
        let input = self.input.clone();
        let running = self.running.clone();
        let metrics = self.metrics.clone();
        let yield_duration = self.yield_duration;
        self.thread_handle = Some(
            thread::Builder::new()
                .name("record-processor".to_owned())
                .spawn(move || Self::process(input, sink, yield_duration, running, metrics))
                .unwrap(),
        );
        info!("record processor started");
    }

    pub fn notify_stop(&mut self) -> Option<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("record processor already stopped, do nothing.");
            return None;
        }
        info!("notify stopping record processor");
        self.thread_handle.take()
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("record processor already stopped, do nothing.");
            return;
        }
        info!("stopping record processor");
        if let Some(handle) = self.thread_handle.take() {
            // the record in hand finishes before the loop rechecks the flag
            let deadline = Instant::now() + STOP_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("stopped record processor");
            } else {
                warn!(
                    "record processor did not stop within {:?}, abandoning join",
                    STOP_TIMEOUT
                );
            }
        }
    }

    fn process(
        input: Arc<Receiver<Box<FeatureRecord>>>,
        mut sink: Box<dyn FeatureSink>,
        yield_duration: Duration,
        running: Arc<AtomicBool>,
        metrics: Arc<RecordProcessorCounter>,
    ) {
        while running.load(Ordering::Relaxed) {
            match input.recv(Some(QUEUE_READ_TIMEOUT)) {
                Ok(record) => {
                    metrics.drained.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = sink.consume(*record) {
                        metrics.sink_errors.fetch_add(1, Ordering::Relaxed);
                        error!("feature sink failed: {}", e);
                    }
                    if !yield_duration.is_zero() {
                        thread::sleep(yield_duration);
                    }
                }
                Err(Error::Timeout) => continue,
                Err(Error::Terminated(..)) => break,
                Err(Error::Full(_)) => unreachable!(),
            }
        }
        info!("record processor exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::error::{Error as SinkError, Result};
    use public::queue;

    struct CollectSink {
        collected: Arc<Mutex<Vec<FeatureRecord>>>,
        fail_on_packet_count: Option<u64>,
    }

    impl FeatureSink for CollectSink {
        fn consume(&mut self, record: FeatureRecord) -> Result<()> {
            if Some(record.packet_count) == self.fail_on_packet_count {
                return Err(SinkError::InvalidFeatureVector("boom".to_owned()));
            }
            self.collected.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn record_with_count(packet_count: u64) -> Box<FeatureRecord> {
        Box::new(FeatureRecord {
            packet_count,
            ..Default::default()
        })
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn drains_queue_in_order() {
        let (sender, receiver, _) = queue::bounded(16);
        let collected = Arc::new(Mutex::new(vec![]));
        let sink = Box::new(CollectSink {
            collected: collected.clone(),
            fail_on_packet_count: None,
        });
        let (mut processor, counter) =
            RecordProcessor::new(receiver, sink, Duration::from_millis(1));

        for i in 1..=3 {
            sender.send(record_with_count(i)).unwrap();
        }
        processor.start();
        wait_for(|| collected.lock().unwrap().len() == 3);
        processor.stop();

        let collected = collected.lock().unwrap();
        let counts: Vec<u64> = collected.iter().map(|r| r.packet_count).collect();
        assert_eq!(counts, vec![1, 2, 3]);
        assert_eq!(sender.len(), 0);
        assert_eq!(
            counter.get_counters()[0].2,
            CounterValue::Unsigned(3),
            "all records counted as drained"
        );
    }

    #[test]
    fn sink_error_drops_record_and_continues() {
        let (sender, receiver, _) = queue::bounded(16);
        let collected = Arc::new(Mutex::new(vec![]));
        let sink = Box::new(CollectSink {
            collected: collected.clone(),
            fail_on_packet_count: Some(2),
        });
        let (mut processor, counter) = RecordProcessor::new(receiver, sink, Duration::ZERO);

        processor.start();
        for i in 1..=3 {
            sender.send(record_with_count(i)).unwrap();
        }
        wait_for(|| collected.lock().unwrap().len() == 2);
        processor.stop();

        let counts: Vec<u64> = collected.lock().unwrap().iter().map(|r| r.packet_count).collect();
        assert_eq!(counts, vec![1, 3]);
        let points = counter.get_counters();
        assert_eq!(points[0].2, CounterValue::Unsigned(3));
        assert_eq!(points[1].2, CounterValue::Unsigned(1));
    }

    #[test]
    fn start_twice_is_noop() {
        let (sender, receiver, _) = queue::bounded(4);
        let collected = Arc::new(Mutex::new(vec![]));
        let sink = Box::new(CollectSink {
            collected: collected.clone(),
            fail_on_packet_count: None,
        });
        let (mut processor, _) = RecordProcessor::new(receiver, sink, Duration::ZERO);

        processor.start();
        processor.start();
        sender.send(record_with_count(7)).unwrap();
        wait_for(|| collected.lock().unwrap().len() == 1);
        processor.stop();
        processor.stop();

        assert_eq!(collected.lock().unwrap().len(), 1);
    }
}
