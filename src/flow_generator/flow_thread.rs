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
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use super::{FlowTable, FlowTimeout, QUEUE_BATCH_SIZE, QUEUE_READ_TIMEOUT};
use crate::common::{flow::FeatureRecord, PacketDescriptor};
use crate::utils::stats;
use public::queue::{Error, Receiver, Sender};

/// Raw frame handed over by a capture source.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub timestamp: Duration,
    pub data: Vec<u8>,
    // wire length before snapping, may exceed data.len()
    pub original_length: usize,
}

/// Owner thread of the flow table.
///
/// Drains captured frames from its input queue, decodes them and feeds
/// the table. A queue read timeout doubles as the flush ticker so the
/// table retires expired sessions when the capture goes quiet.
pub struct FlowGeneratorThread {
    input: Arc<Receiver<CapturedFrame>>,
    output: Sender<Box<FeatureRecord>>,
    timeout: FlowTimeout,
    stats_collector: Arc<stats::Collector>,

    thread_handle: Option<JoinHandle<()>>,

    running: Arc<AtomicBool>,
}

impl FlowGeneratorThread {
    pub fn new(
        input: Receiver<CapturedFrame>,
        output: Sender<Box<FeatureRecord>>,
        timeout: FlowTimeout,
        stats_collector: Arc<stats::Collector>,
    ) -> Self {
        Self {
            input: Arc::new(input),
            output,
            timeout,
            stats_collector,
            thread_handle: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("flow generator already started, do nothing.");
            return;
        }

        let table = FlowTable::new(self.timeout, self.output.clone(), &self.stats_collector);
        let input = self.input.clone();
        let running = self.running.clone();
        self.thread_handle = Some(
            thread::Builder::new()
                .name("flow-generator".to_owned())
                .spawn(move || Self::process(table, input, running))
                .unwrap(),
        );
        info!("flow generator started");
    }

    pub fn notify_stop(&mut self) -> Option<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("flow generator already stopped, do nothing.");
            return None;
        }
        info!("notify stopping flow generator");
        self.thread_handle.take()
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("flow generator already stopped, do nothing.");
            return;
        }
        info!("stopping flow generator");
        let _ = self.thread_handle.take().map(JoinHandle::join);
        info!("stopped flow generator");
    }

    fn process(mut table: FlowTable, input: Arc<Receiver<CapturedFrame>>, running: Arc<AtomicBool>) {
        let mut batch = Vec::with_capacity(QUEUE_BATCH_SIZE);
        while running.load(Ordering::Relaxed) {
            match input.recv_all(&mut batch, Some(QUEUE_READ_TIMEOUT)) {
                Ok(_) => {
                    for frame in batch.drain(..) {
                        match PacketDescriptor::decode(
                            &frame.data,
                            frame.timestamp,
                            frame.original_length,
                        ) {
                            Ok(Some(packet)) => {
                                table.observe(&packet);
                            }
                            // not an IP/TCP/UDP frame the table tracks
                            Ok(None) => continue,
                            Err(e) => debug!("dropped frame: {}", e),
                        }
                    }
                }
                Err(Error::Timeout) => {
                    table.inject_flush_ticker(Self::wall_clock());
                }
                Err(Error::Terminated(..)) => {
                    break;
                }
                Err(Error::Full(_)) => unreachable!(),
            }
        }
        let closed = table.flush();
        info!("flow generator exited, {} sessions force closed", closed);
    }

    fn wall_clock() -> Duration {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}
