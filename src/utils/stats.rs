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

use std::fmt;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cadence::{
    Counted, Gauged, Metric, MetricBuilder, MetricResult, StatsdClient, UdpMetricSink,
};
use log::{info, warn};

pub use public::counter::*;

const STATS_PREFIX: &'static str = "flow_sentinel";
const TICK_CYCLE: Duration = Duration::from_secs(10);

pub enum StatsOption {
    Tag(&'static str, String),
    Interval(Duration),
}

struct Source {
    module: &'static str,
    interval: Duration,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
    // countdown to next metrics collection
    skip: i64,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        self.module == other.module && self.tags == other.tags
    }
}

impl Eq for Source {}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

pub struct Collector {
    hostname: Arc<Mutex<String>>,
    remote: (String, u16),

    sources: Arc<Mutex<Vec<Source>>>,

    min_interval: Arc<AtomicU64>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new<S: AsRef<str>>(remote_host: S, remote_port: u16) -> Self {
        Self::with_min_interval(remote_host, remote_port, TICK_CYCLE)
    }

    pub fn with_min_interval<S: AsRef<str>>(
        remote_host: S,
        remote_port: u16,
        interval: Duration,
    ) -> Self {
        let min_interval = if interval <= TICK_CYCLE {
            TICK_CYCLE
        } else {
            Duration::from_secs(
                (interval.as_secs() + TICK_CYCLE.as_secs() - 1) / TICK_CYCLE.as_secs()
                    * TICK_CYCLE.as_secs(),
            )
        };
        let hostname = hostname::get()
            .ok()
            .and_then(|c| c.into_string().ok())
            .unwrap_or_default();
        Self {
            hostname: Arc::new(Mutex::new(hostname)),
            remote: (remote_host.as_ref().to_owned(), remote_port),
            sources: Arc::new(Mutex::new(vec![])),
            min_interval: Arc::new(AtomicU64::new(min_interval.as_secs())),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            interval: Duration::from_secs(self.min_interval.load(Ordering::Relaxed)),
            countable,
            tags: vec![],
            skip: 0,
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                StatsOption::Interval(interval)
                    if interval.as_secs() >= self.min_interval.load(Ordering::Relaxed) =>
                {
                    source.interval = Duration::from_secs(
                        interval.as_secs() / TICK_CYCLE.as_secs() * TICK_CYCLE.as_secs(),
                    )
                }
                _ => warn!(
                    "ignored duplicated tag or invalid interval for module {}",
                    source.module
                ),
            }
        }
        if source.interval > TICK_CYCLE {
            source.skip = ((60
                - SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_secs()
                    % 60)
                / TICK_CYCLE.as_secs()) as i64;
        }
        let mut sources = self.sources.lock().unwrap();
        sources.retain(|s| {
            let closed = s.countable.closed();
            let equals = s == &source;
            if !closed && equals {
                warn!(
                    "Found duplicated counter source {}, please check if the old one is correctly closed.",
                    source
                );
            }
            !closed && !equals
        });
        sources.push(source);
    }

    fn new_statsd_client<A: ToSocketAddrs + fmt::Debug>(addr: A) -> MetricResult<StatsdClient> {
        info!("stats client connect to {:?}", &addr);

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let sink = UdpMetricSink::from(addr, socket)?;
        Ok(StatsdClient::from_sink(STATS_PREFIX, sink))
    }

    fn send_metrics<'a, T: Metric + From<String>>(
        mut b: MetricBuilder<'a, '_, T>,
        host: &'a str,
        tags: &'a Vec<(&'static str, String)>,
    ) {
        let mut has_host = false;
        for (k, v) in tags {
            if *k == "host" {
                has_host = true;
            }
            b = b.with_tag(k, v);
        }
        if !has_host {
            b = b.with_tag("host", host);
        }
        b.send();
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        *self.running.0.lock().unwrap() = false;
        self.running.1.notify_one();
        self.thread.lock().unwrap().take()
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock().unwrap();
            if *started {
                return;
            }
            *started = true;
        }

        let running = self.running.clone();
        let sources = self.sources.clone();
        let hostname = self.hostname.clone();
        let min_interval = self.min_interval.clone();
        let remote = self.remote.clone();
        *self.thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("stats-collector".to_owned())
                .spawn(move || {
                    let mut statsd_client = None;
                    loop {
                        let host = hostname.lock().unwrap().clone();

                        if statsd_client.is_none() {
                            match Self::new_statsd_client((remote.0.as_str(), remote.1)) {
                                Ok(client) => statsd_client = Some(client),
                                Err(e) => {
                                    warn!("create statsd client to {:?} failed: {}", remote, e)
                                }
                            }
                        }

                        if let Some(client) = statsd_client.as_ref() {
                            let mut sources = sources.lock().unwrap();
                            let min_interval_loaded = min_interval.load(Ordering::Relaxed);
                            sources.retain(|s| !s.countable.closed());
                            for source in sources.iter_mut() {
                                source.skip -= 1;
                                if source.skip > 0 {
                                    continue;
                                }
                                source.skip = (source.interval.as_secs().max(min_interval_loaded)
                                    / TICK_CYCLE.as_secs())
                                    as i64;
                                for point in source.countable.get_counters() {
                                    let metric_name =
                                        format!("{}_{}", source.module, point.0).replace("-", "_");
                                    match point.1 {
                                        CounterType::Counted => Self::send_metrics(
                                            client.count_with_tags(&metric_name, point.2),
                                            &host,
                                            &source.tags,
                                        ),
                                        CounterType::Gauged => Self::send_metrics(
                                            client.gauge_with_tags(&metric_name, point.2),
                                            &host,
                                            &source.tags,
                                        ),
                                    }
                                }
                            }
                        }

                        let (running, timer) = &*running;
                        let mut running = running.lock().unwrap();
                        if !*running {
                            break;
                        }
                        running = timer.wait_timeout(running, TICK_CYCLE).unwrap().0;
                        if !*running {
                            break;
                        }
                    }
                })
                .unwrap(),
        );
        info!("stats collector started");
    }

    pub fn stop(&self) {
        if let Some(t) = self.notify_stop() {
            let _ = t.join();
        }
        info!("stats collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    struct TableStats {
        closed: AtomicU32,
    }

    impl RefCountable for TableStats {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "closed",
                CounterType::Counted,
                CounterValue::Unsigned(self.closed.swap(0, Ordering::Relaxed) as u64),
            )]
        }
    }

    #[test]
    fn registration_replaces_duplicates() {
        let collector = Collector::new("127.0.0.1", 8125);
        let counter = Arc::new(TableStats {
            closed: AtomicU32::new(0),
        });
        for _ in 0..2 {
            collector.register_countable(
                "flow-table",
                Countable::Ref(Arc::downgrade(&counter) as std::sync::Weak<dyn RefCountable>),
                vec![StatsOption::Tag("id", "0".to_owned())],
            );
        }
        assert_eq!(collector.sources.lock().unwrap().len(), 1);
    }

    #[test]
    fn closed_sources_dropped_on_register() {
        let collector = Collector::new("127.0.0.1", 8125);
        {
            let counter = Arc::new(TableStats {
                closed: AtomicU32::new(0),
            });
            collector.register_countable(
                "flow-table",
                Countable::Ref(Arc::downgrade(&counter) as std::sync::Weak<dyn RefCountable>),
                vec![],
            );
            // counter dropped here, source is closed
        }
        let other = Arc::new(TableStats {
            closed: AtomicU32::new(0),
        });
        collector.register_countable(
            "ingest-server",
            Countable::Ref(Arc::downgrade(&other) as std::sync::Weak<dyn RefCountable>),
            vec![],
        );
        let sources = collector.sources.lock().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].module, "ingest-server");
    }
}
