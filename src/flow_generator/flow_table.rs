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

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use log::{debug, warn};

use super::{
    flow_session::FlowMapKey, FlowSession, DEFAULT_FLOW_ACTIVE_TIMEOUT,
    DEFAULT_FLOW_IDLE_TIMEOUT, HASH_SLOTS, QUEUE_BATCH_SIZE,
};
use crate::common::{
    enums::{IpProtocol, TcpFlags},
    flow::{CloseType, FeatureRecord},
    PacketDescriptor,
};
use crate::utils::stats::{self, Countable};
use public::{
    counter::{Counter, CounterType, CounterValue, RefCountable},
    queue::{Error as QueueError, Sender},
};

/// Idle and active limits enforced by the sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowTimeout {
    pub idle: Duration,
    pub active: Duration,
}

impl Default for FlowTimeout {
    fn default() -> Self {
        Self {
            idle: DEFAULT_FLOW_IDLE_TIMEOUT,
            active: DEFAULT_FLOW_ACTIVE_TIMEOUT,
        }
    }
}

/// What the table did with one observed packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observed {
    /// transport is not tracked, nothing touched
    Skipped,
    /// no live session matched, a new one was opened
    Created,
    /// matched a live session and updated its counters
    Updated,
    /// matched a live session and closed it on FIN/RST
    Closed,
}

// not thread-safe, owned by a single worker thread so that the sweep,
// the match and the mutation are atomic with respect to other packets
pub struct FlowTable {
    sessions: Option<HashMap<FlowMapKey, Vec<Box<FlowSession>>>>,
    timeout: FlowTimeout,

    output_queue: Sender<Box<FeatureRecord>>,
    output_buffer: Vec<FeatureRecord>,
    // high water mark of sweep times, never moves backwards
    sweep_clock: Duration,

    counter: Arc<FlowTableCounter>,
}

impl FlowTable {
    pub fn new(
        timeout: FlowTimeout,
        output_queue: Sender<Box<FeatureRecord>>,
        stats_collector: &stats::Collector,
    ) -> Self {
        let counter = Arc::new(FlowTableCounter::default());
        stats_collector.register_countable(
            "flow-table",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
            vec![],
        );
        Self {
            sessions: Some(HashMap::with_capacity(HASH_SLOTS)),
            timeout,
            output_queue,
            output_buffer: vec![],
            sweep_clock: Duration::ZERO,
            counter,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .as_ref()
            .map(|m| m.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Correlates one decoded packet.
    ///
    /// Expired sessions are swept out first, with the table state prior
    /// to this packet. The lookup then compares the packet's forward key
    /// and its exact reverse inside the slot bucket. A hit mutates the
    /// session and FIN/RST retires it, a miss opens a new session keyed
    /// by this packet's orientation.
    pub fn observe(&mut self, pkt: &PacketDescriptor) -> Observed {
        if pkt.proto != IpProtocol::Tcp && pkt.proto != IpProtocol::Udp {
            debug!("ignored packet with untracked protocol {:?}", pkt.proto);
            return Observed::Skipped;
        }

        // a FIN hitting an already expired session must not revive it,
        // the sweep closes that session and the FIN opens a fresh one
        self.sweep(pkt.timestamp);

        let pkt_key = pkt.forward_key();
        let map_key = FlowMapKey::new(&pkt_key);

        let Some(mut sessions) = self.sessions.take() else {
            warn!("cannot get session table");
            return Observed::Skipped;
        };

        let (outcome, max_depth) = match sessions.get_mut(&map_key) {
            Some(bucket) => {
                let depth = bucket.len() as u64;
                let matched = bucket
                    .iter()
                    .enumerate()
                    .find_map(|(i, s)| s.match_key(&pkt_key).map(|d| (i, d)));
                match matched {
                    Some((index, direction)) => {
                        let mut session = bucket.swap_remove(index);
                        session.update(pkt, direction);
                        if pkt.is_tcp() && pkt.tcp_flags.closes_flow() {
                            if bucket.is_empty() {
                                sessions.remove(&map_key);
                            }
                            let close_type = if pkt.tcp_flags.contains(TcpFlags::RST) {
                                CloseType::TcpRst
                            } else {
                                CloseType::TcpFin
                            };
                            self.counter.closed.fetch_add(1, Ordering::Relaxed);
                            self.counter.concurrent.fetch_sub(1, Ordering::Relaxed);
                            self.push_record(session.into_record(close_type));
                            (Observed::Closed, depth)
                        } else {
                            bucket.push(session);
                            (Observed::Updated, depth)
                        }
                    }
                    None => {
                        // same slot, different tuple
                        bucket.push(Box::new(FlowSession::new(pkt)));
                        self.counter.new.fetch_add(1, Ordering::Relaxed);
                        self.counter.concurrent.fetch_add(1, Ordering::Relaxed);
                        (Observed::Created, depth + 1)
                    }
                }
            }
            None => {
                sessions.insert(map_key, vec![Box::new(FlowSession::new(pkt))]);
                self.counter.new.fetch_add(1, Ordering::Relaxed);
                self.counter.concurrent.fetch_add(1, Ordering::Relaxed);
                (Observed::Created, 1)
            }
        };

        Self::update_stats_counter(&self.counter, sessions.len() as u64, max_depth);
        self.sessions.replace(sessions);
        self.flush_output();
        outcome
    }

    /// Runs the eviction sweep without a packet so expired sessions are
    /// still retired when the capture goes quiet.
    pub fn inject_flush_ticker(&mut self, now: Duration) {
        self.sweep(now);
        self.flush_output();
    }

    /// Force closes everything left in the table. Shutdown path.
    pub fn flush(&mut self) -> usize {
        let Some(mut sessions) = self.sessions.take() else {
            warn!("cannot get session table");
            return 0;
        };

        let mut closed = 0usize;
        for (_, bucket) in sessions.drain() {
            for session in bucket {
                self.push_record(session.into_record(CloseType::ForcedClose));
                closed += 1;
            }
        }
        self.counter.closed.fetch_add(closed as u64, Ordering::Relaxed);
        self.counter
            .concurrent
            .fetch_sub(closed as u64, Ordering::Relaxed);
        Self::update_stats_counter(&self.counter, 0, 0);
        self.sessions.replace(sessions);
        self.flush_output();
        closed
    }

    // Closes sessions whose idle time or age exceeds the limits, the
    // idle check wins when both do. Linear in live sessions.
    fn sweep(&mut self, now: Duration) {
        if now < self.sweep_clock {
            self.counter.time_regressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.sweep_clock = now;

        let Some(mut sessions) = self.sessions.take() else {
            warn!("cannot get session table");
            return;
        };

        let timeout = self.timeout;
        let mut expired = vec![];
        sessions.retain(|_, bucket| {
            let mut index = 0;
            while index < bucket.len() {
                let session = &bucket[index];
                let close_type = if session.idle(now) > timeout.idle {
                    CloseType::IdleTimeout
                } else if session.age(now) > timeout.active {
                    CloseType::ActiveTimeout
                } else {
                    index += 1;
                    continue;
                };
                let session = bucket.swap_remove(index);
                expired.push(session.into_record(close_type));
            }
            !bucket.is_empty()
        });

        if !expired.is_empty() {
            self.counter
                .closed
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            self.counter
                .concurrent
                .fetch_sub(expired.len() as u64, Ordering::Relaxed);
            for record in expired {
                self.push_record(record);
            }
        }
        Self::update_stats_counter(&self.counter, sessions.len() as u64, 0);
        self.sessions.replace(sessions);
    }

    fn push_record(&mut self, record: FeatureRecord) {
        self.output_buffer.push(record);
        if self.output_buffer.len() >= QUEUE_BATCH_SIZE {
            self.flush_output();
        }
    }

    fn flush_output(&mut self) {
        if self.output_buffer.is_empty() {
            return;
        }
        let mut records = self
            .output_buffer
            .drain(..)
            .map(Box::new)
            .collect::<Vec<_>>();
        match self.output_queue.send_all(&mut records) {
            Ok(()) => {}
            Err(QueueError::Full(_)) => {
                warn!(
                    "flow-table output queue is full, dropped {} feature records",
                    records.len()
                );
            }
            Err(_) => {
                warn!("flow-table push feature records to queue failed because queue have terminated");
            }
        }
    }

    fn update_stats_counter(c: &FlowTableCounter, slots: u64, max_depth: u64) {
        c.slots.swap(slots, Ordering::Relaxed);
        c.slot_max_depth.fetch_max(max_depth, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct FlowTableCounter {
    new: AtomicU64,             // the number of created sessions
    closed: AtomicU64,          // the number of closed sessions
    time_regressed: AtomicU64,  // packets arriving behind the sweep clock
    concurrent: AtomicU64,      // current the number of live sessions
    slots: AtomicU64,           // current the length of the HashMap
    slot_max_depth: AtomicU64,  // the max length of Vec<FlowSession>
}

impl RefCountable for FlowTableCounter {
    fn get_counters(&self) -> Vec<Counter> {
        let concurrent = self.concurrent.load(Ordering::Relaxed);
        let slots = self.slots.swap(0, Ordering::Relaxed);
        let slots_avg_depth = concurrent.checked_div(slots).unwrap_or_default();

        vec![
            (
                "new",
                CounterType::Gauged,
                CounterValue::Unsigned(self.new.swap(0, Ordering::Relaxed)),
            ),
            (
                "closed",
                CounterType::Gauged,
                CounterValue::Unsigned(self.closed.swap(0, Ordering::Relaxed)),
            ),
            (
                "time_regressed",
                CounterType::Gauged,
                CounterValue::Unsigned(self.time_regressed.swap(0, Ordering::Relaxed)),
            ),
            (
                "concurrent",
                CounterType::Gauged,
                CounterValue::Unsigned(concurrent),
            ),
            (
                "slot_max_depth",
                CounterType::Gauged,
                CounterValue::Unsigned(self.slot_max_depth.swap(0, Ordering::Relaxed)),
            ),
            (
                "slots_avg_depth",
                CounterType::Gauged,
                CounterValue::Unsigned(slots_avg_depth),
            ),
            ("slots", CounterType::Gauged, CounterValue::Unsigned(slots)),
        ]
    }
}

pub fn _new_flow_table_and_receiver(
    timeout: FlowTimeout,
) -> (FlowTable, public::queue::Receiver<Box<FeatureRecord>>) {
    let (output_queue_sender, output_queue_receiver, _) = public::queue::bounded(256);
    let table = FlowTable::new(
        timeout,
        output_queue_sender,
        &stats::Collector::new("127.0.0.1", 8125),
    );
    (table, output_queue_receiver)
}

pub fn _new_packet() -> PacketDescriptor {
    PacketDescriptor {
        timestamp: Duration::from_secs(100),
        ip_src: std::net::Ipv4Addr::new(192, 168, 1, 10).into(),
        ip_dst: std::net::Ipv4Addr::new(10, 0, 0, 80).into(),
        port_src: 1000,
        port_dst: 80,
        proto: IpProtocol::Tcp,
        frame_len: 100,
        tcp_flags: TcpFlags::empty(),
    }
}

pub fn _reverse_packet(pkt: &mut PacketDescriptor) {
    std::mem::swap(&mut pkt.ip_src, &mut pkt.ip_dst);
    std::mem::swap(&mut pkt.port_src, &mut pkt.port_dst);
}

#[cfg(test)]
mod tests {
    use super::super::TIME_UNIT;
    use super::*;

    const RECV_TIMEOUT: Option<Duration> = Some(TIME_UNIT);

    fn short_timeout() -> FlowTimeout {
        FlowTimeout {
            idle: Duration::from_secs(60),
            active: Duration::from_secs(1800),
        }
    }

    #[test]
    fn fin_closes_after_two_packets() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        assert_eq!(table.observe(&packet0), Observed::Created);

        let mut packet1 = _new_packet();
        _reverse_packet(&mut packet1);
        packet1.tcp_flags = TcpFlags::FIN;
        packet1.frame_len = 60;
        packet1.timestamp += Duration::from_secs(2);
        assert_eq!(table.observe(&packet1), Observed::Closed);
        assert_eq!(table.len(), 0);

        let record = output_queue_receiver.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(record.close_type, CloseType::TcpFin);
        assert_eq!(record.packet_count, 2);
        assert_eq!(record.byte_total, 160);
        assert_eq!(record.duration_secs, 2.0);
        assert_eq!((record.packets_fwd, record.packets_rev), (1, 1));
        assert_eq!((record.bytes_fwd, record.bytes_rev), (100, 60));
        assert_eq!(record.key, packet0.forward_key());

        // the session is gone, nothing else may come out
        assert!(output_queue_receiver
            .recv(Some(Duration::from_millis(10)))
            .is_err());
    }

    #[test]
    fn rst_closes_with_reset_cause() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        table.observe(&packet0);

        let mut packet1 = _new_packet();
        _reverse_packet(&mut packet1);
        // FIN and RST together still count as a reset
        packet1.tcp_flags = TcpFlags::RST | TcpFlags::FIN;
        packet1.timestamp += Duration::from_millis(10);
        assert_eq!(table.observe(&packet1), Observed::Closed);

        let record = output_queue_receiver.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(record.close_type, CloseType::TcpRst);
    }

    #[test]
    fn both_orientations_share_one_session() {
        let (mut table, _output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        assert_eq!(table.observe(&packet0), Observed::Created);

        let mut packet1 = _new_packet();
        _reverse_packet(&mut packet1);
        packet1.timestamp += Duration::from_millis(5);
        assert_eq!(table.observe(&packet1), Observed::Updated);

        let mut packet2 = _new_packet();
        packet2.timestamp += Duration::from_millis(9);
        assert_eq!(table.observe(&packet2), Observed::Updated);

        assert_eq!(table.len(), 1);
    }

    #[test]
    fn idle_session_expires_before_match() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        table.observe(&packet0);

        // unrelated tuple arriving after the idle limit evicts the
        // first session before its own lookup runs
        let mut packet1 = _new_packet();
        packet1.port_src = 23456;
        packet1.timestamp += Duration::from_secs(61);
        assert_eq!(table.observe(&packet1), Observed::Created);
        assert_eq!(table.len(), 1);

        let record = output_queue_receiver.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(record.close_type, CloseType::IdleTimeout);
        assert_eq!(record.packet_count, 1);
        assert_eq!(record.key, packet0.forward_key());
    }

    #[test]
    fn kept_alive_session_hits_active_limit() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(FlowTimeout {
            idle: Duration::from_secs(60),
            active: Duration::from_secs(100),
        });

        let mut packet = _new_packet();
        for secs in [0u64, 30, 60, 90] {
            packet.timestamp = Duration::from_secs(100 + secs);
            assert_ne!(table.observe(&packet), Observed::Closed);
        }
        assert_eq!(table.len(), 1);

        // idle never exceeded, age is: the sweep reports ActiveTimeout
        // and this packet starts over
        packet.timestamp = Duration::from_secs(100 + 120);
        assert_eq!(table.observe(&packet), Observed::Created);

        let record = output_queue_receiver.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(record.close_type, CloseType::ActiveTimeout);
        assert_eq!(record.packet_count, 4);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fin_on_expired_session_opens_new_one() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        table.observe(&packet0);

        let mut packet1 = _new_packet();
        packet1.tcp_flags = TcpFlags::FIN;
        packet1.timestamp += Duration::from_secs(61);
        assert_eq!(table.observe(&packet1), Observed::Created);
        assert_eq!(table.len(), 1);

        // exactly one record, closed by the sweep and not by the FIN
        let record = output_queue_receiver.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(record.close_type, CloseType::IdleTimeout);
        assert_eq!(record.packet_count, 1);
        assert!(output_queue_receiver
            .recv(Some(Duration::from_millis(10)))
            .is_err());
    }

    #[test]
    fn sweep_is_idempotent() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        table.observe(&packet0);

        let deadline = packet0.timestamp + Duration::from_secs(61);
        table.inject_flush_ticker(deadline);
        assert_eq!(table.len(), 0);
        assert!(output_queue_receiver.recv(RECV_TIMEOUT).is_ok());

        table.inject_flush_ticker(deadline);
        assert!(output_queue_receiver
            .recv(Some(Duration::from_millis(10)))
            .is_err());
    }

    #[test]
    fn flush_force_closes_everything() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        for port in [1000u16, 1001, 1002] {
            let mut packet = _new_packet();
            packet.port_src = port;
            table.observe(&packet);
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.flush(), 3);
        assert_eq!(table.len(), 0);

        let mut records = vec![];
        while let Ok(record) = output_queue_receiver.recv(Some(Duration::from_millis(10))) {
            records.push(record);
        }
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.close_type == CloseType::ForcedClose));
    }

    #[test]
    fn stale_timestamp_updates_but_never_rewinds() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        table.observe(&packet0);

        let mut packet1 = _new_packet();
        packet1.frame_len = 40;
        packet1.timestamp -= Duration::from_secs(1);
        assert_eq!(table.observe(&packet1), Observed::Updated);

        table.flush();
        let record = output_queue_receiver.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(record.packet_count, 2);
        assert_eq!(record.byte_total, 140);
        assert_eq!(record.duration_secs, 0.0);
        assert_eq!(record.first_seen_us, record.last_seen_us);
    }

    #[test]
    fn untracked_transport_is_skipped() {
        let (mut table, _output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let mut packet = _new_packet();
        packet.proto = IpProtocol::Unknown(47);
        assert_eq!(table.observe(&packet), Observed::Skipped);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn udp_session_round_trip() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let mut packet0 = _new_packet();
        packet0.proto = IpProtocol::Udp;
        packet0.port_src = 5353;
        packet0.port_dst = 5353;
        table.observe(&packet0);

        let mut packet1 = packet0.clone();
        _reverse_packet(&mut packet1);
        packet1.timestamp += Duration::from_millis(3);
        assert_eq!(table.observe(&packet1), Observed::Updated);

        // UDP only ever leaves by timeout or flush
        table.inject_flush_ticker(packet0.timestamp + Duration::from_secs(61));
        let record = output_queue_receiver.recv(RECV_TIMEOUT).unwrap();
        assert_eq!(record.close_type, CloseType::IdleTimeout);
        assert_eq!(record.packet_count, 2);
    }

    #[test]
    fn each_session_emits_exactly_once() {
        let (mut table, output_queue_receiver) = _new_flow_table_and_receiver(short_timeout());

        let packet0 = _new_packet();
        table.observe(&packet0);
        let mut packet1 = _new_packet();
        packet1.port_src = 2000;
        table.observe(&packet1);

        // first closed by FIN, second by the ticker, flush finds nothing
        let mut fin = _new_packet();
        _reverse_packet(&mut fin);
        fin.tcp_flags = TcpFlags::FIN;
        fin.timestamp += Duration::from_secs(1);
        assert_eq!(table.observe(&fin), Observed::Closed);
        table.inject_flush_ticker(packet0.timestamp + Duration::from_secs(62));
        assert_eq!(table.flush(), 0);

        let mut records = vec![];
        while let Ok(record) = output_queue_receiver.recv(Some(Duration::from_millis(10))) {
            records.push(record);
        }
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].key, records[1].key);
    }

    #[test]
    fn full_output_queue_drops_batch_and_keeps_going() {
        let (output_queue_sender, output_queue_receiver, _) = public::queue::bounded(1);
        let mut table = FlowTable::new(
            short_timeout(),
            output_queue_sender,
            &stats::Collector::new("127.0.0.1", 8125),
        );

        let packet0 = _new_packet();
        table.observe(&packet0);
        let mut packet1 = _new_packet();
        packet1.port_src = 2000;
        table.observe(&packet1);

        // two records in one batch cannot fit a one slot queue
        assert_eq!(table.flush(), 2);
        assert!(output_queue_receiver
            .recv(Some(Duration::from_millis(10)))
            .is_err());

        // the table still accepts traffic afterwards
        let packet2 = _new_packet();
        assert_eq!(table.observe(&packet2), Observed::Created);
    }
}
