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

use std::time::{Duration, Instant};

use criterion::*;

use flow_sentinel::{
    _new_flow_table_and_receiver as new_flow_table_and_receiver, _new_packet as new_packet,
    _reverse_packet as reverse_packet, _FlowTimeout as FlowTimeout, _TcpFlags as TcpFlags,
};

fn flow_table(c: &mut Criterion) {
    c.bench_function("flow_table_syn_flood", |b| {
        b.iter_custom(|iters| {
            let (mut table, _r) = new_flow_table_and_receiver(FlowTimeout::default());
            let packets = (0..iters)
                .map(|i| {
                    let mut pkt = new_packet();
                    pkt.tcp_flags = TcpFlags::SYN;
                    pkt.port_src = i as u16;
                    pkt.port_dst = (i >> 16) as u16;
                    pkt
                })
                .collect::<Vec<_>>();
            let start = Instant::now();
            for pkt in packets.iter() {
                table.observe(pkt);
            }
            start.elapsed()
        })
    });

    c.bench_function("flow_table_ten_packet_sessions", |b| {
        b.iter_custom(|iters| {
            let (mut table, _r) = new_flow_table_and_receiver(FlowTimeout::default());
            let iters = (iters + 9) / 10 * 10;

            let mut packets = vec![];
            for i in (0..iters).step_by(10) {
                let port_src = i as u16;
                let port_dst = (i >> 16) as u16;

                for j in 0..10 {
                    let mut pkt = new_packet();
                    pkt.timestamp += Duration::from_nanos(100 * (i + j));
                    pkt.port_src = port_src;
                    pkt.port_dst = port_dst;
                    if j % 2 == 1 {
                        reverse_packet(&mut pkt);
                    }
                    packets.push(pkt);
                }
            }
            let start = Instant::now();
            for pkt in packets.iter() {
                table.observe(pkt);
            }
            start.elapsed()
        })
    });

    c.bench_function("flow_table_fin_close", |b| {
        b.iter_custom(|iters| {
            let (mut table, _r) = new_flow_table_and_receiver(FlowTimeout::default());
            let packets = (0..iters)
                .map(|i| {
                    let mut pkt = new_packet();
                    pkt.timestamp += Duration::from_nanos(100 * i);
                    pkt.tcp_flags = if i % 2 == 1 {
                        TcpFlags::FIN
                    } else {
                        TcpFlags::SYN
                    };
                    pkt.port_src = (i / 2) as u16;
                    pkt.port_dst = ((i / 2) >> 16) as u16;
                    pkt
                })
                .collect::<Vec<_>>();
            let start = Instant::now();
            for pkt in packets.iter() {
                table.observe(pkt);
            }
            start.elapsed()
        })
    });

    c.bench_function("flow_table_flush_ticker", |b| {
        b.iter_custom(|iters| {
            let (mut table, _r) = new_flow_table_and_receiver(FlowTimeout::default());
            let base = new_packet().timestamp;
            for i in 0..4096u64 {
                let mut pkt = new_packet();
                pkt.port_src = i as u16;
                pkt.port_dst = (i >> 16) as u16;
                table.observe(&pkt);
            }
            let start = Instant::now();
            for i in 0..iters {
                table.inject_flush_ticker(base + Duration::from_secs(i));
            }
            start.elapsed()
        })
    });
}

criterion_group!(benches, flow_table);
criterion_main!(benches);
