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

use std::net::IpAddr;
use std::time::Duration;

use crate::common::enums::PacketDirection;
use crate::common::flow::{CloseType, FeatureRecord, FlowKey};
use crate::common::PacketDescriptor;

/*
    FlowMapKey identifies a slot of the session table. Its l3/l4
    components order the larger operand first so a packet and its exact
    reverse land in the same slot. Distinct tuples may still collide,
    the bucket is disambiguated by FlowSession::match_key.
*/
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
pub(super) struct FlowMapKey {
    lhs: u64,
    rhs: u64,
}

impl FlowMapKey {
    fn l3_hash(key: &FlowKey) -> u64 {
        let (src, dst) = match (key.ip_src, key.ip_dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => (
                u32::from_le_bytes(s.octets()),
                u32::from_le_bytes(d.octets()),
            ),
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let (src, dst) = (s.octets(), d.octets());
                src.chunks(4)
                    .zip(dst.chunks(4))
                    .fold((0, 0), |(hash1, hash2), (b1, b2)| {
                        (
                            hash1 ^ u32::from_le_bytes(*<&[u8; 4]>::try_from(b1).unwrap()),
                            hash2 ^ u32::from_le_bytes(*<&[u8; 4]>::try_from(b2).unwrap()),
                        )
                    })
            }
            // decode never yields mixed address families
            _ => unreachable!(),
        };

        if src >= dst {
            (src as u64) << 32 | dst as u64
        } else {
            (dst as u64) << 32 | src as u64
        }
    }

    fn l4_hash(key: &FlowKey) -> u64 {
        if key.port_src >= key.port_dst {
            (key.port_src as u64) << 16 | key.port_dst as u64
        } else {
            (key.port_dst as u64) << 16 | key.port_src as u64
        }
    }

    pub(super) fn new(key: &FlowKey) -> Self {
        Self {
            lhs: Self::l3_hash(key),
            rhs: (u8::from(key.proto) as u64) << 32 | Self::l4_hash(key),
        }
    }
}

/// One live bidirectional session.
///
/// The key is fixed by the first observed packet: that packet's source
/// is the client side, and every later packet counts as forward (same
/// orientation) or reverse.
#[derive(Clone, Debug)]
pub struct FlowSession {
    key: FlowKey,

    pub packet_count: u64,
    pub byte_total: u64,
    pub packets_fwd: u64,
    pub packets_rev: u64,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,

    pub first_seen: Duration,
    pub last_seen: Duration,
}

impl FlowSession {
    pub fn new(pkt: &PacketDescriptor) -> Self {
        Self {
            key: pkt.forward_key(),
            packet_count: 1,
            byte_total: pkt.frame_len as u64,
            packets_fwd: 1,
            packets_rev: 0,
            bytes_fwd: pkt.frame_len as u64,
            bytes_rev: 0,
            first_seen: pkt.timestamp,
            last_seen: pkt.timestamp,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Exact comparison against both orientations of the session key.
    /// Returns the direction the packet ran relative to the reference
    /// direction, or None for a different tuple hashed into the same
    /// slot. Endpoints are never sorted into canonical order.
    pub fn match_key(&self, other: &FlowKey) -> Option<PacketDirection> {
        if self.key.proto != other.proto {
            return None;
        }
        if self.key.ip_src == other.ip_src
            && self.key.ip_dst == other.ip_dst
            && self.key.port_src == other.port_src
            && self.key.port_dst == other.port_dst
        {
            Some(PacketDirection::ClientToServer)
        } else if self.key.ip_src == other.ip_dst
            && self.key.ip_dst == other.ip_src
            && self.key.port_src == other.port_dst
            && self.key.port_dst == other.port_src
        {
            Some(PacketDirection::ServerToClient)
        } else {
            None
        }
    }

    /// Folds one matched packet into the counters. last_seen never
    /// moves backwards even when the packet timestamp does.
    pub fn update(&mut self, pkt: &PacketDescriptor, direction: PacketDirection) {
        self.packet_count += 1;
        self.byte_total += pkt.frame_len as u64;
        match direction {
            PacketDirection::ClientToServer => {
                self.packets_fwd += 1;
                self.bytes_fwd += pkt.frame_len as u64;
            }
            PacketDirection::ServerToClient => {
                self.packets_rev += 1;
                self.bytes_rev += pkt.frame_len as u64;
            }
        }
        if pkt.timestamp > self.last_seen {
            self.last_seen = pkt.timestamp;
        }
    }

    pub fn idle(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_seen)
    }

    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.first_seen)
    }

    pub fn into_record(self, close_type: CloseType) -> FeatureRecord {
        FeatureRecord {
            key: self.key,
            close_type,
            packet_count: self.packet_count,
            byte_total: self.byte_total,
            duration_secs: (self.last_seen - self.first_seen).as_secs_f64(),
            packets_fwd: self.packets_fwd,
            packets_rev: self.packets_rev,
            bytes_fwd: self.bytes_fwd,
            bytes_rev: self.bytes_rev,
            first_seen_us: self.first_seen.as_micros() as u64,
            last_seen_us: self.last_seen.as_micros() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::enums::IpProtocol;

    fn key(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> FlowKey {
        FlowKey {
            ip_src: Ipv4Addr::from(src).into(),
            ip_dst: Ipv4Addr::from(dst).into(),
            port_src: sport,
            port_dst: dport,
            proto: IpProtocol::Tcp,
        }
    }

    #[test]
    fn reverse_lands_in_same_slot() {
        let fwd = key([10, 0, 0, 1], 1000, [10, 0, 0, 2], 80);
        assert_eq!(FlowMapKey::new(&fwd), FlowMapKey::new(&fwd.reversed()));

        let v6 = FlowKey {
            ip_src: "2001::1".parse().unwrap(),
            ip_dst: "2001::2".parse().unwrap(),
            port_src: 443,
            port_dst: 55000,
            proto: IpProtocol::Tcp,
        };
        assert_eq!(FlowMapKey::new(&v6), FlowMapKey::new(&v6.reversed()));
    }

    #[test]
    fn match_key_reports_direction() {
        let pkt = PacketDescriptor {
            ip_src: Ipv4Addr::new(10, 0, 0, 1).into(),
            ip_dst: Ipv4Addr::new(10, 0, 0, 2).into(),
            port_src: 1000,
            port_dst: 80,
            proto: IpProtocol::Tcp,
            frame_len: 60,
            ..Default::default()
        };
        let session = FlowSession::new(&pkt);

        let fwd = key([10, 0, 0, 1], 1000, [10, 0, 0, 2], 80);
        assert_eq!(
            session.match_key(&fwd),
            Some(PacketDirection::ClientToServer)
        );
        assert_eq!(
            session.match_key(&fwd.reversed()),
            Some(PacketDirection::ServerToClient)
        );

        // same hosts, different client port
        let other = key([10, 0, 0, 1], 1001, [10, 0, 0, 2], 80);
        assert_eq!(session.match_key(&other), None);
        let mut udp = fwd;
        udp.proto = IpProtocol::Udp;
        assert_eq!(session.match_key(&udp), None);
    }

    #[test]
    fn update_splits_directional_counters() {
        let mut pkt = PacketDescriptor {
            ip_src: Ipv4Addr::new(10, 0, 0, 1).into(),
            ip_dst: Ipv4Addr::new(10, 0, 0, 2).into(),
            port_src: 1000,
            port_dst: 80,
            proto: IpProtocol::Tcp,
            frame_len: 100,
            timestamp: Duration::from_secs(10),
            ..Default::default()
        };
        let mut session = FlowSession::new(&pkt);

        pkt.frame_len = 60;
        pkt.timestamp = Duration::from_secs(12);
        session.update(&pkt, PacketDirection::ServerToClient);

        assert_eq!(session.packet_count, 2);
        assert_eq!(session.byte_total, 160);
        assert_eq!((session.packets_fwd, session.packets_rev), (1, 1));
        assert_eq!((session.bytes_fwd, session.bytes_rev), (100, 60));
        assert_eq!(session.last_seen, Duration::from_secs(12));

        // stale timestamp keeps counting but cannot rewind last_seen
        pkt.timestamp = Duration::from_secs(11);
        session.update(&pkt, PacketDirection::ClientToServer);
        assert_eq!(session.packet_count, 3);
        assert_eq!(session.last_seen, Duration::from_secs(12));

        let record = session.into_record(CloseType::TcpFin);
        assert_eq!(record.duration_secs, 2.0);
        assert_eq!(record.packet_count, 3);
    }
}
