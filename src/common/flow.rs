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
use std::mem::swap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::enums::IpProtocol;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CloseType {
    Unknown = 0,
    TcpFin = 1,
    TcpRst = 2,
    IdleTimeout = 3,
    ActiveTimeout = 4,
    ForcedClose = 5,
}

impl CloseType {
    pub fn is_timeout(self) -> bool {
        self == CloseType::IdleTimeout || self == CloseType::ActiveTimeout
    }
}

impl Default for CloseType {
    fn default() -> Self {
        CloseType::Unknown
    }
}

/// Directed five tuple identifying one side of a flow.
///
/// Equality is direction sensitive. Whether a packet belongs to a flow
/// is decided by comparing against the key and against its reverse, the
/// key itself is never reordered into a canonical form. The source side
/// of the first packet of a flow stays the client side for the flow's
/// whole life.
#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone)]
pub struct FlowKey {
    pub ip_src: IpAddr,
    pub ip_dst: IpAddr,
    pub port_src: u16,
    pub port_dst: u16,
    #[serde(rename = "protocol")]
    pub proto: IpProtocol,
}

impl FlowKey {
    pub fn reverse(&mut self) {
        swap(&mut self.ip_src, &mut self.ip_dst);
        swap(&mut self.port_src, &mut self.port_dst);
    }

    pub fn reversed(&self) -> Self {
        let mut key = self.clone();
        key.reverse();
        key
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        FlowKey {
            ip_src: Ipv4Addr::UNSPECIFIED.into(),
            ip_dst: Ipv4Addr::UNSPECIFIED.into(),
            port_src: 0,
            port_dst: 0,
            proto: IpProtocol::default(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip_src:{} ip_dst:{} proto:{:?} port_src:{} port_dst:{}",
            self.ip_src, self.ip_dst, self.proto, self.port_src, self.port_dst
        )
    }
}

/// Per flow feature vector emitted exactly once when a session closes.
///
/// Externally produced records arrive over the ingestion endpoint with
/// any subset of these fields, the missing ones default.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct FeatureRecord {
    pub key: FlowKey,
    pub close_type: CloseType,

    pub packet_count: u64,
    pub byte_total: u64,
    pub duration_secs: f64,

    pub packets_fwd: u64,
    pub packets_rev: u64,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,

    pub first_seen_us: u64,
    pub last_seen_us: u64,
}

impl FeatureRecord {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }
}

impl fmt::Display for FeatureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} close_type:{:?} packets:{} bytes:{} duration:{:?}",
            self.key,
            self.close_type,
            self.packet_count,
            self.byte_total,
            self.duration()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_key_reverse_is_involutive() {
        let key = FlowKey {
            ip_src: "10.0.0.1".parse().unwrap(),
            ip_dst: "10.0.0.2".parse().unwrap(),
            port_src: 1000,
            port_dst: 80,
            proto: IpProtocol::Tcp,
        };
        let rev = key.reversed();
        assert_ne!(key, rev);
        assert_eq!(key, rev.reversed());
        assert_eq!(rev.ip_src, key.ip_dst);
        assert_eq!(rev.port_src, key.port_dst);
        assert_eq!(rev.proto, key.proto);
    }

    #[test]
    fn record_accepts_partial_json() {
        let r: FeatureRecord =
            serde_json::from_str(r#"{"packet_count": 3, "byte_total": 512}"#).unwrap();
        assert_eq!(r.packet_count, 3);
        assert_eq!(r.byte_total, 512);
        assert_eq!(r.close_type, CloseType::Unknown);
        assert_eq!(r.duration_secs, 0.0);
    }

    #[test]
    fn record_round_trips_key() {
        let record = FeatureRecord {
            key: FlowKey {
                ip_src: "192.168.1.5".parse().unwrap(),
                ip_dst: "1.1.1.1".parse().unwrap(),
                port_src: 51234,
                port_dst: 443,
                proto: IpProtocol::Udp,
            },
            close_type: CloseType::IdleTimeout,
            packet_count: 7,
            byte_total: 4096,
            duration_secs: 1.5,
            ..Default::default()
        };
        let text = serde_json::to_string(&record).unwrap();
        let back: FeatureRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }
}
