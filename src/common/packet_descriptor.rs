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

use public::bytes::read_u16_be;

use super::consts::*;
use super::enums::{EthernetType, HeaderType, IpProtocol, TcpFlags};
use super::flow::FlowKey;
use crate::error;

/// Decoded header fields of a single captured frame.
///
/// This is all the correlation engine ever sees of a packet, raw bytes
/// stay at the capture boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketDescriptor {
    pub timestamp: Duration,
    pub ip_src: IpAddr,
    pub ip_dst: IpAddr,
    pub port_src: u16,
    pub port_dst: u16,
    pub proto: IpProtocol,
    // original wire length, not the captured length
    pub frame_len: u32,
    pub tcp_flags: TcpFlags,
}

impl Default for PacketDescriptor {
    fn default() -> Self {
        Self {
            timestamp: Duration::ZERO,
            ip_src: std::net::Ipv4Addr::UNSPECIFIED.into(),
            ip_dst: std::net::Ipv4Addr::UNSPECIFIED.into(),
            port_src: 0,
            port_dst: 0,
            proto: IpProtocol::default(),
            frame_len: 0,
            tcp_flags: TcpFlags::empty(),
        }
    }
}

impl PacketDescriptor {
    /// Key in the orientation this packet ran.
    pub fn forward_key(&self) -> FlowKey {
        FlowKey {
            ip_src: self.ip_src,
            ip_dst: self.ip_dst,
            port_src: self.port_src,
            port_dst: self.port_dst,
            proto: self.proto,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.proto == IpProtocol::Tcp
    }

    /// Decodes an ethernet frame into a descriptor.
    ///
    /// Returns `Ok(None)` for frames the correlation engine cannot use:
    /// non-IP ethertypes, double tagged frames, transports other than
    /// TCP/UDP and non-first IPv4 fragments. Frames truncated below the
    /// headers they claim to carry are an error.
    pub fn decode(
        raw: &[u8],
        timestamp: Duration,
        original_length: usize,
    ) -> error::Result<Option<Self>> {
        let mut size_checker = raw.len() as isize;

        // eth
        size_checker -= HeaderType::Eth.min_header_size() as isize;
        if size_checker < 0 {
            return Err(error::Error::ParsePacketFailed("packet truncated".into()));
        }
        let mut vlan_tag_size = 0;
        let mut eth_type = EthernetType::from(read_u16_be(&raw[FIELD_OFFSET_ETH_TYPE..]));
        if eth_type == EthernetType::Dot1Q {
            vlan_tag_size = VLAN_HEADER_SIZE;
            size_checker -= VLAN_HEADER_SIZE as isize;
            if size_checker < 0 {
                return Err(error::Error::ParsePacketFailed("packet truncated".into()));
            }
            eth_type = EthernetType::from(read_u16_be(&raw[FIELD_OFFSET_ETH_TYPE + vlan_tag_size..]));
            if eth_type == EthernetType::Dot1Q || eth_type == EthernetType::QinQ {
                // double tagged, not handled
                return Ok(None);
            }
        }

        let mut is_ipv6 = false;
        let ip_src: IpAddr;
        let ip_dst: IpAddr;
        let proto;
        let mut l2_l3_opt_size = vlan_tag_size;
        match eth_type {
            EthernetType::Ipv4 => {
                size_checker -= HeaderType::Ipv4.min_header_size() as isize;
                if size_checker < 0 {
                    return Err(error::Error::ParsePacketFailed("packet truncated".into()));
                }
                let ihl = raw[FIELD_OFFSET_IHL + vlan_tag_size] & 0xF;
                let offset_ip_0 = FIELD_OFFSET_SIP + vlan_tag_size;
                let offset_ip_1 = FIELD_OFFSET_DIP + vlan_tag_size;
                ip_src = IpAddr::from(
                    *<&[u8; 4]>::try_from(&raw[offset_ip_0..offset_ip_0 + IPV4_ADDR_LEN]).unwrap(),
                );
                ip_dst = IpAddr::from(
                    *<&[u8; 4]>::try_from(&raw[offset_ip_1..offset_ip_1 + IPV4_ADDR_LEN]).unwrap(),
                );

                let frag = read_u16_be(&raw[FIELD_OFFSET_FRAG + vlan_tag_size..]);
                if frag & 0x1FFF != 0 {
                    // non-first fragment, no L4 header to read
                    return Ok(None);
                }

                let mut l3_opt_size = ihl as isize * 4 - 20;
                // wrong ihl
                if l3_opt_size < 0 {
                    l3_opt_size = 0;
                }
                size_checker -= l3_opt_size;
                if size_checker < 0 {
                    return Err(error::Error::ParsePacketFailed("packet truncated".into()));
                }
                l2_l3_opt_size += l3_opt_size as usize;

                proto = IpProtocol::from(raw[IPV4_PROTO_OFFSET + vlan_tag_size]);
            }
            EthernetType::Ipv6 => {
                is_ipv6 = true;
                size_checker -= HeaderType::Ipv6.min_header_size() as isize;
                if size_checker < 0 {
                    return Err(error::Error::ParsePacketFailed("packet truncated".into()));
                }
                let offset_ip_0 = FIELD_OFFSET_IPV6_SRC + vlan_tag_size;
                let offset_ip_1 = FIELD_OFFSET_IPV6_DST + vlan_tag_size;
                ip_src = IpAddr::from(
                    *<&[u8; 16]>::try_from(&raw[offset_ip_0..offset_ip_0 + IPV6_ADDR_LEN]).unwrap(),
                );
                ip_dst = IpAddr::from(
                    *<&[u8; 16]>::try_from(&raw[offset_ip_1..offset_ip_1 + IPV6_ADDR_LEN]).unwrap(),
                );
                // extension header chains are not walked, a next header
                // other than TCP/UDP drops the frame below
                proto = IpProtocol::from(raw[IPV6_PROTO_OFFSET + vlan_tag_size]);
            }
            _ => return Ok(None),
        }

        let (offset_port_0, offset_port_1, offset_tcp_flag) = if is_ipv6 {
            (
                FIELD_OFFSET_IPV6_SPORT + vlan_tag_size,
                FIELD_OFFSET_IPV6_DPORT + vlan_tag_size,
                FIELD_OFFSET_TCPV6_FLAG + vlan_tag_size,
            )
        } else {
            (
                FIELD_OFFSET_SPORT + l2_l3_opt_size,
                FIELD_OFFSET_DPORT + l2_l3_opt_size,
                FIELD_OFFSET_TCP_FLAG + l2_l3_opt_size,
            )
        };

        let tcp_flags = match proto {
            IpProtocol::Tcp => {
                size_checker -= HeaderType::Ipv4Tcp.min_header_size() as isize;
                if size_checker < 0 {
                    return Err(error::Error::ParsePacketFailed("packet truncated".into()));
                }
                TcpFlags::from_bits_truncate(raw[offset_tcp_flag])
            }
            IpProtocol::Udp => {
                size_checker -= HeaderType::Ipv4Udp.min_header_size() as isize;
                if size_checker < 0 {
                    return Err(error::Error::ParsePacketFailed("packet truncated".into()));
                }
                TcpFlags::empty()
            }
            _ => return Ok(None),
        };

        Ok(Some(PacketDescriptor {
            timestamp,
            ip_src,
            ip_dst,
            port_src: read_u16_be(&raw[offset_port_0..]),
            port_dst: read_u16_be(&raw[offset_port_1..]),
            proto,
            frame_len: original_length as u32,
            tcp_flags,
        }))
    }
}
