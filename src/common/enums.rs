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

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// EthernetType is an enumeration of ethernet type values, and acts as a decoder
/// for any type it supports.
#[derive(Serialize, Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub enum EthernetType {
    // EthernetTypeLLC is not an actual ethernet type.  It is instead a
    // placeholder we use in Ethernet frames that use the 802.3 standard of
    // srcmac|dstmac|length|LLC instead of srcmac|dstmac|ethertype.
    Llc,
    Ipv4,
    Arp,
    Ipv6,
    Dot1Q,
    QinQ,
    Unknown(u16),
}

impl EthernetType {
    const LLC: u16 = 0;
    const IPV4: u16 = 0x0800;
    const ARP: u16 = 0x0806;
    const IPV6: u16 = 0x86DD;
    const DOT1Q: u16 = 0x8100;
    const QINQ: u16 = 0x88a8;
}

impl Default for EthernetType {
    fn default() -> Self {
        EthernetType::Llc
    }
}

impl From<u16> for EthernetType {
    fn from(t: u16) -> Self {
        match t {
            EthernetType::IPV4 => Self::Ipv4,
            EthernetType::ARP => Self::Arp,
            EthernetType::IPV6 => Self::Ipv6,
            EthernetType::DOT1Q => Self::Dot1Q,
            EthernetType::QINQ => Self::QinQ,
            EthernetType::LLC => Self::Llc,
            _ => Self::Unknown(t),
        }
    }
}

impl From<EthernetType> for u16 {
    fn from(t: EthernetType) -> Self {
        match t {
            EthernetType::Ipv4 => EthernetType::IPV4,
            EthernetType::Arp => EthernetType::ARP,
            EthernetType::Ipv6 => EthernetType::IPV6,
            EthernetType::Dot1Q => EthernetType::DOT1Q,
            EthernetType::QinQ => EthernetType::QINQ,
            EthernetType::Llc => EthernetType::LLC,
            EthernetType::Unknown(t) => t,
        }
    }
}

impl PartialEq<u16> for EthernetType {
    fn eq(&self, other: &u16) -> bool {
        u16::from(*self).eq(other)
    }
}

impl PartialEq<EthernetType> for u16 {
    fn eq(&self, other: &EthernetType) -> bool {
        u16::from(*other).eq(self)
    }
}

// IpProtocol is an enumeration of IP protocol values, and acts as a decoder
// for any type it supports.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy)]
pub enum IpProtocol {
    Icmpv4,
    Tcp,
    Udp,
    Icmpv6,
    Unknown(u8),
}

impl IpProtocol {
    const ICMPV4: u8 = 1;
    const TCP: u8 = 6;
    const UDP: u8 = 17;
    const ICMPV6: u8 = 58;
}

impl Default for IpProtocol {
    fn default() -> Self {
        IpProtocol::Unknown(0)
    }
}

impl From<u8> for IpProtocol {
    fn from(protocol: u8) -> Self {
        match protocol {
            Self::ICMPV4 => Self::Icmpv4,
            Self::TCP => Self::Tcp,
            Self::UDP => Self::Udp,
            Self::ICMPV6 => Self::Icmpv6,
            p => Self::Unknown(p),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::Icmpv4 => IpProtocol::ICMPV4,
            IpProtocol::Tcp => IpProtocol::TCP,
            IpProtocol::Udp => IpProtocol::UDP,
            IpProtocol::Icmpv6 => IpProtocol::ICMPV6,
            IpProtocol::Unknown(p) => p,
        }
    }
}

impl PartialEq<u8> for IpProtocol {
    fn eq(&self, other: &u8) -> bool {
        u8::from(*self).eq(other)
    }
}

impl PartialEq<IpProtocol> for u8 {
    fn eq(&self, other: &IpProtocol) -> bool {
        u8::from(*other).eq(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum HeaderType {
    Invalid = 0,
    Eth = 0x1,
    Ipv4 = 0x20,
    Ipv6 = 0x40,
    Ipv4Tcp = 0x80,
    Ipv4Udp = 0x81,
    Ipv6Tcp = 0xb0,
    Ipv6Udp = 0xb1,
}

impl HeaderType {
    pub const fn min_packet_size(self) -> usize {
        match self {
            Self::Eth => 14,
            Self::Ipv4 => 14 + 20,
            Self::Ipv6 => 14 + 40,
            Self::Ipv4Tcp => 14 + 20 + 20,
            Self::Ipv4Udp => 14 + 20 + 8,
            Self::Ipv6Tcp => 14 + 40 + 20,
            Self::Ipv6Udp => 14 + 40 + 8,
            Self::Invalid => unreachable!(),
        }
    }

    pub const fn min_header_size(self) -> usize {
        match self {
            Self::Eth => 14,
            Self::Ipv4 => 20,
            Self::Ipv6 => 40,
            Self::Ipv4Tcp => 20,
            Self::Ipv4Udp => 8,
            Self::Ipv6Tcp => 20,
            Self::Ipv6Udp => 8,
            Self::Invalid => unreachable!(),
        }
    }
}

impl Default for HeaderType {
    fn default() -> HeaderType {
        HeaderType::Invalid
    }
}

bitflags! {
    #[derive(Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0b000001;
        const SYN = 0b000010;
        const RST = 0b000100;
        const PSH = 0b001000;
        const ACK = 0b010000;
        const URG = 0b100000;
        const MASK = 0x3F;

        const SYN_ACK = Self::SYN.bits | Self::ACK.bits;
        const FIN_ACK = Self::FIN.bits | Self::ACK.bits;
        const FIN_PSH_ACK = Self::FIN.bits | Self::PSH.bits | Self::ACK.bits;
        const RST_ACK = Self::RST.bits | Self::ACK.bits;
        const RST_PSH_ACK = Self::RST.bits | Self::PSH.bits | Self::ACK.bits;
        const PSH_ACK = Self::PSH.bits | Self::ACK.bits;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bit_strs = vec![];
        if self.contains(Self::FIN) {
            bit_strs.push("FIN");
        }
        if self.contains(Self::SYN) {
            bit_strs.push("SYN");
        }
        if self.contains(Self::RST) {
            bit_strs.push("RST");
        }
        if self.contains(Self::PSH) {
            bit_strs.push("PSH");
        }
        if self.contains(Self::ACK) {
            bit_strs.push("ACK");
        }
        if self.contains(Self::URG) {
            bit_strs.push("URG");
        }
        write!(f, "{}", bit_strs.join("|"))
    }
}

impl TcpFlags {
    pub fn closes_flow(&self) -> bool {
        self.intersects(TcpFlags::FIN | TcpFlags::RST)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketDirection {
    ClientToServer = 0,
    ServerToClient = 1,
}

impl PacketDirection {
    pub fn reversed(&self) -> Self {
        match self {
            PacketDirection::ClientToServer => PacketDirection::ServerToClient,
            PacketDirection::ServerToClient => PacketDirection::ClientToServer,
        }
    }
}

impl Default for PacketDirection {
    fn default() -> Self {
        PacketDirection::ClientToServer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_ethernet_type() {
        let eth_type = EthernetType::Ipv6;
        let ipv6: u16 = eth_type.into();
        assert_eq!(eth_type, 0x86DDu16);
        assert_eq!(0x86DDu16, eth_type);
        assert_eq!(ipv6, 0x86DDu16);
        assert_eq!(EthernetType::Arp, EthernetType::from(0x806u16));
        assert_eq!(EthernetType::Unknown(0x9999), EthernetType::from(0x9999u16));
    }

    #[test]
    fn assert_ip_protocol() {
        let ip = IpProtocol::Tcp;
        assert_eq!(ip, 6);
        assert_eq!(6, ip);
        assert_eq!(IpProtocol::Udp, IpProtocol::from(17u8));
        assert_eq!(IpProtocol::Unknown(47), IpProtocol::from(47u8));
    }

    #[test]
    fn tcp_flag_display_and_close() {
        let flags = TcpFlags::FIN_PSH_ACK;
        assert_eq!(flags.to_string(), "FIN|PSH|ACK");
        assert!(flags.closes_flow());
        assert!(TcpFlags::RST_ACK.closes_flow());
        assert!(!TcpFlags::PSH_ACK.closes_flow());
    }
}
