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

// offsets below are for untagged frames, add VLAN_HEADER_SIZE per 802.1Q tag
pub const FIELD_OFFSET_ETH_TYPE: usize = 12;
pub const FIELD_OFFSET_IHL: usize = 14;
pub const FIELD_OFFSET_TOTAL_LEN: usize = 16;
pub const FIELD_OFFSET_FRAG: usize = 20;
pub const FIELD_OFFSET_SIP: usize = 26;
pub const FIELD_OFFSET_DIP: usize = 30;
pub const FIELD_OFFSET_SPORT: usize = 34;
pub const FIELD_OFFSET_DPORT: usize = 36;
pub const FIELD_OFFSET_TCP_FLAG: usize = 47;
pub const FIELD_OFFSET_PAYLOAD_LEN: usize = 18;
pub const FIELD_OFFSET_IPV6_SRC: usize = 22;
pub const FIELD_OFFSET_IPV6_DST: usize = 38;
pub const FIELD_OFFSET_IPV6_SPORT: usize = 54;
pub const FIELD_OFFSET_IPV6_DPORT: usize = 56;
pub const FIELD_OFFSET_TCPV6_FLAG: usize = 67;

pub const MAC_ADDR_LEN: usize = 6;
pub const ETH_TYPE_LEN: usize = 2;
pub const IPV4_ADDR_LEN: usize = 4;
pub const IPV6_ADDR_LEN: usize = 16;

pub const ETH_HEADER_SIZE: usize = MAC_ADDR_LEN * 2 + ETH_TYPE_LEN;
pub const VLAN_HEADER_SIZE: usize = 4;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const IPV4_PROTO_OFFSET: usize = ETH_HEADER_SIZE + 9; // 23
pub const IPV6_PROTO_OFFSET: usize = ETH_HEADER_SIZE + 6; // 20

pub const IPV6_HEADER_ADJUST: usize = IPV6_HEADER_SIZE - IPV4_HEADER_SIZE;

pub const VLAN_ID_MASK: u16 = 0xfff;
