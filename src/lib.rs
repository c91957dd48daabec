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

#![allow(dead_code)]

mod classifier;
mod common;
mod config;
mod error;
mod flow_generator;
mod ingestion;
pub mod sentinel;
mod sink;
mod utils;

// for benchmarks
#[doc(hidden)]
pub use {
    common::enums::TcpFlags as _TcpFlags,
    flow_generator::flow_table::{_new_flow_table_and_receiver, _new_packet, _reverse_packet},
    flow_generator::FlowTimeout as _FlowTimeout,
};
