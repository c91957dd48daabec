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

mod flow_session;
pub mod flow_table;
mod flow_thread;

pub use flow_session::FlowSession;
pub use flow_table::{FlowTable, FlowTimeout, Observed};
pub use flow_thread::{CapturedFrame, FlowGeneratorThread};

use std::time::Duration;

const TIME_UNIT: Duration = Duration::from_secs(1);
const QUEUE_BATCH_SIZE: usize = 1024;
const QUEUE_READ_TIMEOUT: Duration = Duration::from_secs(1);
// initial slot count of the session table, grows with load
const HASH_SLOTS: usize = 1 << 10;

pub const DEFAULT_FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FLOW_ACTIVE_TIMEOUT: Duration = Duration::from_secs(1800);
