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

//! Feature record intake over HTTP and the worker draining it.
//!
//! [`IngestServer`] accepts JSON feature records on `POST /predict` and
//! parks them on a bounded queue, failing fast with 503 when the queue is
//! full so callers see back pressure instead of silent drops.
//! [`RecordProcessor`] is the single consumer on the other end, feeding
//! each record to a [`crate::sink::FeatureSink`].

mod processor;
mod server;

pub use processor::RecordProcessor;
pub use server::{IngestCounter, IngestServer};

use std::time::Duration;

pub const DEFAULT_QUEUE_MAX_SIZE: usize = 2000;

const QUEUE_READ_TIMEOUT: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(3);
