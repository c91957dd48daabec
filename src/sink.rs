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

use log::debug;

use crate::common::FeatureRecord;
use crate::error::Result;

/// Downstream consumer of feature records.
///
/// Records reach the sink one at a time from a single consumer thread,
/// implementations only need to be Send, not Sync.
pub trait FeatureSink: Send {
    fn consume(&mut self, record: FeatureRecord) -> Result<()>;
}

/// Sink used when no classifier is configured, logs and drops.
#[derive(Default)]
pub struct LogSink;

impl FeatureSink for LogSink {
    fn consume(&mut self, record: FeatureRecord) -> Result<()> {
        debug!("feature record: {}", record);
        Ok(())
    }
}
