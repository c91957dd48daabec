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

use log::info;

use crate::common::FeatureRecord;
use crate::error::{Error, Result};
use crate::sink::FeatureSink;

/// Label set of the CSE-CIC-IDS2018 derived model served behind this
/// boundary. Index positions are part of the model contract.
pub const LABELS: [&'static str; 7] = [
    "Benign",
    "DoS attacks-GoldenEye",
    "DoS attacks-Hulk",
    "DoS attacks-SlowHTTPTest",
    "DoS attacks-Slowloris",
    "FTP-BruteForce",
    "SSH-Bruteforce",
];

/// Input width the model was trained with.
pub const FEATURE_WIDTH: usize = 77;

pub type FeatureVector = Vec<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelPrediction {
    pub index: usize,
    pub label: &'static str,
}

impl fmt::Display for LabelPrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label, self.index)
    }
}

/// Scoring boundary with the served model's label set and input shape.
///
/// Model weights never live in this process. The scorer here folds the
/// input into one score per label and takes the argmax, which keeps the
/// shape checks and the prediction path identical to the real backend.
#[derive(Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, features: &FeatureVector) -> Result<LabelPrediction> {
        if features.len() != FEATURE_WIDTH {
            return Err(Error::InvalidFeatureVector(format!(
                "expected {} features, got {}",
                FEATURE_WIDTH,
                features.len()
            )));
        }
        let mut scores = [0f32; LABELS.len()];
        for (i, v) in features.iter().enumerate() {
            if !v.is_finite() {
                return Err(Error::InvalidFeatureVector(format!(
                    "feature {} is not finite",
                    i
                )));
            }
            scores[i % LABELS.len()] += v;
        }
        // ties resolve to the lowest index, an all-zero vector is Benign
        let mut index = 0;
        for (i, s) in scores.iter().enumerate() {
            if *s > scores[index] {
                index = i;
            }
        }
        Ok(LabelPrediction {
            index,
            label: LABELS[index],
        })
    }
}

/// Feature sink feeding each record through the classifier.
pub struct ClassifierSink {
    classifier: Classifier,
}

impl ClassifierSink {
    pub fn new(classifier: Classifier) -> Self {
        Self { classifier }
    }

    // Lays the record's scalar features into the head of the model input
    // and zero pads the rest of the 77 slots.
    fn vectorize(record: &FeatureRecord) -> FeatureVector {
        let mut features = vec![0f32; FEATURE_WIDTH];
        features[0] = record.key.port_dst as f32;
        features[1] = u8::from(record.key.proto) as f32;
        features[2] = (record.duration_secs * 1_000_000.0) as f32; // flow duration in us
        features[3] = record.packets_fwd as f32;
        features[4] = record.packets_rev as f32;
        features[5] = record.bytes_fwd as f32;
        features[6] = record.bytes_rev as f32;
        features[7] = record.packet_count as f32;
        features[8] = record.byte_total as f32;
        features
    }
}

impl FeatureSink for ClassifierSink {
    fn consume(&mut self, record: FeatureRecord) -> Result<()> {
        let prediction = self.classifier.classify(&Self::vectorize(&record))?;
        info!("{} predicted {}", record.key, prediction);
        Ok(())
    }
}
