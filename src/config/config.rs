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

use std::env;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

use crate::flow_generator::{DEFAULT_FLOW_ACTIVE_TIMEOUT, DEFAULT_FLOW_IDLE_TIMEOUT};
use crate::ingestion::DEFAULT_QUEUE_MAX_SIZE;

pub const DEFAULT_LOG_FILE: &str = "/var/log/flow-sentinel/flow-sentinel.log";

const DEFAULT_WORKER_YIELD: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub queue_max_size: usize,
    #[serde(with = "humantime_serde")]
    pub worker_yield: Duration,
    #[serde(with = "humantime_serde")]
    pub flow_idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub flow_active_timeout: Duration,
    pub log_file: String,
    pub log_level: String,
    pub stats_statsd_host: String,
    pub stats_statsd_port: u16,
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            // a deployment without a config file runs on defaults and env
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ConfigError::YamlConfigInvalid(e.to_string())),
        };
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        let mut cfg: Self = if contents.len() == 0 {
            // parsing empty string leads to EOF error
            Self::default()
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;

        // convert relative path to absolute
        if Path::new(&cfg.log_file).is_relative() {
            let Ok(mut pb) = env::current_dir() else {
                return Err(ConfigError::YamlConfigInvalid("get cwd failed".to_owned()));
            };
            pb.push(&cfg.log_file);
            match pb.to_str() {
                Some(s) => cfg.log_file = s.to_owned(),
                None => {
                    return Err(ConfigError::YamlConfigInvalid(format!(
                        "invalid log path {}",
                        cfg.log_file
                    )))
                }
            }
        }

        Ok(cfg)
    }

    // Deployment environment always wins over the config file.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = env_var("DETECTOR_HOST") {
            self.listen_host = host;
        }
        if let Some(port) = env_var("DETECTOR_PORT") {
            self.listen_port = port
                .parse()
                .map_err(|_| ConfigError::InvalidConfig(format!("DETECTOR_PORT={}", port)))?;
        }
        if let Some(size) = env_var("QUEUE_MAX_SIZE") {
            self.queue_max_size = size
                .parse()
                .map_err(|_| ConfigError::InvalidConfig(format!("QUEUE_MAX_SIZE={}", size)))?;
        }
        if let Some(secs) = env_var("WORKER_SLEEP") {
            // fractional seconds, "0.01" is 10ms
            let secs_f64: f64 = secs
                .parse()
                .map_err(|_| ConfigError::InvalidConfig(format!("WORKER_SLEEP={}", secs)))?;
            if !secs_f64.is_finite() || secs_f64 < 0.0 {
                return Err(ConfigError::InvalidConfig(format!("WORKER_SLEEP={}", secs)));
            }
            self.worker_yield = Duration::from_secs_f64(secs_f64);
        }
        if let Some(secs) = env_var("FLOW_IDLE_TIMEOUT") {
            let secs: u64 = secs.parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("FLOW_IDLE_TIMEOUT={}", secs))
            })?;
            self.flow_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_var("FLOW_ACTIVE_TIMEOUT") {
            let secs: u64 = secs.parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("FLOW_ACTIVE_TIMEOUT={}", secs))
            })?;
            self.flow_active_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "listen-host {} is not an IP address",
                self.listen_host
            )));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "listen-port must not be 0".to_owned(),
            ));
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue-max-size must not be 0".to_owned(),
            ));
        }
        if self.flow_idle_timeout.is_zero() || self.flow_active_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "flow timeouts must not be 0".to_owned(),
            ));
        }
        if LevelFilter::from_str(&self.log_level).is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "log-level {} unknown",
                self.log_level
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_owned(),
            listen_port: 8080,
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            worker_yield: DEFAULT_WORKER_YIELD,
            flow_idle_timeout: DEFAULT_FLOW_IDLE_TIMEOUT,
            flow_active_timeout: DEFAULT_FLOW_ACTIVE_TIMEOUT,
            log_file: DEFAULT_LOG_FILE.to_owned(),
            log_level: "info".to_owned(),
            stats_statsd_host: "127.0.0.1".to_owned(),
            stats_statsd_port: 8125,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    if envmnt::exists(key) {
        Some(envmnt::get_or(key, ""))
    } else {
        None
    }
}
