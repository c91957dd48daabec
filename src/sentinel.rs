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
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use flexi_logger::{
    colored_opt_format, Age, Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming,
};
use log::info;
use tokio::runtime::{Builder, Runtime};

use crate::{
    classifier::{Classifier, ClassifierSink},
    common::FeatureRecord,
    config::Config,
    flow_generator::{CapturedFrame, FlowGeneratorThread, FlowTimeout},
    ingestion::{IngestServer, RecordProcessor},
    utils::{
        logger::{LogLevelWriter, LogWriterAdapter},
        stats::{self, Countable, RefCountable, StatsOption},
    },
};
use public::queue;

// capture adapters burst, so the frame queue runs much deeper than the
// record queue
const FRAME_QUEUE_SIZE: usize = 1 << 16;
const DEFAULT_LOG_RETENTION: usize = 30;
const ASYNC_WORKER_THREAD_NUMBER: usize = 2;

pub struct VersionInfo {
    pub name: &'static str,
    pub branch: &'static str,
    pub commit_id: &'static str,
    pub rev_count: &'static str,
    pub compiler: &'static str,
    pub compile_time: &'static str,

    pub revision: &'static str,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}
Name: {}
Branch: {}
CommitId: {}
RevCount: {}
Compiler: {}
CompileTime: {}",
            self.rev_count,
            self.commit_id,
            self.name,
            self.branch,
            self.commit_id,
            self.rev_count,
            self.compiler,
            self.compile_time
        )
    }
}

/// Owns every running component and the queues wiring them together.
///
/// Records enter through two doors, the HTTP ingest server and the flow
/// generator fed by a capture adapter, and leave through one, the record
/// processor draining into the classifier.
pub struct Sentinel {
    frame_sender: queue::Sender<CapturedFrame>,

    flow_generator: FlowGeneratorThread,
    processor: RecordProcessor,
    server: IngestServer,
    stats_collector: Arc<stats::Collector>,

    #[allow(dead_code)]
    runtime: Arc<Runtime>,

    // dropping the handle shuts logging down
    #[allow(dead_code)]
    logger_handle: LoggerHandle,
}

impl Sentinel {
    pub fn start<P: AsRef<Path>>(
        config_path: P,
        version_info: &'static VersionInfo,
    ) -> Result<Sentinel> {
        let config = Config::load_from_file(config_path.as_ref())?;

        let (log_level_writer, log_level_counter) = LogLevelWriter::new();
        let logger = Logger::try_with_env_or_str(&config.log_level)?.format(colored_opt_format);
        // check log folder permission
        let base_path = Path::new(&config.log_file).parent().unwrap();
        let write_to_file = if base_path.exists() {
            base_path
                .metadata()
                .ok()
                .map(|meta| !meta.permissions().readonly())
                .unwrap_or(false)
        } else {
            fs::create_dir_all(base_path).is_ok()
        };
        let logger = if write_to_file {
            logger
                .log_to_file_and_writer(
                    FileSpec::try_from(&config.log_file)?,
                    Box::new(LogWriterAdapter::new(vec![Box::new(log_level_writer)])),
                )
                .rotate(
                    Criterion::Age(Age::Day),
                    Naming::Timestamps,
                    Cleanup::KeepLogFiles(DEFAULT_LOG_RETENTION),
                )
                .create_symlink(&config.log_file)
                .append()
        } else {
            eprintln!(
                "Log file path '{}' access denied, logs will not be written to file",
                &config.log_file
            );
            logger.log_to_writer(Box::new(LogWriterAdapter::new(vec![Box::new(
                log_level_writer,
            )])))
        };

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let logger = if nix::unistd::getppid().as_raw() != 1 {
            logger.duplicate_to_stderr(flexi_logger::Duplicate::All)
        } else {
            logger
        };
        let logger_handle = logger.start()?;

        let stats_collector = Arc::new(stats::Collector::new(
            &config.stats_statsd_host,
            config.stats_statsd_port,
        ));
        stats_collector.start();

        stats_collector.register_countable(
            "log_counter",
            stats::Countable::Owned(Box::new(log_level_counter)),
            Default::default(),
        );

        info!("==================== Launching Flow-Sentinel ====================");
        info!("version {}", version_info);
        info!("static_config {:#?}", config);

        let (frame_sender, frame_receiver, frame_counter) =
            queue::bounded::<CapturedFrame>(FRAME_QUEUE_SIZE);
        stats_collector.register_countable(
            "queue",
            Countable::Owned(Box::new(frame_counter)),
            vec![StatsOption::Tag(
                "module",
                "0-raw-frame-to-flow-generator".to_string(),
            )],
        );

        let (record_sender, record_receiver, record_counter) =
            queue::bounded::<Box<FeatureRecord>>(config.queue_max_size);
        stats_collector.register_countable(
            "queue",
            Countable::Owned(Box::new(record_counter)),
            vec![StatsOption::Tag(
                "module",
                "1-feature-record-to-processor".to_string(),
            )],
        );

        let runtime = Arc::new(
            Builder::new_multi_thread()
                .worker_threads(ASYNC_WORKER_THREAD_NUMBER)
                .enable_all()
                .build()
                .unwrap(),
        );

        let mut flow_generator = FlowGeneratorThread::new(
            frame_receiver,
            record_sender.clone(),
            FlowTimeout {
                idle: config.flow_idle_timeout,
                active: config.flow_active_timeout,
            },
            stats_collector.clone(),
        );

        let listen_addr = SocketAddr::new(config.listen_host.parse()?, config.listen_port);
        let (server, server_counter) = IngestServer::new(
            runtime.clone(),
            Arc::new(record_sender.clone()),
            listen_addr,
        );
        stats_collector.register_countable(
            "ingest_server",
            Countable::Owned(Box::new(server_counter)),
            Default::default(),
        );

        let (mut processor, processor_counter) = RecordProcessor::new(
            record_receiver,
            Box::new(ClassifierSink::new(Classifier::new())),
            config.worker_yield,
        );
        stats_collector.register_countable(
            "record_processor",
            Countable::Ref(Arc::downgrade(&processor_counter) as std::sync::Weak<dyn RefCountable>),
            Default::default(),
        );

        processor.start();
        flow_generator.start();
        server.start();

        Ok(Sentinel {
            frame_sender,
            flow_generator,
            processor,
            server,
            stats_collector,
            runtime,
            logger_handle,
        })
    }

    /// Capture adapters clone this sender to feed raw frames in.
    pub fn frame_sender(&self) -> &queue::Sender<CapturedFrame> {
        &self.frame_sender
    }

    pub fn stop(&mut self) {
        info!("stopping flow-sentinel");
        self.server.stop();
        self.processor.stop();
        // joining the generator flushes the table, anything it emits
        // past this point stays on the queue and is dropped with it
        self.flow_generator.stop();
        self.stats_collector.stop();
        info!("stopped flow-sentinel");
    }
}
