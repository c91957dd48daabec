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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use hyper::{
    body::{aggregate, Buf},
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use log::{debug, error, info, warn};
use tokio::{runtime::Runtime, sync::mpsc, task::JoinHandle};

use crate::common::FeatureRecord;
use public::{
    counter::{Counter, CounterType, CounterValue, OwnedCountable},
    queue,
};

type GenericError = Box<dyn std::error::Error + Send + Sync>;

const NOT_FOUND: &[u8] = b"Not Found";

const RECEIVED: &str = r#"{"status":"received"}"#;
const INVALID_JSON: &str = r#"{"detail":"invalid JSON"}"#;
const QUEUE_FULL: &str = r#"{"detail":"ingestion queue full"}"#;

#[derive(Default)]
pub struct IngestMetrics {
    requests: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    accepted: AtomicU64,
}

pub struct IngestCounter {
    metrics: Arc<IngestMetrics>,
}

impl OwnedCountable for IngestCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "requests",
                CounterType::Counted,
                CounterValue::Unsigned(self.metrics.requests.swap(0, Ordering::Relaxed)),
            ),
            (
                "malformed",
                CounterType::Counted,
                CounterValue::Unsigned(self.metrics.malformed.swap(0, Ordering::Relaxed)),
            ),
            (
                "rejected",
                CounterType::Counted,
                CounterValue::Unsigned(self.metrics.rejected.swap(0, Ordering::Relaxed)),
            ),
            (
                "accepted",
                CounterType::Counted,
                CounterValue::Unsigned(self.metrics.accepted.swap(0, Ordering::Relaxed)),
            ),
        ]
    }

    fn closed(&self) -> bool {
        false
    }
}

fn json_response<T: Into<Body>>(status: StatusCode, body: T) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn aggregate_with_catch_exception(body: Body) -> Result<impl Buf, Response<Body>> {
    aggregate(body).await.map_err(|e| {
        if e.is_user() {
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(e.to_string().into())
                .unwrap()
        } else {
            error!("ingest server read body error: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(e.to_string().into())
                .unwrap()
        }
    })
}

async fn handler(
    peer_addr: SocketAddr,
    req: Request<Body>,
    record_sender: Arc<queue::Sender<Box<FeatureRecord>>>,
    metrics: Arc<IngestMetrics>,
) -> Result<Response<Body>, GenericError> {
    match (req.method(), req.uri().path()) {
        // external feature record intake
        (&Method::POST, "/predict") => {
            metrics.requests.fetch_add(1, Ordering::Relaxed);
            let mut whole_body = match aggregate_with_catch_exception(req.into_body()).await {
                Ok(b) => b,
                Err(e) => {
                    return Ok(e);
                }
            };
            let mut payload = vec![0u8; whole_body.remaining()];
            whole_body.copy_to_slice(payload.as_mut_slice());
            let record = match serde_json::from_slice::<FeatureRecord>(payload.as_slice()) {
                Ok(r) => r,
                Err(e) => {
                    debug!("malformed record from {}: {}", peer_addr, e);
                    metrics.malformed.fetch_add(1, Ordering::Relaxed);
                    return Ok(json_response(StatusCode::BAD_REQUEST, INVALID_JSON));
                }
            };
            match record_sender.send(Box::new(record)) {
                Ok(()) => {
                    metrics.accepted.fetch_add(1, Ordering::Relaxed);
                    Ok(json_response(StatusCode::OK, RECEIVED))
                }
                Err(queue::Error::Full(_)) => {
                    metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("ingestion queue full, rejecting record from {}", peer_addr);
                    Ok(json_response(StatusCode::SERVICE_UNAVAILABLE, QUEUE_FULL))
                }
                Err(e) => {
                    // terminated queue, the process is shutting down
                    warn!("ingestion queue unavailable: {}", e);
                    Ok(json_response(StatusCode::SERVICE_UNAVAILABLE, QUEUE_FULL))
                }
            }
        }
        (&Method::GET, "/healthz") => Ok(json_response(
            StatusCode::OK,
            format!(
                r#"{{"status":"ok","queue_length":{}}}"#,
                record_sender.len()
            ),
        )),
        // Return the 404 Not Found for other routes.
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(NOT_FOUND.into())
            .unwrap()),
    }
}

/// Listens on the configured HTTP port, parses feature records out of
/// POST bodies and places them on the ingestion queue.
pub struct IngestServer {
    running: Arc<AtomicBool>,
    runtime: Arc<Runtime>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    record_sender: Arc<queue::Sender<Box<FeatureRecord>>>,
    listen_addr: SocketAddr,
    server_shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    metrics: Arc<IngestMetrics>,
}

impl IngestServer {
    pub fn new(
        runtime: Arc<Runtime>,
        record_sender: Arc<queue::Sender<Box<FeatureRecord>>>,
        listen_addr: SocketAddr,
    ) -> (Self, IngestCounter) {
        let metrics = Arc::new(IngestMetrics::default());
        (
            Self {
                running: Default::default(),
                runtime,
                thread: Arc::new(Mutex::new(None)),
                record_sender,
                listen_addr,
                server_shutdown_tx: Default::default(),
                metrics: metrics.clone(),
            },
            IngestCounter { metrics },
        )
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }

        let record_sender = self.record_sender.clone();
        let metrics = self.metrics.clone();
        let addr = self.listen_addr;
        let running = self.running.clone();
        let (tx, mut rx) = mpsc::channel(8);
        self.server_shutdown_tx.lock().unwrap().replace(tx);

        self.thread
            .lock()
            .unwrap()
            .replace(self.runtime.spawn(async move {
                info!("ingest server starting");
                while running.load(Ordering::Relaxed) {
                    let mut max_tries = 0;
                    let server_builder = loop {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        while let Ok(_) = rx.try_recv() {} // drain useless messages
                        match Server::try_bind(&addr) {
                            Ok(s) => break s,
                            Err(e) => {
                                // Binding right after a stop may race the OS
                                // releasing the port, retry before complaining.
                                if max_tries < 2 {
                                    max_tries += 1;
                                    sleep(Duration::from_secs(1));
                                    continue;
                                }
                                error!("ingest server error: {} with addr={}", e, addr);
                                sleep(Duration::from_secs(60));
                                continue;
                            }
                        }
                    };

                    let record_sender = record_sender.clone();
                    let metrics = metrics.clone();
                    let service = make_service_fn(move |conn: &AddrStream| {
                        let record_sender = record_sender.clone();
                        let metrics = metrics.clone();
                        let peer_addr = conn.remote_addr();
                        async move {
                            Ok::<_, GenericError>(service_fn(move |req| {
                                handler(peer_addr, req, record_sender.clone(), metrics.clone())
                            }))
                        }
                    });

                    let server = server_builder.serve(service).with_graceful_shutdown(async {
                        let _ = rx.recv().await;
                    });

                    info!("ingest server listening on http://{}", addr);
                    if let Err(e) = server.await {
                        error!("ingest server error: {}", e);
                    }
                }
            }));
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }

        if let Some(tx) = self.server_shutdown_tx.lock().unwrap().take() {
            let _ = self.runtime.block_on(tx.send(()));
        }

        if let Some(t) = self.thread.lock().unwrap().take() {
            t.abort();
        }

        info!("ingest server stopped");
    }
}
