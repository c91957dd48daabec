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

//! One-shot provisioning of the search backend: creates missing indices
//! from a mappings file and imports the dashboard saved-objects export.
//! Safe to run repeatedly, existing indices are left untouched and the
//! import overwrites in place.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context, Result};
use http::header::CONTENT_TYPE;
use hyper::{body::to_bytes, client::HttpConnector, Body, Client, Request, StatusCode};
use serde_json::Value;
use tokio::runtime::Runtime;

const INDEX_MAPPINGS_FILE: &str = "index-mappings.json";
const DASHBOARDS_FILE: &str = "dashboards.ndjson";

const ENV_OPENSEARCH_HOST: &str = "STATEINIT_OPENSEARCH_HOST";
const ENV_OPENSEARCH_PORT: &str = "STATEINIT_OPENSEARCH_PORT";
const ENV_DASHBOARDS_HOST: &str = "STATEINIT_OPENSEARCH_DASHBOARDS_HOST";
const ENV_DASHBOARDS_PORT: &str = "STATEINIT_OPENSEARCH_DASHBOARDS_PORT";
const ENV_RESOURCES_PATH: &str = "STATEINIT_OPENSEARCH_DASHBOARDS_RESOURCES_PATH";

const MULTIPART_BOUNDARY: &str = "---------------------------sentinelstateinit";

fn required_env(key: &str) -> Result<String> {
    if !envmnt::exists(key) {
        return Err(anyhow!("environment variable {} is not set", key));
    }
    Ok(envmnt::get_or(key, ""))
}

fn endpoint(host_key: &str, port_key: &str) -> Result<String> {
    let host = required_env(host_key)?;
    let port = required_env(port_key)?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("{}={} is not a port number", port_key, port))?;
    Ok(format!("http://{}:{}", host, port))
}

struct StateInit {
    runtime: Runtime,
    client: Client<HttpConnector>,
    search_endpoint: String,
    dashboards_endpoint: String,
    // index name to mappings body, creation runs in name order
    index_mappings: BTreeMap<String, Value>,
    dashboards: Vec<u8>,
}

impl StateInit {
    // everything fallible up front, no network traffic before the
    // environment and resource files check out
    fn new() -> Result<Self> {
        let search_endpoint = endpoint(ENV_OPENSEARCH_HOST, ENV_OPENSEARCH_PORT)?;
        let dashboards_endpoint = endpoint(ENV_DASHBOARDS_HOST, ENV_DASHBOARDS_PORT)?;
        let resources = PathBuf::from(required_env(ENV_RESOURCES_PATH)?);

        let mappings_path = resources.join(INDEX_MAPPINGS_FILE);
        let contents = fs::read_to_string(&mappings_path)
            .with_context(|| format!("reading {}", mappings_path.display()))?;
        let index_mappings: BTreeMap<String, Value> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", mappings_path.display()))?;

        let dashboards_path = resources.join(DASHBOARDS_FILE);
        let dashboards = fs::read(&dashboards_path)
            .with_context(|| format!("reading {}", dashboards_path.display()))?;

        Ok(Self {
            runtime: Runtime::new()?,
            client: Client::new(),
            search_endpoint,
            dashboards_endpoint,
            index_mappings,
            dashboards,
        })
    }

    fn run(&self) -> Result<()> {
        self.runtime.block_on(async {
            for (index, mappings) in self.index_mappings.iter() {
                self.ensure_index(index, mappings).await?;
            }
            self.import_dashboards().await
        })
    }

    async fn ensure_index(&self, index: &str, mappings: &Value) -> Result<()> {
        let uri = format!("{}/{}", self.search_endpoint, index);
        let req = Request::head(uri.as_str()).body(Body::empty())?;
        let resp = self
            .client
            .request(req)
            .await
            .with_context(|| format!("HEAD {}", uri))?;
        match resp.status() {
            StatusCode::OK => {
                println!("index {} already exists, skipping", index);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                let req = Request::put(uri.as_str())
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(mappings)?))?;
                let resp = self
                    .client
                    .request(req)
                    .await
                    .with_context(|| format!("PUT {}", uri))?;
                if !resp.status().is_success() {
                    return Err(response_error(&format!("PUT {}", uri), resp).await);
                }
                println!("created index {}", index);
                Ok(())
            }
            status => Err(anyhow!("HEAD {} returned {}", uri, status)),
        }
    }

    async fn import_dashboards(&self) -> Result<()> {
        let uri = format!(
            "{}/api/saved_objects/_import?overwrite=true",
            self.dashboards_endpoint
        );

        let mut body = Vec::with_capacity(self.dashboards.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                DASHBOARDS_FILE
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/x-ndjson\r\n\r\n");
        body.extend_from_slice(&self.dashboards);
        body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());

        let req = Request::post(uri.as_str())
            // dashboards reject any mutating request without this header
            .header("osd-xsrf", "true")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(Body::from(body))?;
        let resp = self
            .client
            .request(req)
            .await
            .with_context(|| format!("POST {}", uri))?;
        if !resp.status().is_success() {
            return Err(response_error(&format!("POST {}", uri), resp).await);
        }
        println!("imported dashboards from {}", DASHBOARDS_FILE);
        Ok(())
    }
}

async fn response_error(op: &str, resp: hyper::Response<Body>) -> anyhow::Error {
    let status = resp.status();
    let body = to_bytes(resp.into_body()).await.unwrap_or_default();
    anyhow!("{} returned {}: {}", op, status, String::from_utf8_lossy(&body))
}

fn main() {
    let result = StateInit::new().and_then(|s| s.run());
    if let Err(e) = result {
        eprintln!("state-init failed: {:#}", e);
        process::exit(1);
    }
    println!("state-init completed");
}
