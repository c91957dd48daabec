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

use anyhow::Result;
use clap::{ArgAction, Parser};
#[cfg(unix)]
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use ::flow_sentinel::sentinel::{Sentinel, VersionInfo};

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long, default_value = "/etc/flow-sentinel.yaml")]
    config_file: String,

    /// Display the version
    #[clap(short, long, action = ArgAction::SetTrue)]
    version: bool,
}

static VERSION_INFO: VersionInfo = VersionInfo {
    name: "flow-sentinel",
    branch: env!("BRANCH"),
    commit_id: env!("REVISION"),
    rev_count: env!("REV_COUNT"),
    compiler: env!("RUSTC_VERSION"),
    compile_time: env!("COMPILE_TIME"),
    revision: concat!(env!("REV_COUNT"), "-", env!("REVISION")),
};

#[cfg(unix)]
fn wait_on_signals() {
    let mut signals = Signals::new(TERM_SIGNALS).unwrap();
    signals.forever().next();
    signals.handle().close();
}

#[cfg(windows)]
fn wait_on_signals() {}

fn main() -> Result<()> {
    let opts = Opts::parse();
    if opts.version {
        println!("{} {}", VERSION_INFO.revision, env!("COMMIT_DATE"));
        println!(env!("RUSTC_VERSION"));
        return Ok(());
    }
    let mut sentinel = Sentinel::start(&opts.config_file, &VERSION_INFO)?;
    wait_on_signals();
    sentinel.stop();

    Ok(())
}
