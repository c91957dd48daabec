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

use std::error::Error;
use std::process::Command;

use chrono::Utc;

struct EnvCommand(&'static str, Vec<&'static str>);

// release tarballs build outside a git checkout, placeholders keep the
// binary's version output well formed there
fn set_build_info() -> Result<(), Box<dyn Error>> {
    println!(
        "cargo:rustc-env=COMPILE_TIME={}",
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    );
    let entries = vec![
        EnvCommand("BRANCH", vec!["git", "rev-parse", "--abbrev-ref", "HEAD"]),
        EnvCommand("REV_COUNT", vec!["git", "rev-list", "--count", "HEAD"]),
        EnvCommand(
            "COMMIT_DATE",
            vec!["git", "show", "-s", "--format=%cd", "--date=short", "HEAD"],
        ),
        EnvCommand("REVISION", vec!["git", "rev-parse", "HEAD"]),
        EnvCommand("RUSTC_VERSION", vec!["rustc", "--version"]),
    ];
    for e in entries {
        let value = Command::new(e.1[0])
            .args(&e.1[1..])
            .output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|| "unknown".to_owned());
        println!("cargo:rustc-env={}={}", e.0, value);
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    set_build_info()?;
    Ok(())
}
