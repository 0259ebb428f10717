// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// sshtrap is an SSH honeypot proxy: every attacker who connects is
/// bridged to a disposable container running a real SSH server, and
/// everything they do is captured and stored. See libsshtrap for the
/// implementation.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = libsshtrap::Args::parse();

    if args.version() {
        println!("sshtrap {}", VERSION);
        return Ok(());
    }

    libsshtrap::run(args).await
}
