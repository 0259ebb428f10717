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

use std::{
    fs, io,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;

mod config;
mod consts;
mod db;
mod pool;
mod sftp;
mod ssh;
mod wire;

/// The command line arguments that sshtrap expects. Everything about
/// what to trap and where to record it comes from the environment (see
/// `config`); the flags only steer the process itself.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short = 'V', long, action, help = "Print version")]
    pub version: bool,

    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr. The level is controlled by the
LOG_LEVEL environment variable (debug/info/warn/error)."
    )]
    pub log_file: Option<String>,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        self.version
    }
}

/// Run the honeypot until the process is told to stop: connect the
/// store, warm up the container pool, serve SSH, then unwind in reverse
/// order on SIGINT/SIGTERM.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let config =
        config::Config::from_env().context("reading configuration from the environment")?;

    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(config.log_level())
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(config.log_level())
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    info!("\n\n======================== STARTING SSHTRAP ============================\n\n");

    // the persistence sink, the host keys, the pool, and the listener
    // all fail fast: a trap that cannot record or cannot serve is not
    // worth running. The server is built before the pool warms up so a
    // bad host key does not leave orphaned containers behind.
    let db = Arc::new(db::Db::connect(&config.pg_host).await?);
    let pool = pool::HostPool::new(&config)?;
    let server = ssh::Server::new(&config, Arc::clone(&pool), Arc::clone(&db))?;

    pool.start(consts::RUNTIME_DEADLINE).await.context("starting host pool")?;
    if let Err(err) = server.start().await {
        // clean up the containers the warm-up already created
        if let Err(stop_err) = pool.stop(consts::RUNTIME_DEADLINE).await {
            error!("stopping host pool: {stop_err:#}");
        }
        return Err(err);
    }

    wait_for_shutdown().await?;
    info!("shutting down");

    if let Err(err) = server.stop().await {
        error!("stopping ssh server: {err:#}");
    }
    if let Err(err) = pool.stop(consts::RUNTIME_DEADLINE).await {
        error!("stopping host pool: {err:#}");
    }

    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = term.recv() => {}
        res = tokio::signal::ctrl_c() => res.context("waiting for ctrl-c")?,
    }
    Ok(())
}
