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

use std::{env, path::PathBuf};

use anyhow::{anyhow, bail, Context};

use crate::consts;

/// Runtime configuration, populated from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// `PORT`: the inbound SSH listen port.
    pub port: u16,

    /// `LOG_LEVEL`: one of debug/info/warn/error, defaulting to info.
    pub log_level: String,

    /// `PG_HOST`: the postgres connection string handed to the
    /// persistence layer.
    pub pg_host: String,

    /// `DOCKER_HOST`: where to reach the container runtime, either a
    /// `unix://` socket path or a `tcp://host:port` endpoint.
    pub docker_host: String,

    /// `DOCKER_NETWORK_NAME`: the network every spawned container joins.
    /// The backend address handed to the proxy is the container's IP on
    /// this network, so it is required; there is no published-port
    /// fallback.
    pub docker_network: String,

    /// `HONEYPOT_IMAGE`: the image tag backing the warm pool.
    pub honeypot_image: String,

    /// `SSH_HOST_KEYS`: colon-separated paths to private keys presented
    /// to attackers as our host keys.
    pub ssh_host_keys: Vec<PathBuf>,

    /// `HOST_BUFFER`: how many idle containers the pool keeps warm.
    pub host_buffer: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a Config from a lookup function. Tests inject a map here so
    /// they never have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required =
            |key: &str| lookup(key).ok_or_else(|| anyhow!("{} must be set", key));

        let port = match lookup("PORT") {
            Some(raw) => raw.parse().with_context(|| format!("parsing PORT {raw:?}"))?,
            None => consts::DEFAULT_PORT,
        };

        let host_buffer = match lookup("HOST_BUFFER") {
            Some(raw) => {
                raw.parse().with_context(|| format!("parsing HOST_BUFFER {raw:?}"))?
            }
            None => consts::DEFAULT_HOST_BUFFER,
        };

        let ssh_host_keys: Vec<PathBuf> = required("SSH_HOST_KEYS")?
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if ssh_host_keys.is_empty() {
            bail!("SSH_HOST_KEYS must name at least one private key");
        }

        Ok(Config {
            port,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| String::from("info")),
            pg_host: required("PG_HOST")?,
            docker_host: lookup("DOCKER_HOST")
                .unwrap_or_else(|| String::from(consts::DEFAULT_DOCKER_HOST)),
            docker_network: required("DOCKER_NETWORK_NAME")?,
            honeypot_image: lookup("HONEYPOT_IMAGE")
                .unwrap_or_else(|| String::from(consts::DEFAULT_IMAGE)),
            ssh_host_keys,
            host_buffer,
        })
    }

    pub fn log_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}
