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

//! The warm pool of disposable SSH-serving containers.
//!
//! A background controller keeps `HOST_BUFFER` idle containers running at
//! all times so an attacker never waits for a cold start. `get_host`
//! leases one (creating synchronously if the pool ran dry), and
//! `stop_host` destroys it after the session ends. Containers are never
//! reused.

use std::{
    collections::HashMap,
    io::Read as _,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bollard::{
    container::{
        Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
        NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    image::{CreateImageOptions, ListImagesOptions},
    models::{EndpointSettings, HostConfig},
    Docker, API_DEFAULT_VERSION,
};
use futures::StreamExt as _;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{config, consts};

mod host;

pub use host::PooledHost;

// The docker client's own request timeout; individual calls are further
// bounded by the caller's deadline.
const CLIENT_TIMEOUT_SECS: u64 = 120;

pub struct HostPool {
    docker: Docker,
    image: String,
    network: String,
    buffer: usize,
    hosts: RwLock<HashMap<String, Arc<PooledHost>>>,
    shutdown: watch::Sender<bool>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl HostPool {
    pub fn new(cfg: &config::Config) -> anyhow::Result<Arc<Self>> {
        let docker = if cfg.docker_host.starts_with("unix://") {
            Docker::connect_with_unix(&cfg.docker_host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(&cfg.docker_host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .with_context(|| format!("connecting to container runtime at {}", cfg.docker_host))?;

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(HostPool {
            docker,
            image: cfg.honeypot_image.clone(),
            network: cfg.docker_network.clone(),
            buffer: cfg.host_buffer,
            hosts: RwLock::new(HashMap::new()),
            shutdown,
            controller: Mutex::new(None),
        }))
    }

    /// Make sure the configured image is available, then launch the
    /// warm-pool controller.
    #[instrument(skip_all)]
    pub async fn start(self: &Arc<Self>, deadline: Duration) -> anyhow::Result<()> {
        info!("starting host pool");
        self.ensure_image(deadline).await?;

        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(consts::POOL_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => pool.top_up().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.controller.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Shut down the controller and destroy every known container.
    /// Individual failures are collected so one stubborn container does
    /// not strand the rest.
    #[instrument(skip_all)]
    pub async fn stop(&self, deadline: Duration) -> anyhow::Result<()> {
        info!("stopping host pool");
        let _ = self.shutdown.send(true);
        let controller = { self.controller.lock().unwrap().take() };
        if let Some(handle) = controller {
            let _ = handle.await;
        }

        let ids: Vec<String> = { self.hosts.read().unwrap().keys().cloned().collect() };
        let mut failures = Vec::new();
        for id in ids {
            if let Err(err) = self.delete_host(deadline, &id).await {
                failures.push(format!("{id}: {err:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("destroying pooled containers: {}", failures.join("; ")))
        }
    }

    /// Lease a running, unoccupied host, creating one synchronously if
    /// the pool is dry. Returns the backend SSH address and the container
    /// id the lease must be released under.
    #[instrument(skip_all)]
    pub async fn get_host(&self, deadline: Duration) -> anyhow::Result<(String, String)> {
        let mut leased = None;
        {
            let hosts = self.hosts.read().unwrap();
            for host in hosts.values() {
                if host.try_occupy() {
                    leased = Some(Arc::clone(host));
                    break;
                }
            }
        }
        let host = match leased {
            Some(host) => host,
            // Dry pool: pay the cold start here. The replacement host is
            // created pre-occupied so a racing get_host cannot steal it.
            None => self
                .create_and_run(deadline, true)
                .await
                .context("creating a container on demand")?,
        };

        let inspect = tokio::time::timeout(deadline, self.docker.inspect_container(host.id(), None))
            .await
            .context("container inspect timed out")?
            .context("inspecting container")?;
        let ip = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .and_then(|networks| networks.get(&self.network))
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                anyhow!("container {} has no address on network {:?}", host.id(), self.network)
            })?;

        Ok((format!("{ip}:{}", consts::BACKEND_SSH_PORT), host.id().to_string()))
    }

    /// Destroy a leased host once its session has ended.
    #[instrument(skip_all, fields(id = id))]
    pub async fn stop_host(&self, deadline: Duration, id: &str) -> anyhow::Result<()> {
        self.delete_host(deadline, id).await
    }

    /// Copy the script(1) stdout and timing files out of a container.
    /// The container may have died before the shell wrapper wrote them;
    /// that is not an error, it just means there is nothing to keep.
    #[instrument(skip_all, fields(id = id))]
    pub async fn get_script_output(
        &self,
        deadline: Duration,
        id: &str,
    ) -> anyhow::Result<(String, String)> {
        let stdout = self.copy_file(deadline, id, consts::SCRIPT_STDOUT_PATH).await?;
        let timing = self.copy_file(deadline, id, consts::SCRIPT_TIMING_PATH).await?;
        Ok((stdout, timing))
    }

    async fn ensure_image(&self, deadline: Duration) -> anyhow::Result<()> {
        let images = tokio::time::timeout(
            deadline,
            self.docker
                .list_images(Some(ListImagesOptions::<String> { all: false, ..Default::default() })),
        )
        .await
        .context("image list timed out")?
        .context("listing images")?;

        let present =
            images.iter().any(|image| image.repo_tags.iter().any(|tag| *tag == self.image));
        if present {
            return Ok(());
        }

        info!("image {} not present locally, pulling", self.image);
        tokio::time::timeout(deadline, async {
            let mut pull = self.docker.create_image(
                Some(CreateImageOptions { from_image: self.image.clone(), ..Default::default() }),
                None,
                None,
            );
            // the pull stream must be drained for the pull to complete
            while let Some(progress) = pull.next().await {
                let progress = progress.context("pulling image")?;
                debug!(status = ?progress.status, "pull progress");
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("image pull timed out")??;

        Ok(())
    }

    /// One warm-pool tick: create enough containers to bring the count
    /// of running-and-free hosts back up to the buffer target. Errors are
    /// logged and retried on the next tick.
    async fn top_up(&self) {
        let (total, occupied) = {
            let hosts = self.hosts.read().unwrap();
            (hosts.len(), hosts.values().filter(|h| h.occupied()).count())
        };

        for _ in (total - occupied)..self.buffer {
            if let Err(err) = self.create_and_run(consts::RUNTIME_DEADLINE, false).await {
                warn!("creating pooled container: {err:#}");
            }
        }
    }

    /// Create and start one container. The host record goes into the map
    /// with `running=false` before ContainerStart is issued and only
    /// flips to running afterwards, so a lease can never observe a
    /// container that has not started yet.
    async fn create_and_run(
        &self,
        deadline: Duration,
        occupied: bool,
    ) -> anyhow::Result<Arc<PooledHost>> {
        let started_at = Instant::now();

        let config = ContainerConfig {
            image: Some(self.image.clone()),
            env: Some(consts::CONTAINER_ENV.iter().map(|v| v.to_string()).collect()),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    self.network.clone(),
                    EndpointSettings::default(),
                )]),
            }),
            ..Default::default()
        };

        let created = tokio::time::timeout(
            deadline,
            self.docker.create_container(None::<CreateContainerOptions<String>>, config),
        )
        .await
        .context("container create timed out")?
        .context("creating container")?;

        let host = Arc::new(PooledHost::new(created.id.clone(), occupied));
        {
            let mut hosts = self.hosts.write().unwrap();
            hosts.insert(created.id.clone(), Arc::clone(&host));
        }

        if let Err(err) = tokio::time::timeout(
            deadline,
            self.docker.start_container(&created.id, None::<StartContainerOptions<String>>),
        )
        .await
        .context("container start timed out")
        .and_then(|res| res.context("starting container"))
        {
            // leave the dead record for stop() to clean up; it is never
            // leased because running stays false
            return Err(err);
        }
        host.set_running(true);

        debug!(
            id = %created.id,
            elapsed = ?started_at.elapsed(),
            occupied,
            "container started"
        );
        Ok(host)
    }

    async fn delete_host(&self, deadline: Duration, id: &str) -> anyhow::Result<()> {
        let host = { self.hosts.read().unwrap().get(id).cloned() }
            .ok_or_else(|| anyhow!("container {id} is not tracked by the pool"))?;

        if host.running() {
            tokio::time::timeout(
                deadline,
                self.docker
                    .stop_container(id, Some(StopContainerOptions { t: consts::STOP_GRACE_SECS })),
            )
            .await
            .context("container stop timed out")?
            .context("stopping container")?;
            host.set_running(false);
        }

        tokio::time::timeout(
            deadline,
            self.docker.remove_container(
                id,
                Some(RemoveContainerOptions { force: true, v: true, ..Default::default() }),
            ),
        )
        .await
        .context("container remove timed out")?
        .context("removing container")?;

        self.hosts.write().unwrap().remove(id);
        debug!(id, "container destroyed");
        Ok(())
    }

    async fn copy_file(&self, deadline: Duration, id: &str, path: &str) -> anyhow::Result<String> {
        let download = async {
            let mut stream = self.docker.download_from_container(
                id,
                Some(DownloadFromContainerOptions { path: path.to_string() }),
            );
            let mut bytes = Vec::new();
            while let Some(chunk) = stream.next().await {
                bytes.extend_from_slice(&chunk?);
            }
            Ok::<_, bollard::errors::Error>(bytes)
        };

        let bytes = match tokio::time::timeout(deadline, download)
            .await
            .context("file copy timed out")?
        {
            Ok(bytes) => bytes,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(String::new()),
            Err(err) => return Err(err).with_context(|| format!("copying {path} from {id}")),
        };

        read_first_tar_entry(&bytes).with_context(|| format!("unpacking {path} from {id}"))
    }
}

/// CopyFromContainer hands back a tar stream whose first entry is the
/// requested file.
fn read_first_tar_entry(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
    let mut entries = archive.entries().context("reading tar stream")?;
    let mut entry = entries
        .next()
        .ok_or_else(|| anyhow!("empty tar stream"))?
        .context("reading tar entry")?;

    let mut contents = Vec::new();
    entry.read_to_end(&mut contents).context("reading tar entry body")?;
    Ok(String::from_utf8_lossy(&contents).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_tar_entry_round_trip() -> anyhow::Result<()> {
        let mut builder = tar::Builder::new(Vec::new());
        let body = b"uid=1000(panda)\n";
        let mut header = tar::Header::new_gnu();
        header.set_path("l")?;
        header.set_size(body.len() as u64);
        header.set_cksum();
        builder.append(&header, &body[..])?;
        let archive = builder.into_inner()?;

        assert_eq!(read_first_tar_entry(&archive)?, "uid=1000(panda)\n");
        Ok(())
    }

    #[test]
    fn empty_tar_stream_is_an_error() {
        let builder = tar::Builder::new(Vec::new());
        let archive = builder.into_inner().unwrap();
        assert!(read_first_tar_entry(&archive).is_err());
    }
}
