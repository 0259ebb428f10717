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

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use russh::{client, keys::PublicKey, Channel, Disconnect};
use tracing::debug;

use crate::consts;

/// Backend containers are ephemeral and never seen twice, so there is no
/// host key worth pinning.
struct AcceptAllKeys;

impl client::Handler for AcceptAllKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// The outbound SSH connection to one leased backend container.
pub struct ProxyClient {
    handle: client::Handle<AcceptAllKeys>,
    liveness: Option<Channel<client::Msg>>,
}

impl ProxyClient {
    /// Dial the backend. A container's sshd takes a moment to come up
    /// after ContainerStart returns, so the dial is retried on a fixed
    /// short interval before giving up.
    pub async fn connect(addr: &str, user: &str, password: &str) -> anyhow::Result<ProxyClient> {
        let config = Arc::new(client::Config::default());

        let mut last_err = None;
        for attempt in 0..consts::DIAL_ATTEMPTS {
            match Self::dial(Arc::clone(&config), addr, user, password).await {
                Ok(client) => {
                    debug!(addr, attempt, "connected to backend");
                    return Ok(client);
                }
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(consts::DIAL_RETRY_DELAY).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no dial attempts made")))
            .with_context(|| format!("dialing backend {addr}"))
    }

    async fn dial(
        config: Arc<client::Config>,
        addr: &str,
        user: &str,
        password: &str,
    ) -> anyhow::Result<ProxyClient> {
        let mut handle =
            client::connect(config, addr, AcceptAllKeys).await.context("ssh connect")?;

        let auth = handle
            .authenticate_password(user, password)
            .await
            .context("password authentication")?;
        if !auth.success() {
            bail!("backend rejected password for {user:?}");
        }

        // Open a throwaway session channel: some servers only settle
        // once a session exists, and its message stream doubles as our
        // backend liveness signal.
        let liveness =
            handle.channel_open_session().await.context("opening initial session channel")?;

        Ok(ProxyClient { handle, liveness: Some(liveness) })
    }

    /// Take the liveness channel. Its message stream ends when the
    /// backend connection dies, which is what the per-session watchdog
    /// waits on.
    pub fn take_liveness_channel(&mut self) -> Option<Channel<client::Msg>> {
        self.liveness.take()
    }

    pub async fn open_session(&self) -> anyhow::Result<Channel<client::Msg>> {
        self.handle.channel_open_session().await.context("opening backend session channel")
    }

    pub async fn open_direct_tcpip(
        &self,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> anyhow::Result<Channel<client::Msg>> {
        self.handle
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
            .context("opening backend direct-tcpip channel")
    }

    /// Relay a tcpip-forward global request to the backend.
    pub async fn forward_tcpip_listen(&mut self, address: &str, port: u32) -> anyhow::Result<()> {
        let _ = self
            .handle
            .tcpip_forward(address, port)
            .await
            .context("forwarding tcpip-forward request")?;
        Ok(())
    }

    /// Relay a cancel-tcpip-forward global request to the backend.
    pub async fn cancel_tcpip_listen(&mut self, address: &str, port: u32) -> anyhow::Result<()> {
        let _ = self
            .handle
            .cancel_tcpip_forward(address, port)
            .await
            .context("forwarding cancel-tcpip-forward request")?;
        Ok(())
    }

    /// Tear the backend connection down: the liveness channel first (if
    /// the watchdog has not consumed it), then the connection itself.
    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        if let Some(liveness) = self.liveness.take() {
            let _ = liveness.close().await;
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "session over", "en")
            .await
            .context("disconnecting from backend")
    }
}
