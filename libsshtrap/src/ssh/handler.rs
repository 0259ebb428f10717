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
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use russh::{
    server::{self, Auth},
    Channel, ChannelId, Disconnect, Pty, Sig,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::{
    channel::{self, BackendCmd, ChannelRecord},
    client::ProxyClient,
    request::{
        self, EnvRequest, ExecRequest, PtyRequest, Request, RequestKind, SubsystemRequest,
        WindowChangeRequest,
    },
    Session,
};
use crate::{consts, db::Db, pool::HostPool, sftp};

/// State shared between the connection's handler (owned by the SSH
/// layer) and the accept task that outlives it for teardown and
/// persistence.
pub(crate) struct ConnState {
    pool: Arc<HostPool>,
    db: Arc<Db>,
    session: Mutex<Session>,
    backend: AsyncMutex<Option<ProxyClient>>,
    host_id: Mutex<Option<String>>,
    client_handle: Mutex<Option<server::Handle>>,
    client_version: Arc<Mutex<Option<String>>>,
    // true once the attacker side is done; stops the watchdog from
    // treating our own teardown as a backend crash
    disconnected: AtomicBool,
    // only sessions that actually reached a backend are persisted
    persistable: AtomicBool,
}

impl ConnState {
    pub(crate) fn new(
        pool: Arc<HostPool>,
        db: Arc<Db>,
        peer: SocketAddr,
        local: SocketAddr,
        client_version: Arc<Mutex<Option<String>>>,
    ) -> Arc<Self> {
        Arc::new(ConnState {
            pool,
            db,
            session: Mutex::new(Session::new(peer, local)),
            backend: AsyncMutex::new(None),
            host_id: Mutex::new(None),
            client_handle: Mutex::new(None),
            client_version,
            disconnected: AtomicBool::new(false),
            persistable: AtomicBool::new(false),
        })
    }

    /// Post-mortem for one connection: stamp the session, tear down the
    /// backend container, pull the script(1) dump, run the SFTP pass,
    /// and persist. Every failure past this point is logged rather than
    /// propagated; the attacker is already gone.
    pub(crate) async fn finish(&self) {
        self.disconnected.store(true, Ordering::Release);
        if !self.persistable.load(Ordering::Acquire) {
            // the handshake or the backend dial never completed; there
            // is nothing worth keeping
            return;
        }

        {
            let mut session = self.session.lock().unwrap();
            session.stop();
            if let Some(version) = self.client_version.lock().unwrap().clone() {
                session.set_version(version);
            }
        }

        if let Some(mut backend) = self.backend.lock().await.take() {
            if let Err(err) = backend.disconnect().await {
                debug!("disconnecting backend: {err:#}");
            }
        }

        let host_id = self.host_id.lock().unwrap().take();
        if let Some(id) = host_id {
            match self.pool.get_script_output(consts::RUNTIME_DEADLINE, &id).await {
                Ok((stdout, timing)) => {
                    self.session.lock().unwrap().add_script_output(stdout, timing);
                }
                Err(err) => warn!("fetching script output from {id}: {err:#}"),
            }
            if let Err(err) = self.pool.stop_host(consts::RUNTIME_DEADLINE, &id).await {
                warn!("stopping host {id}: {err:#}");
            }
        }

        let session = { self.session.lock().unwrap().clone() };
        for record in session.channels() {
            if record.saw_sftp_subsystem() {
                let captured = record.recv_bytes();
                if let Err(err) = sftp::Parser::new(&captured).parse() {
                    debug!(channel = record.id(), "parsing captured sftp stream: {err:#}");
                }
            }
        }

        if let Err(err) = self.db.record_session(&session).await {
            warn!("recording session: {err:#}");
        }
    }
}

/// Watches the backend connection for the life of a session. If the
/// backend goes away while the attacker is still connected, something is
/// wrong on the container side and the inbound connection is forced shut.
async fn watchdog(state: Arc<ConnState>, mut liveness: Channel<russh::client::Msg>) {
    while liveness.wait().await.is_some() {}

    if state.disconnected.load(Ordering::Acquire) {
        return;
    }
    warn!("backend disconnected while the client is still attached");
    let handle = state.client_handle.lock().unwrap().clone();
    if let Some(handle) = handle {
        let _ = handle
            .disconnect(Disconnect::ConnectionLost, String::from("backend lost"), String::new())
            .await;
    }
}

struct ProxiedChannel {
    record: Arc<ChannelRecord>,
    cmds: mpsc::UnboundedSender<BackendCmd>,
}

enum BackendOpen {
    Session,
    DirectTcpip { host: String, port: u32, originator: String, originator_port: u32 },
}

impl BackendOpen {
    fn channel_type(&self) -> &'static str {
        match self {
            BackendOpen::Session => "session",
            BackendOpen::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// One accepted attacker connection: relays channels and requests to the
/// leased backend and records everything the attacker sends.
pub(crate) struct ClientHandler {
    state: Arc<ConnState>,
    channels: HashMap<ChannelId, ProxiedChannel>,
    chan_counter: u32,
}

impl ClientHandler {
    pub(crate) fn new(state: Arc<ConnState>) -> Self {
        ClientHandler { state, channels: HashMap::new(), chan_counter: 0 }
    }

    /// Open the matching channel on the backend and wire up the pump.
    /// A failed backend open rejects the inbound channel; the record is
    /// kept (with its end stamped) so the attempt is still persisted.
    async fn proxy_channel(
        &mut self,
        inbound: &Channel<server::Msg>,
        session: &mut server::Session,
        open: BackendOpen,
    ) -> anyhow::Result<bool> {
        self.chan_counter += 1;
        let record = Arc::new(ChannelRecord::new(self.chan_counter, open.channel_type()));
        self.state.session.lock().unwrap().add_channel(Arc::clone(&record));
        info!(
            channel = self.chan_counter,
            channel_type = open.channel_type(),
            "wants to open channel"
        );

        let opened = {
            let backend = self.state.backend.lock().await;
            let Some(client) = backend.as_ref() else {
                record.finish();
                return Ok(false);
            };
            match &open {
                BackendOpen::Session => client.open_session().await,
                BackendOpen::DirectTcpip { host, port, originator, originator_port } => {
                    client.open_direct_tcpip(host, *port, originator, *originator_port).await
                }
            }
        };

        let backend_channel = match opened {
            Ok(ch) => ch,
            Err(err) => {
                warn!(channel = record.id(), "could not open backend channel: {err:#}");
                record.finish();
                return Ok(false);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(channel::run_backend_pump(
            backend_channel,
            cmd_rx,
            inbound.id(),
            session.handle(),
            Arc::clone(&record),
        ));
        self.channels.insert(inbound.id(), ProxiedChannel { record, cmds: cmd_tx });
        Ok(true)
    }

    /// Record a client-originated request on its channel and queue it
    /// for the backend. Returns false when the channel is unknown, which
    /// the caller reports as a request failure.
    fn relay_request(&self, id: ChannelId, kind: Option<RequestKind>, cmd: BackendCmd) -> bool {
        let Some(proxied) = self.channels.get(&id) else {
            return false;
        };
        if let Some(kind) = kind {
            proxied.record.push_request(Request::new(proxied.record.id(), true, kind));
        }
        let _ = proxied.cmds.send(cmd);
        true
    }

    fn reply(&self, session: &mut server::Session, id: ChannelId, ok: bool) {
        if ok {
            session.channel_success(id);
        } else {
            session.channel_failure(id);
        }
    }
}

impl server::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(user, "auth none");
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        // no permissions are granted; the credentials are only bait
        info!(user, password, "password attempt");
        Ok(Auth::Accept)
    }

    /// The handshake is done; lease a backend and dial it. Failing to
    /// produce a backend makes the whole connection useless, so any
    /// error here drops the attacker.
    async fn auth_succeeded(&mut self, session: &mut server::Session) -> Result<(), Self::Error> {
        let (addr, host_id) = self
            .state
            .pool
            .get_host(consts::RUNTIME_DEADLINE)
            .await
            .context("leasing a backend host")?;

        let mut client = ProxyClient::connect(&addr, consts::BACKEND_USER, consts::BACKEND_PASSWORD)
            .await
            .with_context(|| format!("connecting to backend {host_id}"))?;
        info!(addr, "connected to backend");

        *self.state.client_handle.lock().unwrap() = Some(session.handle());
        *self.state.host_id.lock().unwrap() = Some(host_id);
        if let Some(liveness) = client.take_liveness_channel() {
            tokio::spawn(watchdog(Arc::clone(&self.state), liveness));
        }
        *self.state.backend.lock().await = Some(client);
        self.state.persistable.store(true, Ordering::Release);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<server::Msg>,
        session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        self.proxy_channel(&channel, session, BackendOpen::Session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<server::Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        self.proxy_channel(
            &channel,
            session,
            BackendOpen::DirectTcpip {
                host: host_to_connect.to_string(),
                port: port_to_connect,
                originator: originator_address.to_string(),
                originator_port,
            },
        )
        .await
    }

    async fn data(
        &mut self,
        id: ChannelId,
        data: &[u8],
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        if let Some(proxied) = self.channels.get(&id) {
            proxied.record.capture_recv(data);
            let _ = proxied.cmds.send(BackendCmd::Data(data.to_vec()));
        }
        Ok(())
    }

    async fn extended_data(
        &mut self,
        id: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        if let Some(proxied) = self.channels.get(&id) {
            if code == 1 {
                proxied.record.capture_recv_stderr(data);
            }
            let _ = proxied.cmds.send(BackendCmd::ExtendedData(code, data.to_vec()));
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        id: ChannelId,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        if let Some(proxied) = self.channels.get(&id) {
            let _ = proxied.cmds.send(BackendCmd::Eof);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        id: ChannelId,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        // the client side of this channel is done; the end stamp is
        // taken here, not when the backend finishes draining
        if let Some(proxied) = self.channels.remove(&id) {
            let _ = proxied.cmds.send(BackendCmd::Close);
            proxied.record.finish();
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let ok = self.relay_request(
            id,
            Some(RequestKind::Pty(PtyRequest {
                term: term.to_string(),
                columns: col_width,
                rows: row_height,
                width: pix_width,
                height: pix_height,
                modelist: request::encode_modes(modes),
            })),
            BackendCmd::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        );
        self.reply(session, id, ok);
        Ok(())
    }

    async fn env_request(
        &mut self,
        id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let ok = self.relay_request(
            id,
            Some(RequestKind::Env(EnvRequest {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            })),
            BackendCmd::Env(variable_name.to_string(), variable_value.to_string()),
        );
        self.reply(session, id, ok);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        id: ChannelId,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let ok = self.relay_request(id, Some(RequestKind::Shell), BackendCmd::Shell);
        self.reply(session, id, ok);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        id: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let ok = self.relay_request(
            id,
            Some(RequestKind::Exec(ExecRequest {
                command: String::from_utf8_lossy(data).into_owned(),
            })),
            BackendCmd::Exec(data.to_vec()),
        );
        self.reply(session, id, ok);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        id: ChannelId,
        name: &str,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        let ok = self.relay_request(
            id,
            Some(RequestKind::Subsystem(SubsystemRequest { name: name.to_string() })),
            BackendCmd::Subsystem(name.to_string()),
        );
        self.reply(session, id, ok);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(
            id,
            Some(RequestKind::WindowChange(WindowChangeRequest {
                columns: col_width,
                rows: row_height,
                width: pix_width,
                height: pix_height,
            })),
            BackendCmd::WindowChange { col_width, row_height, pix_width, pix_height },
        );
        Ok(())
    }

    /// Signals are forwarded but fall outside the persisted request set.
    async fn signal(
        &mut self,
        id: ChannelId,
        signal: Sig,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        self.relay_request(id, None, BackendCmd::Signal(signal));
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        let mut backend = self.state.backend.lock().await;
        let Some(client) = backend.as_mut() else {
            debug!("tcpip-forward before a backend exists");
            return Ok(false);
        };
        match client.forward_tcpip_listen(address, *port).await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!("relaying tcpip-forward: {err:#}");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        let mut backend = self.state.backend.lock().await;
        let Some(client) = backend.as_mut() else {
            debug!("cancel-tcpip-forward before a backend exists");
            return Ok(false);
        };
        match client.cancel_tcpip_listen(address, port).await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!("relaying cancel-tcpip-forward: {err:#}");
                Ok(false)
            }
        }
    }
}
