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

//! The inbound SSH server: accepts attacker connections, handshakes with
//! the configured host keys, and hands each connection to a
//! man-in-the-middle handler glued to a freshly leased backend container.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::Context;
use russh::{server, MethodKind, SshId};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, instrument};

use crate::{config, consts, db::Db, pool::HostPool};

mod channel;
mod client;
mod handler;
mod request;
mod session;

pub use channel::ChannelRecord;
pub use request::{Request, RequestKind};
pub use session::Session;

pub struct Server {
    config: Arc<server::Config>,
    pool: Arc<HostPool>,
    db: Arc<Db>,
    port: u16,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Build the server, loading every configured host key. A key that
    /// cannot be loaded is a startup failure; presenting a changing
    /// host key would give the game away to returning scanners.
    pub fn new(cfg: &config::Config, pool: Arc<HostPool>, db: Arc<Db>) -> anyhow::Result<Arc<Self>> {
        let mut keys = Vec::new();
        for path in &cfg.ssh_host_keys {
            keys.push(
                russh::keys::load_secret_key(path, None)
                    .with_context(|| format!("loading host key {}", path.display()))?,
            );
        }

        let config = server::Config {
            server_id: SshId::Standard(String::from(consts::SERVER_BANNER)),
            keys,
            methods: (&[MethodKind::None, MethodKind::Password]).as_slice().into(),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Server {
            config: Arc::new(config),
            pool,
            db,
            port: cfg.port,
            shutdown,
            accept_task: Mutex::new(None),
        }))
    }

    /// Bind the listener (fatal on failure) and start accepting.
    #[instrument(skip_all)]
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("binding tcp/:{}", self.port))?;
        info!("listening on :{}", self.port);

        let server = Arc::clone(self);
        let handle = tokio::spawn(async move { server.accept_loop(listener).await });
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop accepting and wait for in-flight sessions to finish their
    /// teardown and persistence.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> anyhow::Result<()> {
        info!("stopping ssh server");
        let _ = self.shutdown.send(true);
        let task = { self.accept_task.lock().unwrap().take() };
        if let Some(task) = task {
            task.await.context("joining accept loop")?;
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        handlers.spawn(async move { server.handle_conn(stream, peer).await });
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        error!("accepting connection: {err:#}");
                    }
                },
            }
        }

        drop(listener);
        while handlers.join_next().await.is_some() {}
    }

    /// Drive one attacker connection from handshake to persistence.
    #[instrument(skip_all, fields(peer = %peer))]
    async fn handle_conn(&self, stream: TcpStream, peer: SocketAddr) {
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("resolving local address: {err:#}");
                return;
            }
        };

        let version_slot = Arc::new(Mutex::new(None));
        let stream = VersionSniffer::new(stream, Arc::clone(&version_slot));

        let state = handler::ConnState::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.db),
            peer,
            local,
            version_slot,
        );
        let handler = handler::ClientHandler::new(Arc::clone(&state));

        info!("client connected");
        match server::run_stream(Arc::clone(&self.config), stream, handler).await {
            Ok(session) => {
                if let Err(err) = session.await {
                    debug!("connection ended with error: {err:#}");
                }
            }
            Err(err) => {
                // garbage pre-kex traffic lands here; nothing to persist
                info!("ssh handshake failed: {err:#}");
                return;
            }
        }

        state.finish().await;
    }
}

/// A transparent wrapper around the accepted socket that records the
/// client's SSH identification line (its first line on the wire, per
/// RFC 4253 §4.2) as it flows past. The SSH layer never knows we looked.
struct VersionSniffer {
    inner: TcpStream,
    slot: Arc<Mutex<Option<String>>>,
    line: LineSniffer,
}

impl VersionSniffer {
    fn new(inner: TcpStream, slot: Arc<Mutex<Option<String>>>) -> Self {
        VersionSniffer { inner, slot, line: LineSniffer::new() }
    }

    fn sniff(&mut self, data: &[u8]) {
        if let Some(line) = self.line.feed(data) {
            *self.slot.lock().unwrap() = Some(line);
        }
    }
}

// Identification strings are capped at 255 bytes by the RFC; anything
// longer is garbage and not worth buffering.
const MAX_VERSION_LINE: usize = 255;

/// Accumulates bytes until the first newline and yields that line once.
struct LineSniffer {
    scratch: Vec<u8>,
    done: bool,
}

impl LineSniffer {
    fn new() -> Self {
        LineSniffer { scratch: Vec::new(), done: false }
    }

    fn feed(&mut self, data: &[u8]) -> Option<String> {
        if self.done {
            return None;
        }
        self.scratch.extend_from_slice(data);
        if let Some(pos) = self.scratch.iter().position(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(&self.scratch[..pos]);
            let line = line.trim_end_matches('\r').to_string();
            self.done = true;
            self.scratch = Vec::new();
            Some(line)
        } else if self.scratch.len() > MAX_VERSION_LINE {
            self.done = true;
            self.scratch = Vec::new();
            None
        } else {
            None
        }
    }
}

impl AsyncRead for VersionSniffer {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled().len();
                if filled > before {
                    let fresh = buf.filled()[before..filled].to_vec();
                    self.sniff(&fresh);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for VersionSniffer {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sniffer_records_the_first_line() {
        let cases: Vec<(Vec<&[u8]>, Option<&str>)> = vec![
            (vec![b"SSH-2.0-OpenSSH_9.6\r\n"], Some("SSH-2.0-OpenSSH_9.6")),
            // split across reads
            (vec![b"SSH-2.0-Open", b"SSH_9.6\r\nrest"], Some("SSH-2.0-OpenSSH_9.6")),
            // bare newline, no carriage return
            (vec![b"SSH-2.0-dropbear\n"], Some("SSH-2.0-dropbear")),
            // never a newline within the cap
            (vec![&[b'x'; 300]], None),
        ];

        for (reads, want) in cases.into_iter() {
            let mut sniffer = LineSniffer::new();
            let mut got = None;
            for data in reads {
                if let Some(line) = sniffer.feed(data) {
                    got = Some(line);
                }
            }
            assert_eq!(got.as_deref(), want);
        }
    }

    #[test]
    fn sniffer_yields_only_once() {
        let mut sniffer = LineSniffer::new();
        assert_eq!(sniffer.feed(b"SSH-2.0-x\n").as_deref(), Some("SSH-2.0-x"));
        assert_eq!(sniffer.feed(b"more\nlines\n"), None);
    }
}
