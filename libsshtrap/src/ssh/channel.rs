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

use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use russh::{client, server, ChannelMsg, CryptoVec, Pty, Sig};
use tokio::sync::mpsc;
use tokio_postgres::Transaction;
use tracing::debug;

use super::request::{
    self, ExitSignalRequest, ExitStatusRequest, Request, RequestKind,
};

/// Everything captured about one proxied SSH channel: its lifespan, the
/// client-originated byte streams, and the ordered request log.
///
/// The inbound callback path and the backend pump task both append, so
/// the mutable pieces sit behind mutexes; lock scopes never cross an
/// await point.
#[derive(Debug)]
pub struct ChannelRecord {
    id: u32,
    channel_type: String,
    start: DateTime<Utc>,
    end: Mutex<Option<DateTime<Utc>>>,
    recv: Mutex<Vec<u8>>,
    recv_stderr: Mutex<Vec<u8>>,
    requests: Mutex<Vec<Request>>,
}

impl ChannelRecord {
    pub fn new(id: u32, channel_type: &str) -> Self {
        ChannelRecord {
            id,
            channel_type: channel_type.to_string(),
            start: Utc::now(),
            end: Mutex::new(None),
            recv: Mutex::new(Vec::new()),
            recv_stderr: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Mirror client-originated bytes into the capture buffer. The
    /// proxied copy is made by the caller; only the client half is ever
    /// persisted.
    pub fn capture_recv(&self, data: &[u8]) {
        self.recv.lock().unwrap().extend_from_slice(data);
    }

    pub fn capture_recv_stderr(&self, data: &[u8]) {
        self.recv_stderr.lock().unwrap().extend_from_slice(data);
    }

    pub fn push_request(&self, request: Request) {
        self.requests.lock().unwrap().push(request);
    }

    /// Stamp the end of the channel. The first caller wins so an
    /// open-failure stamp is not overwritten by session teardown.
    pub fn finish(&self) {
        let mut end = self.end.lock().unwrap();
        if end.is_none() {
            *end = Some(Utc::now());
        }
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        *self.end.lock().unwrap()
    }

    /// Whether this channel carried an sftp subsystem, which marks its
    /// capture buffer for post-mortem SFTP parsing.
    pub fn saw_sftp_subsystem(&self) -> bool {
        self.requests.lock().unwrap().iter().any(|req| {
            matches!(&req.kind, RequestKind::Subsystem(s) if s.name.eq_ignore_ascii_case("sftp"))
        })
    }

    pub fn recv_bytes(&self) -> Vec<u8> {
        self.recv.lock().unwrap().clone()
    }

    pub async fn insert(&self, tx: &Transaction<'_>, session_id: i32) -> anyhow::Result<()> {
        let end = self.end.lock().unwrap().unwrap_or(self.start);
        let recv = self.recv.lock().unwrap().clone();
        let recv_stderr = self.recv_stderr.lock().unwrap().clone();

        tx.execute(
            "INSERT INTO Channel(id, session_id, channel_type, recv, recv_stderr, start_ts, end_ts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &(self.id as i64),
                &session_id,
                &self.channel_type,
                &recv,
                &recv_stderr,
                &self.start,
                &end,
            ],
        )
        .await
        .context("inserting channel")?;

        let requests = self.requests.lock().unwrap().clone();
        for request in &requests {
            request.insert(tx, session_id).await?;
        }
        Ok(())
    }
}

/// A command travelling from the inbound (attacker) side of a channel to
/// the task that owns the matching backend channel.
#[derive(Debug)]
pub enum BackendCmd {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    Eof,
    Close,
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    Env(String, String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
}

/// Drive one backend channel for the life of a proxied channel.
///
/// The single select loop is the channel's ordering authority: bytes and
/// requests from the attacker are forwarded in arrival order, and the
/// backend's own messages (data, stderr, eof, exit-status, close) are
/// relayed to the attacker in arrival order. Because the backend's close
/// arrives on the same stream after its final data message, relaying
/// messages one at a time guarantees everything in flight reaches the
/// attacker before the inbound channel closes.
pub async fn run_backend_pump(
    mut backend: russh::Channel<client::Msg>,
    mut cmds: mpsc::UnboundedReceiver<BackendCmd>,
    inbound_id: russh::ChannelId,
    inbound: server::Handle,
    record: Arc<ChannelRecord>,
) {
    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(cmd) => {
                    if let Err(err) = forward_cmd(&backend, cmd).await {
                        debug!(channel = record.id(), "forwarding to backend: {err:#}");
                    }
                }
                // The inbound side of this channel is gone. Closing the
                // backend channel unblocks it; its Close comes back
                // through the wait() arm below.
                None => {
                    let _ = backend.close().await;
                    cmds.close();
                    break;
                }
            },
            msg = backend.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    let _ = inbound.data(inbound_id, CryptoVec::from(data.to_vec())).await;
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    let _ = inbound
                        .extended_data(inbound_id, ext, CryptoVec::from(data.to_vec()))
                        .await;
                }
                Some(ChannelMsg::Eof) => {
                    let _ = inbound.eof(inbound_id).await;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    record.push_request(Request::new(
                        record.id(),
                        false,
                        RequestKind::ExitStatus(ExitStatusRequest { exit_status }),
                    ));
                    let _ = inbound.exit_status_request(inbound_id, exit_status).await;
                }
                Some(ChannelMsg::ExitSignal { signal_name, core_dumped, error_message, lang_tag }) => {
                    record.push_request(Request::new(
                        record.id(),
                        false,
                        RequestKind::ExitSignal(ExitSignalRequest {
                            signal_name: request::sig_name(&signal_name),
                            core_dumped,
                            error_msg: error_message.clone(),
                            lang_tag: lang_tag.clone(),
                        }),
                    ));
                    let _ = inbound
                        .exit_signal_request(
                            inbound_id,
                            signal_name,
                            core_dumped,
                            error_message,
                            lang_tag,
                        )
                        .await;
                }
                // Replies to the requests we forward; the inbound side
                // was already answered.
                Some(ChannelMsg::Success) | Some(ChannelMsg::Failure) => {}
                Some(ChannelMsg::Close) | None => {
                    let _ = inbound.close(inbound_id).await;
                    break;
                }
                Some(other) => {
                    debug!(channel = record.id(), msg = ?other, "unhandled backend channel message");
                }
            },
        }
    }

    record.finish();
    debug!(channel = record.id(), "backend pump done");
}

async fn forward_cmd(
    backend: &russh::Channel<client::Msg>,
    cmd: BackendCmd,
) -> anyhow::Result<()> {
    match cmd {
        BackendCmd::Data(data) => {
            backend.data(&data[..]).await.context("writing data")?;
        }
        BackendCmd::ExtendedData(ext, data) => {
            backend.extended_data(ext, &data[..]).await.context("writing extended data")?;
        }
        BackendCmd::Eof => {
            backend.eof().await.context("sending eof")?;
        }
        BackendCmd::Close => {
            backend.close().await.context("closing channel")?;
        }
        BackendCmd::Pty { term, col_width, row_height, pix_width, pix_height, modes } => {
            backend
                .request_pty(true, &term, col_width, row_height, pix_width, pix_height, &modes)
                .await
                .context("requesting pty")?;
        }
        BackendCmd::Shell => {
            backend.request_shell(true).await.context("requesting shell")?;
        }
        BackendCmd::Exec(command) => {
            backend.exec(true, command).await.context("requesting exec")?;
        }
        BackendCmd::Subsystem(name) => {
            backend.request_subsystem(true, &name).await.context("requesting subsystem")?;
        }
        BackendCmd::Env(name, value) => {
            backend.set_env(false, &name, &value).await.context("setting env")?;
        }
        BackendCmd::WindowChange { col_width, row_height, pix_width, pix_height } => {
            backend
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
                .context("propagating window change")?;
        }
        BackendCmd::Signal(sig) => {
            backend.signal(sig).await.context("delivering signal")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ssh::request::SubsystemRequest;

    #[test]
    fn end_stamp_first_writer_wins() {
        let record = ChannelRecord::new(1, "session");
        assert!(record.end.lock().unwrap().is_none());

        record.finish();
        let first = record.end.lock().unwrap().expect("end set");
        record.finish();
        let second = record.end.lock().unwrap().expect("end still set");
        assert_eq!(first, second);
        assert!(first >= record.start);
    }

    #[test]
    fn capture_buffers_are_independent() {
        let record = ChannelRecord::new(2, "session");
        record.capture_recv(b"ls -la\n");
        record.capture_recv(b"exit\n");
        record.capture_recv_stderr(b"oops");

        assert_eq!(record.recv_bytes(), b"ls -la\nexit\n");
        assert_eq!(*record.recv_stderr.lock().unwrap(), b"oops");
    }

    #[test]
    fn sftp_detection_is_case_insensitive() {
        let cases = vec![
            ("sftp", true),
            ("SFTP", true),
            ("Sftp", true),
            ("scp", false),
            ("", false),
        ];

        for (name, want) in cases.into_iter() {
            let record = ChannelRecord::new(3, "session");
            record.push_request(Request::new(
                3,
                true,
                RequestKind::Subsystem(SubsystemRequest { name: name.to_string() }),
            ));
            assert_eq!(record.saw_sftp_subsystem(), want, "subsystem {name:?}");
        }
    }

    #[test]
    fn requests_keep_arrival_order() {
        let record = ChannelRecord::new(4, "session");
        record.push_request(Request::new(
            4,
            true,
            RequestKind::Exec(request::ExecRequest { command: String::from("id") }),
        ));
        record.push_request(Request::new(
            4,
            false,
            RequestKind::ExitStatus(ExitStatusRequest { exit_status: 0 }),
        ));

        let requests = record.requests.lock().unwrap();
        assert!(matches!(requests[0].kind, RequestKind::Exec(_)));
        assert!(matches!(requests[1].kind, RequestKind::ExitStatus(_)));
        assert!(requests[0].from_client);
        assert!(!requests[1].from_client);
        assert!(requests[0].ts <= requests[1].ts);
    }
}
