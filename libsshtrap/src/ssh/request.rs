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

//! Typed channel requests, RFC 4254 §6.x.
//!
//! Every request observed on a proxied channel is recorded as one of the
//! variants below and persisted as a common `Request` row plus a per-type
//! detail row. `RequestKind::decode` is the wire-format codec for raw
//! request payloads; the live capture path builds the same variants from
//! the SSH layer's already-parsed callbacks.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tokio_postgres::Transaction;

use crate::wire::PacketBuffer;

// Request type names used on session channels - RFC 4254 §6.X.
pub const PTY_REQUEST: &str = "pty-req"; // §6.2
pub const ENV_REQUEST: &str = "env"; // §6.4
pub const SHELL_REQUEST: &str = "shell"; // §6.5
pub const EXEC_REQUEST: &str = "exec"; // §6.5
pub const SUBSYSTEM_REQUEST: &str = "subsystem"; // §6.5
pub const WINDOW_CHANGE_REQUEST: &str = "window-change"; // §6.7
pub const EXIT_STATUS_REQUEST: &str = "exit-status"; // §6.10
pub const EXIT_SIGNAL_REQUEST: &str = "exit-signal"; // §6.10

// Opcode terminating an encoded terminal mode list, RFC 4254 §8.
const TTY_OP_END: u8 = 0;

/// One observed channel request: when it happened, which channel it
/// belongs to, which direction it travelled, and its typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub ts: DateTime<Utc>,
    pub channel_id: u32,
    pub from_client: bool,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(channel_id: u32, from_client: bool, kind: RequestKind) -> Self {
        Request { ts: Utc::now(), channel_id, from_client, kind }
    }

    /// Insert the common request row, then the per-type detail row keyed
    /// by the id the common insert returns.
    pub async fn insert(&self, tx: &Transaction<'_>, session_id: i32) -> anyhow::Result<()> {
        let row = tx
            .query_one(
                "INSERT INTO Request(session_id, channel_id, ts, from_client) \
                 VALUES ($1, $2, $3, $4) \
                 RETURNING id",
                &[&session_id, &(self.channel_id as i64), &self.ts, &self.from_client],
            )
            .await
            .context("inserting request")?;
        let request_id: i32 = row.get(0);

        match &self.kind {
            RequestKind::Pty(r) => {
                tx.execute(
                    "INSERT INTO PTYRequest(request_id, term, columns, rows, width, height, modelist) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    &[
                        &request_id,
                        &r.term,
                        &(r.columns as i64),
                        &(r.rows as i64),
                        &(r.width as i64),
                        &(r.height as i64),
                        &r.modelist,
                    ],
                )
                .await
                .context("inserting pty request")?;
            }
            RequestKind::Env(r) => {
                tx.execute(
                    "INSERT INTO EnvironmentRequest(request_id, name, value) \
                     VALUES ($1, $2, $3)",
                    &[&request_id, &r.name, &r.value],
                )
                .await
                .context("inserting env request")?;
            }
            RequestKind::Shell => {
                tx.execute("INSERT INTO ShellRequest(request_id) VALUES ($1)", &[&request_id])
                    .await
                    .context("inserting shell request")?;
            }
            RequestKind::Exec(r) => {
                tx.execute(
                    "INSERT INTO ExecRequest(request_id, command) VALUES ($1, $2)",
                    &[&request_id, &r.command],
                )
                .await
                .context("inserting exec request")?;
            }
            RequestKind::Subsystem(r) => {
                tx.execute(
                    "INSERT INTO SubSystemRequest(request_id, name) VALUES ($1, $2)",
                    &[&request_id, &r.name],
                )
                .await
                .context("inserting subsystem request")?;
            }
            RequestKind::WindowChange(r) => {
                tx.execute(
                    "INSERT INTO WindowDimChangeRequest(request_id, columns, rows, width, height) \
                     VALUES ($1, $2, $3, $4, $5)",
                    &[
                        &request_id,
                        &(r.columns as i64),
                        &(r.rows as i64),
                        &(r.width as i64),
                        &(r.height as i64),
                    ],
                )
                .await
                .context("inserting window change request")?;
            }
            RequestKind::ExitStatus(r) => {
                tx.execute(
                    "INSERT INTO ExitStatusRequest(request_id, exit_status) VALUES ($1, $2)",
                    &[&request_id, &(r.exit_status as i64)],
                )
                .await
                .context("inserting exit status request")?;
            }
            RequestKind::ExitSignal(r) => {
                tx.execute(
                    "INSERT INTO ExitSignalRequest(request_id, signal_name, core_dumped, error_msg, language_tag) \
                     VALUES ($1, $2, $3, $4, $5)",
                    &[&request_id, &r.signal_name, &r.core_dumped, &r.error_msg, &r.lang_tag],
                )
                .await
                .context("inserting exit signal request")?;
            }
        }

        Ok(())
    }
}

/// A closed sum over the request types we persist. Anything else is
/// still forwarded over the wire but never recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Pty(PtyRequest),
    Env(EnvRequest),
    Shell,
    Exec(ExecRequest),
    Subsystem(SubsystemRequest),
    WindowChange(WindowChangeRequest),
    ExitStatus(ExitStatusRequest),
    ExitSignal(ExitSignalRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub columns: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modelist: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRequest {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowChangeRequest {
    pub columns: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatusRequest {
    pub exit_status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignalRequest {
    pub signal_name: String,
    pub core_dumped: bool,
    pub error_msg: String,
    pub lang_tag: String,
}

impl RequestKind {
    /// Decode a raw channel-request payload (the bytes that follow the
    /// request type and want-reply flag on the wire). A request type
    /// outside the supported set yields a "not supported" error; the
    /// caller forwards the request regardless of what this returns.
    pub fn decode(kind: &str, payload: &[u8]) -> anyhow::Result<RequestKind> {
        let mut buf = PacketBuffer::new(payload);
        let decoded = match kind {
            PTY_REQUEST => RequestKind::Pty(PtyRequest {
                term: buf.read_string()?,
                columns: buf.read_u32()?,
                rows: buf.read_u32()?,
                width: buf.read_u32()?,
                height: buf.read_u32()?,
                modelist: buf.read_string_bytes()?,
            }),
            ENV_REQUEST => RequestKind::Env(EnvRequest {
                name: buf.read_string()?,
                value: buf.read_string()?,
            }),
            SHELL_REQUEST => RequestKind::Shell,
            EXEC_REQUEST => RequestKind::Exec(ExecRequest { command: buf.read_string()? }),
            SUBSYSTEM_REQUEST => {
                RequestKind::Subsystem(SubsystemRequest { name: buf.read_string()? })
            }
            WINDOW_CHANGE_REQUEST => RequestKind::WindowChange(WindowChangeRequest {
                columns: buf.read_u32()?,
                rows: buf.read_u32()?,
                width: buf.read_u32()?,
                height: buf.read_u32()?,
            }),
            EXIT_STATUS_REQUEST => {
                RequestKind::ExitStatus(ExitStatusRequest { exit_status: buf.read_u32()? })
            }
            EXIT_SIGNAL_REQUEST => RequestKind::ExitSignal(ExitSignalRequest {
                signal_name: buf.read_string()?,
                core_dumped: buf.read_u8()? != 0,
                error_msg: buf.read_string()?,
                lang_tag: buf.read_string()?,
            }),
            other => return Err(anyhow!("channel request {other:?} not supported")),
        };
        Ok(decoded)
    }
}

/// Encode a parsed terminal mode list back into the RFC 4254 §8 wire
/// blob we persist alongside pty requests.
pub fn encode_modes(modes: &[(russh::Pty, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(modes.len() * 5 + 1);
    for (opcode, arg) in modes {
        out.push(*opcode as u8);
        out.extend_from_slice(&arg.to_be_bytes());
    }
    out.push(TTY_OP_END);
    out
}

/// The display name of a delivered signal, for exit-signal persistence.
pub fn sig_name(sig: &russh::Sig) -> String {
    use russh::Sig;
    match sig {
        Sig::ABRT => String::from("ABRT"),
        Sig::ALRM => String::from("ALRM"),
        Sig::FPE => String::from("FPE"),
        Sig::HUP => String::from("HUP"),
        Sig::ILL => String::from("ILL"),
        Sig::INT => String::from("INT"),
        Sig::KILL => String::from("KILL"),
        Sig::PIPE => String::from("PIPE"),
        Sig::QUIT => String::from("QUIT"),
        Sig::SEGV => String::from("SEGV"),
        Sig::TERM => String::from("TERM"),
        Sig::USR1 => String::from("USR1"),
        Sig::Custom(name) => name.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn put_str(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u32).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn decode_pty() -> anyhow::Result<()> {
        let mut payload = Vec::new();
        put_str(&mut payload, "xterm-256color");
        payload.extend_from_slice(&80u32.to_be_bytes());
        payload.extend_from_slice(&24u32.to_be_bytes());
        payload.extend_from_slice(&640u32.to_be_bytes());
        payload.extend_from_slice(&480u32.to_be_bytes());
        put_str(&mut payload, "\x00");

        match RequestKind::decode(PTY_REQUEST, &payload)? {
            RequestKind::Pty(pty) => {
                assert_eq!(pty.term, "xterm-256color");
                assert_eq!((pty.columns, pty.rows, pty.width, pty.height), (80, 24, 640, 480));
                assert_eq!(pty.modelist, vec![0]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn decode_simple_kinds() -> anyhow::Result<()> {
        let mut env = Vec::new();
        put_str(&mut env, "LANG");
        put_str(&mut env, "C.UTF-8");

        let mut exec = Vec::new();
        put_str(&mut exec, "id");

        let mut subsystem = Vec::new();
        put_str(&mut subsystem, "sftp");

        let mut window = Vec::new();
        for dim in [120u32, 40, 0, 0] {
            window.extend_from_slice(&dim.to_be_bytes());
        }

        let exit_status = 0u32.to_be_bytes().to_vec();

        let mut exit_signal = Vec::new();
        put_str(&mut exit_signal, "KILL");
        exit_signal.push(1);
        put_str(&mut exit_signal, "killed");
        put_str(&mut exit_signal, "en");

        let cases = vec![
            (
                ENV_REQUEST,
                env,
                RequestKind::Env(EnvRequest {
                    name: String::from("LANG"),
                    value: String::from("C.UTF-8"),
                }),
            ),
            (SHELL_REQUEST, Vec::new(), RequestKind::Shell),
            (EXEC_REQUEST, exec, RequestKind::Exec(ExecRequest { command: String::from("id") })),
            (
                SUBSYSTEM_REQUEST,
                subsystem,
                RequestKind::Subsystem(SubsystemRequest { name: String::from("sftp") }),
            ),
            (
                WINDOW_CHANGE_REQUEST,
                window,
                RequestKind::WindowChange(WindowChangeRequest {
                    columns: 120,
                    rows: 40,
                    width: 0,
                    height: 0,
                }),
            ),
            (
                EXIT_STATUS_REQUEST,
                exit_status,
                RequestKind::ExitStatus(ExitStatusRequest { exit_status: 0 }),
            ),
            (
                EXIT_SIGNAL_REQUEST,
                exit_signal,
                RequestKind::ExitSignal(ExitSignalRequest {
                    signal_name: String::from("KILL"),
                    core_dumped: true,
                    error_msg: String::from("killed"),
                    lang_tag: String::from("en"),
                }),
            ),
        ];

        for (kind, payload, want) in cases.into_iter() {
            let got = RequestKind::decode(kind, &payload)
                .with_context(|| format!("decoding {kind}"))?;
            assert_eq!(got, want, "decoding {kind}");
        }
        Ok(())
    }

    #[test]
    fn unsupported_kinds() {
        let cases = vec!["x11-req", "xon-off", "signal", "auth-agent-req@openssh.com", ""];

        for kind in cases.into_iter() {
            let err = RequestKind::decode(kind, &[]).expect_err("decode should fail");
            assert!(
                err.to_string().contains("not supported"),
                "error {err:#} should say not supported"
            );
        }
    }

    #[test]
    fn short_payloads() {
        let cases = vec![
            (PTY_REQUEST, vec![0, 0, 0, 4, b'v', b't']),
            (ENV_REQUEST, vec![0, 0, 0, 1, b'A']),
            (EXEC_REQUEST, vec![]),
            (WINDOW_CHANGE_REQUEST, vec![0, 0, 0, 80, 0, 0]),
            (EXIT_STATUS_REQUEST, vec![0, 0]),
            (EXIT_SIGNAL_REQUEST, vec![0, 0, 0, 4, b'K', b'I', b'L', b'L']),
        ];

        for (kind, payload) in cases.into_iter() {
            let err = RequestKind::decode(kind, &payload)
                .expect_err("short payload should fail to decode");
            assert!(
                format!("{err:#}").contains("short packet"),
                "error for {kind}: {err:#}"
            );
        }
    }

    #[test]
    fn mode_encoding_terminates() {
        let modes = vec![(russh::Pty::VINTR, 3u32), (russh::Pty::TTY_OP_ISPEED, 38400)];
        let encoded = encode_modes(&modes);

        let mut want: Vec<u8> = Vec::new();
        want.push(russh::Pty::VINTR as u8);
        want.extend_from_slice(&3u32.to_be_bytes());
        want.push(russh::Pty::TTY_OP_ISPEED as u8);
        want.extend_from_slice(&38400u32.to_be_bytes());
        want.push(TTY_OP_END);
        assert_eq!(encoded, want);

        assert_eq!(encode_modes(&[]), vec![TTY_OP_END]);
    }
}
