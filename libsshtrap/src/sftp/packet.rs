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

use anyhow::{bail, Context};

use crate::wire::PacketBuffer;

// Packet types, draft-ietf-secsh-filexfer-13 §4.3.
pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_FSETSTAT: u8 = 10;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_LINK: u8 = 21;
pub const SSH_FXP_BLOCK: u8 = 22;
pub const SSH_FXP_UNBLOCK: u8 = 23;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;
pub const SSH_FXP_EXTENDED: u8 = 200;
pub const SSH_FXP_EXTENDED_REPLY: u8 = 201;

/// One framed SFTP packet:
///
/// ```text
/// u32 length
///  u8 type
///  [u32 request_id]   // omitted for INIT and VERSION
///  bytes body
/// ```
///
/// `length` counts the type byte, the request id if present, and the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub length: u32,
    pub ptype: u8,
    pub request_id: Option<u32>,
    pub body: Vec<u8>,
}

impl Packet {
    /// Read a single packet off the front of the buffer. Errors here are
    /// framing errors: the rest of the stream cannot be trusted.
    pub fn read(buf: &mut PacketBuffer) -> anyhow::Result<Packet> {
        let length = buf.read_u32().context("reading packet length")?;
        if length == 0 {
            bail!("zero-length sftp packet");
        }
        let ptype = buf.read_u8().context("reading packet type")?;

        let mut body_len = length - 1;
        let request_id = if ptype == SSH_FXP_INIT || ptype == SSH_FXP_VERSION {
            None
        } else {
            if body_len < 4 {
                bail!("packet too short for a request id");
            }
            body_len -= 4;
            Some(buf.read_u32().context("reading request id")?)
        };

        let body = buf.read_exact(body_len as usize).context("reading packet body")?;
        Ok(Packet { length, ptype, request_id, body })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(ptype: u8, request_id: Option<u32>, body: &[u8]) -> Vec<u8> {
        let len = 1 + if request_id.is_some() { 4 } else { 0 } + body.len() as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&len.to_be_bytes());
        out.push(ptype);
        if let Some(id) = request_id {
            out.extend_from_slice(&id.to_be_bytes());
        }
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn request_id_presence() -> anyhow::Result<()> {
        let cases = vec![
            (SSH_FXP_INIT, None, vec![0, 0, 0, 3]),
            (SSH_FXP_VERSION, None, vec![0, 0, 0, 3]),
            (SSH_FXP_OPEN, Some(9), vec![1, 2, 3]),
            (SSH_FXP_CLOSE, Some(u32::MAX), vec![]),
        ];

        for (ptype, request_id, body) in cases.into_iter() {
            let data = frame(ptype, request_id, &body);
            let mut buf = PacketBuffer::new(&data);
            let packet = Packet::read(&mut buf)?;
            assert_eq!(packet.ptype, ptype);
            assert_eq!(packet.request_id, request_id);
            assert_eq!(packet.body, body);
            assert!(buf.is_empty());
        }
        Ok(())
    }

    #[test]
    fn framing_errors() {
        let cases = vec![
            (vec![0, 0, 0, 0], "zero-length"),
            // the frame promises a 3-byte body but the stream ends early
            (frame(SSH_FXP_OPEN, Some(1), &[1, 2, 3])[..10].to_vec(), "short packet"),
            // length 2 cannot hold a request id for a non-INIT type
            (vec![0, 0, 0, 2, SSH_FXP_OPEN, 0], "too short for a request id"),
        ];

        for (data, err_substr) in cases.into_iter() {
            let mut buf = PacketBuffer::new(&data);
            let err = Packet::read(&mut buf).expect_err("framing should fail");
            assert!(
                format!("{err:#}").contains(err_substr),
                "error {err:#} does not contain {err_substr:?}"
            );
        }
    }
}
