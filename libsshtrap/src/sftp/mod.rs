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

//! A post-mortem parser for captured SFTP client streams.
//!
//! When a session opened an `sftp` subsystem, the channel's client->server
//! capture buffer is a back-to-back sequence of SFTP packets. Parsing it
//! turns filenames, handles, offsets and attribute bitmasks into
//! observables. The parser is purely observational: it logs what it
//! decodes and never feeds anything back into the relay.

use anyhow::Context;
use tracing::debug;

use crate::wire::PacketBuffer;

mod packet;
mod packets;

pub use packet::Packet;
pub use packets::{FileAttributes, PacketBody};

/// One parsed packet: the frame header plus the decoded body, when the
/// packet type is one we decode.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPacket {
    pub ptype: u8,
    pub request_id: Option<u32>,
    pub body: Option<PacketBody>,
}

/// Parses a captured byte stream as a sequence of SFTP packets.
pub struct Parser<'data> {
    data: &'data [u8],
}

impl<'data> Parser<'data> {
    pub fn new(data: &'data [u8]) -> Self {
        Parser { data }
    }

    /// Parse the whole stream. A body that fails to decode is a
    /// per-packet problem: it is logged and the packet is kept with an
    /// undecoded body. A framing error means the remainder of the stream
    /// cannot be trusted, so parsing stops there.
    pub fn parse(&self) -> anyhow::Result<Vec<ParsedPacket>> {
        let mut buf = PacketBuffer::new(self.data);
        let mut parsed = Vec::new();

        while !buf.is_empty() {
            let packet = Packet::read(&mut buf)
                .with_context(|| format!("framing sftp packet {}", parsed.len()))?;
            let body = match PacketBody::decode(packet.ptype, &packet.body) {
                Ok(body) => body,
                Err(err) => {
                    debug!(ptype = packet.ptype, "undecodable sftp packet body: {err:#}");
                    None
                }
            };
            debug!(
                ptype = packet.ptype,
                request_id = ?packet.request_id,
                body = ?body,
                "sftp packet"
            );
            parsed.push(ParsedPacket { ptype: packet.ptype, request_id: packet.request_id, body });
        }

        debug!(count = parsed.len(), "parsed sftp stream");
        Ok(parsed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn put_str(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u32).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    }

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

    /// The stream an `INIT; OPEN /etc/passwd; CLOSE` exchange produces.
    fn passwd_open_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(packet::SSH_FXP_INIT, None, &3u32.to_be_bytes()));

        let mut open = Vec::new();
        put_str(&mut open, "/etc/passwd");
        open.extend_from_slice(&1u32.to_be_bytes()); // ACE4_READ_DATA
        open.extend_from_slice(&0u32.to_be_bytes());
        stream.extend_from_slice(&frame(packet::SSH_FXP_OPEN, Some(0), &open));

        let mut close = Vec::new();
        put_str(&mut close, "handle-0");
        stream.extend_from_slice(&frame(packet::SSH_FXP_CLOSE, Some(1), &close));
        stream
    }

    #[test]
    fn open_close_sequence() -> anyhow::Result<()> {
        let stream = passwd_open_stream();
        let parsed = Parser::new(&stream).parse()?;

        assert_eq!(parsed.len(), 3);
        assert_eq!(
            parsed.iter().map(|p| p.ptype).collect::<Vec<_>>(),
            vec![packet::SSH_FXP_INIT, packet::SSH_FXP_OPEN, packet::SSH_FXP_CLOSE],
        );
        match &parsed[1].body {
            Some(PacketBody::Open(open)) => assert_eq!(open.filename, "/etc/passwd"),
            other => panic!("expected an Open body, got {other:?}"),
        }
        match &parsed[2].body {
            Some(PacketBody::Close(close)) => assert_eq!(close.handle, "handle-0"),
            other => panic!("expected a Close body, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn parsing_is_idempotent() -> anyhow::Result<()> {
        let stream = passwd_open_stream();
        let parser = Parser::new(&stream);
        assert_eq!(parser.parse()?, parser.parse()?);
        Ok(())
    }

    #[test]
    fn unknown_types_do_not_abort() -> anyhow::Result<()> {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(packet::SSH_FXP_REALPATH, Some(7), &[1, 2, 3]));
        let mut rmdir = Vec::new();
        put_str(&mut rmdir, "/tmp/x");
        stream.extend_from_slice(&frame(packet::SSH_FXP_RMDIR, Some(8), &rmdir));

        let parsed = Parser::new(&stream).parse()?;
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].body.is_none());
        assert!(matches!(parsed[1].body, Some(PacketBody::Rmdir(_))));
        Ok(())
    }

    #[test]
    fn short_body_is_recoverable() -> anyhow::Result<()> {
        // an OPEN whose body lies about its filename length, followed by a
        // well-formed CLOSE; the first packet decodes to nothing, the
        // stream keeps going
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(packet::SSH_FXP_OPEN, Some(0), &[0, 0, 0, 99, b'x']));
        let mut close = Vec::new();
        put_str(&mut close, "h");
        stream.extend_from_slice(&frame(packet::SSH_FXP_CLOSE, Some(1), &close));

        let parsed = Parser::new(&stream).parse()?;
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].body.is_none());
        assert!(matches!(parsed[1].body, Some(PacketBody::Close(_))));
        Ok(())
    }

    #[test]
    fn broken_frame_stops_the_parse() {
        let mut stream = passwd_open_stream();
        // truncate into the middle of the final frame
        stream.truncate(stream.len() - 3);
        let err = Parser::new(&stream).parse().expect_err("parse should fail");
        assert!(format!("{err:#}").contains("framing sftp packet 2"));
    }
}
