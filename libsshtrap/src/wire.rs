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

use std::io::{self, Read as _};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ReadBytesExt as _};

/// A bounded big-endian cursor over a byte slice.
///
/// Both the SSH channel-request payload format (RFC 4254 §6.x) and the
/// SFTP packet format are sequences of network-order integers and
/// u32-length-prefixed strings, so one reader serves both decoders.
/// Every read is bounds checked; running off the end of the slice yields
/// a "short packet" error rather than a panic.
pub struct PacketBuffer<'data> {
    cursor: io::Cursor<&'data [u8]>,
}

impl<'data> PacketBuffer<'data> {
    pub fn new(data: &'data [u8]) -> Self {
        PacketBuffer { cursor: io::Cursor::new(data) }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        (len - self.cursor.position().min(len)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        self.cursor.read_u8().context("short packet")
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        self.cursor.read_u32::<BigEndian>().context("short packet")
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        self.cursor.read_u64::<BigEndian>().context("short packet")
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        self.cursor.read_i64::<BigEndian>().context("short packet")
    }

    /// Read exactly `n` bytes. The bound is checked before allocating
    /// so a malformed length prefix cannot trigger a huge allocation.
    pub fn read_exact(&mut self, n: usize) -> anyhow::Result<Vec<u8>> {
        if n > self.remaining() {
            return Err(anyhow!("short packet"));
        }
        let mut buf = vec![0; n];
        self.cursor.read_exact(&mut buf).context("short packet")?;
        Ok(buf)
    }

    /// Read a u32-length-prefixed byte string.
    pub fn read_string_bytes(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.read_exact(len)
    }

    /// Read a u32-length-prefixed string. The wire guarantees nothing
    /// about the contents, so invalid utf8 is replaced rather than
    /// rejected, matching how we treat all attacker-controlled text.
    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let bytes = self.read_string_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Consume and return all remaining bytes.
    pub fn rest(&mut self) -> Vec<u8> {
        let n = self.remaining();
        self.read_exact(n).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalar_reads() -> anyhow::Result<()> {
        let data: Vec<u8> = vec![
            0x07, // u8
            0x00, 0x00, 0x01, 0x02, // u32
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2a, // u64
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // i64 = -1
        ];
        let mut buf = PacketBuffer::new(&data);

        assert_eq!(buf.read_u8()?, 7);
        assert_eq!(buf.read_u32()?, 258);
        assert_eq!(buf.read_u64()?, 42);
        assert_eq!(buf.read_i64()?, -1);
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn string_reads() -> anyhow::Result<()> {
        let data: Vec<u8> = vec![0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0x01];
        let mut buf = PacketBuffer::new(&data);

        assert_eq!(buf.read_string()?, "hello");
        assert_eq!(buf.remaining(), 1);
        assert_eq!(buf.rest(), vec![0x01]);
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn invalid_utf8_is_replaced() -> anyhow::Result<()> {
        let data: Vec<u8> = vec![0x00, 0x00, 0x00, 0x02, 0xff, 0xfe];
        let mut buf = PacketBuffer::new(&data);

        let s = buf.read_string()?;
        assert_eq!(s.chars().count(), 2);
        Ok(())
    }

    #[test]
    fn short_reads_error() {
        // (data, how to trigger the short read)
        let cases: Vec<(Vec<u8>, fn(&mut PacketBuffer) -> anyhow::Result<()>)> = vec![
            (vec![], |b| b.read_u8().map(|_| ())),
            (vec![0x00, 0x01], |b| b.read_u32().map(|_| ())),
            (vec![0x00, 0x00, 0x00, 0x01], |b| b.read_u64().map(|_| ())),
            (vec![0x00], |b| b.read_i64().map(|_| ())),
            // length prefix promises more bytes than exist
            (vec![0x00, 0x00, 0x00, 0x10, b'x'], |b| b.read_string().map(|_| ())),
            // absurd length prefix must not allocate
            (vec![0xff, 0xff, 0xff, 0xff], |b| b.read_string().map(|_| ())),
        ];

        for (data, read) in cases.into_iter() {
            let mut buf = PacketBuffer::new(&data);
            let err = read(&mut buf).expect_err("read should fail");
            assert!(format!("{err:#}").contains("short packet"), "unexpected error: {err:#}");
        }
    }
}
