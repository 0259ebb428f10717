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

use anyhow::bail;

use super::packet;
use crate::wire::PacketBuffer;

// FileAttributes flag bits, draft-ietf-secsh-filexfer-13 §7.1.
const ATTR_SIZE: u32 = 0x00000001;
const ATTR_PERMISSIONS: u32 = 0x00000004;
const ATTR_ACCESSTIME: u32 = 0x00000008;
const ATTR_CREATETIME: u32 = 0x00000010;
const ATTR_ACL: u32 = 0x00000040;
const ATTR_OWNERGROUP: u32 = 0x00000080;
const ATTR_SUBSECOND_TIMES: u32 = 0x00000100;
const ATTR_BITS: u32 = 0x00000200;
const ATTR_ALLOCATION_SIZE: u32 = 0x00000400;
const ATTR_TEXT_HINT: u32 = 0x00000800;
const ATTR_MIME_TYPE: u32 = 0x00001000;
const ATTR_LINK_COUNT: u32 = 0x00002000;
const ATTR_UNTRANSLATED_NAME: u32 = 0x00004000;
const ATTR_CTIME: u32 = 0x00008000;
const ATTR_EXTENDED: u32 = 0x80000000;

/// The decoded body of a client-originated SFTP packet. Types outside
/// this set are present in the grammar but are skipped undecoded.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Init(Init),
    Open(Open),
    Close(Close),
    Read(Read),
    Write(Write),
    Remove(Remove),
    Rename(Rename),
    Mkdir(Mkdir),
    Rmdir(Rmdir),
    OpenDir(OpenDir),
    ReadDir(ReadDir),
    Stat(Stat),
    Lstat(Lstat),
    Fstat(Fstat),
}

impl PacketBody {
    /// Decode the body bytes of a packet of the given type. `Ok(None)`
    /// means the type is not one we decode; an `Err` means the body was
    /// malformed, which only poisons this packet, not the stream.
    pub fn decode(ptype: u8, body: &[u8]) -> anyhow::Result<Option<PacketBody>> {
        let mut buf = PacketBuffer::new(body);
        let decoded = match ptype {
            packet::SSH_FXP_INIT => {
                if body.len() != 4 {
                    bail!("INIT body must be exactly 4 bytes, got {}", body.len());
                }
                PacketBody::Init(Init { version: buf.read_u32()? })
            }
            packet::SSH_FXP_OPEN => {
                let filename = buf.read_string()?;
                let desired_access = buf.read_u32()?;
                let flags = buf.read_u32()?;
                let attrs =
                    if buf.is_empty() { None } else { Some(FileAttributes::decode(&mut buf)?) };
                PacketBody::Open(Open { filename, desired_access, flags, attrs })
            }
            packet::SSH_FXP_CLOSE => PacketBody::Close(Close { handle: buf.read_string()? }),
            packet::SSH_FXP_READ => PacketBody::Read(Read {
                handle: buf.read_string()?,
                offset: buf.read_u64()?,
                length: buf.read_u32()?,
            }),
            packet::SSH_FXP_WRITE => PacketBody::Write(Write {
                handle: buf.read_string()?,
                offset: buf.read_u64()?,
                data: buf.read_string()?,
            }),
            packet::SSH_FXP_REMOVE => PacketBody::Remove(Remove { filename: buf.read_string()? }),
            packet::SSH_FXP_RENAME => PacketBody::Rename(Rename {
                old_path: buf.read_string()?,
                new_path: buf.read_string()?,
            }),
            packet::SSH_FXP_MKDIR => {
                let path = buf.read_string()?;
                let attrs =
                    if buf.is_empty() { None } else { Some(FileAttributes::decode(&mut buf)?) };
                PacketBody::Mkdir(Mkdir { path, attrs })
            }
            packet::SSH_FXP_RMDIR => PacketBody::Rmdir(Rmdir { path: buf.read_string()? }),
            packet::SSH_FXP_OPENDIR => PacketBody::OpenDir(OpenDir { path: buf.read_string()? }),
            packet::SSH_FXP_READDIR => PacketBody::ReadDir(ReadDir { handle: buf.read_string()? }),
            packet::SSH_FXP_STAT => PacketBody::Stat(Stat { path: buf.read_string()? }),
            packet::SSH_FXP_LSTAT => PacketBody::Lstat(Lstat { path: buf.read_string()? }),
            packet::SSH_FXP_FSTAT => PacketBody::Fstat(Fstat { handle: buf.read_string()? }),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}

/// SSH_FXP_INIT C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub version: u32,
}

/// SSH_FXP_OPEN C->S
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub filename: String,
    pub desired_access: u32,
    pub flags: u32,
    pub attrs: Option<FileAttributes>,
}

/// SSH_FXP_CLOSE C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub handle: String,
}

/// SSH_FXP_READ C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub handle: String,
    pub offset: u64,
    pub length: u32,
}

/// SSH_FXP_WRITE C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub handle: String,
    pub offset: u64,
    pub data: String,
}

/// SSH_FXP_REMOVE C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remove {
    pub filename: String,
}

/// SSH_FXP_RENAME C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub old_path: String,
    pub new_path: String,
}

/// SSH_FXP_MKDIR C->S
#[derive(Debug, Clone, PartialEq)]
pub struct Mkdir {
    pub path: String,
    pub attrs: Option<FileAttributes>,
}

/// SSH_FXP_RMDIR C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rmdir {
    pub path: String,
}

/// SSH_FXP_OPENDIR C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDir {
    pub path: String,
}

/// SSH_FXP_READDIR C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDir {
    pub handle: String,
}

/// SSH_FXP_STAT C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub path: String,
}

/// SSH_FXP_LSTAT C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lstat {
    pub path: String,
}

/// SSH_FXP_FSTAT C->S
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fstat {
    pub handle: String,
}

/// The flags-gated attribute record of draft-ietf-secsh-filexfer-13 §7.
/// Only the fields named by `flags` are present on the wire; everything
/// else stays at its default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAttributes {
    pub flags: u32,
    pub size: u64,
    pub allocation_size: u64,
    pub owner: String,
    pub group: String,
    pub permissions: u32,
    pub atime: i64,
    pub atime_nseconds: u32,
    pub createtime: i64,
    pub createtime_nseconds: u32,
    pub ctime: i64,
    pub ctime_nseconds: u32,
    pub acl: String,
    pub attrib_bits: u32,
    pub attrib_bits_valid: u32,
    pub text_hint: u8,
    pub mime_type: String,
    pub link_count: u32,
    pub untranslated_name: String,
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    pub fn decode(buf: &mut PacketBuffer) -> anyhow::Result<FileAttributes> {
        let mut fa = FileAttributes { flags: buf.read_u32()?, ..Default::default() };

        if fa.flags & ATTR_SIZE != 0 {
            fa.size = buf.read_u64()?;
        }
        if fa.flags & ATTR_ALLOCATION_SIZE != 0 {
            fa.allocation_size = buf.read_u64()?;
        }
        if fa.flags & ATTR_OWNERGROUP != 0 {
            fa.owner = buf.read_string()?;
            fa.group = buf.read_string()?;
        }
        if fa.flags & ATTR_PERMISSIONS != 0 {
            fa.permissions = buf.read_u32()?;
        }
        if fa.flags & ATTR_ACCESSTIME != 0 {
            fa.atime = buf.read_i64()?;
            if fa.flags & ATTR_SUBSECOND_TIMES != 0 {
                fa.atime_nseconds = buf.read_u32()?;
            }
        }
        if fa.flags & ATTR_CREATETIME != 0 {
            fa.createtime = buf.read_i64()?;
            if fa.flags & ATTR_SUBSECOND_TIMES != 0 {
                fa.createtime_nseconds = buf.read_u32()?;
            }
        }
        if fa.flags & ATTR_CTIME != 0 {
            fa.ctime = buf.read_i64()?;
            if fa.flags & ATTR_SUBSECOND_TIMES != 0 {
                fa.ctime_nseconds = buf.read_u32()?;
            }
        }
        if fa.flags & ATTR_ACL != 0 {
            fa.acl = buf.read_string()?;
        }
        if fa.flags & ATTR_BITS != 0 {
            fa.attrib_bits = buf.read_u32()?;
            fa.attrib_bits_valid = buf.read_u32()?;
        }
        if fa.flags & ATTR_TEXT_HINT != 0 {
            fa.text_hint = buf.read_u8()?;
        }
        if fa.flags & ATTR_MIME_TYPE != 0 {
            fa.mime_type = buf.read_string()?;
        }
        if fa.flags & ATTR_LINK_COUNT != 0 {
            fa.link_count = buf.read_u32()?;
        }
        if fa.flags & ATTR_UNTRANSLATED_NAME != 0 {
            fa.untranslated_name = buf.read_string()?;
        }
        if fa.flags & ATTR_EXTENDED != 0 {
            let count = buf.read_u32()?;
            for _ in 0..count {
                let ext_type = buf.read_string()?;
                let ext_data = buf.read_string()?;
                fa.extended.push((ext_type, ext_data));
            }
        }

        Ok(fa)
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
    fn open_with_and_without_attrs() -> anyhow::Result<()> {
        let mut body = Vec::new();
        put_str(&mut body, "/etc/passwd");
        body.extend_from_slice(&1u32.to_be_bytes()); // desired-access
        body.extend_from_slice(&0u32.to_be_bytes()); // flags

        let decoded = PacketBody::decode(packet::SSH_FXP_OPEN, &body)?.expect("decoded");
        let PacketBody::Open(open) = decoded else { panic!("wrong variant") };
        assert_eq!(open.filename, "/etc/passwd");
        assert_eq!(open.desired_access, 1);
        assert_eq!(open.flags, 0);
        assert!(open.attrs.is_none());

        // with a trailing attribute record carrying a size
        body.extend_from_slice(&ATTR_SIZE.to_be_bytes());
        body.extend_from_slice(&4096u64.to_be_bytes());
        let decoded = PacketBody::decode(packet::SSH_FXP_OPEN, &body)?.expect("decoded");
        let PacketBody::Open(open) = decoded else { panic!("wrong variant") };
        let attrs = open.attrs.expect("attrs present");
        assert_eq!(attrs.size, 4096);
        Ok(())
    }

    #[test]
    fn path_and_handle_bodies() -> anyhow::Result<()> {
        // (ptype, payload string, extractor)
        let cases: Vec<(u8, fn(PacketBody) -> String)> = vec![
            (packet::SSH_FXP_CLOSE, |b| match b {
                PacketBody::Close(p) => p.handle,
                other => panic!("wrong variant: {other:?}"),
            }),
            (packet::SSH_FXP_REMOVE, |b| match b {
                PacketBody::Remove(p) => p.filename,
                other => panic!("wrong variant: {other:?}"),
            }),
            (packet::SSH_FXP_RMDIR, |b| match b {
                PacketBody::Rmdir(p) => p.path,
                other => panic!("wrong variant: {other:?}"),
            }),
            (packet::SSH_FXP_OPENDIR, |b| match b {
                PacketBody::OpenDir(p) => p.path,
                other => panic!("wrong variant: {other:?}"),
            }),
            (packet::SSH_FXP_READDIR, |b| match b {
                PacketBody::ReadDir(p) => p.handle,
                other => panic!("wrong variant: {other:?}"),
            }),
            (packet::SSH_FXP_STAT, |b| match b {
                PacketBody::Stat(p) => p.path,
                other => panic!("wrong variant: {other:?}"),
            }),
            (packet::SSH_FXP_LSTAT, |b| match b {
                PacketBody::Lstat(p) => p.path,
                other => panic!("wrong variant: {other:?}"),
            }),
            (packet::SSH_FXP_FSTAT, |b| match b {
                PacketBody::Fstat(p) => p.handle,
                other => panic!("wrong variant: {other:?}"),
            }),
        ];

        for (ptype, extract) in cases.into_iter() {
            let mut body = Vec::new();
            put_str(&mut body, "/some/target");
            let decoded = PacketBody::decode(ptype, &body)?.expect("decoded");
            assert_eq!(extract(decoded), "/some/target");
        }
        Ok(())
    }

    #[test]
    fn read_write_rename() -> anyhow::Result<()> {
        let mut body = Vec::new();
        put_str(&mut body, "h1");
        body.extend_from_slice(&1024u64.to_be_bytes());
        body.extend_from_slice(&512u32.to_be_bytes());
        match PacketBody::decode(packet::SSH_FXP_READ, &body)?.expect("decoded") {
            PacketBody::Read(r) => {
                assert_eq!((r.handle.as_str(), r.offset, r.length), ("h1", 1024, 512));
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let mut body = Vec::new();
        put_str(&mut body, "h2");
        body.extend_from_slice(&0u64.to_be_bytes());
        put_str(&mut body, "payload");
        match PacketBody::decode(packet::SSH_FXP_WRITE, &body)?.expect("decoded") {
            PacketBody::Write(w) => {
                assert_eq!((w.handle.as_str(), w.offset, w.data.as_str()), ("h2", 0, "payload"));
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let mut body = Vec::new();
        put_str(&mut body, "/old");
        put_str(&mut body, "/new");
        match PacketBody::decode(packet::SSH_FXP_RENAME, &body)?.expect("decoded") {
            PacketBody::Rename(r) => {
                assert_eq!((r.old_path.as_str(), r.new_path.as_str()), ("/old", "/new"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn init_body_must_be_four_bytes() {
        assert!(PacketBody::decode(packet::SSH_FXP_INIT, &[0, 0, 0]).is_err());
        assert!(PacketBody::decode(packet::SSH_FXP_INIT, &[0, 0, 0, 3, 0]).is_err());
        match PacketBody::decode(packet::SSH_FXP_INIT, &[0, 0, 0, 3]) {
            Ok(Some(PacketBody::Init(init))) => assert_eq!(init.version, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn undecoded_types_are_skipped() -> anyhow::Result<()> {
        for ptype in [
            packet::SSH_FXP_SETSTAT,
            packet::SSH_FXP_REALPATH,
            packet::SSH_FXP_STATUS,
            packet::SSH_FXP_EXTENDED,
            255,
        ] {
            assert_eq!(PacketBody::decode(ptype, &[1, 2, 3])?, None);
        }
        Ok(())
    }

    #[test]
    fn file_attributes_bitmasks() -> anyhow::Result<()> {
        // size + owner/group + permissions + atime with subseconds
        let flags = ATTR_SIZE | ATTR_OWNERGROUP | ATTR_PERMISSIONS | ATTR_ACCESSTIME
            | ATTR_SUBSECOND_TIMES;
        let mut body = Vec::new();
        body.extend_from_slice(&flags.to_be_bytes());
        body.extend_from_slice(&99u64.to_be_bytes());
        put_str(&mut body, "root");
        put_str(&mut body, "wheel");
        body.extend_from_slice(&0o644u32.to_be_bytes());
        body.extend_from_slice(&1700000000i64.to_be_bytes());
        body.extend_from_slice(&250u32.to_be_bytes());

        let mut buf = PacketBuffer::new(&body);
        let fa = FileAttributes::decode(&mut buf)?;
        assert_eq!(fa.size, 99);
        assert_eq!(fa.owner, "root");
        assert_eq!(fa.group, "wheel");
        assert_eq!(fa.permissions, 0o644);
        assert_eq!(fa.atime, 1700000000);
        assert_eq!(fa.atime_nseconds, 250);
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn file_attributes_extended_pairs() -> anyhow::Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&ATTR_EXTENDED.to_be_bytes());
        body.extend_from_slice(&2u32.to_be_bytes());
        put_str(&mut body, "a@example");
        put_str(&mut body, "1");
        put_str(&mut body, "b@example");
        put_str(&mut body, "2");

        let mut buf = PacketBuffer::new(&body);
        let fa = FileAttributes::decode(&mut buf)?;
        assert_eq!(
            fa.extended,
            vec![
                (String::from("a@example"), String::from("1")),
                (String::from("b@example"), String::from("2")),
            ]
        );
        Ok(())
    }

    #[test]
    fn file_attributes_short_body() {
        // flags promise a size that is not there
        let body = ATTR_SIZE.to_be_bytes().to_vec();
        let mut buf = PacketBuffer::new(&body);
        let err = FileAttributes::decode(&mut buf).expect_err("decode should fail");
        assert!(format!("{err:#}").contains("short packet"));
    }
}
