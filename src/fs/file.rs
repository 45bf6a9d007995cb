//! Open files and the directory-entry wire format.
//!
//! An open file is a position plus exactly one backing: a dentry (regular
//! files, directories) or a device. The dentry is preferred over a bare
//! inode because unlink and path reconstruction need the name and parent.

use alloc::string::String;
use alloc::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::drivers::Device;
use crate::errno::{ErrorCode, Result};
use crate::fs::dcache::DentryRef;
use crate::fs::icache::InodeRef;

#[derive(Clone)]
pub enum FileBacking {
    Dentry(DentryRef),
    Device(Arc<dyn Device>),
}

/// An open file. Cloning clones the backing reference (the dentry refcount
/// moves with it), so handles can be inherited across threads.
#[derive(Clone)]
pub struct File {
    pub offset: u64,
    pub backing: FileBacking,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File").field("offset", &self.offset).finish()
    }
}

impl File {
    pub fn from_dentry(dentry: DentryRef) -> File {
        File {
            offset: 0,
            backing: FileBacking::Dentry(dentry),
        }
    }

    pub fn from_device(dev: Arc<dyn Device>) -> File {
        File {
            offset: 0,
            backing: FileBacking::Device(dev),
        }
    }

    pub fn dentry(&self) -> Option<&DentryRef> {
        match &self.backing {
            FileBacking::Dentry(d) => Some(d),
            FileBacking::Device(_) => None,
        }
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        match &self.backing {
            FileBacking::Device(dev) => Some(dev),
            FileBacking::Dentry(_) => None,
        }
    }

    /// Backing inode (fresh ref), when dentry-backed and resolved.
    pub fn inode(&self) -> Option<InodeRef> {
        self.dentry().and_then(|d| d.inode())
    }
}

// ── VFS_DIRENT wire format ──────────────────────

/// Fixed header of one directory entry; the name follows immediately.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
pub struct DirentHeader {
    pub flags: u32,
    pub name_length: u8,
    pub inum: u64,
}

pub const DIRENT_HEADER_LEN: usize = core::mem::size_of::<DirentHeader>();

/// Append one entry to `buf`. Returns the bytes consumed, or `None` when
/// the buffer cannot hold the record (the caller stops emitting there).
pub fn emit_dirent(buf: &mut [u8], flags: u32, inum: u64, name: &str) -> Option<usize> {
    let total = DIRENT_HEADER_LEN + name.len();
    if buf.len() < total || name.len() > u8::MAX as usize {
        return None;
    }
    let hdr = DirentHeader {
        flags,
        name_length: name.len() as u8,
        inum,
    };
    buf[..DIRENT_HEADER_LEN].copy_from_slice(hdr.as_bytes());
    buf[DIRENT_HEADER_LEN..total].copy_from_slice(name.as_bytes());
    Some(total)
}

/// Decode one entry; returns `(flags, inum, name, consumed)`.
pub fn parse_dirent(buf: &[u8]) -> Result<(u32, u64, String, usize)> {
    let (hdr, rest) =
        DirentHeader::read_from_prefix(buf).map_err(|_| ErrorCode::BadLength)?;
    let name_len = hdr.name_length as usize;
    if rest.len() < name_len {
        return Err(ErrorCode::BadLength);
    }
    let name = core::str::from_utf8(&rest[..name_len])
        .map_err(|_| ErrorCode::BadLength)?;
    Ok((
        hdr.flags,
        hdr.inum,
        String::from(name),
        DIRENT_HEADER_LEN + name_len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_layout_matches_wire_contract() {
        // u32 flags + u8 name_length + u64 inum, no padding.
        assert_eq!(DIRENT_HEADER_LEN, 13);
        let mut buf = [0u8; 32];
        let n = emit_dirent(&mut buf, 0x1, 0x1122_3344_5566_7788, "ab").unwrap();
        assert_eq!(n, 15);
        assert_eq!(&buf[..4], &1u32.to_le_bytes());
        assert_eq!(buf[4], 2);
        assert_eq!(&buf[5..13], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&buf[13..15], b"ab");
    }

    #[test]
    fn dirent_roundtrip_and_truncation() {
        let mut buf = [0u8; 64];
        let n1 = emit_dirent(&mut buf, 0, 7, "hello").unwrap();
        let n2 = emit_dirent(&mut buf[n1..], 0, 9, "x").unwrap();

        let (f, inum, name, used) = parse_dirent(&buf).unwrap();
        assert_eq!((f, inum, name.as_str(), used), (0, 7, "hello", n1));
        let (_, inum2, name2, _) = parse_dirent(&buf[n1..n1 + n2]).unwrap();
        assert_eq!((inum2, name2.as_str()), (9, "x"));

        // A buffer too small for the record refuses to emit.
        let mut tiny = [0u8; 14];
        assert!(emit_dirent(&mut tiny, 0, 1, "ab").is_none());
    }
}
