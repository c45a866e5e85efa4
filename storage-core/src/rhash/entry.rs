//! On-disk layout for the resource-hash header and entries (spec.md
//! sections 3.1 and 6), pinned to explicit little-endian byte order via
//! `zerocopy` rather than the host-endian transmute the rest of this
//! corpus tends to reach for.

use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x4a58_5230;
pub const HEADER_SIZE: u64 = 512;
pub const ENTRY_SIZE: u64 = 32;
pub const DEFAULT_SIZE: u32 = 65536;
pub const DEFAULT_BUCKET_SIZE: u32 = 16;
pub const DEFAULT_SEARCH_DIST: u32 = 32;
pub const INLINE_CAP: usize = 15;

#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawHeader {
    magic: [u8; 4],
    size: [u8; 4],
    count: [u8; 4],
    search_dist: [u8; 4],
    bucket_size: [u8; 4],
    revision: [u8; 4],
    _pad: [u8; 488],
}

impl RawHeader {
    pub fn new(size: u32, bucket_size: u32, search_dist: u32) -> Self {
        RawHeader {
            magic: MAGIC.to_le_bytes(),
            size: size.to_le_bytes(),
            count: 0u32.to_le_bytes(),
            search_dist: search_dist.to_le_bytes(),
            bucket_size: bucket_size.to_le_bytes(),
            revision: 1u32.to_le_bytes(),
            _pad: [0u8; 488],
        }
    }

    pub fn validate(&self) -> Result<()> {
        let magic = u32::from_le_bytes(self.magic);
        if magic != MAGIC {
            return Err(Error::CorruptHeader(format!("rhash magic mismatch: {magic:#x}")));
        }
        Ok(())
    }

    pub fn size(&self) -> u32 {
        u32::from_le_bytes(self.size)
    }
    pub fn set_size(&mut self, v: u32) {
        self.size = v.to_le_bytes();
    }
    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.count)
    }
    pub fn set_count(&mut self, v: u32) {
        self.count = v.to_le_bytes();
    }
    pub fn search_dist(&self) -> u32 {
        u32::from_le_bytes(self.search_dist)
    }
    pub fn set_search_dist(&mut self, v: u32) {
        self.search_dist = v.to_le_bytes();
    }
    pub fn bucket_size(&self) -> u32 {
        u32::from_le_bytes(self.bucket_size)
    }
}

/// Single-byte codec/location tag (spec.md section 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline = b'i' as isize,
    Numeric = b'N' as isize,
    Date = b'D' as isize,
    Prefix = b'p' as isize,
    File = b'f' as isize,
    PrefixFile = b'P' as isize,
    Zlib = b'Z' as isize,
}

impl Disposition {
    pub fn is_prefixed(self) -> bool {
        matches!(self, Disposition::Prefix | Disposition::PrefixFile)
    }

    pub fn is_external(self) -> bool {
        matches!(self, Disposition::File | Disposition::PrefixFile | Disposition::Zlib)
    }
}

impl TryFrom<u8> for Disposition {
    type Error = Error;

    fn try_from(b: u8) -> Result<Disposition> {
        Ok(match b {
            b'i' => Disposition::Inline,
            b'N' => Disposition::Numeric,
            b'D' => Disposition::Date,
            b'p' => Disposition::Prefix,
            b'f' => Disposition::File,
            b'P' => Disposition::PrefixFile,
            b'Z' => Disposition::Zlib,
            other => return Err(Error::CorruptHeader(format!("unknown disposition byte {other:#x}"))),
        })
    }
}

/// A 32-byte packed table entry: `rid`(8) + `aval`(8) + `val`(15) +
/// `disp`(1). `aval` is either the attribute RID or a `{code, 7-byte
/// inline suffix}` pair; `val`'s 15 bytes hold either inline payload
/// bytes or (for external dispositions) an 8-byte lex-file offset.
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RawEntry {
    rid: [u8; 8],
    aval: [u8; 8],
    val: [u8; INLINE_CAP],
    disp: u8,
}

impl RawEntry {
    pub const SIZE: usize = ENTRY_SIZE as usize;

    pub fn free() -> Self {
        RawEntry { rid: [0; 8], aval: [0; 8], val: [0; INLINE_CAP], disp: 0 }
    }

    pub fn is_free(&self) -> bool {
        self.rid == [0; 8] && self.disp == 0
    }

    pub fn rid(&self) -> u64 {
        u64::from_le_bytes(self.rid)
    }

    pub fn disposition(&self) -> Result<Disposition> {
        Disposition::try_from(self.disp)
    }

    pub fn attr(&self) -> u64 {
        u64::from_le_bytes(self.aval)
    }

    pub fn prefix_code(&self) -> u8 {
        self.aval[0]
    }

    pub fn prefix_inline(&self) -> &[u8] {
        &self.aval[1..8]
    }

    pub fn val(&self) -> &[u8; INLINE_CAP] {
        &self.val
    }

    pub fn offset(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.val[0..8]);
        u64::from_le_bytes(buf)
    }

    pub fn from_bytes_at(bytes: &[u8]) -> Result<RawEntry> {
        RawEntry::read_from(bytes).ok_or_else(|| Error::CorruptHeader("short entry read".into()))
    }

    pub fn new_inline(rid: u64, attr: u64, disp: Disposition, bytes: &[u8]) -> RawEntry {
        debug_assert!(bytes.len() <= INLINE_CAP);
        let mut val = [0u8; INLINE_CAP];
        val[..bytes.len()].copy_from_slice(bytes);
        RawEntry { rid: rid.to_le_bytes(), aval: attr.to_le_bytes(), val, disp: disp as u8 }
    }

    pub fn new_prefix_inline(rid: u64, code: u8, inline_suffix: &[u8; 7], rest: &[u8]) -> RawEntry {
        debug_assert!(rest.len() <= INLINE_CAP);
        let mut aval = [0u8; 8];
        aval[0] = code;
        aval[1..8].copy_from_slice(inline_suffix);
        let mut val = [0u8; INLINE_CAP];
        val[..rest.len()].copy_from_slice(rest);
        RawEntry { rid: rid.to_le_bytes(), aval, val, disp: Disposition::Prefix as u8 }
    }

    pub fn new_external(rid: u64, attr: u64, disp: Disposition, offset: u64) -> RawEntry {
        debug_assert!(disp.is_external());
        let mut val = [0u8; INLINE_CAP];
        val[0..8].copy_from_slice(&offset.to_le_bytes());
        RawEntry { rid: rid.to_le_bytes(), aval: attr.to_le_bytes(), val, disp: disp as u8 }
    }

    pub fn new_prefix_file(rid: u64, code: u8, offset: u64) -> RawEntry {
        let mut aval = [0u8; 8];
        aval[0] = code;
        let mut val = [0u8; INLINE_CAP];
        val[0..8].copy_from_slice(&offset.to_le_bytes());
        RawEntry { rid: rid.to_le_bytes(), aval, val, disp: Disposition::PrefixFile as u8 }
    }
}
