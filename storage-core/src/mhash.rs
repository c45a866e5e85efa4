//! Fixed-width, open-addressed, linear-probed disk hash table mapping
//! 64-bit RIDs to 32-bit index node values (spec.md section 4.3).

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::{debug, warn};

use lockable::{Lockable, LockOp, LockState, MetadataHooks, OpenFlags};

use crate::error::{Error, Result};
use crate::Rid;

const MAGIC: u32 = 0x4a58_4d30;
const HEADER_SIZE: u64 = 512;
const ENTRY_SIZE: u64 = 12;
const DEFAULT_SIZE: u32 = 1024;
const DEFAULT_SEARCH_DIST: u32 = 16;

struct Header {
    size: u32,
    count: u32,
    search_dist: u32,
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.search_dist.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Header> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::CorruptHeader(format!("mhash magic mismatch: {magic:#x}")));
        }
        Ok(Header {
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            search_dist: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

struct MhashMeta {
    header: Header,
}

impl MetadataHooks for MhashMeta {
    fn read_metadata(&mut self, file: &File) -> lockable::Result<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut buf, 0)?;
        self.header = Header::from_bytes(&buf)
            .map_err(|e| lockable::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;
        Ok(())
    }

    fn write_metadata(&mut self, file: &mut File) -> lockable::Result<()> {
        file.write_all_at(&self.header.to_bytes(), 0)?;
        Ok(())
    }
}

/// A fixed-width, open-addressed disk hash from RIDs to `u32` index node
/// values.
pub struct Mhash {
    lockable: Lockable<MhashMeta>,
}

fn home_slot(rid: Rid, size: u32) -> u32 {
    ((rid >> 10) & (size as u64 - 1)) as u32
}

fn entry_offset(index: u32) -> u64 {
    HEADER_SIZE + index as u64 * ENTRY_SIZE
}

fn read_entry(file: &File, index: u32) -> Result<(Rid, u32)> {
    let mut buf = [0u8; ENTRY_SIZE as usize];
    file.read_exact_at(&mut buf, entry_offset(index))?;
    let rid = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let val = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    Ok((rid, val))
}

fn write_entry(file: &File, index: u32, rid: Rid, val: u32) -> Result<()> {
    let mut buf = [0u8; ENTRY_SIZE as usize];
    buf[0..8].copy_from_slice(&rid.to_le_bytes());
    buf[8..12].copy_from_slice(&val.to_le_bytes());
    file.write_all_at(&buf, entry_offset(index))?;
    Ok(())
}

impl Mhash {
    pub fn open(path: impl AsRef<std::path::Path>, flags: OpenFlags) -> Result<Self> {
        let meta = MhashMeta {
            header: Header { size: DEFAULT_SIZE, count: 0, search_dist: DEFAULT_SEARCH_DIST },
        };
        let lockable = Lockable::open(path, flags, meta)?;
        let mut mhash = Self { lockable };
        mhash.ensure_table_extent()?;
        Ok(mhash)
    }

    fn ensure_table_extent(&mut self) -> Result<()> {
        let needed = HEADER_SIZE + self.lockable.hooks.header.size as u64 * ENTRY_SIZE;
        let len = self.lockable.file().metadata()?.len();
        if len < needed {
            self.lockable.file_mut().set_len(needed)?;
        }
        Ok(())
    }

    fn require_read_lock(&self) {
        debug_assert_ne!(self.lockable.state(), LockState::Unlocked);
    }

    fn require_write_lock(&self) {
        debug_assert_eq!(self.lockable.state(), LockState::Exclusive);
    }

    pub fn count(&self) -> u32 {
        self.lockable.hooks.header.count
    }

    pub fn size(&self) -> u32 {
        self.lockable.hooks.header.size
    }

    pub fn search_dist(&self) -> u32 {
        self.lockable.hooks.header.search_dist
    }

    /// Inserts or updates `rid -> val` (locking). `val == 0` deletes the
    /// mapping if present.
    pub fn put(&mut self, rid: Rid, val: u32) -> Result<()> {
        self.lockable.lock(LockOp::Exclusive)?;
        let result = self.put_r(rid, val);
        self.lockable.lock(LockOp::Unlock)?;
        result
    }

    pub fn put_r(&mut self, rid: Rid, val: u32) -> Result<()> {
        self.require_write_lock();
        loop {
            match self.try_put(rid, val)? {
                Some(()) => return Ok(()),
                None => {
                    self.double()?;
                }
            }
        }
    }

    /// Attempts a single put without doubling; `Ok(None)` means the table
    /// needs to double and the caller should retry.
    fn try_put(&mut self, rid: Rid, val: u32) -> Result<Option<()>> {
        let size = self.lockable.hooks.header.size;
        let search_dist = self.lockable.hooks.header.search_dist;
        let home = home_slot(rid, size);
        let mut candidate: Option<u32> = None;

        for k in 0..search_dist {
            let index = home + k;
            if index >= size {
                break;
            }
            let (srid, sval) = read_entry(self.lockable.file(), index)?;
            if srid == rid && !(srid == 0 && sval == 0) {
                let delta = match (sval != 0, val != 0) {
                    (true, false) => {
                        write_entry(self.lockable.file(), index, 0, 0)?;
                        -1
                    }
                    (false, true) => {
                        write_entry(self.lockable.file(), index, rid, val)?;
                        1
                    }
                    _ => {
                        write_entry(self.lockable.file(), index, rid, val)?;
                        0
                    }
                };
                self.adjust_count(delta)?;
                return Ok(Some(()));
            }
            if srid == 0 && sval == 0 && candidate.is_none() {
                candidate = Some(index);
            }
        }

        if val == 0 {
            // Nothing to delete: the key was never present.
            return Ok(Some(()));
        }

        match candidate {
            Some(index) => {
                write_entry(self.lockable.file(), index, rid, val)?;
                self.adjust_count(1)?;
                Ok(Some(()))
            }
            None => {
                warn!("mhash home={home} overfull at search_dist={search_dist}, doubling");
                Ok(None)
            }
        }
    }

    fn adjust_count(&mut self, delta: i64) -> Result<()> {
        let count = self.lockable.hooks.header.count as i64 + delta;
        self.lockable.hooks.header.count = count.max(0) as u32;
        self.lockable.file_mut().write_all_at(&self.lockable.hooks.header.to_bytes(), 0)?;
        Ok(())
    }

    /// Looks up `rid` (locking). Absent keys yield `Ok(0)`.
    pub fn get(&self, rid: Rid) -> Result<u32> {
        self.require_read_lock();
        let size = self.lockable.hooks.header.size;
        let search_dist = self.lockable.hooks.header.search_dist;
        let home = home_slot(rid, size);
        for k in 0..search_dist {
            let index = home + k;
            if index >= size {
                break;
            }
            let (srid, sval) = read_entry(self.lockable.file(), index)?;
            if srid == rid && sval != 0 {
                return Ok(sval);
            }
            if srid == 0 && sval == 0 {
                // An empty slot this early in the probe chain means rid
                // was never inserted at this home (no tombstones exist in
                // this design: deletions fully clear the slot).
                return Ok(0);
            }
        }
        Ok(0)
    }

    /// Doubles the table, relocating any entry whose new home moved into
    /// the upper half (spec.md section 4.3 "Doubling").
    fn double(&mut self) -> Result<()> {
        self.require_write_lock();
        let old_size = self.lockable.hooks.header.size;
        let new_size = old_size * 2;
        let new_len = HEADER_SIZE + new_size as u64 * ENTRY_SIZE;
        self.lockable.file_mut().set_len(new_len)?;

        for i in 0..old_size {
            let (rid, val) = read_entry(self.lockable.file(), i)?;
            if rid == 0 && val == 0 {
                continue;
            }
            let new_home = home_slot(rid, new_size);
            if new_home != home_slot(rid, old_size) {
                write_entry(self.lockable.file(), old_size + i, rid, val)?;
                write_entry(self.lockable.file(), i, 0, 0)?;
            }
        }

        self.lockable.hooks.header.size = new_size;
        self.lockable.hooks.header.search_dist = old_size_search_dist_after_double(self.lockable.hooks.header.search_dist);
        self.lockable.file_mut().write_all_at(&self.lockable.hooks.header.to_bytes(), 0)?;
        debug!("mhash doubled {old_size} -> {new_size}");
        Ok(())
    }

    /// Scans the whole file sequentially, emitting every entry with a
    /// non-zero value.
    pub fn enumerate(&self) -> Result<Vec<(Rid, u32)>> {
        self.require_read_lock();
        let size = self.lockable.hooks.header.size;
        let mut out = Vec::new();
        for i in 0..size {
            let (rid, val) = read_entry(self.lockable.file(), i)?;
            if val != 0 {
                out.push((rid, val));
            }
        }
        Ok(out)
    }

    pub fn lock(&mut self, op: LockOp) -> Result<()> {
        self.lockable.lock(op).map_err(Error::from)
    }
}

fn old_size_search_dist_after_double(search_dist: u32) -> u32 {
    search_dist * 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_rw(path: &std::path::Path) -> Mhash {
        Mhash::open(path, OpenFlags { read_write: true, create: true, truncate: true }).unwrap()
    }

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open_rw(&dir.path().join("m.bin"));
        m.lock(LockOp::Exclusive).unwrap();
        m.put_r(0x1000, 42).unwrap();
        assert_eq!(m.get(0x1000).unwrap(), 42);
        assert_eq!(m.get(0x2000).unwrap(), 0);
        assert_eq!(m.count(), 1);
        m.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn delete_via_zero_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open_rw(&dir.path().join("m.bin"));
        m.lock(LockOp::Exclusive).unwrap();
        m.put_r(0x1000, 42).unwrap();
        m.put_r(0x1000, 0).unwrap();
        assert_eq!(m.get(0x1000).unwrap(), 0);
        assert_eq!(m.count(), 0);
        m.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn doubling_preserves_all_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open_rw(&dir.path().join("m.bin"));
        m.lock(LockOp::Exclusive).unwrap();
        for k in 0..2000u64 {
            let rid = k << 10;
            m.put_r(rid, (k + 1) as u32).unwrap();
        }
        assert_eq!(m.count(), 2000);
        for k in 0..2000u64 {
            let rid = k << 10;
            assert_eq!(m.get(rid).unwrap(), (k + 1) as u32);
        }
        assert!(m.size() >= 2000);
        m.lock(LockOp::Unlock).unwrap();
    }
}
