//! A buffered, file-backed sequence of fixed-width records with an
//! external chunked sort and a sorted-unique streaming merge (spec.md
//! section 4.2). Used standalone and as the backing store for the
//! resource hash's prefix dictionary.

use std::cmp::Ordering;
use std::fs::File;
use std::os::unix::fs::FileExt;

use log::{debug, warn};
use memmap2::{Mmap, MmapMut};

use lockable::{Lockable, LockOp, LockState, MetadataHooks, OpenFlags};

use crate::error::{Error, Result};

/// Aligned window of a list file, the unit of external sort (512 MiB).
pub const CHUNK_SIZE: u64 = 512 * 1024 * 1024;

/// Append records are buffered this many at a time before a flush.
const BUFFER_RECORDS: usize = 256;

/// Sortedness of a list file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Unsorted,
    ChunkSorted,
    Sorted,
}

type Comparator = Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

struct ListMeta {
    width: u64,
    offset: u64,
}

impl MetadataHooks for ListMeta {
    fn read_metadata(&mut self, file: &File) -> lockable::Result<()> {
        let len = file.metadata()?.len();
        self.offset = len / self.width;
        Ok(())
    }

    fn write_metadata(&mut self, _file: &mut File) -> lockable::Result<()> {
        // Raw concatenation of fixed-width records, no header to persist.
        Ok(())
    }
}

struct ChunkCursor {
    pos: u64,
    end: u64,
}

struct MergeState {
    mmap: Mmap,
    cursors: Vec<ChunkCursor>,
    last: Vec<u8>,
}

pub struct List {
    lockable: Lockable<ListMeta>,
    width: usize,
    buffer: Vec<u8>,
    buffer_pos: usize,
    state: ListState,
    read_cursor: u64,
    sort_cmp: Option<Comparator>,
    merge: Option<MergeState>,
    merge_fallback: bool,
    chunk_size: u64,
}

impl List {
    /// Opens or creates `path` as a list of fixed-width `width`-byte
    /// records. Fails if `width` does not divide [`CHUNK_SIZE`].
    pub fn open(path: impl AsRef<std::path::Path>, width: usize, flags: OpenFlags) -> Result<Self> {
        if width == 0 || CHUNK_SIZE % width as u64 != 0 {
            return Err(Error::CorruptHeader(format!(
                "list width {width} does not divide chunk size {CHUNK_SIZE}"
            )));
        }
        let lockable = Lockable::open(path, flags, ListMeta { width: width as u64, offset: 0 })?;
        Ok(Self {
            lockable,
            width,
            buffer: Vec::with_capacity(width * BUFFER_RECORDS),
            buffer_pos: 0,
            state: ListState::Unsorted,
            read_cursor: 0,
            sort_cmp: None,
            merge: None,
            merge_fallback: false,
            chunk_size: CHUNK_SIZE,
        })
    }

    /// Overrides the external-sort chunk size. Only meant for tests that
    /// need to exercise the multi-chunk merge path without allocating a
    /// full [`CHUNK_SIZE`] per chunk; `bytes` must still divide `width`.
    #[doc(hidden)]
    pub fn set_chunk_size_for_test(&mut self, bytes: u64) {
        assert_eq!(bytes % self.width as u64, 0, "chunk size must divide record width");
        self.chunk_size = bytes;
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    fn on_disk_offset(&self) -> u64 {
        self.lockable.hooks.offset
    }

    /// Total record count: on-disk plus buffered-but-not-flushed.
    pub fn length(&self) -> u64 {
        self.on_disk_offset() + self.buffer_pos as u64
    }

    fn require_read_lock(&self) {
        debug_assert_ne!(
            self.lockable.state(),
            LockState::Unlocked,
            "list read operation requires a shared or exclusive lock"
        );
    }

    fn require_write_lock(&self) {
        debug_assert_eq!(
            self.lockable.state(),
            LockState::Exclusive,
            "list write operation requires an exclusive lock"
        );
    }

    /// Acquires or releases the backing file's lock directly. Exposed so
    /// composite callers (the resource hash's prefix dictionary) can hold
    /// the lock across several `_r` operations.
    pub fn lock(&mut self, op: LockOp) -> Result<()> {
        self.lockable.lock(op).map_err(Error::from)
    }

    /// Appends `rec` (locking). Returns the assigned logical index.
    pub fn add(&mut self, rec: &[u8]) -> Result<u64> {
        self.lockable.lock(LockOp::Exclusive)?;
        let result = self.add_r(rec);
        self.lockable.lock(LockOp::Unlock)?;
        result
    }

    /// Appends `rec`; caller must already hold the exclusive lock.
    pub fn add_r(&mut self, rec: &[u8]) -> Result<u64> {
        self.require_write_lock();
        assert_eq!(rec.len(), self.width, "record width mismatch");
        let index = self.on_disk_offset() + self.buffer_pos as u64;
        self.buffer.extend_from_slice(rec);
        self.buffer_pos += 1;
        if self.buffer_pos >= BUFFER_RECORDS {
            self.flush_r()?;
        }
        Ok(index)
    }

    /// Flushes buffered appends to disk (locking).
    pub fn flush(&mut self) -> Result<()> {
        self.lockable.lock(LockOp::Exclusive)?;
        let result = self.flush_r();
        self.lockable.lock(LockOp::Unlock)?;
        result
    }

    fn flush_r(&mut self) -> Result<()> {
        self.require_write_lock();
        if self.buffer_pos > 0 {
            let offset = self.on_disk_offset();
            self.lockable
                .file_mut()
                .write_all_at(&self.buffer[..self.buffer_pos * self.width], offset * self.width as u64)?;
        }
        let len = self.lockable.file().metadata()?.len();
        self.lockable.hooks.offset = len / self.width as u64;
        self.buffer.clear();
        self.buffer_pos = 0;
        Ok(())
    }

    /// Random read; serves from the append buffer if `i` is past the
    /// on-disk offset. Requires the caller to hold a shared or exclusive
    /// lock.
    pub fn get(&self, i: u64, out: &mut [u8]) -> Result<()> {
        self.require_read_lock();
        assert_eq!(out.len(), self.width);
        let on_disk = self.on_disk_offset();
        if i >= on_disk + self.buffer_pos as u64 {
            return Err(Error::NotFound);
        }
        if i >= on_disk {
            let start = (i - on_disk) as usize * self.width;
            out.copy_from_slice(&self.buffer[start..start + self.width]);
        } else {
            self.lockable.file().read_exact_at(out, i * self.width as u64)?;
        }
        Ok(())
    }

    /// Resets the sequential read cursor to the start of the file.
    pub fn rewind(&mut self) {
        self.read_cursor = 0;
    }

    /// Reads the next record sequentially from disk. Returns `Ok(false)`
    /// at a clean end-of-file, `Err` on a short/partial read (spec.md
    /// section 9's open question on distinguishing the two).
    pub fn next_value(&mut self, out: &mut [u8]) -> Result<bool> {
        self.require_read_lock();
        assert_eq!(out.len(), self.width);
        if self.read_cursor >= self.on_disk_offset() {
            return Ok(false);
        }
        match self.lockable.file().read_exact_at(out, self.read_cursor * self.width as u64) {
            Ok(()) => {
                self.read_cursor += 1;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Resets the list to empty (locking).
    pub fn truncate(&mut self) -> Result<()> {
        self.lockable.lock(LockOp::Exclusive)?;
        let result = self.truncate_r();
        self.lockable.lock(LockOp::Unlock)?;
        result
    }

    fn truncate_r(&mut self) -> Result<()> {
        self.require_write_lock();
        self.lockable.file_mut().set_len(0)?;
        self.lockable.hooks.offset = 0;
        self.buffer.clear();
        self.buffer_pos = 0;
        self.read_cursor = 0;
        self.state = ListState::Unsorted;
        self.merge = None;
        self.merge_fallback = false;
        Ok(())
    }

    /// Flushes, then sorts the whole file in place via a read-write
    /// mapping (locking).
    pub fn sort(&mut self, cmp: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static) -> Result<()> {
        self.lockable.lock(LockOp::Exclusive)?;
        let result = self.sort_with(Box::new(cmp), false);
        self.lockable.lock(LockOp::Unlock)?;
        result
    }

    /// Flushes, then sorts each [`CHUNK_SIZE`] window independently
    /// (locking).
    pub fn sort_chunked(&mut self, cmp: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static) -> Result<()> {
        self.lockable.lock(LockOp::Exclusive)?;
        let result = self.sort_with(Box::new(cmp), true);
        self.lockable.lock(LockOp::Unlock)?;
        result
    }

    fn sort_with(&mut self, cmp: Comparator, chunked: bool) -> Result<()> {
        self.require_write_lock();
        self.flush_r()?;
        let total = self.on_disk_offset() * self.width as u64;
        let num_chunks = if chunked {
            total.div_ceil(self.chunk_size).max(1)
        } else {
            1
        };
        if total > 0 {
            let mut mmap = unsafe { MmapMut::map_mut(self.lockable.file())? };
            let chunk_bytes = if chunked { self.chunk_size } else { total };
            for c in 0..num_chunks {
                let start = (c * chunk_bytes) as usize;
                let end = (((c + 1) * chunk_bytes).min(total)) as usize;
                sort_region(&mut mmap[start..end], self.width, cmp.as_ref());
            }
            mmap.flush()?;
        }
        self.state = if num_chunks <= 1 { ListState::Sorted } else { ListState::ChunkSorted };
        self.sort_cmp = Some(cmp);
        self.merge = None;
        self.merge_fallback = false;
        Ok(())
    }

    /// Multi-way merge of the chunks produced by `sort`/`sort_chunked`,
    /// deduplicating bytewise-equal adjacent records. Falls back to
    /// [`List::next_value`] (with a one-time warning) when the list was
    /// never sorted.
    pub fn next_sort_uniqed(&mut self, out: &mut [u8]) -> Result<bool> {
        self.require_read_lock();
        assert_eq!(out.len(), self.width);

        if self.state == ListState::Unsorted {
            if !self.merge_fallback {
                warn!("next_sort_uniqed called on an unsorted list, falling back to next_value");
                self.merge_fallback = true;
            }
            return self.next_value(out);
        }

        if self.on_disk_offset() == 0 {
            return Ok(false);
        }

        if self.merge.is_none() {
            self.init_merge()?;
        }

        fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
        let cmp: &dyn Fn(&[u8], &[u8]) -> Ordering = match self.sort_cmp.as_ref() {
            Some(c) => c.as_ref(),
            // The comparator is only known within the process that called
            // sort()/sort_chunked(); a list resumed from a prior sort with
            // no comparator in hand falls back to byte order.
            None => &bytewise,
        };

        loop {
            let width = self.width;
            let merge = self.merge.as_mut().expect("merge initialized above");

            let mut best: Option<usize> = None;
            for (ci, cursor) in merge.cursors.iter().enumerate() {
                if cursor.pos >= cursor.end {
                    continue;
                }
                let rec = &merge.mmap[cursor.pos as usize..cursor.pos as usize + width];
                best = Some(match best {
                    None => ci,
                    Some(bi) => {
                        let bpos = merge.cursors[bi].pos as usize;
                        let brec = &merge.mmap[bpos..bpos + width];
                        if cmp(rec, brec) == Ordering::Less {
                            ci
                        } else {
                            bi
                        }
                    }
                });
            }
            let Some(bi) = best else {
                self.merge = None;
                return Ok(false);
            };
            let pos = merge.cursors[bi].pos as usize;
            out.copy_from_slice(&merge.mmap[pos..pos + width]);
            merge.cursors[bi].pos += width as u64;

            if merge.last.as_slice() == &out[..] {
                continue;
            }
            merge.last.copy_from_slice(out);
            return Ok(true);
        }
    }

    fn init_merge(&mut self) -> Result<()> {
        let total = self.on_disk_offset() * self.width as u64;
        let mmap = unsafe { Mmap::map(self.lockable.file())? };
        let num_chunks = if self.state == ListState::ChunkSorted {
            total.div_ceil(self.chunk_size).max(1)
        } else {
            1
        };
        let chunk_bytes = if self.state == ListState::ChunkSorted { self.chunk_size } else { total };
        let cursors = (0..num_chunks)
            .map(|c| ChunkCursor {
                pos: c * chunk_bytes,
                end: ((c + 1) * chunk_bytes).min(total),
            })
            .collect();
        self.merge = Some(MergeState { mmap, cursors, last: vec![0u8; self.width] });
        Ok(())
    }

    /// Removes the backing file entirely.
    pub fn unlink(self) -> Result<()> {
        let path = self.lockable.path().to_path_buf();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}

/// Sorts `region` (an integral number of `width`-byte records) in place
/// using `cmp`, by sorting a small index array and then gathering the
/// permuted records into a scratch buffer the size of the region, which
/// is copied back. This keeps peak extra memory at one chunk (never the
/// whole file) while staying simple and provably correct.
fn sort_region(region: &mut [u8], width: usize, cmp: &dyn Fn(&[u8], &[u8]) -> Ordering) {
    let n = region.len() / width;
    if n <= 1 {
        return;
    }
    let mut idx: Vec<u32> = (0..n as u32).collect();
    idx.sort_by(|&a, &b| {
        let ar = &region[a as usize * width..a as usize * width + width];
        let br = &region[b as usize * width..b as usize * width + width];
        cmp(ar, br)
    });
    let mut out = vec![0u8; region.len()];
    for (new_pos, &old_idx) in idx.iter().enumerate() {
        let old = old_idx as usize * width;
        out[new_pos * width..new_pos * width + width].copy_from_slice(&region[old..old + width]);
    }
    region.copy_from_slice(&out);
    debug!("sorted region of {n} records ({width} bytes each)");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_rw(path: &std::path::Path, width: usize) -> List {
        List::open(path, width, OpenFlags { read_write: true, create: true, truncate: true }).unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = open_rw(&dir.path().join("l.bin"), 32);
        list.lockable.lock(LockOp::Exclusive).unwrap();
        for i in 0..100u64 {
            let rec = [i.to_le_bytes(); 4].concat();
            let idx = list.add_r(&rec).unwrap();
            assert_eq!(idx, i);
        }
        list.flush_r().unwrap();
        assert_eq!(list.length(), 100);
        let mut out = vec![0u8; 32];
        for i in 0..100u64 {
            list.get(i, &mut out).unwrap();
            assert_eq!(&out[0..8], &i.to_le_bytes());
        }
        list.lockable.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn sort_chunked_then_merge_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = open_rw(&dir.path().join("l.bin"), 8);
        list.lockable.lock(LockOp::Exclusive).unwrap();
        for v in [3u64, 1, 2, 2, 3, 1, 5] {
            list.add_r(&v.to_le_bytes()).unwrap();
        }
        list.sort_with(Box::new(|a: &[u8], b: &[u8]| a.cmp(b)), true).unwrap();
        let mut seen = vec![];
        let mut out = [0u8; 8];
        while list.next_sort_uniqed(&mut out).unwrap() {
            seen.push(u64::from_le_bytes(out));
        }
        assert_eq!(seen, vec![1, 2, 3, 5]);
        list.lockable.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn truncate_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = open_rw(&dir.path().join("l.bin"), 8);
        list.lockable.lock(LockOp::Exclusive).unwrap();
        list.add_r(&1u64.to_le_bytes()).unwrap();
        list.truncate_r().unwrap();
        assert_eq!(list.length(), 0);
        assert_eq!(list.state(), ListState::Unsorted);
        list.lockable.lock(LockOp::Unlock).unwrap();
    }
}
