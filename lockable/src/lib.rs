//! Generic file substrate: advisory locking, mtime-gated metadata reload,
//! and crash-safe flush semantics, shared by `list`, `mhash` and `rhash`.
//!
//! A [`Lockable<H>`] owns exactly one [`File`] plus whatever cached,
//! in-memory state a caller's [`MetadataHooks`] implementation derives from
//! its contents. Locking is purely advisory (`flock(2)`) and coordinates
//! cooperating processes; it does nothing to stop an uncooperative one.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, warn};
use nix::fcntl::{flock, FlockArg};

mod mtime;
pub use mtime::Mtime;

/// Error kinds surfaced by the lockable substrate (spec.md section 7).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot {0} without first unlocking")]
    BadLockTransition(&'static str),
    #[error("lock already held at this level")]
    DoubleLock,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which lock level an operation requires or releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Shared,
    Exclusive,
    Unlock,
}

/// Process-local advisory lock state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Shared,
    Exclusive,
}

/// Open-time behavior, passed straight through from the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read_write: bool,
    pub create: bool,
    pub truncate: bool,
}

/// The two callback hooks a concrete file type installs: "reload my cached
/// state from the file" and "write my cached state into the file". Called
/// when a lock is acquired on a file modified by another holder, or
/// released after exclusive use, respectively.
pub trait MetadataHooks {
    fn read_metadata(&mut self, file: &File) -> Result<()>;
    fn write_metadata(&mut self, file: &mut File) -> Result<()>;
}

/// A locked, mtime-gated file handle.
pub struct Lockable<H: MetadataHooks> {
    file: File,
    path: PathBuf,
    state: LockState,
    mtime: Mtime,
    pub hooks: H,
}

impl<H: MetadataHooks> Lockable<H> {
    /// Opens `path` under `flags` and runs the init sequence from spec.md
    /// section 4.1, leaving the handle `Unlocked`.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags, hooks: H) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(flags.read_write)
            .create(flags.create)
            .truncate(flags.truncate)
            .open(&path)?;
        let mut handle = Self {
            file,
            path,
            state: LockState::Unlocked,
            mtime: Mtime::ZERO,
            hooks,
        };
        handle.init(flags.truncate)?;
        Ok(handle)
    }

    fn init(&mut self, truncated: bool) -> Result<()> {
        if truncated {
            self.lock(LockOp::Exclusive)?;
            self.hooks.write_metadata(&mut self.file)?;
            self.file.sync_all()?;
            self.lock(LockOp::Unlock)?;
            self.lock(LockOp::Shared)?;
            self.hooks.read_metadata(&self.file)?;
            self.mtime = Mtime::of(&self.file)?;
            self.lock(LockOp::Unlock)?;
            return Ok(());
        }

        self.lock(LockOp::Shared)?;
        if self.file.metadata()?.len() == 0 {
            self.lock(LockOp::Unlock)?;
            self.lock(LockOp::Exclusive)?;
            if self.file.metadata()?.len() == 0 {
                self.hooks.write_metadata(&mut self.file)?;
                self.file.sync_all()?;
            }
            self.lock(LockOp::Unlock)?;
            self.lock(LockOp::Shared)?;
        }
        self.hooks.read_metadata(&self.file)?;
        self.mtime = Mtime::of(&self.file)?;
        self.lock(LockOp::Unlock)?;
        Ok(())
    }

    /// Acquires or releases a lock, enforcing the transition contracts from
    /// spec.md section 4.1.
    pub fn lock(&mut self, op: LockOp) -> Result<()> {
        match (self.state, op) {
            (LockState::Shared, LockOp::Exclusive) => {
                return Err(Error::BadLockTransition("upgrade shared to exclusive"))
            }
            (LockState::Exclusive, LockOp::Shared) => {
                return Err(Error::BadLockTransition("downgrade exclusive to shared"))
            }
            (LockState::Shared, LockOp::Shared) | (LockState::Exclusive, LockOp::Exclusive) => {
                return Err(Error::DoubleLock)
            }
            _ => {}
        }

        match op {
            LockOp::Shared => {
                flock(self.file.as_raw_fd(), FlockArg::LockShared)?;
                self.state = LockState::Shared;
                self.reload_if_stale()?;
            }
            LockOp::Exclusive => {
                flock(self.file.as_raw_fd(), FlockArg::LockExclusive)?;
                self.state = LockState::Exclusive;
                self.reload_if_stale()?;
            }
            LockOp::Unlock => {
                if self.state == LockState::Exclusive {
                    self.hooks.write_metadata(&mut self.file)?;
                    self.file.sync_all()?;
                    self.mtime = Mtime::of(&self.file)?;
                }
                flock(self.file.as_raw_fd(), FlockArg::Unlock)?;
                self.state = LockState::Unlocked;
            }
        }
        Ok(())
    }

    /// Returns whether the handle currently holds `op`.
    pub fn test(&self, op: LockOp) -> bool {
        match op {
            LockOp::Shared => self.state == LockState::Shared,
            LockOp::Exclusive => self.state == LockState::Exclusive,
            LockOp::Unlock => self.state == LockState::Unlocked,
        }
    }

    fn reload_if_stale(&mut self) -> Result<()> {
        let current = Mtime::of(&self.file)?;
        if current > self.mtime {
            debug!("{:?}: mtime advanced, reloading cached metadata", self.path);
            self.hooks.read_metadata(&self.file)?;
            self.mtime = current;
        }
        Ok(())
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Best-effort mtime snapshot, used by callers that poll without
    /// holding a lock (e.g. the prefix-list decorator).
    pub fn mtime_hint(&self) -> SystemTime {
        self.mtime.into()
    }
}

impl<H: MetadataHooks> Drop for Lockable<H> {
    fn drop(&mut self) {
        if self.state != LockState::Unlocked {
            if let Err(e) = self.lock(LockOp::Unlock) {
                warn!("failed to release lock on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Default)]
    struct CountingHooks {
        reads: u32,
        writes: u32,
    }

    impl MetadataHooks for CountingHooks {
        fn read_metadata(&mut self, _file: &File) -> Result<()> {
            self.reads += 1;
            Ok(())
        }

        fn write_metadata(&mut self, file: &mut File) -> Result<()> {
            self.writes += 1;
            file.write_all(b"HDR0")?;
            Ok(())
        }
    }

    #[test]
    fn init_writes_header_once_on_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let handle: Lockable<CountingHooks> =
            Lockable::open(&path, OpenFlags { read_write: true, create: true, truncate: false }, CountingHooks::default())
                .unwrap();
        assert_eq!(handle.hooks.writes, 1);
        assert_eq!(handle.hooks.reads, 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"HDR0");
    }

    #[test]
    fn double_lock_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut handle: Lockable<CountingHooks> =
            Lockable::open(&path, OpenFlags { read_write: true, create: true, truncate: false }, CountingHooks::default())
                .unwrap();
        handle.lock(LockOp::Shared).unwrap();
        assert!(matches!(handle.lock(LockOp::Shared), Err(Error::DoubleLock)));
        handle.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn upgrade_without_unlock_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut handle: Lockable<CountingHooks> =
            Lockable::open(&path, OpenFlags { read_write: true, create: true, truncate: false }, CountingHooks::default())
                .unwrap();
        handle.lock(LockOp::Shared).unwrap();
        assert!(matches!(
            handle.lock(LockOp::Exclusive),
            Err(Error::BadLockTransition(_))
        ));
        handle.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn exclusive_release_persists_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut handle: Lockable<CountingHooks> =
            Lockable::open(&path, OpenFlags { read_write: true, create: true, truncate: false }, CountingHooks::default())
                .unwrap();
        handle.lock(LockOp::Exclusive).unwrap();
        handle.lock(LockOp::Unlock).unwrap();
        assert_eq!(handle.hooks.writes, 2);
    }
}
