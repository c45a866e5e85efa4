use std::fs::File;
use std::time::SystemTime;

use crate::Result;

/// Seconds + nanoseconds since the epoch, the resolution spec.md's mtime
/// gate is defined over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mtime {
    sec: i64,
    nsec: i64,
}

impl Mtime {
    pub const ZERO: Mtime = Mtime { sec: 0, nsec: 0 };

    pub fn of(file: &File) -> Result<Mtime> {
        let modified = file.metadata()?.modified()?;
        Ok(Mtime::from(modified))
    }
}

impl From<SystemTime> for Mtime {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Mtime { sec: d.as_secs() as i64, nsec: d.subsec_nanos() as i64 },
            Err(e) => {
                let d = e.duration();
                Mtime { sec: -(d.as_secs() as i64), nsec: -(d.subsec_nanos() as i64) }
            }
        }
    }
}

impl From<Mtime> for SystemTime {
    fn from(m: Mtime) -> Self {
        if m.sec >= 0 {
            SystemTime::UNIX_EPOCH + std::time::Duration::new(m.sec as u64, m.nsec as u32)
        } else {
            SystemTime::UNIX_EPOCH - std::time::Duration::new((-m.sec) as u64, (-m.nsec) as u32)
        }
    }
}
