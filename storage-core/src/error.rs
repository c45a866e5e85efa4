//! Error kinds for the storage primitives (spec.md section 7).
//!
//! `TableOverfull` from the design is deliberately *not* a variant here:
//! spec.md calls it out as something that "internally triggers doubling,
//! not surfaced", so it never reaches callers. Both `rhash::try_put` and
//! `mhash::try_put` return `Result<Option<()>>`; `Ok(None)` is the private
//! overfull signal their `put_r` retry loops consume to call `double()`
//! and try again, with nothing crossing the public API.
//!
//! `TooLong` is kept as a variant per spec.md's advisory error list, but
//! never constructed: the resource hash's codec chain always has the
//! external file/zlib dispositions as a final fallback, so no lexical
//! ever actually fails to fit.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    #[error(transparent)]
    Lock(#[from] lockable::Error),

    #[error("rid not found in probe window")]
    NotFound,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("lexical too long to store inline")]
    TooLong,

    #[error("put({0:#x}) collides with an existing, different record")]
    Collision(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
