//! Cross-handle lock handoff: a second handle opened on the same file
//! after a first handle wrote and released its exclusive lock must see
//! the first handle's writes (spec.md section 4.1's mtime-gated reload).

use lockable::{LockOp, OpenFlags};
use rhash_store::mhash::Mhash;
use rhash_store::rhash::{Resource, RhashHandle};

fn existing() -> OpenFlags {
    OpenFlags { read_write: true, create: false, truncate: false }
}

#[test]
fn mhash_handoff_reloads_after_exclusive_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.bin");

    let mut writer =
        Mhash::open(&path, OpenFlags { read_write: true, create: true, truncate: true }).unwrap();
    writer.lock(LockOp::Exclusive).unwrap();
    writer.put_r(0xabc, 7).unwrap();
    writer.lock(LockOp::Unlock).unwrap();
    drop(writer);

    let mut reader = Mhash::open(&path, existing()).unwrap();
    reader.lock(LockOp::Shared).unwrap();
    assert_eq!(reader.get(0xabc).unwrap(), 7);
    reader.lock(LockOp::Unlock).unwrap();
}

#[test]
fn rhash_handoff_sees_writes_from_another_handle() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer =
        RhashHandle::open(dir.path(), OpenFlags { read_write: true, create: true, truncate: true }).unwrap();
    writer
        .put(&Resource { rid: 0x55, attr: 1, lex: "http://example.org/a".to_string() })
        .unwrap();
    drop(writer);

    let mut reader = RhashHandle::open(dir.path(), existing()).unwrap();
    let got = reader.get(0x55).unwrap();
    assert_eq!(got.lex, "http://example.org/a");
}
