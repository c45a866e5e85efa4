//! Model-hash and resource-hash end-to-end scenarios driven through the
//! crate's public API (spec.md section 8, scenarios 3 through 6).

use lockable::OpenFlags;
use rhash_store::mhash::Mhash;
use rhash_store::rhash::{Resource, RhashHandle};

fn rw() -> OpenFlags {
    OpenFlags { read_write: true, create: true, truncate: true }
}

/// Scenario 3: enough distinct RIDs to force at least one doubling, all
/// mappings still resolve afterward.
#[test]
fn scenario_3_mhash_doubling_preserves_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Mhash::open(dir.path().join("m.bin"), rw()).unwrap();
    let initial_size = m.size();

    for k in 0..16384u64 {
        m.put(k << 10, (k + 1) as u32).unwrap();
    }
    assert!(m.size() > initial_size);
    assert_eq!(m.count(), 16384);
    for k in 0..16384u64 {
        assert_eq!(m.get(k << 10).unwrap(), (k + 1) as u32);
    }
}

/// Scenario 4: short lexicals stay inline.
#[test]
fn scenario_4_rhash_inline_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut rh = RhashHandle::open(dir.path(), rw()).unwrap();
    let res = Resource { rid: 1, attr: 2, lex: "hello".to_string() };
    rh.put(&res).unwrap();
    assert_eq!(rh.get(1).unwrap(), res);
}

/// Scenario 5: a long lexical with no shared prefix and no numeric/date
/// shape falls through to the zlib-compressed overflow disposition.
#[test]
fn scenario_5_rhash_zlib_overflow_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut rh = RhashHandle::open(dir.path(), rw()).unwrap();
    let lex = "the quick brown fox jumps over the lazy dog ".repeat(200);
    rh.put(&Resource { rid: 9, attr: 0, lex: lex.clone() }).unwrap();
    assert_eq!(rh.get(9).unwrap().lex, lex);
}

/// Scenario 6: a batch of resources sharing a long URI prefix eventually
/// triggers prefix learning, after which multi_put/multi_get (which sort
/// by home slot internally) both still round-trip correctly.
#[test]
fn scenario_6_rhash_prefix_learning_and_multi_ops() {
    let dir = tempfile::tempdir().unwrap();
    let mut rh = RhashHandle::open(dir.path(), rw()).unwrap();

    let resources: Vec<Resource> = (0..300u64)
        .map(|i| Resource { rid: 0x10000 + i, attr: 0, lex: format!("http://example.org/resource/{i}") })
        .collect();
    rh.multi_put(&resources).unwrap();

    let rids: Vec<u64> = resources.iter().map(|r| r.rid).collect();
    let got = rh.multi_get(&rids).unwrap();
    for (expected, actual) in resources.iter().zip(got) {
        assert_eq!(actual.unwrap().lex, expected.lex);
    }
}
