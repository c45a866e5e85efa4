//! Subcommand dispatch for `rhash-store`: open a list/mhash/rhash file by
//! path and run one maintenance operation against it. `main.rs` only
//! builds the [`clap::ArgMatches`] and calls [`dispatch`].

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use log::info;

use lockable::{LockOp, OpenFlags};
use storage_core::list::List;
use storage_core::mhash::Mhash;
use storage_core::rhash::{Resource, RhashHandle};

fn parse_num(s: &str) -> Result<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => Ok(u64::from_str_radix(hex, 16)?),
        None => Ok(s.parse()?),
    }
}

fn open_flags() -> OpenFlags {
    OpenFlags { read_write: true, create: true, truncate: false }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn dispatch(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("list", sub)) => dispatch_list(sub),
        Some(("mhash", sub)) => dispatch_mhash(sub),
        Some(("rhash", sub)) => dispatch_rhash(sub),
        _ => bail!("no subcommand given, see --help"),
    }
}

fn dispatch_list(sub: &ArgMatches) -> Result<()> {
    let path = PathBuf::from(sub.get_one::<String>("path").unwrap());
    let width: usize = *sub.get_one("width").unwrap();
    let mut list = List::open(&path, width, open_flags()).context("opening list")?;

    match sub.subcommand() {
        Some(("dump", _)) => {
            list.lock(LockOp::Shared)?;
            list.rewind();
            let mut buf = vec![0u8; width];
            let mut n = 0u64;
            while list.next_value(&mut buf)? {
                println!("{n}: {}", hex(&buf));
                n += 1;
            }
            list.lock(LockOp::Unlock)?;
            info!("dumped {n} records from {}", path.display());
        }
        Some(("sort", _)) => {
            list.sort(|a, b| a.cmp(b))?;
            info!("sorted {} records in {}", list.length(), path.display());
        }
        _ => bail!("list requires a subcommand (dump, sort)"),
    }
    Ok(())
}

fn dispatch_mhash(sub: &ArgMatches) -> Result<()> {
    let path = PathBuf::from(sub.get_one::<String>("path").unwrap());
    let mut m = Mhash::open(&path, open_flags()).context("opening mhash")?;

    match sub.subcommand() {
        Some(("dump", _)) => {
            m.lock(LockOp::Shared)?;
            let entries = m.enumerate()?;
            m.lock(LockOp::Unlock)?;
            for (rid, val) in &entries {
                println!("{rid:#x} -> {val}");
            }
            info!("dumped {} entries from {}", entries.len(), path.display());
        }
        Some(("get", args)) => {
            let rid = parse_num(args.get_one::<String>("rid").unwrap())?;
            m.lock(LockOp::Shared)?;
            let val = m.get(rid)?;
            m.lock(LockOp::Unlock)?;
            println!("{val}");
        }
        Some(("put", args)) => {
            let rid = parse_num(args.get_one::<String>("rid").unwrap())?;
            let val = *args.get_one::<u32>("val").unwrap();
            m.put(rid, val)?;
            info!("mhash put {rid:#x} -> {val} in {}", path.display());
        }
        _ => bail!("mhash requires a subcommand (dump, get, put)"),
    }
    Ok(())
}

fn dispatch_rhash(sub: &ArgMatches) -> Result<()> {
    let dir = PathBuf::from(sub.get_one::<String>("dir").unwrap());
    let mut rh = RhashHandle::open(&dir, open_flags()).context("opening rhash")?;

    match sub.subcommand() {
        Some(("get", args)) => {
            let rid = parse_num(args.get_one::<String>("rid").unwrap())?;
            let res = rh.get(rid)?;
            println!("{:#x}\t{:#x}\t{}", res.rid, res.attr, res.lex);
        }
        Some(("put", args)) => {
            let rid = parse_num(args.get_one::<String>("rid").unwrap())?;
            let attr = parse_num(args.get_one::<String>("attr").unwrap())?;
            let lex = args.get_one::<String>("lex").unwrap().clone();
            rh.put(&Resource { rid, attr, lex })?;
            info!("rhash put {rid:#x} in {}", dir.display());
        }
        _ => bail!("rhash requires a subcommand (get, put)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_num_accepts_hex_and_decimal() {
        assert_eq!(parse_num("0x2a").unwrap(), 42);
        assert_eq!(parse_num("42").unwrap(), 42);
    }

    #[test]
    fn parse_num_rejects_garbage() {
        assert!(parse_num("not-a-number").is_err());
    }
}
