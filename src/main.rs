use std::env::set_var;

use clap::{arg, command, ArgAction, Command};
use log::*;

fn main() -> anyhow::Result<()> {
    let matches = command!()
        .arg(
            arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
                .action(ArgAction::SetTrue)
                .required(false),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("list")
                .about("Inspect or sort an append-only list file")
                .arg(arg!(<path> "Path to the list file"))
                .arg(arg!(<width> "Record width in bytes").value_parser(clap::value_parser!(usize)))
                .subcommand_required(true)
                .subcommand(Command::new("dump").about("Print every record as hex"))
                .subcommand(Command::new("sort").about("Sort the whole list in place by byte order")),
        )
        .subcommand(
            Command::new("mhash")
                .about("Inspect or edit a model-hash file")
                .arg(arg!(<path> "Path to the mhash file"))
                .subcommand_required(true)
                .subcommand(Command::new("dump").about("Print every non-empty rid -> val mapping"))
                .subcommand(Command::new("get").arg(arg!(<rid> "RID, hex (0x..) or decimal")))
                .subcommand(
                    Command::new("put")
                        .arg(arg!(<rid> "RID, hex (0x..) or decimal"))
                        .arg(arg!(<val> "u32 value; 0 deletes").value_parser(clap::value_parser!(u32))),
                ),
        )
        .subcommand(
            Command::new("rhash")
                .about("Inspect or edit a resource-hash directory")
                .arg(arg!(<dir> "Directory holding rhash.tab / rhash.lex / rhash.prefix"))
                .subcommand_required(true)
                .subcommand(Command::new("get").arg(arg!(<rid> "RID, hex (0x..) or decimal")))
                .subcommand(
                    Command::new("put")
                        .arg(arg!(<rid> "RID, hex (0x..) or decimal"))
                        .arg(arg!(<attr> "attr tag, hex (0x..) or decimal"))
                        .arg(arg!(<lex> "lexical form")),
                ),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    match rhash_store::cli::dispatch(&matches) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{e:#}");
            Err(e)
        }
    }
}
