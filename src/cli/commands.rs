//! Dispatch from parsed arguments to database operations.

use anyhow::{bail, Context};

use tdb::{Attribute, Flags, OpenFlags, StoreMode, Tdb};

use crate::cli::args::{Cli, CliStoreMode, Command};

fn open_flags_for(cmd: &Command) -> OpenFlags {
    match cmd {
        Command::Create => OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL,
        Command::Dump | Command::Keys | Command::Fetch { .. } | Command::Exists { .. }
        | Command::Check | Command::Summary | Command::Seqnum => OpenFlags::RDONLY,
        _ => OpenFlags::RDWR | OpenFlags::CREAT,
    }
}

fn flags_for(cli: &Cli) -> Flags {
    let mut flags = Flags::SEQNUM;
    if cli.tdb1 {
        flags |= Flags::VERSION1;
    }
    if cli.no_mmap {
        flags |= Flags::NOMMAP;
    }
    if cli.no_lock {
        flags |= Flags::NOLOCK;
    }
    if cli.no_sync {
        flags |= Flags::NOSYNC;
    }
    flags
}

/// Render bytes the way tdb dumps have always looked: printable ASCII
/// stays, the rest becomes `\xx` hex escapes.
fn dump_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if (b' '..=b'~').contains(&b) && b != b'\\' && b != b'"' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{b:02x}"));
        }
    }
    out
}

/// Execute one command.  The process exit code is 0 on success, 1 on any
/// database error (clap itself exits 2 on usage errors).
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let mut attrs = Vec::new();
    if let Some(n) = cli.hash_size {
        attrs.push(Attribute::Tdb1Hashsize(n));
    }
    let mut db = Tdb::open(
        &cli.file,
        flags_for(&cli),
        open_flags_for(&cli.cmd),
        0o600,
        attrs,
    )
    .with_context(|| format!("cannot open {}", cli.file.display()))?;

    match cli.cmd {
        Command::Create => {
            println!("created {}", cli.file.display());
        }
        Command::Dump => {
            db.traverse(|_, k, v| {
                println!("{{");
                println!("key({}) = \"{}\"", k.len(), dump_escape(k));
                println!("data({}) = \"{}\"", v.len(), dump_escape(v));
                println!("}}");
                true
            })
            .context("traverse failed")?;
        }
        Command::Keys => {
            db.traverse(|_, k, _| {
                println!("\"{}\"", dump_escape(k));
                true
            })
            .context("traverse failed")?;
        }
        Command::Fetch { key } => {
            let val = db.fetch(key.as_bytes()).context("fetch failed")?;
            use std::io::Write;
            std::io::stdout().write_all(&val)?;
            println!();
        }
        Command::Store { key, value, mode } => {
            let mode = match mode {
                CliStoreMode::Insert => StoreMode::Insert,
                CliStoreMode::Replace => StoreMode::Replace,
                CliStoreMode::Modify => StoreMode::Modify,
            };
            db.store(key.as_bytes(), value.as_bytes(), mode)
                .context("store failed")?;
        }
        Command::Delete { key } => {
            db.delete(key.as_bytes()).context("delete failed")?;
        }
        Command::Exists { key } => {
            if !db.exists(key.as_bytes()) {
                bail!("key not found");
            }
        }
        Command::Check => {
            db.check(None).context("database is corrupt")?;
            println!("{} checks out", cli.file.display());
        }
        Command::Summary => {
            print!("{}", db.summary().context("summary failed")?);
        }
        Command::Repack => {
            db.repack().context("repack failed")?;
        }
        Command::Wipe => {
            db.wipe_all().context("wipe failed")?;
        }
        Command::Seqnum => {
            println!("{}", db.seqnum());
        }
    }
    Ok(())
}
