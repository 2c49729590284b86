//! Command-line definition for `tdbtool`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Inspect and modify TDB database files.
#[derive(Debug, Parser)]
#[command(name = "tdbtool", version, about)]
pub struct Cli {
    /// Database file to operate on.
    pub file: PathBuf,

    /// Create new databases in the legacy version-1 format.
    #[arg(long)]
    pub tdb1: bool,

    /// Use pread/pwrite instead of mmap.
    #[arg(long)]
    pub no_mmap: bool,

    /// Skip all fcntl locking (single-process use only).
    #[arg(long)]
    pub no_lock: bool,

    /// Skip fsync; faster, loses crash durability.
    #[arg(long)]
    pub no_sync: bool,

    /// Bucket count for newly created version-1 databases.
    #[arg(long, value_name = "N")]
    pub hash_size: Option<u32>,

    #[command(subcommand)]
    pub cmd: Command,
}

/// Store disposition on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliStoreMode {
    Insert,
    Replace,
    Modify,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create an empty database (fails if the file already exists).
    Create,
    /// Print every record in dump format.
    Dump,
    /// Print every key, one per line.
    Keys,
    /// Print the value stored under KEY.
    Fetch { key: String },
    /// Store VALUE under KEY.
    Store {
        key: String,
        value: String,
        #[arg(long, value_enum, default_value = "replace")]
        mode: CliStoreMode,
    },
    /// Delete KEY.
    Delete { key: String },
    /// Exit 0 if KEY exists, 1 otherwise.
    Exists { key: String },
    /// Verify the database structure.
    Check,
    /// Print statistics.
    Summary,
    /// Rewrite the database compactly.
    Repack,
    /// Delete every record.
    Wipe,
    /// Print the sequence number.
    Seqnum,
}
