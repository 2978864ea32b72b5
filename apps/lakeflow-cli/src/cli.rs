use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lakeflow", about = "Chunked uploads and resumable downloads", version)]
pub struct Args {
    /// Root directory of the local store
    #[arg(short, long, env = "LAKEFLOW_ROOT", default_value = ".")]
    pub root: PathBuf,
    /// Transfer configuration file (JSON)
    #[arg(short, long, env = "LAKEFLOW_CONFIG")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload a local file to an object path
    Upload {
        /// Local source file
        source: PathBuf,
        /// Destination object path, relative to the store root
        object: String,
        /// Block size in bytes (default: chosen from the file size)
        #[arg(short, long)]
        block_size: Option<u64>,
        /// Appends allowed in flight
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// Replace an existing object
        #[arg(long)]
        overwrite: bool,
    },
    /// Download an object, or a byte range of it, to a local file
    Download {
        /// Source object path
        object: String,
        /// Local destination file
        dest: PathBuf,
        /// First byte to read
        #[arg(long, requires = "length")]
        offset: Option<u64>,
        /// Bytes to read (default: to the end)
        #[arg(long)]
        length: Option<u64>,
        /// Check the MD5 of a whole-object download
        #[arg(long)]
        verify: bool,
        /// Resumptions allowed after a dropped stream
        #[arg(long)]
        retries: Option<u32>,
        /// Replace an existing destination file
        #[arg(long)]
        overwrite: bool,
    },
    /// Write an object to stdout
    Cat {
        object: String,
    },
    /// Print the effective transfer configuration
    Config,
}
