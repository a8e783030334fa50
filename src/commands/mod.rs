//! Subcommand entry points for the `methq` binary.

use std::io::{BufWriter, Write};
use std::path::Path;

pub mod bins;
pub mod check;
pub mod compress;
pub mod config;
pub mod format;
pub mod index;
pub mod intervals;
pub mod merge;
pub mod server;

pub(crate) fn open_output(path: Option<&Path>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(std::fs::File::create(path)?)),
        None => Box::new(BufWriter::new(std::io::stdout())),
    })
}
