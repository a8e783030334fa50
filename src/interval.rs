//! Genomic intervals and BED-style loading.

use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::index::CpgIndex;
use crate::{Error, Result};

/// A half-open genomic interval `[start, stop)` on one chromosome.
///
/// The chromosome is identified by its rank in the index's chromosome
/// order, so intervals are only meaningful relative to the index that
/// resolved them. Ordering is by `(ch_id, start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GenomicInterval {
    pub ch_id: i32,
    pub start: u32,
    pub stop: u32,
}

impl GenomicInterval {
    /// Load intervals from a three-column tabular file (chrom, start, stop),
    /// resolving chromosome names against `index`.
    pub fn load(index: &CpgIndex, path: &Path) -> Result<Vec<GenomicInterval>> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut intervals = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            intervals.push(parse_line(index, &line).map_err(|e| {
                Error::Parse(format!("{}:{}: {}", path.display(), lineno + 1, e))
            })?);
        }
        Ok(intervals)
    }
}

fn parse_line(index: &CpgIndex, line: &str) -> std::result::Result<GenomicInterval, String> {
    let mut fields = line.split_whitespace();
    let chrom = fields.next().ok_or("missing chromosome")?;
    let start: u32 = fields
        .next()
        .ok_or("missing start")?
        .parse()
        .map_err(|_| "bad start")?;
    let stop: u32 = fields
        .next()
        .ok_or("missing stop")?
        .parse()
        .map_err(|_| "bad stop")?;

    let ch_id = index
        .chrom_id(chrom)
        .ok_or_else(|| format!("chromosome {chrom} not in index"))?;
    if start > stop {
        return Err(format!("start {start} past stop {stop}"));
    }
    if stop > index.meta.chrom_size[ch_id as usize] {
        return Err(format!(
            "stop {stop} past end of {chrom} ({})",
            index.meta.chrom_size[ch_id as usize]
        ));
    }
    Ok(GenomicInterval { ch_id, start, stop })
}
