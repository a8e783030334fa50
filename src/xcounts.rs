//! Reader for external per-CpG counts files ("xcounts" layout).
//!
//! The input is plain or gzipped text in genome order: `#`-prefixed header
//! lines naming each chromosome and its size (checked against the index),
//! a bare chromosome-name line opening each block, and data lines
//! `pos_step n_meth n_unmeth` where positions are delta-encoded within the
//! block. Sites absent from the input stay `(0, 0)`; input positions that
//! are not CpGs of the index are dropped; counters past [`MAX_COUNT`] are
//! round-scaled to fit.
//!
//! [`MAX_COUNT`]: crate::methylome::MAX_COUNT

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::index::CpgIndex;
use crate::methylome::{conditional_round_to_fit, CountPair, Methylome};
use crate::{Error, Result};

/// Build a methylome aligned to `index` from a counts file; the bool
/// reports whether any record was saturated.
pub fn build_from_counts(index: &CpgIndex, path: &Path) -> Result<(Methylome, bool)> {
    let reader = open_counts(path)?;
    let mut cpgs = vec![CountPair::default(); index.meta.n_cpgs_total as usize];
    let mut saturated = false;

    let mut n_chroms_seen = 0i32;
    // cursor into the current chromosome block, None before the first
    let mut block: Option<Block> = None;
    let mut skipping = false;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let at = |msg: String| Error::Parse(format!("{}:{}: {msg}", path.display(), lineno + 1));
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            verify_header_line(index, &mut n_chroms_seen, rest)
                .map_err(|e| Error::Integrity(format!("{}:{}: {e}", path.display(), lineno + 1)))?;
            continue;
        }
        if !line.as_bytes()[0].is_ascii_digit() {
            let name = line.trim();
            match index.chrom_id(name) {
                Some(ch_id) => {
                    block = Some(Block {
                        ch_id: ch_id as usize,
                        offset: index.chrom_offset[ch_id as usize] as usize,
                        idx: 0,
                        pos: 0,
                    });
                    skipping = false;
                }
                None => {
                    tracing::warn!(chrom = name, "dropping counts for unknown chromosome");
                    block = None;
                    skipping = true;
                }
            }
            continue;
        }
        if skipping {
            continue;
        }
        let block = block
            .as_mut()
            .ok_or_else(|| at("counts before any chromosome name".to_string()))?;

        let mut fields = line.split_ascii_whitespace();
        let mut next_u32 = |what: &str| -> Result<u32> {
            fields
                .next()
                .ok_or_else(|| at(format!("missing {what}")))?
                .parse::<u32>()
                .map_err(|_| at(format!("bad {what}")))
        };
        let pos_step = next_u32("position step")?;
        let n_meth = next_u32("n_meth")?;
        let n_unmeth = next_u32("n_unmeth")?;

        let positions = &index.positions[block.ch_id];
        let pos = block.pos + pos_step as u64;
        while block.idx < positions.len() && (positions[block.idx] as u64) < pos {
            block.idx += 1;
        }
        if block.idx < positions.len() && positions[block.idx] as u64 == pos {
            let (pair, sat) = conditional_round_to_fit(n_meth, n_unmeth);
            cpgs[block.offset + block.idx] = pair;
            saturated |= sat;
            block.idx += 1;
        }
        // anything else is an observation outside the index; dropped
        block.pos = pos;
    }

    Ok((Methylome { cpgs }, saturated))
}

struct Block {
    ch_id: usize,
    offset: usize,
    idx: usize,
    pos: u64,
}

/// Header lines name chromosomes with sizes in index order; lines that do
/// not parse as `name size` (format/version banners) are ignored.
fn verify_header_line(
    index: &CpgIndex,
    n_chroms_seen: &mut i32,
    rest: &str,
) -> std::result::Result<(), String> {
    let mut fields = rest.split_ascii_whitespace();
    let (Some(chrom), Some(size)) = (fields.next(), fields.next()) else {
        return Ok(());
    };
    let Ok(size) = size.parse::<u32>() else {
        return Ok(());
    };
    let ch_id = index
        .chrom_id(chrom)
        .ok_or_else(|| format!("chromosome {chrom} not in index"))?;
    if ch_id != *n_chroms_seen {
        return Err(format!(
            "chromosome {chrom} out of order (rank {ch_id}, header position {n_chroms_seen})"
        ));
    }
    let expected = index.meta.chrom_size[ch_id as usize];
    if size != expected {
        return Err(format!(
            "chromosome {chrom} size {size} does not match index ({expected})"
        ));
    }
    *n_chroms_seen += 1;
    Ok(())
}

fn open_counts(path: &Path) -> Result<Box<dyn BufRead>> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}
