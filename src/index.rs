//! CpG index: construction, on-disk format, offset queries.
//!
//! The index records, for one reference assembly, the sorted forward-strand
//! CG dinucleotide positions of every chromosome, together with chromosome
//! order, sizes and prefix offsets into the flattened CpG sequence. It is
//! written as a raw little-endian u32 payload plus a JSON metadata sidecar
//! and is read-only once loaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::interval::GenomicInterval;
use crate::{Error, Result};

/// Version tag written to index metadata; readers reject anything else.
pub const INDEX_VERSION: u32 = 1;

/// Filename extension for index payload files.
pub const INDEX_EXTENSION: &str = "cpg_idx";

/// Metadata sidecar for a CpG index payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpgIndexMeta {
    pub assembly: String,
    pub version: u32,
    pub chrom_order: Vec<String>,
    pub chrom_size: Vec<u32>,
    pub n_cpgs_per_chrom: Vec<u32>,
    pub n_cpgs_total: u32,
    pub payload_hash: u32,
}

impl CpgIndexMeta {
    pub fn read(path: &Path) -> Result<CpgIndexMeta> {
        let text = std::fs::read_to_string(path)?;
        let meta: CpgIndexMeta = serde_json::from_str(&text)?;
        if meta.version != INDEX_VERSION {
            return Err(Error::UnsupportedVersion(meta.version));
        }
        Ok(meta)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Derive the metadata sidecar path from a payload path.
pub fn metadata_path(payload: &Path) -> PathBuf {
    PathBuf::from(format!("{}.meta", payload.display()))
}

/// In-memory CpG index for one assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct CpgIndex {
    pub meta: CpgIndexMeta,
    /// Strictly ascending CpG positions, one vector per chromosome in
    /// `meta.chrom_order` order.
    pub positions: Vec<Vec<u32>>,
    /// Exclusive prefix sums of per-chromosome CpG counts.
    pub chrom_offset: Vec<u32>,
    chrom_index: HashMap<String, i32>,
}

impl CpgIndex {
    /// Scan a FASTA reference genome and build the index.
    ///
    /// Chromosome order is file order; chromosomes without CpGs are kept.
    pub fn from_genome(assembly: &str, genome_path: &Path) -> Result<CpgIndex> {
        let file = std::fs::File::open(genome_path)?;
        let map = unsafe { Mmap::map(&file)? };
        let data: &[u8] = &map;

        let mut chrom_order = Vec::new();
        let mut chrom_size = Vec::new();
        let mut positions = Vec::new();

        let mut at = 0usize;
        while at < data.len() {
            if data[at] != b'>' {
                return Err(Error::Parse(format!(
                    "{}: expected '>' at byte {at}",
                    genome_path.display()
                )));
            }
            let line_end = data[at..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| at + p)
                .unwrap_or(data.len());
            let name_end = data[at + 1..line_end]
                .iter()
                .position(|b| b.is_ascii_whitespace())
                .map(|p| at + 1 + p)
                .unwrap_or(line_end);
            let name = std::str::from_utf8(&data[at + 1..name_end])
                .map_err(|_| Error::Parse("non-UTF8 sequence name".to_string()))?;
            if name.is_empty() {
                return Err(Error::Parse(format!(
                    "{}: empty sequence name",
                    genome_path.display()
                )));
            }

            let seq_start = (line_end + 1).min(data.len());
            let seq_end = data[seq_start..]
                .iter()
                .position(|&b| b == b'>')
                .map(|p| seq_start + p)
                .unwrap_or(data.len());

            let (cpgs, n_bases) = scan_cpgs(&data[seq_start..seq_end]);
            chrom_order.push(name.to_string());
            chrom_size.push(n_bases);
            positions.push(cpgs);
            at = seq_end;
        }

        if chrom_order.is_empty() {
            return Err(Error::Parse(format!(
                "{}: no sequences found",
                genome_path.display()
            )));
        }

        Ok(CpgIndex::assemble(
            assembly.to_string(),
            chrom_order,
            chrom_size,
            positions,
        ))
    }

    fn assemble(
        assembly: String,
        chrom_order: Vec<String>,
        chrom_size: Vec<u32>,
        positions: Vec<Vec<u32>>,
    ) -> CpgIndex {
        let n_cpgs_per_chrom: Vec<u32> = positions.iter().map(|p| p.len() as u32).collect();
        let mut chrom_offset = Vec::with_capacity(positions.len());
        let mut running = 0u32;
        for n in &n_cpgs_per_chrom {
            chrom_offset.push(running);
            running += n;
        }
        let chrom_index = chrom_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as i32))
            .collect();
        let payload_hash = hash_positions(&positions);
        CpgIndex {
            meta: CpgIndexMeta {
                assembly,
                version: INDEX_VERSION,
                chrom_order,
                chrom_size,
                n_cpgs_per_chrom,
                n_cpgs_total: running,
                payload_hash,
            },
            positions,
            chrom_offset,
            chrom_index,
        }
    }

    /// Write the binary payload and its metadata sidecar.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut payload = Vec::with_capacity(self.meta.n_cpgs_total as usize * 4);
        for chrom in &self.positions {
            payload.extend_from_slice(bytemuck::cast_slice(chrom));
        }
        std::fs::write(path, &payload)?;
        self.meta.write(&metadata_path(path))?;
        Ok(())
    }

    /// Read an index from its payload path, verifying version and hash.
    pub fn read(path: &Path) -> Result<CpgIndex> {
        let meta = CpgIndexMeta::read(&metadata_path(path))?;
        let n_from_chroms: usize = meta.n_cpgs_per_chrom.iter().map(|&n| n as usize).sum();
        if n_from_chroms != meta.n_cpgs_total as usize {
            return Err(Error::Integrity(format!(
                "{}: per-chromosome counts sum to {n_from_chroms}, metadata says {}",
                path.display(),
                meta.n_cpgs_total
            )));
        }
        let payload = std::fs::read(path)?;
        if payload.len() != meta.n_cpgs_total as usize * 4 {
            return Err(Error::Integrity(format!(
                "{}: payload is {} bytes, expected {}",
                path.display(),
                payload.len(),
                meta.n_cpgs_total as usize * 4
            )));
        }

        let mut positions = Vec::with_capacity(meta.n_cpgs_per_chrom.len());
        let mut at = 0usize;
        for &n in &meta.n_cpgs_per_chrom {
            let end = at + n as usize * 4;
            positions.push(bytemuck::pod_collect_to_vec(&payload[at..end]));
            at = end;
        }

        let hash = hash_positions(&positions);
        if hash != meta.payload_hash {
            return Err(Error::Integrity(format!(
                "{}: payload hash {hash:#010x} does not match metadata {:#010x}",
                path.display(),
                meta.payload_hash
            )));
        }

        let index = CpgIndex::assemble(
            meta.assembly.clone(),
            meta.chrom_order.clone(),
            meta.chrom_size.clone(),
            positions,
        );
        Ok(index)
    }

    /// Rank of a chromosome name in the index order.
    pub fn chrom_id(&self, name: &str) -> Option<i32> {
        self.chrom_index.get(name).copied()
    }

    pub fn n_chroms(&self) -> usize {
        self.positions.len()
    }

    /// Global offsets of the CpGs in `[start, stop)` on one chromosome.
    ///
    /// `lo` counts CpGs strictly below `start`, `hi` strictly below `stop`;
    /// `hi - lo` is the number of CpGs inside the interval.
    pub fn offsets_for(&self, ch_id: i32, start: u32, stop: u32) -> (u32, u32) {
        let positions = &self.positions[ch_id as usize];
        let base = self.chrom_offset[ch_id as usize];
        let lo = positions.partition_point(|&p| p < start);
        let hi = lo + positions[lo..].partition_point(|&p| p < stop);
        (base + lo as u32, base + hi as u32)
    }

    /// Global offset pairs for a batch of intervals, in matching order.
    ///
    /// Sorted input is scanned monotonically per chromosome; unsorted input
    /// is sorted internally and the results permuted back.
    pub fn offsets(&self, intervals: &[GenomicInterval]) -> Vec<(u32, u32)> {
        if intervals.windows(2).all(|w| w[0] <= w[1]) {
            return self.offsets_sorted(intervals);
        }
        let mut order: Vec<usize> = (0..intervals.len()).collect();
        order.sort_by_key(|&i| intervals[i]);
        let sorted: Vec<GenomicInterval> = order.iter().map(|&i| intervals[i]).collect();
        let pairs = self.offsets_sorted(&sorted);
        let mut res = vec![(0u32, 0u32); intervals.len()];
        for (rank, &i) in order.iter().enumerate() {
            res[i] = pairs[rank];
        }
        res
    }

    fn offsets_sorted(&self, intervals: &[GenomicInterval]) -> Vec<(u32, u32)> {
        let mut res = Vec::with_capacity(intervals.len());
        let mut at = 0usize;
        while at < intervals.len() {
            let ch_id = intervals[at].ch_id;
            let chunk_end = at
                + intervals[at..]
                    .iter()
                    .position(|iv| iv.ch_id != ch_id)
                    .unwrap_or(intervals.len() - at);
            let positions = &self.positions[ch_id as usize];
            let base = self.chrom_offset[ch_id as usize];
            // starts are ascending within the chunk, so each search can
            // resume from the previous lower bound
            let mut cursor = 0usize;
            for iv in &intervals[at..chunk_end] {
                cursor += positions[cursor..].partition_point(|&p| p < iv.start);
                let hi = cursor + positions[cursor..].partition_point(|&p| p < iv.stop);
                res.push((base + cursor as u32, base + hi as u32));
            }
            at = chunk_end;
        }
        res
    }

    /// Total bin count for a genome-wide walk at `bin_size`.
    pub fn n_bins(&self, bin_size: u32) -> u32 {
        self.meta
            .chrom_size
            .iter()
            .map(|&s| s.div_ceil(bin_size))
            .sum()
    }
}

/// Forward-strand CG positions and base count of one sequence region.
///
/// Newlines interrupt neither the position count nor a C..G pair spanning
/// a line break.
fn scan_cpgs(seq: &[u8]) -> (Vec<u32>, u32) {
    // typical CpG density is a few percent of bases
    let mut cpgs = Vec::with_capacity(seq.len() / 50);
    let mut prev_is_c = false;
    let mut pos = 0u32;
    for &b in seq {
        if prev_is_c && (b == b'g' || b == b'G') {
            cpgs.push(pos - 1);
        }
        prev_is_c = b == b'C' || b == b'c' || (prev_is_c && b == b'\n');
        pos += (b != b'\n') as u32;
    }
    (cpgs, pos)
}

fn hash_positions(positions: &[Vec<u32>]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for chrom in positions {
        hasher.update(bytemuck::cast_slice(chrom));
    }
    hasher.finalize()
}

/// Read-only set of indexes, one per assembly, loaded at server startup.
#[derive(Debug, Default)]
pub struct CpgIndexSet {
    indexes: HashMap<String, Arc<CpgIndex>>,
}

impl CpgIndexSet {
    /// Load every `.cpg_idx` payload under `dir`. Empty directories are a
    /// startup error: a server without indexes cannot answer anything.
    pub fn load(dir: &Path) -> Result<CpgIndexSet> {
        let mut indexes = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INDEX_EXTENSION) {
                continue;
            }
            let index = CpgIndex::read(&path)?;
            indexes.insert(index.meta.assembly.clone(), Arc::new(index));
        }
        if indexes.is_empty() {
            return Err(Error::Parse(format!(
                "no .{INDEX_EXTENSION} files in {}",
                dir.display()
            )));
        }
        Ok(CpgIndexSet { indexes })
    }

    pub fn get(&self, assembly: &str) -> Option<Arc<CpgIndex>> {
        self.indexes.get(assembly).cloned()
    }

    pub fn assemblies(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }
}
