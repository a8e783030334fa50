//! Methylome store: per-CpG counts, on-disk format, aggregation kernels.
//!
//! A methylome is a flat array of `(n_meth, n_unmeth)` u16 pairs whose
//! length equals the CpG index's total site count; the on-disk payload is
//! the same records little-endian, optionally deflated, with a JSON
//! metadata sidecar binding the methylome to its assembly.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::compress;
use crate::index::{metadata_path, CpgIndex};
use crate::{Error, Result};

/// Per-CpG counter ceiling; `n_meth + n_unmeth` never exceeds this after
/// construction.
pub const MAX_COUNT: u16 = u16::MAX;

/// Filename extension for methylome payload files.
pub const METHYLOME_EXTENSION: &str = "m16";

/// One CpG record: methylated and unmethylated read counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CountPair {
    pub n_meth: u16,
    pub n_unmeth: u16,
}

pub const RECORD_SIZE: usize = std::mem::size_of::<CountPair>();

impl CountPair {
    #[inline]
    pub fn is_covered(self) -> bool {
        self.n_meth != 0 || self.n_unmeth != 0
    }
}

/// Aggregate over one interval or bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountsRes {
    pub n_meth: u32,
    pub n_unmeth: u32,
}

/// Aggregate with the number of covered sites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountsResCov {
    pub n_meth: u32,
    pub n_unmeth: u32,
    pub n_covered: u32,
}

impl CountsResCov {
    #[inline]
    pub fn drop_coverage(self) -> CountsRes {
        CountsRes {
            n_meth: self.n_meth,
            n_unmeth: self.n_unmeth,
        }
    }
}

/// Result of an aggregation: one of two row shapes, selected per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateResult {
    Plain(Vec<CountsRes>),
    Cov(Vec<CountsResCov>),
}

impl AggregateResult {
    pub fn len(&self) -> usize {
        match self {
            AggregateResult::Plain(v) => v.len(),
            AggregateResult::Cov(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn include_coverage(&self) -> bool {
        matches!(self, AggregateResult::Cov(_))
    }
}

/// Scale `(a, b)` down proportionally so both fit in a u16 counter.
///
/// The larger value becomes `MAX_COUNT`; the other keeps its ratio to the
/// larger, rounded to nearest.
pub fn round_to_fit(a: u32, b: u32) -> (u16, u16) {
    let c = a.max(b);
    let scale = |x: u32| -> u16 {
        if x == c {
            MAX_COUNT
        } else {
            ((x as f64 / c as f64) * MAX_COUNT as f64).round() as u16
        }
    };
    (scale(a), scale(b))
}

/// Saturate a raw counter pair into a record, reporting whether scaling
/// was applied.
pub fn conditional_round_to_fit(a: u32, b: u32) -> (CountPair, bool) {
    if a.max(b) > MAX_COUNT as u32 {
        let (n_meth, n_unmeth) = round_to_fit(a, b);
        (CountPair { n_meth, n_unmeth }, true)
    } else {
        (
            CountPair {
                n_meth: a as u16,
                n_unmeth: b as u16,
            },
            false,
        )
    }
}

/// Metadata sidecar for a methylome payload.
///
/// `payload_hash` covers the uncompressed records, so it is invariant
/// under re-encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethylomeMeta {
    pub assembly: String,
    pub n_cpgs: u32,
    pub payload_hash: u32,
    pub sum_m: u64,
    pub sum_u: u64,
    pub saturated: bool,
    #[serde(default)]
    pub compressed: bool,
}

impl MethylomeMeta {
    pub fn read(path: &Path) -> Result<MethylomeMeta> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn for_methylome(
        methylome: &Methylome,
        assembly: &str,
        saturated: bool,
        compressed: bool,
    ) -> MethylomeMeta {
        let (sum_m, sum_u, _) = methylome.totals();
        MethylomeMeta {
            assembly: assembly.to_string(),
            n_cpgs: methylome.n_cpgs(),
            payload_hash: methylome.payload_hash(),
            sum_m,
            sum_u,
            saturated,
            compressed,
        }
    }
}

/// In-memory methylome: one record per CpG site of the bound assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Methylome {
    pub cpgs: Vec<CountPair>,
}

impl Methylome {
    pub fn zeroed(n_cpgs: u32) -> Methylome {
        Methylome {
            cpgs: vec![CountPair::default(); n_cpgs as usize],
        }
    }

    pub fn n_cpgs(&self) -> u32 {
        self.cpgs.len() as u32
    }

    pub fn payload_hash(&self) -> u32 {
        crc32fast::hash(bytemuck::cast_slice(&self.cpgs))
    }

    /// Read a payload described by `meta`, inflating if needed. The record
    /// count must match the metadata; the hash is not checked here.
    pub fn read(path: &Path, meta: &MethylomeMeta) -> Result<Methylome> {
        let bytes = std::fs::read(path)?;
        let cpgs: Vec<CountPair> = if meta.compressed {
            compress::inflate(&bytes, meta.n_cpgs as usize)?
        } else {
            if bytes.len() != meta.n_cpgs as usize * RECORD_SIZE {
                return Err(Error::Integrity(format!(
                    "{}: payload is {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    meta.n_cpgs as usize * RECORD_SIZE
                )));
            }
            bytemuck::pod_collect_to_vec(&bytes)
        };
        Ok(Methylome { cpgs })
    }

    /// Read payload plus sidecar and verify the payload hash.
    pub fn open(path: &Path) -> Result<(Methylome, MethylomeMeta)> {
        let meta = MethylomeMeta::read(&metadata_path(path))?;
        let methylome = Methylome::read(path, &meta)?;
        let hash = methylome.payload_hash();
        if hash != meta.payload_hash {
            return Err(Error::Integrity(format!(
                "{}: payload hash {hash:#010x} does not match metadata {:#010x}",
                path.display(),
                meta.payload_hash
            )));
        }
        Ok((methylome, meta))
    }

    /// Write the payload, deflated when `compressed` is set. The caller
    /// writes the sidecar separately.
    pub fn write(&self, path: &Path, compressed: bool) -> Result<()> {
        if compressed {
            std::fs::write(path, compress::deflate(&self.cpgs)?)?;
        } else {
            std::fs::write(path, bytemuck::cast_slice::<CountPair, u8>(&self.cpgs))?;
        }
        Ok(())
    }

    /// Element-wise sum with saturation; returns whether any record was
    /// scaled to fit.
    pub fn merge(&mut self, other: &Methylome) -> Result<bool> {
        if self.cpgs.len() != other.cpgs.len() {
            return Err(Error::Integrity(format!(
                "cannot merge methylomes of {} and {} sites",
                self.cpgs.len(),
                other.cpgs.len()
            )));
        }
        let mut saturated = false;
        for (l, r) in self.cpgs.iter_mut().zip(&other.cpgs) {
            let (pair, sat) = conditional_round_to_fit(
                l.n_meth as u32 + r.n_meth as u32,
                l.n_unmeth as u32 + r.n_unmeth as u32,
            );
            *l = pair;
            saturated |= sat;
        }
        Ok(saturated)
    }

    /// `(sum_m, sum_u, n_covered)` over every site.
    pub fn totals(&self) -> (u64, u64, u64) {
        let mut m = 0u64;
        let mut u = 0u64;
        let mut cov = 0u64;
        for p in &self.cpgs {
            m += p.n_meth as u64;
            u += p.n_unmeth as u64;
            cov += p.is_covered() as u64;
        }
        (m, u, cov)
    }

    /// Sum the records of one offset range. Accumulation is 64-bit and
    /// narrowed on output.
    #[inline]
    fn accumulate(&self, lo: u32, hi: u32) -> CountsResCov {
        let mut m = 0u64;
        let mut u = 0u64;
        let mut cov = 0u32;
        for p in &self.cpgs[lo as usize..hi as usize] {
            m += p.n_meth as u64;
            u += p.n_unmeth as u64;
            cov += p.is_covered() as u32;
        }
        CountsResCov {
            n_meth: narrow(m),
            n_unmeth: narrow(u),
            n_covered: cov,
        }
    }

    pub fn get_counts(&self, offsets: &[(u32, u32)]) -> Vec<CountsRes> {
        offsets
            .iter()
            .map(|&(lo, hi)| self.accumulate(lo, hi).drop_coverage())
            .collect()
    }

    pub fn get_counts_cov(&self, offsets: &[(u32, u32)]) -> Vec<CountsResCov> {
        offsets
            .iter()
            .map(|&(lo, hi)| self.accumulate(lo, hi))
            .collect()
    }

    /// Bin aggregates for one chromosome: `ceil(chrom_size / bin_size)`
    /// half-open bins, position and record cursors advancing in lockstep.
    pub fn chrom_bins_cov(
        &self,
        ch_id: usize,
        bin_size: u32,
        index: &CpgIndex,
    ) -> Vec<CountsResCov> {
        assert!(bin_size > 0, "bin_size must be positive");
        let positions = &index.positions[ch_id];
        let chrom_size = index.meta.chrom_size[ch_id];
        let offset = index.chrom_offset[ch_id] as usize;

        let mut res = Vec::with_capacity(chrom_size.div_ceil(bin_size) as usize);
        let mut p = 0usize;
        let mut bin_start = 0u32;
        while bin_start < chrom_size {
            let bin_end = bin_start.saturating_add(bin_size).min(chrom_size);
            let mut m = 0u64;
            let mut u = 0u64;
            let mut cov = 0u32;
            while p < positions.len() && positions[p] < bin_end {
                let rec = self.cpgs[offset + p];
                m += rec.n_meth as u64;
                u += rec.n_unmeth as u64;
                cov += rec.is_covered() as u32;
                p += 1;
            }
            res.push(CountsResCov {
                n_meth: narrow(m),
                n_unmeth: narrow(u),
                n_covered: cov,
            });
            bin_start = bin_end;
        }
        res
    }

    pub fn get_bins_cov(&self, bin_size: u32, index: &CpgIndex) -> Vec<CountsResCov> {
        let mut res = Vec::with_capacity(index.n_bins(bin_size) as usize);
        for ch_id in 0..index.n_chroms() {
            res.extend(self.chrom_bins_cov(ch_id, bin_size, index));
        }
        res
    }

    pub fn get_bins(&self, bin_size: u32, index: &CpgIndex) -> Vec<CountsRes> {
        self.get_bins_cov(bin_size, index)
            .into_iter()
            .map(CountsResCov::drop_coverage)
            .collect()
    }
}

#[inline]
fn narrow(x: u64) -> u32 {
    x.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CpgIndex;
    use std::io::Write;

    fn tiny_index(dir: &Path) -> CpgIndex {
        let genome = dir.join("g.fa");
        let mut f = std::fs::File::create(&genome).unwrap();
        writeln!(f, ">chr1\nACGTCGCG\n>chr2\nCG").unwrap();
        CpgIndex::from_genome("tiny", &genome).unwrap()
    }

    fn tiny_methylome() -> Methylome {
        Methylome {
            cpgs: vec![
                CountPair { n_meth: 10, n_unmeth: 0 },
                CountPair { n_meth: 5, n_unmeth: 5 },
                CountPair { n_meth: 0, n_unmeth: 20 },
                CountPair { n_meth: 7, n_unmeth: 3 },
            ],
        }
    }

    #[test]
    fn interval_aggregation_with_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let index = tiny_index(dir.path());
        let meth = tiny_methylome();
        let offsets = vec![
            index.offsets_for(0, 3, 7),
            index.offsets_for(1, 0, 2),
        ];
        let res = meth.get_counts_cov(&offsets);
        assert_eq!(
            res,
            vec![
                CountsResCov { n_meth: 5, n_unmeth: 25, n_covered: 2 },
                CountsResCov { n_meth: 7, n_unmeth: 3, n_covered: 1 },
            ]
        );
        let plain = meth.get_counts(&offsets);
        assert_eq!(plain[0], CountsRes { n_meth: 5, n_unmeth: 25 });
    }

    #[test]
    fn uncovered_sites_do_not_count() {
        let meth = Methylome {
            cpgs: vec![
                CountPair::default(),
                CountPair { n_meth: 1, n_unmeth: 0 },
            ],
        };
        let res = meth.get_counts_cov(&[(0, 2)]);
        assert_eq!(res[0].n_covered, 1);
    }

    #[test]
    fn bin_aggregation_partitions_chromosomes() {
        let dir = tempfile::tempdir().unwrap();
        let index = tiny_index(dir.path());
        let meth = tiny_methylome();
        let bins = meth.get_bins_cov(4, &index);
        assert_eq!(
            bins,
            vec![
                // chr1 [0,4): site at 1
                CountsResCov { n_meth: 10, n_unmeth: 0, n_covered: 1 },
                // chr1 [4,8): sites at 4, 6
                CountsResCov { n_meth: 5, n_unmeth: 25, n_covered: 2 },
                // chr2 [0,2): site at 0
                CountsResCov { n_meth: 7, n_unmeth: 3, n_covered: 1 },
            ]
        );
        assert_eq!(bins.len() as u32, index.n_bins(4));
    }

    #[test]
    fn bin_count_matches_n_bins_for_odd_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let index = tiny_index(dir.path());
        let meth = Methylome::zeroed(index.meta.n_cpgs_total);
        for bin_size in 1..=10u32 {
            let bins = meth.get_bins(bin_size, &index);
            assert_eq!(bins.len() as u32, index.n_bins(bin_size), "B={bin_size}");
        }
    }

    #[test]
    fn round_to_fit_preserves_ratio() {
        let (a, b) = round_to_fit(200_000, 100_000);
        assert_eq!(a, MAX_COUNT);
        let ratio = a as f64 / b as f64;
        assert!((ratio - 2.0).abs() < 0.001);

        // equal values both saturate
        let (a, b) = round_to_fit(70_000, 70_000);
        assert_eq!((a, b), (MAX_COUNT, MAX_COUNT));
    }

    #[test]
    fn conditional_round_only_fires_past_max() {
        let (pair, sat) = conditional_round_to_fit(17, 40);
        assert!(!sat);
        assert_eq!(pair, CountPair { n_meth: 17, n_unmeth: 40 });

        let (pair, sat) = conditional_round_to_fit(100_000, 10);
        assert!(sat);
        assert_eq!(pair.n_meth, MAX_COUNT);
        assert!(pair.n_unmeth <= 7);
    }

    #[test]
    fn merge_sums_and_saturates() {
        let mut a = tiny_methylome();
        let b = tiny_methylome();
        let saturated = a.merge(&b).unwrap();
        assert!(!saturated);
        assert_eq!(a.cpgs[0], CountPair { n_meth: 20, n_unmeth: 0 });
        assert_eq!(a.cpgs[2], CountPair { n_meth: 0, n_unmeth: 40 });

        let mut big = Methylome {
            cpgs: vec![CountPair { n_meth: 60_000, n_unmeth: 30_000 }],
        };
        let other = Methylome {
            cpgs: vec![CountPair { n_meth: 20_000, n_unmeth: 10_000 }],
        };
        let saturated = big.merge(&other).unwrap();
        assert!(saturated);
        assert_eq!(big.cpgs[0].n_meth, MAX_COUNT);

        let mut short = Methylome::zeroed(2);
        assert!(short.merge(&other).is_err());
    }

    #[test]
    fn merge_is_commutative_without_saturation() {
        let a = tiny_methylome();
        let mut ab = a.clone();
        ab.merge(&Methylome::zeroed(4)).unwrap();
        assert_eq!(ab, a);

        let mut x = tiny_methylome();
        let y = Methylome {
            cpgs: vec![
                CountPair { n_meth: 1, n_unmeth: 2 },
                CountPair { n_meth: 3, n_unmeth: 4 },
                CountPair { n_meth: 5, n_unmeth: 6 },
                CountPair { n_meth: 7, n_unmeth: 8 },
            ],
        };
        let mut yx = y.clone();
        x.merge(&y).unwrap();
        yx.merge(&tiny_methylome()).unwrap();
        assert_eq!(x, yx);
    }

    #[test]
    fn merge_is_associative_without_saturation() {
        let a = tiny_methylome();
        let b = Methylome {
            cpgs: vec![
                CountPair { n_meth: 1, n_unmeth: 2 },
                CountPair { n_meth: 3, n_unmeth: 4 },
                CountPair { n_meth: 5, n_unmeth: 6 },
                CountPair { n_meth: 7, n_unmeth: 8 },
            ],
        };
        let c = Methylome {
            cpgs: vec![CountPair { n_meth: 2, n_unmeth: 9 }; 4],
        };

        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();

        assert_eq!(left, right);
    }

    #[test]
    fn totals_cover_all_sites() {
        let meth = tiny_methylome();
        assert_eq!(meth.totals(), (22, 28, 4));
    }

    #[test]
    fn write_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let meth = tiny_methylome();
        for compressed in [false, true] {
            let path = dir.path().join(format!("s_{compressed}.m16"));
            meth.write(&path, compressed).unwrap();
            MethylomeMeta::for_methylome(&meth, "tiny", false, compressed)
                .write(&metadata_path(&path))
                .unwrap();
            let (back, meta) = Methylome::open(&path).unwrap();
            assert_eq!(back, meth);
            assert_eq!(meta.assembly, "tiny");
            assert_eq!(meta.sum_m, 22);
            assert_eq!(meta.sum_u, 28);
        }
    }

    #[test]
    fn corrupt_payload_fails_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let meth = tiny_methylome();
        let path = dir.path().join("s.m16");
        meth.write(&path, false).unwrap();
        MethylomeMeta::for_methylome(&meth, "tiny", false, false)
            .write(&metadata_path(&path))
            .unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[1] ^= 0x40;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(Methylome::open(&path), Err(Error::Integrity(_))));
    }
}
