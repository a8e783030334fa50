use std::io::Write;

use super::open_output;
use crate::config::IntervalsArgs;
use crate::index::CpgIndex;
use crate::interval::GenomicInterval;
use crate::methylome::Methylome;

pub fn run(args: IntervalsArgs) -> anyhow::Result<()> {
    let index = CpgIndex::read(&args.index)?;
    let (methylome, meta) = Methylome::open(&args.methylome)?;
    anyhow::ensure!(
        meta.assembly == index.meta.assembly && meta.n_cpgs == index.meta.n_cpgs_total,
        "{}: methylome ({}, {} sites) does not match index ({}, {} sites)",
        args.methylome.display(),
        meta.assembly,
        meta.n_cpgs,
        index.meta.assembly,
        index.meta.n_cpgs_total
    );

    let intervals = GenomicInterval::load(&index, &args.intervals)?;
    let offsets = index.offsets(&intervals);

    let mut out = open_output(args.output.as_deref())?;
    if args.coverage {
        for (iv, row) in intervals.iter().zip(methylome.get_counts_cov(&offsets)) {
            let chrom = &index.meta.chrom_order[iv.ch_id as usize];
            writeln!(
                out,
                "{chrom}\t{}\t{}\t{}\t{}\t{}",
                iv.start, iv.stop, row.n_meth, row.n_unmeth, row.n_covered
            )?;
        }
    } else {
        for (iv, row) in intervals.iter().zip(methylome.get_counts(&offsets)) {
            let chrom = &index.meta.chrom_order[iv.ch_id as usize];
            writeln!(
                out,
                "{chrom}\t{}\t{}\t{}\t{}",
                iv.start, iv.stop, row.n_meth, row.n_unmeth
            )?;
        }
    }
    out.flush()?;
    Ok(())
}
