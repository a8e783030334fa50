use std::io::Write;

use super::open_output;
use crate::config::BinsArgs;
use crate::index::CpgIndex;
use crate::methylome::Methylome;

pub fn run(args: BinsArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.bin_size > 0, "bin size must be positive");
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

    let mut out = open_output(args.output.as_deref())?;
    for ch_id in 0..index.n_chroms() {
        let chrom = &index.meta.chrom_order[ch_id];
        let chrom_size = index.meta.chrom_size[ch_id];
        let mut start = 0u32;
        for row in methylome.chrom_bins_cov(ch_id, args.bin_size, &index) {
            let stop = start.saturating_add(args.bin_size).min(chrom_size);
            if args.coverage {
                writeln!(
                    out,
                    "{chrom}\t{start}\t{stop}\t{}\t{}\t{}",
                    row.n_meth, row.n_unmeth, row.n_covered
                )?;
            } else {
                writeln!(out, "{chrom}\t{start}\t{stop}\t{}\t{}", row.n_meth, row.n_unmeth)?;
            }
            start = stop;
        }
    }
    out.flush()?;
    Ok(())
}
