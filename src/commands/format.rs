use crate::config::FormatArgs;
use crate::index::{metadata_path, CpgIndex};
use crate::methylome::MethylomeMeta;
use crate::xcounts;

pub fn run(args: FormatArgs) -> anyhow::Result<()> {
    let index = CpgIndex::read(&args.index)?;
    tracing::info!(
        meth = %args.meth.display(),
        assembly = %index.meta.assembly,
        "formatting methylome"
    );
    let (methylome, saturated) = xcounts::build_from_counts(&index, &args.meth)?;
    methylome.write(&args.output, args.zip)?;
    let meta = MethylomeMeta::for_methylome(&methylome, &index.meta.assembly, saturated, args.zip);
    meta.write(&metadata_path(&args.output))?;
    tracing::info!(
        n_cpgs = meta.n_cpgs,
        sum_m = meta.sum_m,
        sum_u = meta.sum_u,
        saturated,
        output = %args.output.display(),
        "methylome written"
    );
    Ok(())
}
