use crate::config::CheckArgs;
use crate::index::CpgIndex;
use crate::methylome::Methylome;

pub fn run(args: CheckArgs) -> anyhow::Result<()> {
    anyhow::ensure!(
        args.index.is_some() || !args.methylomes.is_empty(),
        "nothing to check; pass --index and/or --methylome"
    );

    // reading already verifies the version tag and payload hash
    let index = args.index.as_ref().map(|p| CpgIndex::read(p)).transpose()?;
    if let (Some(index), Some(path)) = (&index, &args.index) {
        tracing::info!(
            assembly = %index.meta.assembly,
            n_cpgs = index.meta.n_cpgs_total,
            "index ok: {}",
            path.display()
        );
    }

    for path in &args.methylomes {
        let (methylome, meta) = Methylome::open(path)?;
        let (sum_m, sum_u, _) = methylome.totals();
        anyhow::ensure!(
            sum_m == meta.sum_m && sum_u == meta.sum_u,
            "{}: totals ({sum_m}, {sum_u}) do not match metadata ({}, {})",
            path.display(),
            meta.sum_m,
            meta.sum_u
        );
        if let Some(index) = &index {
            anyhow::ensure!(
                meta.assembly == index.meta.assembly,
                "{}: assembly {} does not match index assembly {}",
                path.display(),
                meta.assembly,
                index.meta.assembly
            );
            anyhow::ensure!(
                meta.n_cpgs == index.meta.n_cpgs_total,
                "{}: methylome has {} sites but the index has {}",
                path.display(),
                meta.n_cpgs,
                index.meta.n_cpgs_total
            );
        }
        tracing::info!(
            assembly = %meta.assembly,
            n_cpgs = meta.n_cpgs,
            "methylome ok: {}",
            path.display()
        );
    }
    Ok(())
}
