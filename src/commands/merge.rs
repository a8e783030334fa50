use crate::config::MergeArgs;
use crate::index::metadata_path;
use crate::methylome::{Methylome, MethylomeMeta};

pub fn run(args: MergeArgs) -> anyhow::Result<()> {
    let Some((first, rest)) = args.inputs.split_first() else {
        anyhow::bail!("at least two input methylomes are required");
    };
    let (mut merged, first_meta) = Methylome::open(first)?;
    let mut saturated = first_meta.saturated;

    for path in rest {
        let (next, meta) = Methylome::open(path)?;
        anyhow::ensure!(
            meta.assembly == first_meta.assembly,
            "{}: assembly {} does not match {} from {}",
            path.display(),
            meta.assembly,
            first_meta.assembly,
            first.display()
        );
        saturated |= meta.saturated;
        saturated |= merged.merge(&next)?;
    }

    merged.write(&args.output, args.zip)?;
    let meta = MethylomeMeta::for_methylome(&merged, &first_meta.assembly, saturated, args.zip);
    meta.write(&metadata_path(&args.output))?;
    tracing::info!(
        n_inputs = args.inputs.len(),
        sum_m = meta.sum_m,
        sum_u = meta.sum_u,
        saturated,
        output = %args.output.display(),
        "merged methylome written"
    );
    Ok(())
}
