use anyhow::Context;

use crate::config::IndexArgs;
use crate::index::CpgIndex;

pub fn run(args: IndexArgs) -> anyhow::Result<()> {
    let assembly = match &args.assembly {
        Some(name) => name.clone(),
        None => args
            .output
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .context("cannot derive an assembly name from the output path")?,
    };
    tracing::info!(genome = %args.genome.display(), %assembly, "building CpG index");
    let index = CpgIndex::from_genome(&assembly, &args.genome)?;
    index.write(&args.output)?;
    tracing::info!(
        n_chroms = index.n_chroms(),
        n_cpgs = index.meta.n_cpgs_total,
        output = %args.output.display(),
        "index written"
    );
    Ok(())
}
