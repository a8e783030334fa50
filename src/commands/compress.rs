use crate::config::CompressArgs;
use crate::index::metadata_path;
use crate::methylome::{Methylome, MethylomeMeta};

pub fn run(args: CompressArgs) -> anyhow::Result<()> {
    let (methylome, meta) = Methylome::open(&args.input)?;
    let compressed = !args.decompress;
    methylome.write(&args.output, compressed)?;
    // the hash covers the raw records, so re-encoding leaves it untouched
    MethylomeMeta { compressed, ..meta }.write(&metadata_path(&args.output))?;
    tracing::info!(
        input = %args.input.display(),
        output = %args.output.display(),
        compressed,
        "payload re-encoded"
    );
    Ok(())
}
