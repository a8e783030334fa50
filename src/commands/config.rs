use anyhow::Context;

use crate::config::{default_config_path, write_template, ConfigArgs};

pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let path = match args.output {
        Some(path) => path,
        None => default_config_path().context("HOME is not set")?,
    };
    write_template(&path)?;
    println!("wrote config template to {}", path.display());
    Ok(())
}
