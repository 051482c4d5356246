//! Entry point for the sld linker.
//!
//! Simple flow: parse args → map files → link → executable on disk.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sld::config::Config;
use sld::linker::link_executable;

fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Resolve inputs (handles -o, -e, -l, -L and friends in order)
    let (options, input_paths) = config.parse_inputs()?;
    if input_paths.is_empty() {
        anyhow::bail!("no input files");
    }

    // Memory-map input files; the mappings outlive the whole link and the
    // linker never writes through them.
    let mut mappings = Vec::with_capacity(input_paths.len());
    for path in &input_paths {
        info!("processing input: {}", path.display());
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map {}", path.display()))?;
        mappings.push(mmap);
    }
    let buffers: Vec<&[u8]> = mappings.iter().map(|m| m.as_ref()).collect();

    link_executable(&buffers, &options).context("linking failed")?;

    info!("linked successfully to {}", options.output_file_name.display());
    Ok(())
}
