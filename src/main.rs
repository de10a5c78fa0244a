use anyhow::Result;
use clap::Parser;
use sbstage_core::cli::Args;

fn main() -> Result<()> {
    let args = Args::parse();
    sbstage_core::run_cli(&args)
}
