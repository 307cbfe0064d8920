use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = inference_ledger_cli::Cli::parse();
    inference_ledger_cli::run_cli(cli)
}
