use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = product_rating_cli::Cli::parse();
    product_rating_cli::run_cli(cli)
}
