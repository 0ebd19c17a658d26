//! Command surface for the product rating pipeline.
//!
//! `run` executes the full generate → persist → aggregate → pivot flow and
//! prints the per-month top products; `report` renders the report from an
//! already-populated store. Both accept `--json` for machine-readable
//! output.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use product_rating_core::{parse_date, MonthTopProducts, PipelineConfig, TOP_N};
use product_rating_store_sqlite::{
    run_pipeline, top_products_all_months, PipelineRunReport, SqliteRatingStore, AGGREGATE_TABLE,
    RAW_TABLE,
};

#[derive(Debug, Parser)]
#[command(name = "product-rating")]
#[command(about = "Synthetic product rating aggregation pipeline")]
pub struct Cli {
    #[arg(long, default_value = "./ProductRating.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full pipeline, then print the top products per month.
    Run(RunArgs),
    /// Print the top products per month from an existing store.
    Report(ReportArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    records: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    max_user_id: Option<u32>,
    #[arg(long)]
    max_product_id: Option<u32>,
    #[arg(long)]
    max_rating: Option<u32>,
    #[arg(long)]
    start_date: Option<String>,
    #[arg(long)]
    end_date: Option<String>,
    /// Keep rows already in the store instead of truncating first.
    #[arg(long)]
    keep_existing: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, serde::Serialize)]
struct RunOutput<'a> {
    pipeline: &'a PipelineRunReport,
    top_products: &'a [MonthTopProducts],
}

/// Executes the parsed CLI command.
///
/// # Errors
/// Returns an error when argument values are invalid or any store
/// operation fails; the error reaches `main` and terminates the process
/// with a diagnostic.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteRatingStore::new(&cli.db);

    match cli.command {
        Command::Run(args) => {
            let config = build_config(&args)?;
            let report = run_pipeline(&store, &config)?;
            let months = top_products_all_months(&store)?;

            if args.json {
                let output = RunOutput {
                    pipeline: &report,
                    top_products: &months,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_run_report(&report);
                println!();
                print_top_products(&months);
            }
            Ok(())
        }
        Command::Report(args) => {
            if !store.table_exists(AGGREGATE_TABLE)? {
                return Err(anyhow!(
                    "{AGGREGATE_TABLE} table doesn't exist in {}; run the pipeline first",
                    cli.db.display()
                ));
            }

            let months = top_products_all_months(&store)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&months)?);
            } else {
                print_top_products(&months);
            }
            Ok(())
        }
    }
}

fn build_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::default();

    if let Some(records) = args.records {
        config.total_records = records;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(max_user_id) = args.max_user_id {
        config.max_user_id = max_user_id;
    }
    if let Some(max_product_id) = args.max_product_id {
        config.max_product_id = max_product_id;
    }
    if let Some(max_rating) = args.max_rating {
        config.max_rating = max_rating;
    }
    if let Some(raw) = args.start_date.as_deref() {
        config.start_date = parse_date(raw).map_err(|err| anyhow!("invalid --start-date: {err}"))?;
    }
    if let Some(raw) = args.end_date.as_deref() {
        config.end_date = parse_date(raw).map_err(|err| anyhow!("invalid --end-date: {err}"))?;
    }
    config.keep_existing = args.keep_existing;

    config
        .validate()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(config)
}

fn print_run_report(report: &PipelineRunReport) {
    println!(
        "{} raw events inserted into {RAW_TABLE}{}",
        report.raw_events_inserted,
        if report.truncated {
            " (store truncated first)"
        } else {
            ""
        }
    );
    println!(
        "{} aggregate rows inserted into {AGGREGATE_TABLE} ({} distinct products)",
        report.aggregate_rows_inserted, report.distinct_products
    );
}

fn print_top_products(months: &[MonthTopProducts]) {
    for entry in months {
        println!("Top {TOP_N} products of {}:", entry.month);
        for product in &entry.products {
            println!(
                "Product ID : {} , Avg Rating: {}",
                product.product_id, product.average_rating
            );
        }
        println!();
    }
}
