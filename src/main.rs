mod client;
mod output;
mod project;
mod schema;

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Runs one SQL query against BigQuery and writes the result as CSV.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the BigQuery service-account key file (JSON)
    #[arg(short, long, default_value = "auth/auth.json")]
    auth: PathBuf,

    /// Output file destination; defaults to stdout
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Directory in which to write the flattened schema as schema.json
    #[arg(short = 's', long = "schema-out")]
    schema_out: Option<PathBuf>,

    /// Expand nested RECORD columns into one CSV column per leaf field
    /// instead of serializing them as JSON text
    #[arg(long)]
    nf2: bool,

    /// SQL query to execute
    #[arg(short, long, conflicts_with = "query_file")]
    query: Option<String>,

    /// File containing the SQL query; when neither this nor --query is
    /// given the query is read from stdin
    #[arg(short = 'f', long)]
    query_file: Option<PathBuf>,
}

fn read_statement(args: &Args) -> Result<String> {
    if let Some(query) = &args.query {
        return Ok(query.clone());
    }
    if let Some(path) = &args.query_file {
        return fs::read_to_string(path)
            .with_context(|| format!("cannot read query file {}", path.display()));
    }
    let mut stmt = String::new();
    std::io::stdin()
        .read_to_string(&mut stmt)
        .context("cannot read query from stdin")?;
    Ok(stmt)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let stmt = read_statement(&args)?;
    debug!(statement_len = stmt.len(), nf2 = args.nf2, "query resolved");

    let mut results = client::run_query(&args.auth, &stmt).await?;
    let fields = schema::flatten(&results.schema, args.nf2);
    debug!(fields = fields.len(), "schema flattened");

    if let Some(dir) = &args.schema_out {
        output::write_schema_file(dir, &fields)?;
    }

    let dest = output::open_destination(args.out.as_deref())?;
    let mut csv = output::CsvOutput::new(dest, &fields)?;
    // Each page is projected and written before the next one is fetched,
    // so memory stays bounded by one response page.
    while let Some(rows) = results.next_page().await? {
        for row in &rows {
            let raw = client::decode_row(&results.schema, row);
            csv.write_row(&project::project(&raw, &fields, args.nf2))?;
        }
    }
    let written = csv.finish()?;
    info!(rows = written, "csv written");
    Ok(())
}
