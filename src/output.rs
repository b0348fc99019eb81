use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use gcp_bigquery_client::model::field_type::FieldType;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::project::render;
use crate::schema::FlatField;

/// Opens the CSV destination: the given file, or stdout when none.
pub fn open_destination(out: Option<&Path>) -> Result<Box<dyn Write>> {
    match out {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create output file {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout().lock())),
    }
}

/// CSV writer over the flattened schema. Rows are written as they are
/// handed in, one page at a time; nothing is buffered beyond the
/// writer's own block. Dropping it closes the destination on every exit
/// path.
pub struct CsvOutput<W: Write> {
    writer: csv::Writer<W>,
    rows_written: u64,
}

impl<W: Write> CsvOutput<W> {
    /// Opens the writer and emits the header row of display names.
    pub fn new(dest: W, fields: &[FlatField]) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(dest);
        writer.write_record(fields.iter().map(|f| f.display_name.as_str()))?;
        Ok(Self {
            writer,
            rows_written: 0,
        })
    }

    /// Writes one projected row as a CSV record.
    pub fn write_row(&mut self, row: &[Value]) -> Result<()> {
        self.writer.write_record(row.iter().map(render))?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flushes and returns the number of data rows written.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.rows_written)
    }
}

#[derive(Serialize)]
struct SchemaEntry<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    datatype: &'a FieldType,
}

/// Writes the flattened schema as `schema.json` inside `dir`, creating
/// the directory when needed and overwriting any existing file.
pub fn write_schema_file(dir: &Path, fields: &[FlatField]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("cannot create schema directory {}", dir.display()))?;
    let path = dir.join("schema.json");

    let entries: Vec<SchemaEntry> = fields
        .iter()
        .map(|f| SchemaEntry {
            name: &f.display_name,
            datatype: &f.datatype,
        })
        .collect();

    let file = File::create(&path)
        .with_context(|| format!("cannot create schema file {}", path.display()))?;
    serde_json::to_writer(file, &entries)
        .with_context(|| format!("cannot write schema file {}", path.display()))?;
    info!(path = %path.display(), fields = fields.len(), "schema side file written");
    Ok(())
}
