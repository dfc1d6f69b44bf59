//! Tabular output writer: one CSV file per table, opened on first row.
//!
//! New files start with a header of the selected columns, binary columns
//! suffixed with `*b64`. An existing file is appended to under its own header
//! order; columns it does not know are dropped and columns it has but the
//! table no longer has are written empty.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use seedbed_rdbc::schema::Column;
use seedbed_rdbc::types::Row;
use seedbed_rdbc::TableName;

use crate::dataset::{header_cell, parse_header};
use crate::error::Result;

/// Writer for one table file
pub struct TableWriter {
    path: PathBuf,
    table: TableName,
    columns: Vec<Column>,
    max_cell_length: usize,
    writer: Option<csv::Writer<File>>,
    // file column -> selected column
    positions: Vec<Option<usize>>,
    rows: u64,
}

impl std::fmt::Debug for TableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableWriter")
            .field("path", &self.path)
            .field("table", &self.table)
            .field("open", &self.writer.is_some())
            .field("rows", &self.rows)
            .finish()
    }
}

impl TableWriter {
    /// Writer for `columns` of `table` at `path`. Nothing touches the disk
    /// until the first row.
    pub fn new(path: PathBuf, table: TableName, columns: &[Column], max_cell_length: usize) -> Self {
        Self {
            path,
            table,
            columns: columns.to_vec(),
            max_cell_length,
            writer: None,
            positions: Vec::new(),
            rows: 0,
        }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written by this writer
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Header for a fresh file
    pub fn header(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| header_cell(&c.name, c.is_binary()))
            .collect()
    }

    /// Append one row
    pub fn write(&mut self, row: &Row) -> Result<()> {
        if self.writer.is_none() {
            self.open()?;
        }
        let record: Vec<String> = self
            .positions
            .iter()
            .map(|position| match position.and_then(|i| row.get(i).map(|v| (i, v))) {
                Some((i, value)) => self.cell(i, value.to_cell()),
                None => String::new(),
            })
            .collect();
        if let Some(writer) = self.writer.as_mut() {
            writer.write_record(&record)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Write a header-only file marking a table captured with zero rows.
    /// Existing files are left alone. Returns whether a file was created.
    pub fn write_empty_marker(&mut self) -> Result<bool> {
        if self.writer.is_some() || self.path.exists() {
            return Ok(false);
        }
        self.open()?;
        debug!(table = %self.table, file = %self.path.display(), "wrote empty marker");
        Ok(true)
    }

    /// Flush and release the file
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn cell(&self, index: usize, text: String) -> String {
        if text.len() > self.max_cell_length {
            warn!(
                table = %self.table,
                column = %self.columns[index].name,
                length = text.len(),
                max = self.max_cell_length,
                "value too long, written empty"
            );
            return String::new();
        }
        text
    }

    fn open(&mut self) -> Result<()> {
        let existing = self.path.is_file() && std::fs::metadata(&self.path)?.len() > 0;

        if existing {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .from_path(&self.path)?;
            let header: Vec<String> = match reader.records().next() {
                Some(record) => record?.iter().map(str::to_string).collect(),
                None => Vec::new(),
            };
            self.positions = header
                .iter()
                .map(|h| {
                    let name = parse_header(h).0;
                    self.columns
                        .iter()
                        .position(|c| c.name.eq_ignore_ascii_case(name))
                })
                .collect();
            for column in &self.columns {
                if !header
                    .iter()
                    .any(|h| parse_header(h).0.eq_ignore_ascii_case(&column.name))
                {
                    warn!(
                        table = %self.table,
                        column = %column.name,
                        "column not in existing file header, not written"
                    );
                }
            }

            let mut file = OpenOptions::new().read(true).append(true).open(&self.path)?;
            terminate_last_line(&mut file)?;
            self.writer = Some(csv::WriterBuilder::new().from_writer(file));
            debug!(table = %self.table, file = %self.path.display(), "appending");
        } else {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&self.path)?;
            let mut writer = csv::WriterBuilder::new().from_writer(file);
            writer.write_record(self.header())?;
            self.positions = (0..self.columns.len()).map(Some).collect();
            self.writer = Some(writer);
            debug!(table = %self.table, file = %self.path.display(), "created");
        }
        Ok(())
    }
}

/// Add the line break a hand-edited file may lack, so appended rows start
/// on their own line.
fn terminate_last_line(file: &mut File) -> std::io::Result<()> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}
