use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// lines in front of the dispersion table written by the post-processor
pub const HEADER_LINES: usize = 5;
pub const ASCII_EXTENSION: &str = "nd_Ek_ascii";
pub const CSV_EXTENSION: &str = "csv";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Expected a .{ASCII_EXTENSION} file, got {0}")]
    UnexpectedInput(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Line {line}: expected 4 columns, found {found}")]
    ColumnCount { line: usize, found: usize },
    #[error("Line {line}: '{value}' is not a number")]
    NotANumber { line: usize, value: String },
    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("Failed to encode row: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
/// One k-point of a band structure and its energy
pub struct DispersionRow {
    pub kx: f64,
    pub ky: f64,
    pub kz: f64,
    #[serde(rename = "E")]
    pub energy: f64,
}

/// Parse the whitespace separated dispersion table, skipping the header block
///
/// Blank lines are ignored. Line numbers in errors are 1-based and count the header.
pub fn parse_ascii(content: &str) -> Result<Vec<DispersionRow>, IngestError> {
    let mut rows = Vec::new();

    for (index, line) in content.lines().enumerate().skip(HEADER_LINES) {
        let line_number = index + 1;
        let columns: Vec<&str> = line.split_whitespace().collect();

        if columns.is_empty() {
            continue;
        }

        if columns.len() != 4 {
            return Err(IngestError::ColumnCount {
                line: line_number,
                found: columns.len(),
            });
        }

        let mut values = [0.0; 4];
        for (value, column) in values.iter_mut().zip(&columns) {
            *value = column.parse().map_err(|_| IngestError::NotANumber {
                line: line_number,
                value: (*column).to_owned(),
            })?;
        }

        let [kx, ky, kz, energy] = values;
        rows.push(DispersionRow { kx, ky, kz, energy });
    }

    debug!(rows = rows.len(), "Parsed dispersion table");

    Ok(rows)
}

/// Write `rows` with a `kx,ky,kz,E` header to `destination`, replacing it atomically
pub fn write_csv(rows: &[DispersionRow], destination: &Path) -> Result<(), IngestError> {
    let write_error = |source| IngestError::Write {
        path: destination.to_path_buf(),
        source,
    };
    let directory = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = NamedTempFile::new_in(directory).map_err(write_error)?;
    {
        let mut writer = csv::Writer::from_writer(&mut file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(write_error)?;
    }
    file.persist(destination)
        .map_err(|error| write_error(error.error))?;

    Ok(())
}

/// Convert `{stem}.nd_Ek_ascii` into `{stem}.csv` next to it, returns the written path
pub fn convert(path: &Path) -> Result<PathBuf, IngestError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let Some(stem) = name.strip_suffix(&format!(".{ASCII_EXTENSION}")) else {
        return Err(IngestError::UnexpectedInput(path.to_path_buf()));
    };

    let content = fs::read_to_string(path).map_err(|source| IngestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let rows = parse_ascii(&content)?;

    let destination = path.with_file_name(format!("{stem}.{CSV_EXTENSION}"));
    write_csv(&rows, &destination)?;

    info!(path = ?destination, rows = rows.len(), "Converted dispersion table");

    Ok(destination)
}
