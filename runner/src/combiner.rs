use crate::{path::Segment, template::artifact_name};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::{
    io,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// columns of a segment output, three coordinates and the energy
pub const OUTPUT_COLUMNS: [&str; 4] = ["kx", "ky", "kz", "E"];
pub const SEGMENT_POINT_COLUMN: &str = "Segment_Point";

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("Output of segment {index} is missing, expected {path}")]
    MissingSegmentOutput { index: usize, path: PathBuf },
    #[error("Output of segment {index} ({path}) line {line}: {reason}")]
    MalformedSegmentOutput {
        index: usize,
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error("Failed to read output of segment {index} ({path}): {source}")]
    Read {
        index: usize,
        path: PathBuf,
        source: csv::Error,
    },
    #[error("Failed to write merged table {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedDataset {
    pub path: PathBuf,
    pub rows: usize,
    /// row index -> waypoint symbol for every tagged row
    pub boundaries: Vec<(usize, String)>,
}

/// Stitches the per-segment tables back together in path order
#[derive(Debug, Clone)]
pub struct ResultCombiner<'a> {
    base: &'a str,
    directory: &'a Path,
}

impl<'a> ResultCombiner<'a> {
    pub fn new(base: &'a str, directory: &'a Path) -> Self {
        Self { base, directory }
    }

    /// where the job of `segment` leaves its table
    pub fn expected_output(&self, segment: &Segment) -> PathBuf {
        self.directory.join(artifact_name(self.base, segment, "csv"))
    }

    /// default location of the merged table, `{title}_combined.csv`
    pub fn default_destination(&self, title: &str) -> PathBuf {
        self.directory.join(format!("{title}_combined.csv"))
    }

    fn read_segment(&self, segment: &Segment, path: &Path) -> Result<Vec<StringRecord>, CombineError> {
        let read_error = |source| CombineError::Read {
            index: segment.index,
            path: path.to_path_buf(),
            source,
        };
        let malformed = |line, reason| CombineError::MalformedSegmentOutput {
            index: segment.index,
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(read_error)?;

        let headers = reader.headers().map_err(read_error)?.clone();
        if headers.iter().ne(OUTPUT_COLUMNS) {
            return Err(malformed(
                1,
                format!("expected columns {OUTPUT_COLUMNS:?}, found {headers:?}"),
            ));
        }

        let mut rows = Vec::new();

        for record in reader.records() {
            let record = record.map_err(read_error)?;
            let line = record.position().map_or(0, |position| position.line());

            if let Some(field) = record.iter().find(|field| field.parse::<f64>().is_err()) {
                return Err(malformed(line, format!("'{field}' is not a number")));
            }

            rows.push(record);
        }

        if rows.is_empty() {
            warn!(segment = segment.index, path = ?path, "Segment output has no rows");
        }

        Ok(rows)
    }

    /// Concatenate all segment outputs in index order into `destination`
    ///
    /// The first and last row of every segment are tagged with the segment's waypoints. Nothing
    /// is written unless every segment output is present and well formed.
    #[instrument(skip(self, segments), fields(segments = segments.len()))]
    pub fn combine(
        &self,
        segments: &[Segment],
        destination: &Path,
    ) -> Result<MergedDataset, CombineError> {
        let mut ordered = segments.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|segment| segment.index);

        let paths = ordered
            .iter()
            .map(|segment| {
                let path = self.expected_output(segment);

                if path.is_file() {
                    Ok(path)
                } else {
                    Err(CombineError::MissingSegmentOutput {
                        index: segment.index,
                        path,
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows: Vec<(StringRecord, &str)> = Vec::new();
        let mut boundaries = Vec::new();

        for (segment, path) in ordered.iter().zip(paths.iter()) {
            let table = self.read_segment(segment, path)?;
            let first = rows.len();
            let count = table.len();

            rows.extend(table.into_iter().map(|record| (record, "")));

            if count > 0 {
                // a single row segment ends up carrying its end point
                rows[first].1 = segment.from.symbol.as_str();
                rows[first + count - 1].1 = segment.to.symbol.as_str();
            }
        }

        let write_error = |source| CombineError::Write {
            path: destination.to_path_buf(),
            source,
        };
        let directory = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(directory).map_err(write_error)?;

        {
            let mut writer = WriterBuilder::new().from_writer(&mut file);
            let csv_error = |error: csv::Error| write_error(io::Error::from(error));

            writer
                .write_record(OUTPUT_COLUMNS.iter().chain([&SEGMENT_POINT_COLUMN]))
                .map_err(csv_error)?;

            for (index, (record, tag)) in rows.iter().enumerate() {
                writer
                    .write_record(record.iter().chain([*tag]))
                    .map_err(csv_error)?;

                if !tag.is_empty() {
                    boundaries.push((index, tag.to_string()));
                }
            }

            writer.flush().map_err(write_error)?;
        }

        file.persist(destination)
            .map_err(|error| write_error(error.error))?;

        info!(path = ?destination, rows = rows.len(), "Combined segment outputs");

        Ok(MergedDataset {
            path: destination.to_path_buf(),
            rows: rows.len(),
            boundaries,
        })
    }
}
