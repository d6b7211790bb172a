use crate::path::{Coordinate, Segment, Waypoint};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::{self, BufReader, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "args.json";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to access manifest {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Manifest {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Manifest lists {symbols} waypoints for {pairs} segments")]
    Inconsistent { symbols: usize, pairs: usize },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
/// Durable record of a decomposed path, read and extended by downstream analysis
pub struct PathManifest {
    pub title: String,
    pub symbolic_path: Vec<String>,
    pub coordinate_representation: Vec<[Coordinate; 2]>,
    // fields added by other tools, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PathManifest {
    pub fn new(title: String, segments: &[Segment]) -> Self {
        let symbolic_path = segments
            .first()
            .map(|first| first.from.symbol.clone())
            .into_iter()
            .chain(segments.iter().map(|segment| segment.to.symbol.clone()))
            .collect();

        Self {
            title,
            symbolic_path,
            coordinate_representation: segments
                .iter()
                .map(|segment| [*segment.start(), *segment.end()])
                .collect(),
            extra: Map::new(),
        }
    }

    /// Rebuild the segments the manifest was written for
    pub fn segments(&self) -> Result<Vec<Segment>, ManifestError> {
        let pairs = self.coordinate_representation.len();

        if pairs == 0 || self.symbolic_path.len() != pairs + 1 {
            return Err(ManifestError::Inconsistent {
                symbols: self.symbolic_path.len(),
                pairs,
            });
        }

        Ok(self
            .coordinate_representation
            .iter()
            .enumerate()
            .map(|(index, [start, end])| Segment {
                index,
                from: Waypoint {
                    symbol: self.symbolic_path[index].clone(),
                    coordinate: *start,
                },
                to: Waypoint {
                    symbol: self.symbolic_path[index + 1].clone(),
                    coordinate: *end,
                },
            })
            .collect())
    }

    pub fn path(directory: &Path) -> PathBuf {
        directory.join(MANIFEST_FILE)
    }

    pub fn read(directory: &Path) -> Result<Self, ManifestError> {
        let path = Self::path(directory);
        let file = File::open(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;

        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| ManifestError::Json { path, source })
    }

    const FIELDS: [&'static str; 3] = ["title", "symbolic_path", "coordinate_representation"];

    fn read_fields(path: &Path) -> Result<Map<String, Value>, ManifestError> {
        let file = File::open(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_reader(BufReader::new(file)).map_err(|source| ManifestError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write `args.json` into `directory`, keeping fields other tools added to an earlier manifest
    pub fn write(&mut self, directory: &Path) -> Result<PathBuf, ManifestError> {
        let path = Self::path(directory);

        if path.is_file() {
            // only the extra fields are kept, so the known ones may have any shape
            match Self::read_fields(&path) {
                Ok(previous) => {
                    for (key, value) in previous {
                        if !Self::FIELDS.contains(&key.as_str()) {
                            self.extra.entry(key).or_insert(value);
                        }
                    }
                }
                Err(error) => warn!("Replacing unreadable manifest: {error}"),
            }
        }

        let io_error = |source| ManifestError::Io {
            path: path.clone(),
            source,
        };
        let mut file = NamedTempFile::new_in(directory).map_err(io_error)?;

        serde_json::to_writer_pretty(&mut file, self).map_err(|source| ManifestError::Json {
            path: path.clone(),
            source,
        })?;
        file.write_all(b"\n").map_err(io_error)?;
        file.persist(&path)
            .map_err(|error| io_error(error.error))?;

        info!(path = ?path, "Path information saved");

        Ok(path)
    }
}
