use itertools::Itertools;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Point in reciprocal space (kx, ky, kz)
pub type Coordinate = [f64; 3];

/// map of symbol -> coordinate
pub type SymmetryPoints = BTreeMap<String, Coordinate>;

/// Symmetry points of an fcc Brillouin zone, with 2π/a taken as 1
pub static DEFAULT_SYMMETRY_POINTS: Lazy<SymmetryPoints> = Lazy::new(|| {
    [
        ("Γ", [0.0, 0.0, 0.0]),
        ("X", [0.0, 2.0, 0.0]),
        ("L", [1.0, 1.0, 1.0]),
        ("W", [1.0, 2.0, 0.0]),
        ("U", [0.5, 2.0, 0.5]),
        ("K", [1.5, 1.5, 0.0]),
    ]
    .into_iter()
    .map(|(symbol, coordinate)| (symbol.to_owned(), coordinate))
    .collect()
});

/// ASCII stand-in for Γ accepted on the command line
pub const GAMMA_ALIAS: &str = "G";
pub const GAMMA: &str = "Γ";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathError {
    #[error("Waypoint '{name}' at position {position} is not a known symmetry point")]
    UnknownWaypoint { name: String, position: usize },
    #[error("A path needs at least 2 resolvable waypoints, found {0}")]
    PathTooShort(usize),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Waypoint {
    pub symbol: String,
    pub coordinate: Coordinate,
}

#[derive(Clone, Debug, PartialEq)]
/// One independent unit of computation between two consecutive waypoints
pub struct Segment {
    pub index: usize,
    pub from: Waypoint,
    pub to: Waypoint,
}

impl Segment {
    pub fn start(&self) -> &Coordinate {
        &self.from.coordinate
    }

    pub fn end(&self) -> &Coordinate {
        &self.to.coordinate
    }

    /// `{start}to{end}` with underscore separated components, e.g. `0_0_0to0_2_0`
    pub fn encoded(&self) -> String {
        format!(
            "{}to{}",
            encode_coordinate(self.start(), "_"),
            encode_coordinate(self.end(), "_")
        )
    }
}

/// Integral components are written without a fraction (`2`, not `2.0`)
pub fn format_component(value: f64) -> String {
    if value == 0.0 {
        // also folds -0 into 0
        "0".to_owned()
    } else {
        format!("{value}")
    }
}

pub fn encode_coordinate(coordinate: &Coordinate, separator: &str) -> String {
    coordinate
        .iter()
        .map(|component| format_component(*component))
        .join(separator)
}

/// Split a user supplied path like `G,X,L` into waypoint names
pub fn parse_path(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            if name == GAMMA_ALIAS {
                GAMMA.to_owned()
            } else {
                name.to_owned()
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PathDecomposer<'a> {
    points: &'a SymmetryPoints,
}

impl<'a> PathDecomposer<'a> {
    pub fn new(points: &'a SymmetryPoints) -> Self {
        Self { points }
    }

    /// resolve names into waypoints, unknown names are reported and skipped
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> (Vec<Waypoint>, Vec<PathError>) {
        let mut waypoints = Vec::with_capacity(names.len());
        let mut skipped = Vec::new();

        for (position, name) in names.iter().map(AsRef::as_ref).enumerate() {
            match self.points.get(name) {
                Some(coordinate) => waypoints.push(Waypoint {
                    symbol: name.to_owned(),
                    coordinate: *coordinate,
                }),
                None => {
                    let error = PathError::UnknownWaypoint {
                        name: name.to_owned(),
                        position,
                    };
                    warn!(waypoint = name, position, "{error}, skipping");
                    skipped.push(error);
                }
            }
        }

        (waypoints, skipped)
    }

    /// Pair consecutive resolvable waypoints into segments
    pub fn decompose<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Segment>, PathError> {
        let (waypoints, _) = self.resolve(names);

        if waypoints.len() < 2 {
            return Err(PathError::PathTooShort(waypoints.len()));
        }

        let segments = waypoints
            .into_iter()
            .tuple_windows()
            .enumerate()
            .map(|(index, (from, to))| Segment { index, from, to })
            .collect_vec();

        debug!(segments = segments.len(), "Decomposed path");

        Ok(segments)
    }
}
