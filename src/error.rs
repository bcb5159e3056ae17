use thiserror::Error;

/// Failures the grid builder can name. Everything else (SQLite, gzip, MVT
/// decoding) travels as plain `anyhow` context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("gridsize must be a power of 4, got {0}")]
    InvalidGridSize(u32),

    #[error("unknown reducer: {0}")]
    UnknownReducer(String),

    #[error("unknown post-aggregation: {0}")]
    UnknownPostAggregation(String),

    #[error("invalid field spec '{0}', expected layer:reducer(field)")]
    InvalidFieldSpec(String),

    #[error("basezoom of each stage must match minzoom of the previous stage ({basezoom} != {minzoom})")]
    ZoomRangeMismatch { basezoom: u8, minzoom: u8 },

    #[error("invalid zoom range: {0}")]
    InvalidZoomRange(String),

    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometry(&'static str),

    #[error("invalid quadkey: {0}")]
    InvalidQuadkey(String),

    #[error("grid cell in layer '{0}' has no _quadKey property")]
    MissingQuadkey(String),

    #[error("invalid tile {zoom}/{x}/{y}")]
    InvalidTile { zoom: u8, x: u32, y: u32 },

    #[error("worker {worker} failed: {message}")]
    WorkerFailed { worker: usize, message: String },
}
