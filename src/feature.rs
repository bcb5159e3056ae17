use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use geo_types::Geometry;

use crate::tile::TileCoord;

/// Property holding the cell identifier on every aggregated feature.
pub const QUADKEY_PROPERTY: &str = "_quadKey";

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(value) => Some(*value),
            PropertyValue::String(text) => text.trim().parse().ok(),
            PropertyValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(text) => f.write_str(text),
            PropertyValue::Number(value) => write!(f, "{value}"),
            PropertyValue::Bool(value) => write!(f, "{value}"),
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// A geometry in longitude/latitude degrees with its properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: Geometry<f64>,
    pub properties: Properties,
}

impl Feature {
    pub fn new(geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            geometry: geometry.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.properties.get(field).and_then(PropertyValue::as_f64)
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        self.properties.get(field).and_then(PropertyValue::as_str)
    }
}

/// One grid square produced by aggregation, addressed by its quadkey.
#[derive(Debug, Clone, PartialEq)]
pub struct CellFeature {
    pub cell: TileCoord,
    pub feature: Feature,
}

impl CellFeature {
    pub fn quadkey(&self) -> String {
        self.cell.quadkey()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Unaggregated features that still need clipping into cells.
    Raw,
    /// Grid squares from the next finer level.
    Cells,
}

/// The features of one layer gathered from a tile's children.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerInput {
    Raw(Vec<Feature>),
    Cells(Vec<CellFeature>),
}

impl LayerInput {
    pub fn empty(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Raw => LayerInput::Raw(Vec::new()),
            SourceKind::Cells => LayerInput::Cells(Vec::new()),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            LayerInput::Raw(_) => SourceKind::Raw,
            LayerInput::Cells(_) => SourceKind::Cells,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LayerInput::Raw(features) => features.len(),
            LayerInput::Cells(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `other`. Raw features and grid cells never mix.
    pub fn extend(&mut self, other: LayerInput) -> Result<()> {
        match (self, other) {
            (LayerInput::Raw(features), LayerInput::Raw(more)) => features.extend(more),
            (LayerInput::Cells(cells), LayerInput::Cells(more)) => cells.extend(more),
            (this, other) => anyhow::bail!(
                "cannot merge {:?} input into {:?} input",
                other.kind(),
                this.kind()
            ),
        }
        Ok(())
    }
}
