use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use geo::ChamberlainDuquetteArea;

use crate::error::GridError;
use crate::feature::{Feature, Properties, PropertyValue, SourceKind};
use crate::tile::TileCoord;

/// What a reducer knows about the cell it is folding into.
#[derive(Debug, Clone, Copy)]
pub struct ReduceContext<'a> {
    pub tile: TileCoord,
    pub cell: TileCoord,
    pub source: SourceKind,
    /// Name of the output field being produced.
    pub output: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Empty,
    Number(f64),
    /// Running numerator and denominator of a mean.
    Sum { total: f64, weight: f64 },
    Set(BTreeSet<String>),
}

impl Accumulator {
    pub fn number(&self) -> f64 {
        match self {
            Accumulator::Number(value) => *value,
            _ => 0.0,
        }
    }

    pub fn add(self, value: f64) -> Accumulator {
        Accumulator::Number(self.number() + value)
    }

    pub fn add_weighted(self, total: f64, weight: f64) -> Accumulator {
        match self {
            Accumulator::Sum {
                total: t,
                weight: w,
            } => Accumulator::Sum {
                total: t + total,
                weight: w + weight,
            },
            _ => Accumulator::Sum { total, weight },
        }
    }

    pub fn insert(self, values: impl IntoIterator<Item = String>) -> Accumulator {
        let mut set = match self {
            Accumulator::Set(set) => set,
            _ => BTreeSet::new(),
        };
        set.extend(values);
        Accumulator::Set(set)
    }

    /// How much data went into the accumulator: the number of values, or the
    /// total weight of a weighted mean. Zero when nothing was folded.
    pub fn weight(&self) -> f64 {
        match self {
            Accumulator::Empty => 0.0,
            Accumulator::Number(_) => 1.0,
            Accumulator::Sum { weight, .. } => *weight,
            Accumulator::Set(set) => set.len() as f64,
        }
    }

    pub fn into_value(self) -> PropertyValue {
        match self {
            Accumulator::Empty => PropertyValue::Number(0.0),
            Accumulator::Number(value) => PropertyValue::Number(value),
            Accumulator::Sum { total, weight } => {
                if weight == 0.0 {
                    PropertyValue::Number(0.0)
                } else {
                    PropertyValue::Number(total / weight)
                }
            }
            Accumulator::Set(set) => {
                if set.is_empty() {
                    PropertyValue::String(String::new())
                } else {
                    let items: Vec<String> = set.into_iter().collect();
                    PropertyValue::String(serde_json::to_string(&items).unwrap_or_default())
                }
            }
        }
    }
}

/// A fold over the features of one cell. `fold` is called once per feature in
/// input order, starting from `Accumulator::Empty`; `finish` runs once after.
pub trait Reducer: Send + Sync + fmt::Debug {
    fn fold(
        &self,
        acc: Accumulator,
        feature: &Feature,
        index: usize,
        ctx: &ReduceContext<'_>,
    ) -> Accumulator;

    fn finish(&self, acc: Accumulator) -> PropertyValue {
        acc.into_value()
    }

    /// Whether finished values are strings rather than numbers.
    fn produces_string(&self) -> bool {
        false
    }

    /// Weight stored next to the finished value, so that the next coarser
    /// level can tell empty cells from real zeros. `None` when the finished
    /// value alone is enough to regrid.
    fn weight(&self, _acc: &Accumulator) -> Option<f64> {
        None
    }
}

/// Hidden property carrying the weight of `output` on grid cells.
pub fn weight_property(output: &str) -> String {
    format!("_{output}_weight")
}

/// Output field name to reducer, for one layer.
pub type LayerReducers = BTreeMap<String, Arc<dyn Reducer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReducerKind {
    Sum,
    Count,
    Mean,
    Min,
    Max,
    AreaWeightedSum,
    AreaWeightedMean,
    TotalArea,
    Union,
}

const REDUCERS: &[(&str, ReducerKind)] = &[
    ("sum", ReducerKind::Sum),
    ("count", ReducerKind::Count),
    ("mean", ReducerKind::Mean),
    ("average", ReducerKind::Mean),
    ("min", ReducerKind::Min),
    ("max", ReducerKind::Max),
    ("areaWeightedSum", ReducerKind::AreaWeightedSum),
    ("areaWeightedMean", ReducerKind::AreaWeightedMean),
    ("totalArea", ReducerKind::TotalArea),
    ("union", ReducerKind::Union),
];

impl ReducerKind {
    pub fn names() -> impl Iterator<Item = &'static str> {
        REDUCERS.iter().map(|(name, _)| *name)
    }

    pub fn name(&self) -> &'static str {
        REDUCERS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Whether values of this reducer add up across cells, so that a coarser
    /// cell is the plain sum of its finer cells.
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            ReducerKind::Sum
                | ReducerKind::Count
                | ReducerKind::AreaWeightedSum
                | ReducerKind::TotalArea
        )
    }

    pub fn produces_string(&self) -> bool {
        matches!(self, ReducerKind::Union)
    }

    /// Whether regridding needs each cell's weight next to its value.
    pub fn is_weighted(&self) -> bool {
        matches!(
            self,
            ReducerKind::Mean | ReducerKind::Min | ReducerKind::Max | ReducerKind::AreaWeightedMean
        )
    }
}

impl FromStr for ReducerKind {
    type Err = GridError;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        REDUCERS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| GridError::UnknownReducer(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinReducer {
    pub kind: ReducerKind,
    /// Field read from raw features.
    pub field: String,
}

impl BuiltinReducer {
    pub fn new(kind: ReducerKind, field: &str) -> Self {
        Self {
            kind,
            field: field.to_string(),
        }
    }
}

pub fn resolve_reducer(name: &str, field: &str) -> Result<Arc<dyn Reducer>> {
    let kind: ReducerKind = name.parse()?;
    Ok(Arc::new(BuiltinReducer::new(kind, field)))
}

fn area(feature: &Feature) -> f64 {
    feature.geometry.chamberlain_duquette_unsigned_area()
}

fn union_values(value: &PropertyValue) -> Vec<String> {
    match value {
        PropertyValue::String(text) if text.is_empty() => Vec::new(),
        PropertyValue::String(text) if text.starts_with('[') => {
            match serde_json::from_str::<Vec<serde_json::Value>>(text) {
                Ok(items) => items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(text) => text,
                        other => other.to_string(),
                    })
                    .collect(),
                Err(_) => vec![text.clone()],
            }
        }
        other => vec![other.to_string()],
    }
}

impl Reducer for BuiltinReducer {
    fn fold(
        &self,
        acc: Accumulator,
        feature: &Feature,
        _index: usize,
        ctx: &ReduceContext<'_>,
    ) -> Accumulator {
        // Grid cells carry the previous level's result under the output name.
        let field = match ctx.source {
            SourceKind::Raw => self.field.as_str(),
            SourceKind::Cells => ctx.output,
        };
        if ctx.source == SourceKind::Cells {
            if self.kind.is_additive() {
                return match feature.number(field) {
                    Some(value) => acc.add(value),
                    None => acc,
                };
            }
            if self.kind.is_weighted() {
                return self.fold_cell(acc, feature, ctx.output);
            }
        }
        match self.kind {
            ReducerKind::Sum => match feature.number(field) {
                Some(value) => acc.add(value),
                None => acc,
            },
            ReducerKind::Count => acc.add(1.0),
            ReducerKind::Mean => match feature.number(field) {
                Some(value) => acc.add_weighted(value, 1.0),
                None => acc,
            },
            ReducerKind::Min => match (feature.number(field), &acc) {
                (Some(value), Accumulator::Number(current)) => {
                    Accumulator::Number(current.min(value))
                }
                (Some(value), _) => Accumulator::Number(value),
                (None, _) => acc,
            },
            ReducerKind::Max => match (feature.number(field), &acc) {
                (Some(value), Accumulator::Number(current)) => {
                    Accumulator::Number(current.max(value))
                }
                (Some(value), _) => Accumulator::Number(value),
                (None, _) => acc,
            },
            ReducerKind::AreaWeightedSum => match feature.number(field) {
                Some(value) => acc.add(value * area(feature)),
                None => acc,
            },
            ReducerKind::AreaWeightedMean => match feature.number(field) {
                Some(value) => {
                    let a = area(feature);
                    acc.add_weighted(value * a, a)
                }
                None => acc,
            },
            ReducerKind::TotalArea => acc.add(area(feature)),
            ReducerKind::Union => match feature.properties.get(field) {
                Some(value) => acc.insert(union_values(value)),
                None => acc,
            },
        }
    }

    fn finish(&self, acc: Accumulator) -> PropertyValue {
        match (self.kind, acc) {
            (ReducerKind::Union, Accumulator::Empty) => PropertyValue::String(String::new()),
            (_, acc) => acc.into_value(),
        }
    }

    fn produces_string(&self) -> bool {
        self.kind.produces_string()
    }

    fn weight(&self, acc: &Accumulator) -> Option<f64> {
        self.kind.is_weighted().then(|| acc.weight())
    }
}

impl BuiltinReducer {
    /// Folds a finer cell's finished value, weighted by the data behind it.
    /// Cells without a stored weight count once.
    fn fold_cell(&self, acc: Accumulator, cell: &Feature, output: &str) -> Accumulator {
        let weight = cell.number(&weight_property(output)).unwrap_or(1.0);
        if weight <= 0.0 {
            return acc;
        }
        let Some(value) = cell.number(output) else {
            return acc;
        };
        match self.kind {
            ReducerKind::Mean | ReducerKind::AreaWeightedMean => {
                acc.add_weighted(value * weight, weight)
            }
            ReducerKind::Min => match acc {
                Accumulator::Number(current) => Accumulator::Number(current.min(value)),
                _ => Accumulator::Number(value),
            },
            ReducerKind::Max => match acc {
                Accumulator::Number(current) => Accumulator::Number(current.max(value)),
                _ => Accumulator::Number(value),
            },
            _ => acc,
        }
    }
}

/// Folds `features` through every reducer of a layer and returns the finished
/// properties, keyed by output field.
pub fn aggregate_features(
    features: &[&Feature],
    reducers: &LayerReducers,
    tile: TileCoord,
    cell: TileCoord,
    source: SourceKind,
) -> Properties {
    let mut properties = Properties::new();
    for (output, reducer) in reducers.iter() {
        let ctx = ReduceContext {
            tile,
            cell,
            source,
            output,
        };
        let mut acc = Accumulator::Empty;
        for (index, feature) in features.iter().enumerate() {
            acc = reducer.fold(acc, feature, index, &ctx);
        }
        if let Some(weight) = reducer.weight(&acc) {
            properties.insert(weight_property(output), PropertyValue::Number(weight));
        }
        properties.insert(output.clone(), reducer.finish(acc));
    }
    properties
}
