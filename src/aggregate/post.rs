use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::error::GridError;
use crate::feature::{Feature, PropertyValue};
use crate::tile::TileCoord;

/// Derives a field from a finished cell. Runs after every reducer of the
/// layer; its result overrides any reduced value of the same name.
pub trait PostAggregation: Send + Sync + fmt::Debug {
    fn derive(&self, cell: &Feature, tile: TileCoord) -> PropertyValue;
}

/// Output field name to post-aggregation, for one layer.
pub type LayerPostAggregations = BTreeMap<String, Arc<dyn PostAggregation>>;

/// Adapts a closure into a [`PostAggregation`].
pub struct FnPost<F>
where
    F: Fn(&Feature, TileCoord) -> PropertyValue + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnPost<F>
where
    F: Fn(&Feature, TileCoord) -> PropertyValue + Send + Sync,
{
    pub fn new(name: &str, func: F) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnPost<F>
where
    F: Fn(&Feature, TileCoord) -> PropertyValue + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPost").field("name", &self.name).finish()
    }
}

impl<F> PostAggregation for FnPost<F>
where
    F: Fn(&Feature, TileCoord) -> PropertyValue + Send + Sync,
{
    fn derive(&self, cell: &Feature, tile: TileCoord) -> PropertyValue {
        (self.func)(cell, tile)
    }
}

/// Number of entries in a union field (a JSON array string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionCount {
    pub field: String,
}

impl PostAggregation for UnionCount {
    fn derive(&self, cell: &Feature, _tile: TileCoord) -> PropertyValue {
        let count = cell
            .string(&self.field)
            .and_then(|text| serde_json::from_str::<Vec<serde_json::Value>>(text).ok())
            .map(|items| items.len())
            .unwrap_or(0);
        PropertyValue::Number(count as f64)
    }
}

pub fn resolve_post_aggregation(name: &str, field: &str) -> Result<Arc<dyn PostAggregation>> {
    match name {
        "unionCount" => Ok(Arc::new(UnionCount {
            field: field.to_string(),
        })),
        _ => Err(GridError::UnknownPostAggregation(name.to_string()).into()),
    }
}

/// Applies every post-aggregation of a layer to `cell` in field order.
pub fn apply_post_aggregations(
    cell: &mut Feature,
    tile: TileCoord,
    posts: &LayerPostAggregations,
) {
    let derived: Vec<(String, PropertyValue)> = posts
        .iter()
        .map(|(field, post)| (field.clone(), post.derive(cell, tile)))
        .collect();
    cell.properties.extend(derived);
}
