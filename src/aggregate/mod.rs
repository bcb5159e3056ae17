//! Reduction of features into the grid cells of a tile.

pub mod clip;
pub mod degenerate;
pub mod partition;
pub mod post;
pub mod reducer;

pub use degenerate::DegenerateFilter;
pub use partition::{aggregate_cells, cell_geometry};
pub use post::{
    FnPost, LayerPostAggregations, PostAggregation, UnionCount, apply_post_aggregations,
    resolve_post_aggregation,
};
pub use reducer::{
    Accumulator, BuiltinReducer, LayerReducers, ReduceContext, Reducer, ReducerKind,
    aggregate_features, resolve_reducer, weight_property,
};
