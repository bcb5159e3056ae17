use std::collections::HashMap;

use anyhow::Result;
use geo::BoundingRect;
use geo_types::{Geometry, Rect, coord};
use rstar::{AABB, RTree, RTreeObject};

use crate::aggregate::clip::{clip_to_rect, project, unproject};
use crate::aggregate::degenerate::DegenerateFilter;
use crate::aggregate::post::{LayerPostAggregations, apply_post_aggregations};
use crate::aggregate::reducer::{LayerReducers, aggregate_features};
use crate::feature::{CellFeature, Feature, LayerInput, Properties, QUADKEY_PROPERTY};
use crate::tile::{TileCoord, progeny};

/// Envelope of one projected feature, pointing back at it by index.
#[derive(Debug, Clone)]
struct IndexedEnvelope {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Splits `tile` into `4^depth` cells and reduces `input` into each of them.
///
/// The result has one entry per cell, in `progeny` order, including cells no
/// feature reached.
pub fn aggregate_cells(
    input: &LayerInput,
    tile: TileCoord,
    depth: u8,
    reducers: &LayerReducers,
    posts: Option<&LayerPostAggregations>,
) -> Result<Vec<CellFeature>> {
    let cells = progeny(tile, tile.zoom + depth);
    let grouped = match input {
        LayerInput::Cells(features) => group_by_cell(features, &cells),
        LayerInput::Raw(features) => clip_into_cells(features, &cells)?,
    };
    let source = input.kind();

    let mut output = Vec::with_capacity(cells.len());
    for (i, cell) in cells.iter().enumerate() {
        let filter = DegenerateFilter::new(*cell);
        let mut members: Vec<&Feature> = Vec::new();
        if let Some(candidates) = grouped.get(&i) {
            for feature in candidates.iter() {
                if filter.keep(feature)? {
                    members.push(feature);
                }
            }
        }
        let properties = aggregate_features(&members, reducers, tile, *cell, source);
        output.push(make_cell(*cell, tile, properties, posts));
    }
    Ok(output)
}

fn make_cell(
    cell: TileCoord,
    tile: TileCoord,
    properties: Properties,
    posts: Option<&LayerPostAggregations>,
) -> CellFeature {
    let mut feature = Feature {
        geometry: cell_geometry(cell),
        properties,
    };
    if let Some(posts) = posts {
        apply_post_aggregations(&mut feature, tile, posts);
    }
    feature
        .properties
        .insert(QUADKEY_PROPERTY.to_string(), cell.quadkey().into());
    CellFeature { cell, feature }
}

/// The square covering `cell`, in degrees.
pub fn cell_geometry(cell: TileCoord) -> Geometry<f64> {
    let b = cell.bounds();
    Geometry::Polygon(
        Rect::new(
            coord! { x: b.west, y: b.south },
            coord! { x: b.east, y: b.north },
        )
        .to_polygon(),
    )
}

fn group_by_cell(features: &[CellFeature], cells: &[TileCoord]) -> HashMap<usize, Vec<Feature>> {
    let positions: HashMap<TileCoord, usize> =
        cells.iter().enumerate().map(|(i, cell)| (*cell, i)).collect();
    let Some(grid_zoom) = cells.first().map(|cell| cell.zoom) else {
        return HashMap::new();
    };
    let mut grouped: HashMap<usize, Vec<Feature>> = HashMap::new();
    for feature in features.iter() {
        let position = feature
            .cell
            .ancestor_at(grid_zoom)
            .and_then(|parent| positions.get(&parent));
        match position {
            Some(position) => grouped
                .entry(*position)
                .or_default()
                .push(feature.feature.clone()),
            None => tracing::debug!("cell {} is outside the grid at z{}", feature.cell, grid_zoom),
        }
    }
    grouped
}

fn clip_into_cells(
    features: &[Feature],
    cells: &[TileCoord],
) -> Result<HashMap<usize, Vec<Feature>>> {
    let projected: Vec<Geometry<f64>> = features.iter().map(|f| project(&f.geometry)).collect();
    let envelopes: Vec<IndexedEnvelope> = projected
        .iter()
        .enumerate()
        .filter_map(|(index, geometry)| {
            geometry.bounding_rect().map(|rect| IndexedEnvelope {
                index,
                envelope: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
            })
        })
        .collect();
    let tree = RTree::bulk_load(envelopes);

    let mut grouped: HashMap<usize, Vec<Feature>> = HashMap::new();
    for (position, cell) in cells.iter().enumerate() {
        let rect = cell.world_rect();
        let query = AABB::from_corners([rect.min_x, rect.min_y], [rect.max_x, rect.max_y]);
        let mut hits: Vec<usize> = tree
            .locate_in_envelope_intersecting(&query)
            .map(|entry| entry.index)
            .collect();
        // Keep the input order so reducers fold deterministically.
        hits.sort_unstable();
        for index in hits {
            if let Some(clipped) = clip_to_rect(&projected[index], &rect)? {
                grouped.entry(position).or_default().push(Feature {
                    geometry: unproject(&clipped),
                    properties: features[index].properties.clone(),
                });
            }
        }
    }
    Ok(grouped)
}
