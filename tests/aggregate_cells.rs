use geo_types::{Point, Polygon, Rect, coord};

use vt_grid::aggregate::{LayerReducers, aggregate_cells, resolve_reducer};
use vt_grid::feature::{CellFeature, Feature, LayerInput, QUADKEY_PROPERTY};
use vt_grid::tile::{TileCoord, progeny, world_to_lng_lat};

fn reducers(specs: &[(&str, &str, &str)]) -> LayerReducers {
    specs
        .iter()
        .map(|(output, name, field)| {
            (output.to_string(), resolve_reducer(name, field).expect("reducer"))
        })
        .collect()
}

/// Point at fractional position (fx, fy) inside `tile`.
fn point_in(tile: TileCoord, fx: f64, fy: f64) -> Point<f64> {
    let rect = tile.world_rect();
    let (lng, lat) = world_to_lng_lat(
        rect.min_x + (rect.max_x - rect.min_x) * fx,
        rect.min_y + (rect.max_y - rect.min_y) * fy,
    );
    Point::new(lng, lat)
}

fn block(tile: TileCoord, fx0: f64, fy0: f64, fx1: f64, fy1: f64) -> Polygon<f64> {
    let a = point_in(tile, fx0, fy0);
    let b = point_in(tile, fx1, fy1);
    Rect::new(coord! { x: a.x(), y: a.y() }, coord! { x: b.x(), y: b.y() }).to_polygon()
}

/// Points that never sit on a power-of-two cell edge.
fn scattered_points(tile: TileCoord, count: usize) -> Vec<Feature> {
    (0..count)
        .map(|i| {
            let fx = (((i * 7 + 3) % 101) as f64 + 0.3) / 101.0;
            let fy = (((i * 13 + 5) % 101) as f64 + 0.3) / 101.0;
            Feature::new(point_in(tile, fx, fy)).with_property("value", (i % 5 + 1) as f64)
        })
        .collect()
}

fn total(cells: &[CellFeature], field: &str) -> f64 {
    cells
        .iter()
        .map(|cell| cell.feature.number(field).unwrap_or(0.0))
        .sum()
}

#[test]
fn produces_one_cell_per_grid_square() {
    let tile = TileCoord::new(14, 9631, 8139).expect("tile");
    let features = vec![
        Feature::new(block(tile, 0.1, 0.1, 0.6, 0.4)).with_property("densitypph", 1.5),
        Feature::new(block(tile, 0.3, 0.2, 0.9, 0.95)).with_property("densitypph", 0.25),
        Feature::new(block(tile, 0.55, 0.05, 0.7, 0.5)).with_property("densitypph", 2.0),
    ];
    let reducers = reducers(&[("densitypph", "areaWeightedMean", "densitypph")]);
    let cells = aggregate_cells(&LayerInput::Raw(features), tile, 5, &reducers, None)
        .expect("aggregate");

    assert_eq!(cells.len(), 1024);
    let expected = progeny(tile, 19);
    for (cell, expected) in cells.iter().zip(expected.iter()) {
        assert_eq!(cell.cell, *expected);
        assert_eq!(
            cell.feature.string(QUADKEY_PROPERTY),
            Some(expected.quadkey().as_str())
        );
        let density = cell.feature.number("densitypph").expect("density");
        assert!((0.0..=2.0 + 1e-9).contains(&density), "{density}");
    }
    assert!(cells.iter().any(|cell| cell.feature.number("densitypph") == Some(2.0)));
    assert!(cells.iter().any(|cell| cell.feature.number("densitypph") == Some(0.0)));
}

#[test]
fn cell_geometry_is_the_cell_box() {
    let tile = TileCoord::new(8, 70, 100).expect("tile");
    let reducers = reducers(&[("count", "count", "")]);
    let cells = aggregate_cells(&LayerInput::Raw(Vec::new()), tile, 1, &reducers, None)
        .expect("aggregate");
    assert_eq!(cells.len(), 4);
    for cell in cells.iter() {
        let b = cell.cell.bounds();
        let expected: Polygon<f64> =
            Rect::new(coord! { x: b.west, y: b.south }, coord! { x: b.east, y: b.north }).to_polygon();
        assert_eq!(cell.feature.geometry, expected.into());
        assert_eq!(cell.feature.number("count"), Some(0.0));
    }
}

#[test]
fn points_land_in_exactly_one_cell() {
    let tile = TileCoord::new(11, 600, 770).expect("tile");
    let features = scattered_points(tile, 40);
    let expected: f64 = features.iter().filter_map(|f| f.number("value")).sum();
    let reducers = reducers(&[("value", "sum", "value"), ("count", "count", "")]);
    let cells = aggregate_cells(&LayerInput::Raw(features), tile, 3, &reducers, None)
        .expect("aggregate");
    assert_eq!(cells.len(), 64);
    assert!((total(&cells, "value") - expected).abs() < 1e-9);
    assert_eq!(total(&cells, "count"), 40.0);
}

#[test]
fn features_outside_the_tile_are_ignored() {
    let tile = TileCoord::new(11, 600, 770).expect("tile");
    let neighbour = TileCoord::new(11, 602, 770).expect("tile");
    let features = scattered_points(neighbour, 10);
    let reducers = reducers(&[("value", "sum", "value")]);
    let cells = aggregate_cells(&LayerInput::Raw(features), tile, 2, &reducers, None)
        .expect("aggregate");
    assert_eq!(total(&cells, "value"), 0.0);
}

#[test]
fn regridding_cells_matches_aggregating_raw_features() {
    let tile = TileCoord::new(9, 150, 190).expect("tile");
    let depth = 3;
    let features = scattered_points(tile, 60);
    let reducers = reducers(&[("value", "sum", "value"), ("count", "count", "")]);

    let direct = aggregate_cells(&LayerInput::Raw(features.clone()), tile, depth, &reducers, None)
        .expect("direct");

    let mut finer = Vec::new();
    for child in tile.children() {
        let cells = aggregate_cells(&LayerInput::Raw(features.clone()), child, depth, &reducers, None)
            .expect("child");
        finer.extend(cells);
    }
    assert_eq!(finer.len(), 4 * 64);
    let regridded = aggregate_cells(&LayerInput::Cells(finer), tile, depth, &reducers, None)
        .expect("regrid");

    assert_eq!(direct.len(), regridded.len());
    for (a, b) in direct.iter().zip(regridded.iter()) {
        assert_eq!(a.cell, b.cell);
        for field in ["value", "count"] {
            let x = a.feature.number(field).expect("direct value");
            let y = b.feature.number(field).expect("regridded value");
            assert!((x - y).abs() < 1e-6, "{} {field}: {x} != {y}", a.cell);
        }
    }
}

#[test]
fn empty_cells_do_not_dilute_non_additive_fields() {
    let coarse_tile = TileCoord::new(10, 300, 400).expect("tile");
    let child = TileCoord::new(12, 1200, 1600).expect("child");
    let features = vec![Feature::new(point_in(child, 0.3, 0.3)).with_property("v", 10.0)];
    let reducers = reducers(&[
        ("mean", "mean", "v"),
        ("min", "min", "v"),
        ("max", "max", "v"),
        ("weighted", "areaWeightedMean", "v"),
    ]);

    let finer = aggregate_cells(&LayerInput::Raw(features.clone()), child, 1, &reducers, None)
        .expect("child");
    assert_eq!(finer.iter().filter(|cell| cell.feature.number("mean") == Some(10.0)).count(), 1);

    let direct = aggregate_cells(&LayerInput::Raw(features), coarse_tile, 1, &reducers, None)
        .expect("direct");
    let regridded = aggregate_cells(&LayerInput::Cells(finer), coarse_tile, 1, &reducers, None)
        .expect("regrid");

    assert_eq!(direct[0].feature.number("mean"), Some(10.0));
    assert_eq!(regridded[0].feature.number("mean"), Some(10.0));
    assert_eq!(regridded[0].feature.number("min"), Some(10.0));
    assert_eq!(regridded[0].feature.number("max"), Some(10.0));
    assert_eq!(regridded[0].feature.number("weighted"), Some(0.0));
    for cell in regridded[1..].iter() {
        assert_eq!(cell.feature.number("mean"), Some(0.0));
        assert_eq!(cell.feature.number("_mean_weight"), Some(0.0));
    }
}

#[test]
fn regridded_means_weigh_cells_by_their_data() {
    let tile = TileCoord::new(9, 150, 190).expect("tile");
    let depth = 2;
    let features = scattered_points(tile, 50);
    let reducers = reducers(&[("mean", "mean", "value"), ("min", "min", "value")]);

    let direct = aggregate_cells(&LayerInput::Raw(features.clone()), tile, depth, &reducers, None)
        .expect("direct");
    let mut finer = Vec::new();
    for child in tile.children() {
        finer.extend(
            aggregate_cells(&LayerInput::Raw(features.clone()), child, depth, &reducers, None)
                .expect("child"),
        );
    }
    let regridded = aggregate_cells(&LayerInput::Cells(finer), tile, depth, &reducers, None)
        .expect("regrid");

    for (a, b) in direct.iter().zip(regridded.iter()) {
        for field in ["mean", "min"] {
            let x = a.feature.number(field).expect("direct value");
            let y = b.feature.number(field).expect("regridded value");
            assert!((x - y).abs() < 1e-9, "{} {field}: {x} != {y}", a.cell);
        }
    }
}
