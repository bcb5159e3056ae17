use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use geo_types::Point;

use vt_grid::aggregate::resolve_reducer;
use vt_grid::config::{GridConfig, JobStack};
use vt_grid::error::GridError;
use vt_grid::feature::{Feature, SourceKind};
use vt_grid::mbtiles::{
    MbtilesReader, MbtilesWriter, decode_cells, encode_features, encode_tile_payload,
};
use vt_grid::pyramid::{BuildOptions, LevelBuilder, NoProgress, build_grid};
use vt_grid::tile::{TileCoord, ancestor_levels, lng_lat_to_world, world_to_lng_lat};

const BASEZOOM: u8 = 12;

fn leaves() -> Vec<TileCoord> {
    let mut tiles = Vec::new();
    for a in 0..3u32 {
        for b in 0..4u32 {
            tiles.push(TileCoord::new(BASEZOOM, 1170 + a * 37, 1560 + b * 29).expect("tile"));
        }
    }
    tiles.push(TileCoord::new(BASEZOOM, 1171, 1561).expect("tile"));
    tiles
}

/// Points kept clear of every power-of-two edge inside `tile`, so each lands
/// in exactly one grid cell.
fn points_in(tile: TileCoord, count: usize, seed: usize) -> Vec<Feature> {
    let rect = tile.world_rect();
    (0..count)
        .map(|i| {
            let fx = (((seed + i * 7 + 3) % 101) as f64 + 0.3) / 101.0;
            let fy = (((seed * 3 + i * 13 + 5) % 101) as f64 + 0.3) / 101.0;
            let (lng, lat) = world_to_lng_lat(
                rect.min_x + (rect.max_x - rect.min_x) * fx,
                rect.min_y + (rect.max_y - rect.min_y) * fy,
            );
            Feature::new(Point::new(lng, lat)).with_property("data", ((seed + i) % 7 + 1) as f64)
        })
        .collect()
}

/// Writes a source MBTiles with one `dc` layer per tile and returns the sum of
/// every `data` value.
fn create_source(path: &Path) -> f64 {
    let conn = rusqlite::Connection::open(path).expect("open");
    conn.execute_batch(
        "
        CREATE TABLE metadata (name TEXT, value TEXT);
        CREATE TABLE tiles (
            zoom_level INTEGER,
            tile_column INTEGER,
            tile_row INTEGER,
            tile_data BLOB
        );
        ",
    )
    .expect("schema");
    conn.execute(
        "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
        ("json", r#"{"vector_layers":[{"id":"dc","fields":{"data":"Number"}}]}"#),
    )
    .expect("metadata");

    let mut total = 0.0;
    for (seed, tile) in leaves().into_iter().enumerate() {
        let features = points_in(tile, 5, seed);
        total += features.iter().filter_map(|f| f.number("data")).sum::<f64>();
        let mut layers = BTreeMap::new();
        layers.insert("dc".to_string(), features);
        let data = encode_tile_payload(&encode_features(tile, &layers).expect("encode"))
            .expect("gzip");
        let row = (1u32 << tile.zoom) - 1 - tile.y;
        conn.execute(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
            (tile.zoom, tile.x, row, data),
        )
        .expect("tile");
    }
    total
}

/// `data` of every cell at `zoom`, keyed by quadkey.
fn cells_at(path: &Path, zoom: u8) -> BTreeMap<String, f64> {
    field_at(path, zoom, "data")
}

/// `field` of every cell at `zoom`, keyed by quadkey.
fn field_at(path: &Path, zoom: u8, field: &str) -> BTreeMap<String, f64> {
    let reader = MbtilesReader::open(path).expect("open output");
    let layers: BTreeSet<String> = ["dc".to_string()].into_iter().collect();
    let mut values = BTreeMap::new();
    for tile in reader.list_tiles(zoom).expect("list") {
        let data = reader.get_tile(tile).expect("get").expect("stored tile");
        let decoded = decode_cells(&data, tile, &layers).expect("decode cells");
        let cells = decoded.get("dc").expect("dc layer");
        for cell in cells.iter() {
            values.insert(cell.quadkey(), cell.feature.number(field).unwrap_or(0.0));
        }
    }
    values
}

/// `data` values of the source points, grouped by the quadkey of the cell at
/// `cell_zoom` that contains each point.
fn point_values_by_cell(cell_zoom: u8) -> BTreeMap<String, Vec<f64>> {
    let scale = (1u64 << cell_zoom) as f64;
    let mut cells: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (seed, tile) in leaves().into_iter().enumerate() {
        for feature in points_in(tile, 5, seed) {
            let geo_types::Geometry::Point(point) = &feature.geometry else {
                panic!("fixture features are points");
            };
            let (wx, wy) = lng_lat_to_world(point.x(), point.y());
            let cell = TileCoord::new(cell_zoom, (wx * scale) as u32, (wy * scale) as u32)
                .expect("cell");
            cells
                .entry(cell.quadkey())
                .or_default()
                .push(feature.number("data").expect("data"));
        }
    }
    cells
}

fn sum_stack(gridsize: u32, jobs: usize) -> JobStack {
    let config = GridConfig::builder(BASEZOOM)
        .minzoom(1)
        .gridsize(gridsize)
        .jobs(jobs)
        .write_batch(3)
        .field("dc:sum(data)")
        .expect("field")
        .build()
        .expect("config");
    JobStack::single(config)
}

fn options() -> BuildOptions {
    BuildOptions {
        progress: false,
        name: Some("dc grid".to_string()),
    }
}

#[test]
fn sum_is_preserved_at_every_level() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    let expected = create_source(&input);

    let stats = build_grid(&input, &output, &sum_stack(64, 4), &options()).expect("build");
    assert_eq!(stats.base_tiles, leaves().len() as u64);
    assert_eq!(stats.minzoom, 1);
    assert_eq!(stats.maxzoom, BASEZOOM);

    let reader = MbtilesReader::open(&output).expect("open output");
    assert!(reader.list_tiles(0).expect("list z0").is_empty());
    assert_eq!(reader.list_tiles(BASEZOOM).expect("list base"), {
        let mut tiles = leaves();
        tiles.sort();
        tiles
    });

    for zoom in 1..BASEZOOM {
        let tiles = reader.list_tiles(zoom).expect("list");
        assert!(!tiles.is_empty(), "no tiles at z{zoom}");
        let cells = cells_at(&output, zoom);
        assert_eq!(cells.len(), tiles.len() * 64, "cells at z{zoom}");
        assert!(cells.keys().all(|key| key.len() == zoom as usize + 3));
        let total: f64 = cells.values().sum();
        assert!((total - expected).abs() < 1e-6, "z{zoom}: {total} != {expected}");
    }
}

#[test]
fn parallel_and_serial_builds_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let serial = dir.path().join("serial.mbtiles");
    let parallel = dir.path().join("parallel.mbtiles");
    create_source(&input);

    build_grid(&input, &serial, &sum_stack(16, 1), &options()).expect("serial build");
    build_grid(&input, &parallel, &sum_stack(16, 8), &options()).expect("parallel build");

    for zoom in [1, 4, 8, 11] {
        assert_eq!(cells_at(&serial, zoom), cells_at(&parallel, zoom), "z{zoom}");
    }
}

#[test]
fn writes_tilejson_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    create_source(&input);
    build_grid(&input, &output, &sum_stack(64, 2), &options()).expect("build");

    let metadata = MbtilesReader::open(&output)
        .expect("open output")
        .metadata()
        .expect("metadata");
    assert_eq!(metadata.get("name").map(String::as_str), Some("dc grid"));
    assert_eq!(metadata.get("format").map(String::as_str), Some("pbf"));
    assert_eq!(metadata.get("minzoom").map(String::as_str), Some("1"));
    assert_eq!(metadata.get("maxzoom").map(String::as_str), Some("12"));

    let json: serde_json::Value =
        serde_json::from_str(metadata.get("json").expect("json")).expect("parse json");
    let layers = json["vector_layers"].as_array().expect("vector_layers");
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0]["id"], "dc");
    assert_eq!(layers[0]["fields"]["data"], "Number");
    assert_eq!(layers[0]["fields"]["_quadKey"], "String");
}

#[test]
fn stacked_stages_continue_from_previous_minzoom() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    let expected = create_source(&input);

    let fine = GridConfig::builder(BASEZOOM)
        .minzoom(8)
        .gridsize(64)
        .jobs(2)
        .include_base_data(false)
        .field("dc:sum(data)")
        .expect("field")
        .build()
        .expect("fine stage");
    let coarse = GridConfig::builder(8)
        .minzoom(2)
        .gridsize(16)
        .jobs(2)
        .field("dc:sum(data)")
        .expect("field")
        .build()
        .expect("coarse stage");
    let stack = JobStack::new(vec![coarse, fine]).expect("stack");

    let stats = build_grid(&input, &output, &stack, &options()).expect("build");
    assert_eq!(stats.base_tiles, 0);
    assert_eq!(stats.minzoom, 2);

    let reader = MbtilesReader::open(&output).expect("open output");
    assert!(reader.list_tiles(BASEZOOM).expect("list base").is_empty());
    assert!(reader.list_tiles(1).expect("list z1").is_empty());
    for (zoom, depth) in [(11u8, 3usize), (8, 3), (7, 2), (2, 2)] {
        let cells = cells_at(&output, zoom);
        assert!(cells.keys().all(|key| key.len() == zoom as usize + depth));
        let total: f64 = cells.values().sum();
        assert!((total - expected).abs() < 1e-6, "z{zoom}: {total} != {expected}");
    }
}

#[test]
fn refuses_to_overwrite_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    create_source(&input);
    std::fs::write(&output, b"").expect("touch output");

    let err = build_grid(&input, &output, &sum_stack(64, 1), &options()).expect_err("exists");
    assert!(err.to_string().contains("already exists"));
}

#[test]
fn undecodable_source_tiles_fail_the_build() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("broken.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    create_source(&input);
    let conn = rusqlite::Connection::open(&input).expect("open");
    conn.execute("UPDATE tiles SET tile_data = x'0a0b0c0d'", [])
        .expect("corrupt tiles");
    drop(conn);

    let err = build_grid(&input, &output, &sum_stack(64, 2), &options()).expect_err("corrupt");
    let failed = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<GridError>(), Some(GridError::WorkerFailed { .. })));
    assert!(failed, "{err:#}");
}

#[test]
fn level_builder_stops_at_the_requested_zoom() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    create_source(&input);

    let config = sum_stack(4, 1).first().clone();
    let source = MbtilesReader::open(&input).expect("open source");
    let mut dest = MbtilesWriter::create(&output, config.busy_timeout).expect("create");
    let first_level = ancestor_levels(&leaves(), 11).remove(0);
    let cancel = AtomicBool::new(false);
    let mut builder =
        LevelBuilder::new(&config, &source, &mut dest, SourceKind::Raw, &NoProgress, &cancel);
    let report = builder.build(first_level.clone(), 9).expect("build");

    let at_9 = ancestor_levels(&leaves(), 9).remove(2);
    let at_8 = ancestor_levels(&leaves(), 8).remove(3);
    assert_eq!(report.written, at_9);
    assert_eq!(report.next_level, at_8);
    assert_eq!(report.last_tile, at_9.last().copied());
    assert_eq!(
        report.tiles as usize,
        first_level.len() + ancestor_levels(&leaves(), 10)[1].len() + at_9.len()
    );
    // raw points feed z11, four cells per child tile feed every level after
    assert_eq!(
        report.features as usize,
        leaves().len() * 5 + 4 * (report.tiles as usize - at_9.len())
    );
    drop(builder);
    assert_eq!(dest.tile_count(8).expect("count z8"), 0);
    assert_eq!(dest.tile_count(9).expect("count z9") as usize, at_9.len());
}

#[test]
fn level_builder_honours_cancellation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    create_source(&input);

    let config = sum_stack(4, 1).first().clone();
    let source = MbtilesReader::open(&input).expect("open source");
    let mut dest = MbtilesWriter::create(&output, config.busy_timeout).expect("create");
    let cancel = AtomicBool::new(true);
    let mut builder =
        LevelBuilder::new(&config, &source, &mut dest, SourceKind::Raw, &NoProgress, &cancel);
    let err = builder
        .build(ancestor_levels(&leaves(), 11).remove(0), 1)
        .expect_err("cancelled");
    assert!(err.to_string().contains("cancelled"));
}

#[test]
fn nonzero_cells_are_the_ancestors_of_the_points() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    create_source(&input);
    build_grid(&input, &output, &sum_stack(64, 3), &options()).expect("build");

    for zoom in [11u8, 6, 1] {
        let expected: BTreeSet<String> = point_values_by_cell(zoom + 3).into_keys().collect();
        let nonzero: BTreeSet<String> = cells_at(&output, zoom)
            .into_iter()
            .filter(|(_, value)| *value > 0.0)
            .map(|(key, _)| key)
            .collect();
        assert_eq!(nonzero, expected, "z{zoom}");
    }
}

#[test]
fn means_and_minimums_ignore_empty_cells_at_every_level() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dc.mbtiles");
    let output = dir.path().join("grid.mbtiles");
    create_source(&input);
    let config = GridConfig::builder(BASEZOOM)
        .minzoom(1)
        .gridsize(16)
        .jobs(2)
        .reducer("dc", "avg", resolve_reducer("mean", "data").expect("mean"))
        .reducer("dc", "low", resolve_reducer("min", "data").expect("min"))
        .build()
        .expect("config");
    build_grid(&input, &output, &JobStack::single(config), &options()).expect("build");

    for zoom in [11u8, 9, 5, 1] {
        let by_cell = point_values_by_cell(zoom + 2);
        let avg = field_at(&output, zoom, "avg");
        let low = field_at(&output, zoom, "low");
        assert!(!avg.is_empty(), "no cells at z{zoom}");
        for (key, value) in avg.iter() {
            let (mean, min) = match by_cell.get(key) {
                Some(values) => (
                    values.iter().sum::<f64>() / values.len() as f64,
                    values.iter().cloned().fold(f64::INFINITY, f64::min),
                ),
                None => (0.0, 0.0),
            };
            assert!((value - mean).abs() < 1e-9, "z{zoom} {key}: mean {value} != {mean}");
            assert_eq!(low[key], min, "z{zoom} {key}");
        }
    }
}
