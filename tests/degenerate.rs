use geo_types::{
    Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon, Point,
    Polygon, Rect, coord,
};

use vt_grid::aggregate::DegenerateFilter;
use vt_grid::error::GridError;
use vt_grid::feature::Feature;
use vt_grid::tile::TileCoord;

fn rect(west: f64, south: f64, east: f64, north: f64) -> Polygon<f64> {
    Rect::new(coord! { x: west, y: south }, coord! { x: east, y: north }).to_polygon()
}

fn fixture(cell: TileCoord, tolerance: f64) -> Vec<Feature> {
    let b = cell.bounds();
    let w = b.east - b.west;
    let h = b.north - b.south;
    vec![
        // interior square
        Feature::new(rect(
            b.west + w * 0.25,
            b.south + h * 0.25,
            b.west + w * 0.75,
            b.south + h * 0.75,
        )),
        // the whole cell
        Feature::new(rect(b.west, b.south, b.east, b.north)),
        Feature::new(Point::new(b.west + w * 0.5, b.south + h * 0.5)),
        Feature::new(LineString::from(vec![(b.west, b.south), (b.east, b.north)])),
        // sliver along the west edge
        Feature::new(rect(b.west, b.south, b.west + tolerance * 0.5, b.north)),
        // line on the north edge
        Feature::new(LineString::from(vec![(b.west, b.north), (b.east, b.north)])),
        Feature::new(Point::new(b.east, b.south)),
    ]
}

#[test]
fn keeps_only_features_reaching_inside_every_edge() {
    let cell = TileCoord::new(15, 9393, 12516).expect("tile");
    let filter = DegenerateFilter::new(cell);
    let features = fixture(cell, filter.tolerance());

    let kept: Vec<usize> = features
        .iter()
        .enumerate()
        .filter(|(_, feature)| filter.keep(feature).expect("keep"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(kept, vec![0, 1, 2, 3]);
}

#[test]
fn tolerance_shrinks_with_zoom() {
    let z0 = DegenerateFilter::new(TileCoord::new(0, 0, 0).expect("tile"));
    let z1 = DegenerateFilter::new(TileCoord::new(1, 0, 0).expect("tile"));
    assert!((z0.tolerance() - 0.087).abs() < 1e-12);
    assert!((z1.tolerance() - 0.087 / 4.0).abs() < 1e-12);
}

#[test]
fn multipolygon_survives_when_any_part_does() {
    let cell = TileCoord::new(15, 9370, 12525).expect("tile");
    let filter = DegenerateFilter::new(cell);
    let b = cell.bounds();
    let sliver = rect(b.west, b.south, b.west + filter.tolerance() * 0.5, b.north);
    let inner = rect(
        b.west + (b.east - b.west) * 0.4,
        b.south + (b.north - b.south) * 0.4,
        b.east,
        b.north,
    );

    let only_sliver = Geometry::MultiPolygon(MultiPolygon(vec![sliver.clone()]));
    assert!(!filter.keep_geometry(&only_sliver).expect("keep"));

    let mixed = Geometry::MultiPolygon(MultiPolygon(vec![sliver, inner]));
    assert!(filter.keep_geometry(&mixed).expect("keep"));
}

#[test]
fn geometry_collections_are_rejected() {
    let cell = TileCoord::new(15, 9393, 12516).expect("tile");
    let filter = DegenerateFilter::new(cell);
    let collection = Geometry::GeometryCollection(GeometryCollection(vec![]));
    let err = filter.keep_geometry(&collection).expect_err("unsupported");
    assert_eq!(
        err.downcast_ref::<GridError>(),
        Some(&GridError::UnsupportedGeometry("GeometryCollection"))
    );
}

#[test]
fn multi_members_are_tested_one_by_one() {
    let cell = TileCoord::new(15, 9393, 12516).expect("tile");
    let filter = DegenerateFilter::new(cell);
    let b = cell.bounds();

    let west_edge = LineString::from(vec![(b.west, b.south), (b.west, b.north)]);
    let east_edge = LineString::from(vec![(b.east, b.south), (b.east, b.north)]);
    let diagonal = LineString::from(vec![(b.west, b.south), (b.east, b.north)]);
    assert!(!filter.keep_geometry(&west_edge.clone().into()).expect("west"));
    assert!(!filter.keep_geometry(&east_edge.clone().into()).expect("east"));

    let edges = Geometry::MultiLineString(MultiLineString(vec![west_edge.clone(), east_edge]));
    assert!(!filter.keep_geometry(&edges).expect("edges"));
    let with_diagonal = Geometry::MultiLineString(MultiLineString(vec![west_edge, diagonal]));
    assert!(filter.keep_geometry(&with_diagonal).expect("diagonal"));

    let corners = Geometry::MultiPoint(MultiPoint(vec![
        Point::new(b.west, b.south),
        Point::new(b.east, b.north),
    ]));
    assert!(!filter.keep_geometry(&corners).expect("corners"));
    let centre = Geometry::MultiPoint(MultiPoint(vec![
        Point::new(b.west, b.south),
        Point::new((b.west + b.east) / 2.0, (b.south + b.north) / 2.0),
    ]));
    assert!(filter.keep_geometry(&centre).expect("centre"));
}
