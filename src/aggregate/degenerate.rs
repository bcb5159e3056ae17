use anyhow::Result;
use geo_types::{Coord, Geometry, LineString};

use crate::error::GridError;
use crate::feature::Feature;
use crate::tile::{TileBounds, TileCoord};

/// Rejects clipped features that only touch the border of a cell.
///
/// A feature survives when, for each of the four cell edges, at least one of
/// its vertices lies inside that edge by more than the tolerance. Members of
/// multi-geometries are tested one by one and any passing member keeps the
/// whole feature. The
/// tolerance is about one pixel of a 4096 extent at zoom 0, shrinking by a
/// factor of 4 per zoom.
#[derive(Debug, Clone, Copy)]
pub struct DegenerateFilter {
    bounds: TileBounds,
    tolerance: f64,
}

impl DegenerateFilter {
    pub fn new(cell: TileCoord) -> Self {
        Self {
            bounds: cell.bounds(),
            tolerance: 0.087 / 4f64.powi(cell.zoom as i32),
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn keep(&self, feature: &Feature) -> Result<bool> {
        self.keep_geometry(&feature.geometry)
    }

    pub fn keep_geometry(&self, geometry: &Geometry<f64>) -> Result<bool> {
        let passes = match geometry {
            Geometry::Point(point) => self.passes([point.0].iter()),
            Geometry::Line(line) => self.passes([line.start, line.end].iter()),
            Geometry::LineString(line) => self.passes(line.0.iter()),
            Geometry::Polygon(polygon) => self.passes_ring(polygon.exterior()),
            Geometry::Rect(rect) => self.passes_ring(rect.to_polygon().exterior()),
            Geometry::Triangle(triangle) => self.passes_ring(triangle.to_polygon().exterior()),
            Geometry::MultiPoint(points) => {
                points.iter().any(|point| self.passes([point.0].iter()))
            }
            Geometry::MultiLineString(lines) => lines.iter().any(|line| self.passes(line.0.iter())),
            Geometry::MultiPolygon(polygons) => polygons
                .iter()
                .any(|polygon| self.passes_ring(polygon.exterior())),
            Geometry::GeometryCollection(_) => {
                return Err(GridError::UnsupportedGeometry("GeometryCollection").into());
            }
        };
        Ok(passes)
    }

    fn passes_ring(&self, ring: &LineString<f64>) -> bool {
        self.passes(ring.0.iter())
    }

    fn passes<'a>(&self, coords: impl Iterator<Item = &'a Coord<f64>>) -> bool {
        let b = &self.bounds;
        let tol = self.tolerance;
        let (mut west, mut east, mut south, mut north) = (false, false, false, false);
        for c in coords {
            west |= c.x - b.west > tol;
            east |= b.east - c.x > tol;
            south |= c.y - b.south > tol;
            north |= b.north - c.y > tol;
            if west && east && south && north {
                return true;
            }
        }
        false
    }
}
