//! Clipping of projected geometries to grid cells.
//!
//! Geometries are clipped in normalized Web Mercator space, where cell edges
//! are straight lines, against the cell rectangle with no buffer. The
//! boundary itself counts as inside.

use geo::{BooleanOps, BoundingRect, Coord, MapCoords, Rect};
use geo_types::{
    Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon,
};

use crate::error::GridError;
use crate::tile::{WorldRect, lng_lat_to_world, world_to_lng_lat};

pub fn project(geometry: &Geometry<f64>) -> Geometry<f64> {
    geometry.map_coords(|c| {
        let (x, y) = lng_lat_to_world(c.x, c.y);
        Coord { x, y }
    })
}

pub fn unproject(geometry: &Geometry<f64>) -> Geometry<f64> {
    geometry.map_coords(|c| {
        let (x, y) = world_to_lng_lat(c.x, c.y);
        Coord { x, y }
    })
}

fn intersects(bbox: &Rect<f64>, rect: &WorldRect) -> bool {
    bbox.max().x >= rect.min_x
        && bbox.min().x <= rect.max_x
        && bbox.max().y >= rect.min_y
        && bbox.min().y <= rect.max_y
}

fn contains(rect: &WorldRect, c: &Coord<f64>) -> bool {
    c.x >= rect.min_x && c.x <= rect.max_x && c.y >= rect.min_y && c.y <= rect.max_y
}

fn rect_polygon(rect: &WorldRect) -> Polygon<f64> {
    Rect::new(
        Coord {
            x: rect.min_x,
            y: rect.min_y,
        },
        Coord {
            x: rect.max_x,
            y: rect.max_y,
        },
    )
    .to_polygon()
}

/// Clips a projected geometry to `rect`. `Ok(None)` when nothing is left.
pub fn clip_to_rect(geometry: &Geometry<f64>, rect: &WorldRect) -> Result<Option<Geometry<f64>>, GridError> {
    if let Some(bbox) = geometry.bounding_rect() {
        if !intersects(&bbox, rect) {
            return Ok(None);
        }
    }
    let clipped = match geometry {
        Geometry::Point(point) => contains(rect, &point.0).then(|| Geometry::Point(*point)),
        Geometry::MultiPoint(points) => {
            let kept: Vec<Point<f64>> = points
                .iter()
                .filter(|point| contains(rect, &point.0))
                .copied()
                .collect();
            (!kept.is_empty()).then(|| Geometry::MultiPoint(MultiPoint::new(kept)))
        }
        Geometry::Line(line) => clip_lines(
            &MultiLineString::new(vec![LineString::new(vec![line.start, line.end])]),
            rect,
        ),
        Geometry::LineString(line) => clip_lines(&MultiLineString::new(vec![line.clone()]), rect),
        Geometry::MultiLineString(lines) => clip_lines(lines, rect),
        Geometry::Polygon(polygon) => clip_polygon(polygon, rect).map(Geometry::Polygon),
        Geometry::Rect(r) => clip_polygon(&r.to_polygon(), rect).map(Geometry::Polygon),
        Geometry::Triangle(t) => clip_polygon(&t.to_polygon(), rect).map(Geometry::Polygon),
        Geometry::MultiPolygon(polygons) => {
            let kept: Vec<Polygon<f64>> = polygons
                .iter()
                .filter_map(|polygon| clip_polygon(polygon, rect))
                .collect();
            match kept.len() {
                0 => None,
                1 => kept.into_iter().next().map(Geometry::Polygon),
                _ => Some(Geometry::MultiPolygon(MultiPolygon::new(kept))),
            }
        }
        Geometry::GeometryCollection(_) => {
            return Err(GridError::UnsupportedGeometry("GeometryCollection"));
        }
    };
    Ok(clipped)
}

fn clip_lines(lines: &MultiLineString<f64>, rect: &WorldRect) -> Option<Geometry<f64>> {
    // Lines lying exactly on the boundary are lost by the boolean clip.
    if lines.iter().all(|line| line.coords().all(|c| contains(rect, c))) {
        return Some(Geometry::MultiLineString(lines.clone()));
    }
    let clipped = rect_polygon(rect).clip(lines, false);
    let mut parts: Vec<LineString<f64>> = clipped.0.into_iter().filter(|l| l.0.len() >= 2).collect();
    match parts.len() {
        0 => None,
        1 => parts.pop().map(Geometry::LineString),
        _ => Some(Geometry::MultiLineString(MultiLineString::new(parts))),
    }
}

fn clip_polygon(polygon: &Polygon<f64>, rect: &WorldRect) -> Option<Polygon<f64>> {
    let bbox = polygon.bounding_rect()?;
    if bbox.min().x >= rect.min_x
        && bbox.max().x <= rect.max_x
        && bbox.min().y >= rect.min_y
        && bbox.max().y <= rect.max_y
    {
        return Some(polygon.clone());
    }
    let exterior = clip_ring(polygon.exterior(), rect)?;
    let interiors = polygon
        .interiors()
        .iter()
        .filter_map(|ring| clip_ring(ring, rect))
        .collect();
    Some(Polygon::new(exterior, interiors))
}

/// Sutherland-Hodgman against the four cell edges.
fn clip_ring(ring: &LineString<f64>, rect: &WorldRect) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = ring.0.clone();
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }

    coords = clip_edge(&coords, |c| c.x >= rect.min_x, |a, b| {
        let t = (rect.min_x - a.x) / (b.x - a.x);
        Coord {
            x: rect.min_x,
            y: a.y + t * (b.y - a.y),
        }
    });
    coords = clip_edge(&coords, |c| c.x <= rect.max_x, |a, b| {
        let t = (rect.max_x - a.x) / (b.x - a.x);
        Coord {
            x: rect.max_x,
            y: a.y + t * (b.y - a.y),
        }
    });
    coords = clip_edge(&coords, |c| c.y >= rect.min_y, |a, b| {
        let t = (rect.min_y - a.y) / (b.y - a.y);
        Coord {
            x: a.x + t * (b.x - a.x),
            y: rect.min_y,
        }
    });
    coords = clip_edge(&coords, |c| c.y <= rect.max_y, |a, b| {
        let t = (rect.max_y - a.y) / (b.y - a.y);
        Coord {
            x: a.x + t * (b.x - a.x),
            y: rect.max_y,
        }
    });

    coords.dedup();
    if coords.len() < 3 {
        return None;
    }
    coords.push(coords[0]);
    Some(LineString::new(coords))
}

fn clip_edge<F, I>(vertices: &[Coord<f64>], inside: F, intersect: I) -> Vec<Coord<f64>>
where
    F: Fn(&Coord<f64>) -> bool,
    I: Fn(&Coord<f64>, &Coord<f64>) -> Coord<f64>,
{
    let mut output = Vec::with_capacity(vertices.len() + 4);
    for (i, current) in vertices.iter().enumerate() {
        let next = &vertices[(i + 1) % vertices.len()];
        match (inside(current), inside(next)) {
            (true, true) => output.push(*current),
            (true, false) => {
                output.push(*current);
                output.push(intersect(current, next));
            }
            (false, true) => output.push(intersect(current, next)),
            (false, false) => {}
        }
    }
    output
}
