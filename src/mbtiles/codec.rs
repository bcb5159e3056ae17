use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use geo::MapCoords;
use geo_types::{Coord, Geometry, Line, LineString, MultiLineString, MultiPoint, MultiPolygon, Polygon};
use mvt::{GeomData, GeomEncoder, GeomType, Tile};
use mvt_reader::Reader;
use mvt_reader::feature::Value;

use crate::error::GridError;
use crate::feature::{
    CellFeature, Feature, LayerInput, Properties, PropertyValue, QUADKEY_PROPERTY, SourceKind,
};
use crate::tile::{TileCoord, lng_lat_to_world, world_to_lng_lat};

pub const EXTENT: u32 = 4096;

pub fn decode_tile_payload(data: &[u8]) -> Result<Vec<u8>> {
    if data.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(data);
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .context("decode gzip tile data")?;
        Ok(decoded)
    } else {
        Ok(data.to_vec())
    }
}

pub fn encode_tile_payload(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("encode gzip tile data")?;
    let encoded = encoder.finish().context("finish gzip tile data")?;
    Ok(encoded)
}

fn property_value(value: Value) -> Option<PropertyValue> {
    match value {
        Value::String(text) => Some(PropertyValue::String(text)),
        Value::Float(val) => Some(PropertyValue::Number(val as f64)),
        Value::Double(val) => Some(PropertyValue::Number(val)),
        Value::Int(val) => Some(PropertyValue::Number(val as f64)),
        Value::UInt(val) => Some(PropertyValue::Number(val as f64)),
        Value::SInt(val) => Some(PropertyValue::Number(val as f64)),
        Value::Bool(val) => Some(PropertyValue::Bool(val)),
        Value::Null => None,
    }
}

/// Converts tile-local pixels into longitude/latitude.
fn pixels_to_degrees(geometry: &Geometry<f32>, tile: TileCoord, extent: u32) -> Geometry<f64> {
    let n = (1u64 << tile.zoom) as f64;
    let extent = extent as f64;
    geometry.map_coords(|c| {
        let wx = (tile.x as f64 + c.x as f64 / extent) / n;
        let wy = (tile.y as f64 + c.y as f64 / extent) / n;
        let (x, y) = world_to_lng_lat(wx, wy);
        Coord { x, y }
    })
}

fn degrees_to_pixels(geometry: &Geometry<f64>, tile: TileCoord) -> Geometry<f32> {
    let n = (1u64 << tile.zoom) as f64;
    let extent = EXTENT as f64;
    geometry.map_coords(|c| {
        let (wx, wy) = lng_lat_to_world(c.x, c.y);
        Coord {
            x: ((wx * n - tile.x as f64) * extent).round() as f32,
            y: ((wy * n - tile.y as f64) * extent).round() as f32,
        }
    })
}

/// Decodes the features of the requested layers, in degrees. Layers missing
/// from the tile are absent from the result.
pub fn decode_layers(
    data: &[u8],
    tile: TileCoord,
    layers: &BTreeSet<String>,
) -> Result<BTreeMap<String, Vec<Feature>>> {
    let payload = decode_tile_payload(data)?;
    let reader =
        Reader::new(payload).map_err(|err| anyhow::anyhow!("decode vector tile {tile}: {err}"))?;
    let metadata = reader
        .get_layer_metadata()
        .map_err(|err| anyhow::anyhow!("read layer metadata: {err}"))?;

    let mut result = BTreeMap::new();
    for layer in metadata {
        if !layers.contains(&layer.name) {
            continue;
        }
        let features = reader
            .get_features(layer.layer_index)
            .map_err(|err| anyhow::anyhow!("read layer features: {err}"))?;
        let mut decoded = Vec::with_capacity(features.len());
        for feature in features {
            let geometry = pixels_to_degrees(feature.get_geometry(), tile, layer.extent);
            let mut properties = Properties::new();
            if let Some(props) = feature.properties {
                for (key, value) in props {
                    if let Some(value) = property_value(value) {
                        properties.insert(key, value);
                    }
                }
            }
            decoded.push(Feature {
                geometry,
                properties,
            });
        }
        result.insert(layer.name, decoded);
    }
    Ok(result)
}

/// Decodes grid cells, reading each cell's position from its quadkey.
pub fn decode_cells(
    data: &[u8],
    tile: TileCoord,
    layers: &BTreeSet<String>,
) -> Result<BTreeMap<String, Vec<CellFeature>>> {
    let mut result = BTreeMap::new();
    for (layer, features) in decode_layers(data, tile, layers)? {
        let mut cells = Vec::with_capacity(features.len());
        for feature in features {
            let key = feature
                .string(QUADKEY_PROPERTY)
                .ok_or_else(|| GridError::MissingQuadkey(layer.clone()))?;
            let cell = TileCoord::from_quadkey(key)?;
            cells.push(CellFeature { cell, feature });
        }
        result.insert(layer, cells);
    }
    Ok(result)
}

/// Decodes a tile as the given kind of layer input.
pub fn decode_layer_inputs(
    data: &[u8],
    tile: TileCoord,
    layers: &BTreeSet<String>,
    kind: SourceKind,
) -> Result<BTreeMap<String, LayerInput>> {
    Ok(match kind {
        SourceKind::Raw => decode_layers(data, tile, layers)?
            .into_iter()
            .map(|(layer, features)| (layer, LayerInput::Raw(features)))
            .collect(),
        SourceKind::Cells => decode_cells(data, tile, layers)?
            .into_iter()
            .map(|(layer, cells)| (layer, LayerInput::Cells(cells)))
            .collect(),
    })
}

fn encode_linestring(encoder: &mut GeomEncoder<f32>, line: &LineString<f32>) -> Result<()> {
    for coord in ring_coords(line) {
        encoder
            .add_point(coord.x, coord.y)
            .map_err(|err| anyhow::anyhow!("encode geometry: {err}"))?;
    }
    Ok(())
}

fn ring_coords(line: &LineString<f32>) -> &[Coord<f32>] {
    let coords = line.0.as_slice();
    if coords.len() > 1 && coords.first() == coords.last() {
        &coords[..coords.len() - 1]
    } else {
        coords
    }
}

fn encode_polygons(encoder: &mut GeomEncoder<f32>, polygons: &[Polygon<f32>]) -> Result<()> {
    for (poly_idx, polygon) in polygons.iter().enumerate() {
        let mut rings: Vec<&LineString<f32>> = Vec::with_capacity(1 + polygon.interiors().len());
        rings.push(polygon.exterior());
        rings.extend(polygon.interiors());
        for (idx, ring) in rings.iter().enumerate() {
            encode_linestring(encoder, ring)?;
            if idx + 1 < rings.len() || poly_idx + 1 < polygons.len() {
                encoder
                    .complete_geom()
                    .map_err(|err| anyhow::anyhow!("encode geometry: {err}"))?;
            }
        }
    }
    Ok(())
}

fn encode_geometry(geometry: &Geometry<f32>) -> Result<GeomData> {
    let encoder = match geometry {
        Geometry::Point(point) => {
            let mut encoder = GeomEncoder::new(GeomType::Point);
            encoder
                .add_point(point.x(), point.y())
                .map_err(|err| anyhow::anyhow!("encode geometry: {err}"))?;
            encoder
        }
        Geometry::MultiPoint(MultiPoint(points)) => {
            let mut encoder = GeomEncoder::new(GeomType::Point);
            for point in points {
                encoder
                    .add_point(point.x(), point.y())
                    .map_err(|err| anyhow::anyhow!("encode geometry: {err}"))?;
            }
            encoder
        }
        Geometry::Line(Line { start, end }) => {
            let mut encoder = GeomEncoder::new(GeomType::Linestring);
            encode_linestring(&mut encoder, &LineString::new(vec![*start, *end]))?;
            encoder
        }
        Geometry::LineString(line) => {
            let mut encoder = GeomEncoder::new(GeomType::Linestring);
            encode_linestring(&mut encoder, line)?;
            encoder
        }
        Geometry::MultiLineString(MultiLineString(lines)) => {
            let mut encoder = GeomEncoder::new(GeomType::Linestring);
            for (idx, line) in lines.iter().enumerate() {
                encode_linestring(&mut encoder, line)?;
                if idx + 1 < lines.len() {
                    encoder
                        .complete_geom()
                        .map_err(|err| anyhow::anyhow!("encode geometry: {err}"))?;
                }
            }
            encoder
        }
        Geometry::Polygon(polygon) => {
            let mut encoder = GeomEncoder::new(GeomType::Polygon);
            encode_polygons(&mut encoder, std::slice::from_ref(polygon))?;
            encoder
        }
        Geometry::Rect(rect) => {
            let mut encoder = GeomEncoder::new(GeomType::Polygon);
            encode_polygons(&mut encoder, &[rect.to_polygon()])?;
            encoder
        }
        Geometry::Triangle(triangle) => {
            let mut encoder = GeomEncoder::new(GeomType::Polygon);
            encode_polygons(&mut encoder, &[triangle.to_polygon()])?;
            encoder
        }
        Geometry::MultiPolygon(MultiPolygon(polygons)) => {
            let mut encoder = GeomEncoder::new(GeomType::Polygon);
            encode_polygons(&mut encoder, polygons)?;
            encoder
        }
        Geometry::GeometryCollection(_) => {
            return Err(GridError::UnsupportedGeometry("GeometryCollection").into());
        }
    };
    encoder
        .encode()
        .map_err(|err| anyhow::anyhow!("encode geometry: {err}"))
}

fn add_properties(feature: &mut mvt::Feature, properties: &Properties) {
    for (key, value) in properties.iter() {
        match value {
            PropertyValue::String(text) => feature.add_tag_string(key, text),
            PropertyValue::Bool(val) => feature.add_tag_bool(key, *val),
            PropertyValue::Number(val) => {
                let integral = val.fract() == 0.0 && val.abs() < (1u64 << 53) as f64;
                if integral && *val >= 0.0 {
                    feature.add_tag_uint(key, *val as u64);
                } else if integral {
                    feature.add_tag_sint(key, *val as i64);
                } else {
                    feature.add_tag_double(key, *val);
                }
            }
        }
    }
}

fn encode_tile(layers: Vec<(&str, Vec<(Geometry<f32>, &Properties)>)>) -> Result<Vec<u8>> {
    let mut tile = Tile::new(EXTENT);
    for (name, features) in layers {
        if features.is_empty() {
            continue;
        }
        let mut layer = tile.create_layer(name);
        for (geometry, properties) in features {
            let mut feature = layer.into_feature(encode_geometry(&geometry)?);
            add_properties(&mut feature, properties);
            layer = feature.into_layer();
        }
        tile.add_layer(layer)
            .map_err(|err| anyhow::anyhow!("add layer: {err}"))?;
    }
    tile.to_bytes()
        .map_err(|err| anyhow::anyhow!("encode vector tile: {err}"))
}

/// The square of `cell` in the pixel space of `tile`, computed exactly.
fn cell_pixels(cell: TileCoord, tile: TileCoord) -> Geometry<f32> {
    let depth = cell.zoom.saturating_sub(tile.zoom);
    let n = 1u64 << depth;
    let cx = cell.x as u64 - ((tile.x as u64) << depth);
    let cy = cell.y as u64 - ((tile.y as u64) << depth);
    let extent = EXTENT as u64;
    let left = (cx * extent / n) as f32;
    let right = ((cx + 1) * extent / n) as f32;
    let top = (cy * extent / n) as f32;
    let bottom = ((cy + 1) * extent / n) as f32;
    Geometry::Polygon(Polygon::new(
        LineString::from(vec![
            (left, top),
            (right, top),
            (right, bottom),
            (left, bottom),
            (left, top),
        ]),
        Vec::new(),
    ))
}

/// Encodes the grid cells of `tile`. Cell geometry is derived from the cell
/// position rather than from the feature geometry.
pub fn encode_cells(tile: TileCoord, layers: &BTreeMap<String, Vec<CellFeature>>) -> Result<Vec<u8>> {
    let layers = layers
        .iter()
        .map(|(name, cells)| {
            let features = cells
                .iter()
                .map(|cell| (cell_pixels(cell.cell, tile), &cell.feature.properties))
                .collect();
            (name.as_str(), features)
        })
        .collect();
    encode_tile(layers)
}

/// Encodes features given in degrees into `tile`.
pub fn encode_features(tile: TileCoord, layers: &BTreeMap<String, Vec<Feature>>) -> Result<Vec<u8>> {
    let layers = layers
        .iter()
        .map(|(name, features)| {
            let features = features
                .iter()
                .map(|feature| (degrees_to_pixels(&feature.geometry, tile), &feature.properties))
                .collect();
            (name.as_str(), features)
        })
        .collect();
    encode_tile(layers)
}
