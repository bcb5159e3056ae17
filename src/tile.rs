//! Tile coordinates, the quadtree relations between them, and the Web
//! Mercator math needed to place features inside tiles.

use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::fmt;

use anyhow::{Context, Result};

use crate::error::GridError;

pub const MAX_ZOOM: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoord {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(zoom: u8, x: u32, y: u32) -> Result<Self> {
        let tile = TileCoord { zoom, x, y };
        if !tile.is_valid() {
            return Err(GridError::InvalidTile { zoom, x, y }.into());
        }
        Ok(tile)
    }

    pub fn is_valid(&self) -> bool {
        if self.zoom > MAX_ZOOM {
            return false;
        }
        let max = 1u64 << self.zoom;
        (self.x as u64) < max && (self.y as u64) < max
    }

    /// `[z, x, y]`, the ordering used by job files and `z/x/y` specs.
    pub fn from_zxy(zxy: [u32; 3]) -> Result<Self> {
        let zoom = u8::try_from(zxy[0]).context("zoom out of range")?;
        TileCoord::new(zoom, zxy[1], zxy[2])
    }

    pub fn to_zxy(&self) -> [u32; 3] {
        [self.zoom as u32, self.x, self.y]
    }

    /// `[x, y, z]`, the ordering of most slippy-map tooling.
    pub fn from_xyz(xyz: [u32; 3]) -> Result<Self> {
        let zoom = u8::try_from(xyz[2]).context("zoom out of range")?;
        TileCoord::new(zoom, xyz[0], xyz[1])
    }

    pub fn to_xyz(&self) -> [u32; 3] {
        [self.x, self.y, self.zoom as u32]
    }

    pub fn parent(&self) -> Option<TileCoord> {
        if self.zoom == 0 {
            return None;
        }
        Some(TileCoord {
            zoom: self.zoom - 1,
            x: self.x >> 1,
            y: self.y >> 1,
        })
    }

    /// The four tiles one zoom deeper, always in the order
    /// top-left, top-right, bottom-right, bottom-left.
    pub fn children(&self) -> [TileCoord; 4] {
        let zoom = self.zoom + 1;
        let x = self.x * 2;
        let y = self.y * 2;
        [
            TileCoord { zoom, x, y },
            TileCoord { zoom, x: x + 1, y },
            TileCoord { zoom, x: x + 1, y: y + 1 },
            TileCoord { zoom, x, y: y + 1 },
        ]
    }

    pub fn ancestor_at(&self, zoom: u8) -> Option<TileCoord> {
        if zoom > self.zoom {
            return None;
        }
        let shift = self.zoom - zoom;
        Some(TileCoord {
            zoom,
            x: self.x >> shift,
            y: self.y >> shift,
        })
    }

    pub fn quadkey(&self) -> String {
        let mut key = String::with_capacity(self.zoom as usize);
        for level in (1..=self.zoom).rev() {
            let mask = 1u32 << (level - 1);
            let mut digit = b'0';
            if self.x & mask != 0 {
                digit += 1;
            }
            if self.y & mask != 0 {
                digit += 2;
            }
            key.push(digit as char);
        }
        key
    }

    pub fn from_quadkey(key: &str) -> Result<TileCoord> {
        if key.len() > MAX_ZOOM as usize {
            return Err(GridError::InvalidQuadkey(key.to_string()).into());
        }
        let mut x = 0u32;
        let mut y = 0u32;
        for digit in key.bytes() {
            x <<= 1;
            y <<= 1;
            match digit {
                b'0' => {}
                b'1' => x |= 1,
                b'2' => y |= 1,
                b'3' => {
                    x |= 1;
                    y |= 1;
                }
                _ => return Err(GridError::InvalidQuadkey(key.to_string()).into()),
            }
        }
        Ok(TileCoord {
            zoom: key.len() as u8,
            x,
            y,
        })
    }

    /// Tile extent in normalized Web Mercator space: 0..1 on both axes, y
    /// growing southwards.
    pub fn world_rect(&self) -> WorldRect {
        let n = (1u64 << self.zoom) as f64;
        WorldRect {
            min_x: self.x as f64 / n,
            min_y: self.y as f64 / n,
            max_x: (self.x as f64 + 1.0) / n,
            max_y: (self.y as f64 + 1.0) / n,
        }
    }

    pub fn bounds(&self) -> TileBounds {
        let rect = self.world_rect();
        let (west, north) = world_to_lng_lat(rect.min_x, rect.min_y);
        let (east, south) = world_to_lng_lat(rect.max_x, rect.max_y);
        TileBounds {
            west,
            south,
            east,
            north,
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

pub fn lng_lat_to_world(lng: f64, lat: f64) -> (f64, f64) {
    let x = (lng + 180.0) / 360.0;
    let y = (1.0 - lat.to_radians().tan().asinh() / PI) / 2.0;
    (x, y)
}

pub fn world_to_lng_lat(x: f64, y: f64) -> (f64, f64) {
    let lng = x * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y)).sinh().atan().to_degrees();
    (lng, lat)
}

/// Every descendant of `tile` at `zoom`, built by repeated `children`
/// expansion so that cell `i` of a grid always maps to the same tile.
pub fn progeny(tile: TileCoord, zoom: u8) -> Vec<TileCoord> {
    if zoom < tile.zoom {
        return Vec::new();
    }
    let mut tiles = vec![tile];
    for _ in tile.zoom..zoom {
        let mut next = Vec::with_capacity(tiles.len() * 4);
        for t in tiles.iter() {
            next.extend_from_slice(&t.children());
        }
        tiles = next;
    }
    tiles
}

/// Distinct parents of `tiles`, then their distinct parents, and so on while
/// the zoom stays at or above `min_zoom`. Each level is sorted by (z, x, y).
pub fn ancestor_levels(tiles: &[TileCoord], min_zoom: u8) -> Vec<Vec<TileCoord>> {
    let mut levels = Vec::new();
    let mut current: Vec<TileCoord> = tiles.to_vec();
    loop {
        let parents: BTreeSet<TileCoord> = current
            .iter()
            .filter_map(|tile| tile.parent())
            .filter(|tile| tile.zoom >= min_zoom)
            .collect();
        if parents.is_empty() {
            break;
        }
        current = parents.into_iter().collect();
        levels.push(current.clone());
    }
    levels
}

pub fn parse_tile_spec(value: &str) -> Result<TileCoord> {
    let trimmed = value.trim();
    let mut parts = trimmed.split('/');
    let zoom_str = parts.next().context("tile must be in z/x/y format")?;
    let x_str = parts.next().context("tile must be in z/x/y format")?;
    let y_str = parts.next().context("tile must be in z/x/y format")?;
    if parts.next().is_some() {
        anyhow::bail!("tile must be in z/x/y format");
    }
    let zoom: u8 = zoom_str.parse().context("invalid tile zoom")?;
    let x: u32 = x_str.parse().context("invalid tile x")?;
    let y: u32 = y_str.parse().context("invalid tile y")?;
    TileCoord::new(zoom, x, y)
}
