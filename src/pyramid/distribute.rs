use std::collections::HashMap;

use crate::tile::{TileCoord, ancestor_levels};

/// How one parallel round splits the work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPlan {
    /// Lowest zoom the round builds. Batches never share a tile at or above
    /// this zoom.
    pub boundary_zoom: u8,
    /// Tiles to build per zoom, from the round's first level down to the
    /// last level of the stage.
    pub levels: Vec<Vec<TileCoord>>,
    /// First-level tiles per worker.
    pub batches: Vec<Vec<TileCoord>>,
}

impl RoundPlan {
    /// Whether this round builds everything down to the last level.
    pub fn is_final(&self) -> bool {
        self.levels
            .last()
            .and_then(|level| level.first())
            .is_none_or(|tile| tile.zoom == self.boundary_zoom)
    }

    pub fn total_tiles(&self) -> u64 {
        self.levels.iter().map(|level| level.len() as u64).sum()
    }
}

/// Splits the pyramid above `tiles` into at most `jobs` disjoint batches.
///
/// Only levels at or below `start_zoom` and at or above `minzoom` are
/// considered. The boundary is the deepest level reachable while every level
/// down to it still has at least `jobs` tiles; its tiles are dealt round-robin
/// to batches. When even the first level is too small, a single batch builds
/// everything.
pub fn plan_round(tiles: &[TileCoord], jobs: usize, minzoom: u8, start_zoom: u8) -> RoundPlan {
    let jobs = jobs.max(1);
    let levels: Vec<Vec<TileCoord>> = ancestor_levels(tiles, minzoom)
        .into_iter()
        .filter(|level| level.first().is_some_and(|tile| tile.zoom <= start_zoom))
        .collect();

    let Some(first) = levels.first() else {
        return RoundPlan {
            boundary_zoom: minzoom,
            levels,
            batches: Vec::new(),
        };
    };

    let serial = levels
        .iter()
        .take_while(|level| level.len() >= jobs)
        .count()
        .checked_sub(1);

    let last_zoom = levels
        .last()
        .and_then(|level| level.first())
        .map(|tile| tile.zoom)
        .unwrap_or(minzoom);

    let serial = match serial {
        Some(serial) if jobs > 1 => serial,
        _ => {
            let batches = vec![first.clone()];
            return RoundPlan {
                boundary_zoom: last_zoom,
                levels,
                batches,
            };
        }
    };

    let boundary = &levels[serial];
    let boundary_zoom = boundary[0].zoom;
    let owner: HashMap<TileCoord, usize> = boundary
        .iter()
        .enumerate()
        .map(|(i, tile)| (*tile, i % jobs))
        .collect();

    let mut batches: Vec<Vec<TileCoord>> = vec![Vec::new(); jobs];
    for tile in first.iter() {
        if let Some(batch) = tile
            .ancestor_at(boundary_zoom)
            .and_then(|ancestor| owner.get(&ancestor))
        {
            batches[*batch].push(*tile);
        }
    }
    batches.retain(|batch| !batch.is_empty());

    RoundPlan {
        boundary_zoom,
        levels,
        batches,
    }
}
