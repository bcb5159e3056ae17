use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use rayon::prelude::*;

use crate::aggregate::aggregate_cells;
use crate::config::GridConfig;
use crate::feature::{CellFeature, LayerInput, SourceKind};
use crate::mbtiles::{MbtilesReader, MbtilesWriter, decode_layer_inputs, encode_cells, encode_tile_payload};
use crate::pyramid::progress::{ProgressSink, Throttle};
use crate::tile::{TileCoord, progeny};

/// Outcome of building one or more levels from a tile list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelReport {
    pub tiles: u64,
    pub features: u64,
    pub last_tile: Option<TileCoord>,
    /// Tiles written at the last zoom built.
    pub written: Vec<TileCoord>,
    /// Distinct parents of `written`.
    pub next_level: Vec<TileCoord>,
}

/// Builds grid levels bottom-up for one stage, writing every tile that
/// received at least one feature.
pub struct LevelBuilder<'a> {
    config: &'a GridConfig,
    source: &'a MbtilesReader,
    dest: &'a mut MbtilesWriter,
    /// What the stage's first grid level reads.
    first_kind: SourceKind,
    layers: BTreeSet<String>,
    progress: &'a dyn ProgressSink,
    cancel: &'a AtomicBool,
    pending: Vec<(TileCoord, Vec<u8>)>,
}

impl<'a> LevelBuilder<'a> {
    pub fn new(
        config: &'a GridConfig,
        source: &'a MbtilesReader,
        dest: &'a mut MbtilesWriter,
        first_kind: SourceKind,
        progress: &'a dyn ProgressSink,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            config,
            source,
            dest,
            first_kind,
            layers: config.layers().map(str::to_string).collect(),
            progress,
            cancel,
            pending: Vec::new(),
        }
    }

    /// Builds `tiles` (all at one zoom), then their parents, and so on until
    /// `stop_zoom` has been built.
    pub fn build(&mut self, tiles: Vec<TileCoord>, stop_zoom: u8) -> Result<LevelReport> {
        let mut report = LevelReport::default();
        let mut current = tiles;
        loop {
            let Some(zoom) = current.first().map(|tile| tile.zoom) else {
                break;
            };
            tracing::debug!("building {} tiles at z{}", current.len(), zoom);
            let written = self.build_level(&current, &mut report)?;
            let next: BTreeSet<TileCoord> = written.iter().filter_map(TileCoord::parent).collect();
            report.written = written;
            report.next_level = next.into_iter().collect();
            if zoom <= stop_zoom || zoom == 0 {
                break;
            }
            current = report.next_level.clone();
        }
        Ok(report)
    }

    fn build_level(&mut self, tiles: &[TileCoord], report: &mut LevelReport) -> Result<Vec<TileCoord>> {
        let mut written = Vec::new();
        let mut throttle = Throttle::new(self.progress);
        for tile in tiles.iter() {
            if self.cancel.load(Ordering::Relaxed) {
                anyhow::bail!("build cancelled at {tile}");
            }
            let inputs = self.read_children(*tile)?;
            let features: u64 = inputs.values().map(|input| input.len() as u64).sum();
            if features > 0 {
                self.write_tile(*tile, inputs)?;
                written.push(*tile);
                report.tiles += 1;
                report.features += features;
                report.last_tile = Some(*tile);
            }
            throttle.tick(features, *tile);
        }
        self.flush()?;
        throttle.flush();
        Ok(written)
    }

    fn read_children(&self, tile: TileCoord) -> Result<BTreeMap<String, LayerInput>> {
        let first_level = tile.zoom == self.config.maxzoom;
        let (children, kind) = if first_level {
            (progeny(tile, self.config.basezoom), self.first_kind)
        } else {
            (tile.children().to_vec(), SourceKind::Cells)
        };

        let mut payloads = Vec::with_capacity(children.len());
        for child in children {
            let data = if first_level && kind == SourceKind::Raw {
                self.source.get_tile(child)?
            } else {
                self.dest.get_tile(child)?
            };
            if let Some(data) = data {
                payloads.push((child, data));
            }
        }

        let layers = &self.layers;
        let decoded = payloads
            .par_iter()
            .map(|(child, data)| decode_layer_inputs(data, *child, layers, kind))
            .collect::<Result<Vec<_>>>()?;

        let mut merged: BTreeMap<String, LayerInput> = BTreeMap::new();
        for layers in decoded {
            for (name, input) in layers {
                merged
                    .entry(name)
                    .or_insert_with(|| LayerInput::empty(kind))
                    .extend(input)?;
            }
        }
        Ok(merged)
    }

    fn write_tile(&mut self, tile: TileCoord, inputs: BTreeMap<String, LayerInput>) -> Result<()> {
        let mut layers: BTreeMap<String, Vec<CellFeature>> = BTreeMap::new();
        for (name, input) in inputs.iter() {
            let Some(reducers) = self.config.reducers(name) else {
                continue;
            };
            let cells = aggregate_cells(
                input,
                tile,
                self.config.depth,
                reducers,
                self.config.post_aggregations(name),
            )?;
            layers.insert(name.clone(), cells);
        }
        let data = encode_tile_payload(&encode_cells(tile, &layers)?)?;
        self.pending.push((tile, data));
        if self.pending.len() >= self.config.write_batch {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        self.dest.put_tiles(&pending)
    }
}
