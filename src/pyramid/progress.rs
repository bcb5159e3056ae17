use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::tile::TileCoord;

/// Tiles between two progress reports from a level builder.
pub const REPORT_EVERY: u64 = 10;

/// Receives progress from level builders. Reporting never affects results.
pub trait ProgressSink: Send + Sync {
    fn report(&self, tiles: u64, features: u64, last_tile: TileCoord);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _tiles: u64, _features: u64, _last_tile: TileCoord) {}
}

/// Batches per-tile updates into one report every [`REPORT_EVERY`] tiles.
pub struct Throttle<'a> {
    sink: &'a dyn ProgressSink,
    tiles: u64,
    features: u64,
    last_tile: Option<TileCoord>,
}

impl<'a> Throttle<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            tiles: 0,
            features: 0,
            last_tile: None,
        }
    }

    pub fn tick(&mut self, features: u64, tile: TileCoord) {
        self.tiles += 1;
        self.features += features;
        self.last_tile = Some(tile);
        if self.tiles >= REPORT_EVERY {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if let Some(tile) = self.last_tile {
            if self.tiles > 0 {
                self.sink.report(self.tiles, self.features, tile);
            }
        }
        self.tiles = 0;
        self.features = 0;
    }
}

impl Drop for Throttle<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Terminal progress for a whole build: a bar over the expected number of
/// tiles, annotated with throughput and the last tile reported.
pub struct ProgressTracker {
    pub bar: ProgressBar,
    pub total: u64,
    pub processed: u64,
    features: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            bar: make_progress_bar(total),
            total,
            processed: 0,
            features: 0,
            started: Instant::now(),
        }
    }

    pub fn inc(&mut self, jobs: usize, tiles: u64, features: u64, last_tile: TileCoord) {
        self.processed = self.processed.saturating_add(tiles);
        self.features = self.features.saturating_add(features);
        let pos = self.processed.min(self.total.saturating_sub(1));
        self.bar.set_position(pos);
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.processed as f64 / elapsed
        } else {
            0.0
        };
        let avg = if self.processed > 0 {
            self.features / self.processed
        } else {
            0
        };
        self.bar.set_message(format!(
            "[{avg} feats/tile] [{rate:.2} tiles/s] [{jobs} jobs] [{last_tile}]"
        ));
    }

    pub fn finish(self) {
        self.bar.set_position(self.total);
        self.bar.finish_and_clear();
    }
}

fn make_progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr_with_hz(10));
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.enable_steady_tick(Duration::from_millis(200));
    bar
}
