use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Result;
use crossbeam_channel::{Sender, unbounded};

use crate::config::GridConfig;
use crate::error::GridError;
use crate::feature::SourceKind;
use crate::mbtiles::{MbtilesReader, MbtilesWriter};
use crate::pyramid::distribute::{RoundPlan, plan_round};
use crate::pyramid::level::{LevelBuilder, LevelReport};
use crate::pyramid::progress::{ProgressSink, ProgressTracker};
use crate::tile::TileCoord;

#[derive(Debug)]
pub enum WorkerMessage {
    Progress {
        worker: usize,
        tiles: u64,
        features: u64,
        last_tile: TileCoord,
    },
    Finished {
        worker: usize,
        report: LevelReport,
    },
    Failed {
        worker: usize,
        error: String,
    },
}

struct ChannelProgress {
    worker: usize,
    sender: Sender<WorkerMessage>,
}

impl ProgressSink for ChannelProgress {
    fn report(&self, tiles: u64, features: u64, last_tile: TileCoord) {
        let _ = self.sender.send(WorkerMessage::Progress {
            worker: self.worker,
            tiles,
            features,
            last_tile,
        });
    }
}

/// Everything a worker needs to build its batch of one stage.
pub struct StageContext<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub config: &'a GridConfig,
    pub first_kind: SourceKind,
}

/// Totals across every round of a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub tiles: u64,
    pub features: u64,
    /// Tiles written at the stage's minzoom.
    pub written: Vec<TileCoord>,
}

fn run_worker(
    ctx: &StageContext<'_>,
    worker: usize,
    tiles: Vec<TileCoord>,
    stop_zoom: u8,
    sender: Sender<WorkerMessage>,
    cancel: &AtomicBool,
) {
    let progress = ChannelProgress {
        worker,
        sender: sender.clone(),
    };
    let result = (|| -> Result<LevelReport> {
        let source = MbtilesReader::open(ctx.input)?;
        let mut dest = MbtilesWriter::open(ctx.output, ctx.config.busy_timeout)?;
        let mut builder =
            LevelBuilder::new(ctx.config, &source, &mut dest, ctx.first_kind, &progress, cancel);
        builder.build(tiles, stop_zoom)
    })();
    let message = match result {
        Ok(report) => WorkerMessage::Finished { worker, report },
        Err(err) => WorkerMessage::Failed {
            worker,
            error: format!("{err:#}"),
        },
    };
    let _ = sender.send(message);
}

/// Runs one round: a thread per batch, all building down to the plan's
/// boundary zoom. Returns the boundary tiles written by any worker.
fn run_round(
    ctx: &StageContext<'_>,
    plan: &RoundPlan,
    tracker: &mut Option<ProgressTracker>,
) -> Result<StageReport> {
    let jobs = plan.batches.len();
    let cancel = AtomicBool::new(false);
    let (sender, receiver) = unbounded();
    let mut report = StageReport::default();
    let mut written = BTreeSet::new();
    let mut failure: Option<(usize, String)> = None;

    thread::scope(|scope| {
        for (worker, batch) in plan.batches.iter().enumerate() {
            let sender = sender.clone();
            let cancel = &cancel;
            let tiles = batch.clone();
            scope.spawn(move || {
                run_worker(
                    ctx,
                    worker,
                    tiles,
                    plan.boundary_zoom,
                    sender,
                    cancel,
                )
            });
        }
        drop(sender);

        let mut active = jobs;
        while active > 0 {
            let Ok(message) = receiver.recv() else {
                break;
            };
            match message {
                WorkerMessage::Progress {
                    tiles,
                    features,
                    last_tile,
                    ..
                } => {
                    if let Some(tracker) = tracker.as_mut() {
                        tracker.inc(active, tiles, features, last_tile);
                    }
                }
                WorkerMessage::Finished { worker, report: done } => {
                    tracing::debug!(
                        "worker {worker} finished: {} tiles, {} features",
                        done.tiles,
                        done.features
                    );
                    report.tiles += done.tiles;
                    report.features += done.features;
                    written.extend(done.written);
                    active -= 1;
                }
                WorkerMessage::Failed { worker, error } => {
                    tracing::warn!("worker {worker} failed: {error}");
                    cancel.store(true, Ordering::Relaxed);
                    if failure.is_none() {
                        failure = Some((worker, error));
                    }
                    active -= 1;
                }
            }
        }
    });

    if let Some((worker, message)) = failure {
        return Err(GridError::WorkerFailed { worker, message }.into());
    }
    report.written = written.into_iter().collect();
    Ok(report)
}

/// Builds one stage from its leaf tiles down to its minzoom, in rounds of
/// shrinking parallelism. Each round after the first starts from the
/// boundary tiles the previous round wrote.
pub fn run_stage(
    ctx: &StageContext<'_>,
    leaves: &[TileCoord],
    tracker: &mut Option<ProgressTracker>,
) -> Result<StageReport> {
    let config = ctx.config;
    let mut jobs = config.jobs;
    if jobs > 1 {
        let probe = MbtilesWriter::open(ctx.output, config.busy_timeout)?;
        if !probe.supports_concurrent_writers() {
            tracing::warn!("destination cannot take concurrent writers, using one worker");
            jobs = 1;
        }
    }

    let mut total = StageReport::default();
    let mut tiles = leaves.to_vec();
    let mut start_zoom = config.maxzoom;
    loop {
        let plan = plan_round(&tiles, jobs, config.minzoom, start_zoom);
        if plan.batches.is_empty() {
            break;
        }
        tracing::info!(
            "building z{}..z{} with {} workers",
            start_zoom,
            plan.boundary_zoom,
            plan.batches.len()
        );
        let round = run_round(ctx, &plan, tracker)?;
        total.tiles += round.tiles;
        total.features += round.features;
        total.written = round.written;
        if plan.is_final() || plan.boundary_zoom <= config.minzoom {
            break;
        }
        tiles = total.written.clone();
        start_zoom = plan.boundary_zoom - 1;
        jobs = (jobs / 4).max(1);
    }
    Ok(total)
}
