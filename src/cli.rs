use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::config::{GridConfig, GridConfigBuilder, JobFile, JobStack};
use crate::error::GridError;

#[derive(Debug, Parser)]
#[command(name = "vt-grid", version, about = "Aggregate vector tiles into grid pyramids")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error|warn|info|debug|trace)
    #[arg(long, default_value = "info")]
    pub log: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build grid levels above the base zoom of an MBTiles file.
    Build(BuildArgs),
    /// Copy the tiles of one zoom level into a new MBTiles file.
    CopyBase(CopyBaseArgs),
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    pub input: PathBuf,

    #[arg(long)]
    pub output: PathBuf,

    #[arg(long)]
    pub minzoom: Option<u8>,

    /// Zoom of the source data. Defaults to the lowest zoom stored in INPUT.
    #[arg(long)]
    pub basezoom: Option<u8>,

    /// First grid level. Defaults to basezoom - 1.
    #[arg(long)]
    pub maxzoom: Option<u8>,

    /// Cells per tile, a power of 4.
    #[arg(long)]
    pub gridsize: Option<u32>,

    #[arg(long)]
    pub jobs: Option<usize>,

    /// Aggregations as `layer:reducer(field)`, e.g. `buildings:sum(height)`.
    #[arg(long, num_args = 1.., conflicts_with = "config")]
    pub fields: Vec<String>,

    /// JSON job file with one stage or a `stages` list.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Do not copy the base zoom tiles into the output.
    #[arg(long, default_value_t = false)]
    pub no_base: bool,

    /// Tiles per write transaction.
    #[arg(long)]
    pub write_batch: Option<usize>,

    #[arg(long)]
    pub busy_timeout_ms: Option<u64>,

    /// Dataset name stored in the output metadata.
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
}

#[derive(Debug, Args)]
pub struct CopyBaseArgs {
    pub input: PathBuf,

    #[arg(long)]
    pub output: PathBuf,

    #[arg(long)]
    pub zoom: u8,
}

impl BuildArgs {
    /// Resolves flags and the optional job file into a validated stack.
    /// `source_minzoom` stands in for a missing basezoom.
    pub fn job_stack(&self, source_minzoom: Option<u8>) -> Result<JobStack> {
        let default_basezoom = self.basezoom.or(source_minzoom);
        let Some(path) = self.config.as_ref() else {
            let basezoom = default_basezoom.ok_or_else(|| {
                GridError::InvalidZoomRange("basezoom is required".to_string())
            })?;
            let mut builder = self.apply_overrides(GridConfig::builder(basezoom));
            if let Some(minzoom) = self.minzoom {
                builder = builder.minzoom(minzoom);
            }
            if let Some(maxzoom) = self.maxzoom {
                builder = builder.maxzoom(maxzoom);
            }
            if let Some(gridsize) = self.gridsize {
                builder = builder.gridsize(gridsize);
            }
            for field in self.fields.iter() {
                builder = builder.field(field)?;
            }
            return Ok(JobStack::single(builder.build()?));
        };

        let mut stages: Vec<GridConfig> = Vec::new();
        for stage in JobFile::load(path)?.into_stages() {
            let basezoom = match stages.last() {
                Some(previous) => Some(previous.minzoom),
                None => default_basezoom,
            };
            let builder = self.apply_overrides(stage.into_builder(basezoom)?);
            stages.push(builder.build()?);
        }
        tracing::debug!("loaded {} stages from {}", stages.len(), path.display());
        JobStack::new(stages)
    }

    fn apply_overrides(&self, mut builder: GridConfigBuilder) -> GridConfigBuilder {
        if let Some(jobs) = self.jobs {
            builder = builder.jobs(jobs);
        }
        if self.no_base {
            builder = builder.include_base_data(false);
        }
        if let Some(write_batch) = self.write_batch {
            builder = builder.write_batch(write_batch);
        }
        if let Some(ms) = self.busy_timeout_ms {
            builder = builder.busy_timeout(Duration::from_millis(ms));
        }
        builder
    }
}
