use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::aggregate::post::{LayerPostAggregations, PostAggregation, resolve_post_aggregation};
use crate::aggregate::reducer::{LayerReducers, Reducer, resolve_reducer};
use crate::error::GridError;
use crate::feature::SourceKind;
use crate::tile::{MAX_ZOOM, TileCoord};

/// Layer name to its reducers.
pub type Aggregations = BTreeMap<String, LayerReducers>;
/// Layer name to its post-aggregations.
pub type PostAggregations = BTreeMap<String, LayerPostAggregations>;

pub const DEFAULT_MINZOOM: u8 = 1;
pub const DEFAULT_GRIDSIZE: u32 = 1024;
pub const DEFAULT_WRITE_BATCH: usize = 100;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of quadtree levels between a tile and its grid cells: `gridsize`
/// must be `4^depth`.
pub fn grid_depth(gridsize: u32) -> Result<u8> {
    if gridsize == 0 {
        return Err(GridError::InvalidGridSize(gridsize).into());
    }
    let mut depth = 0u8;
    let mut size = gridsize;
    while size > 1 {
        if size % 4 != 0 {
            return Err(GridError::InvalidGridSize(gridsize).into());
        }
        size /= 4;
        depth += 1;
    }
    Ok(depth)
}

pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Settings for one stage of the pyramid, fixed before any tile is built.
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub minzoom: u8,
    pub basezoom: u8,
    /// Zoom of the first grid level; its tiles read their whole progeny down
    /// to `basezoom`.
    pub maxzoom: u8,
    pub gridsize: u32,
    pub depth: u8,
    pub jobs: usize,
    pub aggregations: Aggregations,
    pub post_aggregations: PostAggregations,
    pub include_base_data: bool,
    pub write_batch: usize,
    pub busy_timeout: Duration,
    pub input_tiles: Option<Vec<TileCoord>>,
}

impl GridConfig {
    pub fn builder(basezoom: u8) -> GridConfigBuilder {
        GridConfigBuilder::new(basezoom)
    }

    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.aggregations.keys().map(String::as_str)
    }

    pub fn reducers(&self, layer: &str) -> Option<&LayerReducers> {
        self.aggregations.get(layer)
    }

    pub fn post_aggregations(&self, layer: &str) -> Option<&LayerPostAggregations> {
        self.post_aggregations.get(layer)
    }
}

#[derive(Debug, Clone)]
pub struct GridConfigBuilder {
    minzoom: Option<u8>,
    basezoom: u8,
    maxzoom: Option<u8>,
    gridsize: u32,
    jobs: usize,
    aggregations: Aggregations,
    post_aggregations: PostAggregations,
    include_base_data: bool,
    write_batch: usize,
    busy_timeout: Duration,
    input_tiles: Option<Vec<TileCoord>>,
}

impl GridConfigBuilder {
    pub fn new(basezoom: u8) -> Self {
        Self {
            minzoom: None,
            basezoom,
            maxzoom: None,
            gridsize: DEFAULT_GRIDSIZE,
            jobs: default_jobs(),
            aggregations: Aggregations::new(),
            post_aggregations: PostAggregations::new(),
            include_base_data: true,
            write_batch: DEFAULT_WRITE_BATCH,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            input_tiles: None,
        }
    }

    pub fn minzoom(mut self, minzoom: u8) -> Self {
        self.minzoom = Some(minzoom);
        self
    }

    pub fn basezoom(mut self, basezoom: u8) -> Self {
        self.basezoom = basezoom;
        self
    }

    pub fn maxzoom(mut self, maxzoom: u8) -> Self {
        self.maxzoom = Some(maxzoom);
        self
    }

    pub fn gridsize(mut self, gridsize: u32) -> Self {
        self.gridsize = gridsize;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn include_base_data(mut self, include: bool) -> Self {
        self.include_base_data = include;
        self
    }

    pub fn write_batch(mut self, write_batch: usize) -> Self {
        self.write_batch = write_batch.max(1);
        self
    }

    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn input_tiles(mut self, tiles: Vec<TileCoord>) -> Self {
        self.input_tiles = Some(tiles);
        self
    }

    pub fn reducer(
        mut self,
        layer: &str,
        output: &str,
        reducer: Arc<dyn Reducer>,
    ) -> Self {
        self.aggregations
            .entry(layer.to_string())
            .or_default()
            .insert(output.to_string(), reducer);
        self
    }

    pub fn post_aggregation(
        mut self,
        layer: &str,
        output: &str,
        post: Arc<dyn PostAggregation>,
    ) -> Self {
        self.post_aggregations
            .entry(layer.to_string())
            .or_default()
            .insert(output.to_string(), post);
        self
    }

    /// Adds a reducer from a `layer:reducer(field)` spec.
    pub fn field(self, spec: &str) -> Result<Self> {
        let field = parse_field_spec(spec)?;
        let reducer = resolve_reducer(&field.reducer, &field.source)?;
        Ok(self.reducer(&field.layer, &field.output, reducer))
    }

    pub fn build(self) -> Result<GridConfig> {
        let depth = grid_depth(self.gridsize)?;
        let minzoom = self
            .minzoom
            .unwrap_or_else(|| DEFAULT_MINZOOM.min(self.basezoom.saturating_sub(1)));
        let maxzoom = match self.maxzoom {
            Some(maxzoom) => maxzoom,
            None => self.basezoom.checked_sub(1).ok_or_else(|| {
                GridError::InvalidZoomRange("basezoom must be at least 1".to_string())
            })?,
        };
        if self.basezoom > MAX_ZOOM {
            return Err(GridError::InvalidZoomRange(format!(
                "basezoom {} exceeds {}",
                self.basezoom, MAX_ZOOM
            ))
            .into());
        }
        if !(minzoom <= maxzoom && maxzoom < self.basezoom) {
            return Err(GridError::InvalidZoomRange(format!(
                "expected minzoom <= maxzoom < basezoom, got {} / {} / {}",
                minzoom, maxzoom, self.basezoom
            ))
            .into());
        }
        if maxzoom + depth > MAX_ZOOM {
            return Err(GridError::InvalidZoomRange(format!(
                "grid cells at z{} would exceed z{}",
                maxzoom + depth,
                MAX_ZOOM
            ))
            .into());
        }
        if self.aggregations.is_empty() {
            anyhow::bail!("at least one aggregation is required");
        }
        if let Some(tiles) = self.input_tiles.as_ref() {
            if let Some(tile) = tiles.iter().find(|tile| tile.zoom != self.basezoom) {
                return Err(GridError::InvalidZoomRange(format!(
                    "input tile {} is not at basezoom {}",
                    tile, self.basezoom
                ))
                .into());
            }
        }
        Ok(GridConfig {
            minzoom,
            basezoom: self.basezoom,
            maxzoom,
            gridsize: self.gridsize,
            depth,
            jobs: self.jobs,
            aggregations: self.aggregations,
            post_aggregations: self.post_aggregations,
            include_base_data: self.include_base_data,
            write_batch: self.write_batch,
            busy_timeout: self.busy_timeout,
            input_tiles: self.input_tiles,
        })
    }
}

/// One `layer:reducer(field)` command-line aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub layer: String,
    pub reducer: String,
    pub source: String,
    pub output: String,
}

pub fn parse_field_spec(spec: &str) -> Result<FieldSpec> {
    let invalid = || GridError::InvalidFieldSpec(spec.to_string());
    let (layer, call) = spec.trim().split_once(':').ok_or_else(invalid)?;
    let (reducer, source) = parse_call(call).ok_or_else(invalid)?;
    if layer.is_empty() {
        return Err(invalid().into());
    }
    let output = if source.is_empty() {
        reducer.clone()
    } else {
        source.clone()
    };
    Ok(FieldSpec {
        layer: layer.to_string(),
        reducer,
        source,
        output,
    })
}

/// Splits `name(arg)` into its parts. A bare `name` has an empty argument.
fn parse_call(call: &str) -> Option<(String, String)> {
    let call = call.trim();
    match call.split_once('(') {
        Some((name, rest)) => {
            let arg = rest.strip_suffix(')')?;
            if name.is_empty() || arg.contains('(') {
                return None;
            }
            Some((name.trim().to_string(), arg.trim().to_string()))
        }
        None if !call.is_empty() => Some((call.to_string(), String::new())),
        None => None,
    }
}

/// A validated list of stages, ordered from the highest basezoom down. Each
/// stage starts where the previous one stopped.
#[derive(Debug, Clone)]
pub struct JobStack {
    stages: Vec<GridConfig>,
}

impl JobStack {
    pub fn new(mut stages: Vec<GridConfig>) -> Result<Self> {
        if stages.is_empty() {
            anyhow::bail!("at least one stage is required");
        }
        stages.sort_by(|a, b| b.basezoom.cmp(&a.basezoom));
        for pair in stages.windows(2) {
            if pair[1].basezoom != pair[0].minzoom {
                return Err(GridError::ZoomRangeMismatch {
                    basezoom: pair[1].basezoom,
                    minzoom: pair[0].minzoom,
                }
                .into());
            }
        }
        Ok(Self { stages })
    }

    pub fn single(config: GridConfig) -> Self {
        Self {
            stages: vec![config],
        }
    }

    pub fn stages(&self) -> &[GridConfig] {
        &self.stages
    }

    pub fn first(&self) -> &GridConfig {
        &self.stages[0]
    }

    /// Raw features feed the first stage; later stages regrid cells.
    pub fn source_kind(&self, stage: usize) -> SourceKind {
        if stage == 0 {
            SourceKind::Raw
        } else {
            SourceKind::Cells
        }
    }

    pub fn minzoom(&self) -> u8 {
        self.stages.last().map(|s| s.minzoom).unwrap_or(0)
    }

    pub fn basezoom(&self) -> u8 {
        self.first().basezoom
    }
}

/// A stage as written in a JSON job file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageFile {
    pub minzoom: Option<u8>,
    pub basezoom: Option<u8>,
    pub maxzoom: Option<u8>,
    pub gridsize: Option<u32>,
    pub jobs: Option<usize>,
    pub include_base_data: Option<bool>,
    pub write_batch: Option<usize>,
    pub busy_timeout_ms: Option<u64>,
    pub input_tiles: Option<Vec<[u32; 3]>>,
    /// `layer -> output field -> "reducer"` or `"reducer(source)"`.
    #[serde(default)]
    pub aggregations: BTreeMap<String, BTreeMap<String, String>>,
    /// `layer -> output field -> "postAggregation(field)"`.
    #[serde(default)]
    pub post_aggregations: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JobFile {
    Stages { stages: Vec<StageFile> },
    Single(StageFile),
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read job file: {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("failed to parse job file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let job: JobFile = serde_json::from_str(contents)?;
        Ok(job)
    }

    pub fn into_stages(self) -> Vec<StageFile> {
        match self {
            JobFile::Stages { stages } => stages,
            JobFile::Single(stage) => vec![stage],
        }
    }
}

impl StageFile {
    /// Resolves names into reducers. `default_basezoom` fills a missing
    /// basezoom, usually the source's minzoom.
    pub fn into_builder(self, default_basezoom: Option<u8>) -> Result<GridConfigBuilder> {
        let basezoom = self.basezoom.or(default_basezoom).ok_or_else(|| {
            GridError::InvalidZoomRange("basezoom is required".to_string())
        })?;
        let mut builder = GridConfigBuilder::new(basezoom);
        if let Some(minzoom) = self.minzoom {
            builder = builder.minzoom(minzoom);
        }
        if let Some(maxzoom) = self.maxzoom {
            builder = builder.maxzoom(maxzoom);
        }
        if let Some(gridsize) = self.gridsize {
            builder = builder.gridsize(gridsize);
        }
        if let Some(jobs) = self.jobs {
            builder = builder.jobs(jobs);
        }
        if let Some(include) = self.include_base_data {
            builder = builder.include_base_data(include);
        }
        if let Some(write_batch) = self.write_batch {
            builder = builder.write_batch(write_batch);
        }
        if let Some(ms) = self.busy_timeout_ms {
            builder = builder.busy_timeout(Duration::from_millis(ms));
        }
        if let Some(tiles) = self.input_tiles {
            let tiles = tiles
                .into_iter()
                .map(TileCoord::from_zxy)
                .collect::<Result<Vec<_>>>()?;
            builder = builder.input_tiles(tiles);
        }
        for (layer, fields) in self.aggregations.iter() {
            for (output, call) in fields.iter() {
                let (name, source) = parse_call(call)
                    .ok_or_else(|| GridError::InvalidFieldSpec(call.clone()))?;
                let source = if source.is_empty() { output.clone() } else { source };
                builder = builder.reducer(layer, output, resolve_reducer(&name, &source)?);
            }
        }
        for (layer, fields) in self.post_aggregations.iter() {
            for (output, call) in fields.iter() {
                let (name, source) = parse_call(call)
                    .ok_or_else(|| GridError::InvalidFieldSpec(call.clone()))?;
                builder =
                    builder.post_aggregation(layer, output, resolve_post_aggregation(&name, &source)?);
            }
        }
        Ok(builder)
    }
}
