//! Building the aggregated pyramid: level by level, in parallel rounds, one
//! stage after another.

pub mod distribute;
pub mod level;
pub mod progress;
pub mod worker;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};

use crate::aggregate::{Accumulator, weight_property};
use crate::config::{GridConfig, JobStack};
use crate::feature::QUADKEY_PROPERTY;
use crate::mbtiles::{MbtilesReader, MbtilesWriter, copy_base_tiles};
use crate::tile::ancestor_levels;

pub use self::distribute::{RoundPlan, plan_round};
pub use self::level::{LevelBuilder, LevelReport};
pub use self::progress::{NoProgress, ProgressSink, ProgressTracker, Throttle};
pub use self::worker::{StageContext, StageReport, WorkerMessage, run_stage};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub progress: bool,
    /// Dataset name for the output metadata. Defaults to the output file stem.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub base_tiles: u64,
    pub tiles: u64,
    pub features: u64,
    pub minzoom: u8,
    pub maxzoom: u8,
}

/// Builds the grid pyramid described by `stack` from `input` into a new
/// MBTiles file at `output`.
pub fn build_grid(
    input: &Path,
    output: &Path,
    stack: &JobStack,
    options: &BuildOptions,
) -> Result<BuildStats> {
    let first = stack.first();
    let source = MbtilesReader::open(input)?;
    let mut dest = MbtilesWriter::create(output, first.busy_timeout)?;

    let mut leaves = match first.input_tiles.as_ref() {
        Some(tiles) => tiles.clone(),
        None => source.list_tiles(first.basezoom)?,
    };
    leaves.sort();
    leaves.dedup();
    tracing::info!(
        "building z{}..z{} from {} tiles at z{}",
        first.maxzoom,
        stack.minzoom(),
        leaves.len(),
        first.basezoom
    );
    if leaves.is_empty() {
        tracing::warn!("no tiles at z{} in {}", first.basezoom, input.display());
    }

    let mut stats = BuildStats {
        minzoom: stack.minzoom(),
        maxzoom: first.maxzoom,
        ..BuildStats::default()
    };
    if first.include_base_data {
        stats.base_tiles = copy_base_tiles(&source, &mut dest, &leaves, first.write_batch)? as u64;
        stats.maxzoom = first.basezoom;
    }

    let mut tracker = if options.progress {
        let total: u64 = ancestor_levels(&leaves, stack.minzoom())
            .iter()
            .filter(|level| level.first().is_some_and(|tile| tile.zoom <= first.maxzoom))
            .map(|level| level.len() as u64)
            .sum();
        Some(ProgressTracker::new(total))
    } else {
        None
    };

    for (index, config) in stack.stages().iter().enumerate() {
        let ctx = StageContext {
            input,
            output,
            config,
            first_kind: stack.source_kind(index),
        };
        let report = run_stage(&ctx, &leaves, &mut tracker)
            .with_context(|| format!("stage {} (z{}..z{}) failed", index + 1, config.maxzoom, config.minzoom))?;
        tracing::info!(
            "stage {} wrote {} tiles from {} features",
            index + 1,
            report.tiles,
            report.features
        );
        stats.tiles += report.tiles;
        stats.features += report.features;
        leaves = report.written;
    }

    if let Some(tracker) = tracker {
        tracker.finish();
    }

    let metadata = output_metadata(&source, stack, output, options, &stats)?;
    dest.write_metadata(metadata.iter().map(|(name, value)| (name.as_str(), value.clone())))?;
    tracing::info!(
        "wrote {} grid tiles and {} base tiles to {}",
        stats.tiles,
        stats.base_tiles,
        output.display()
    );
    Ok(stats)
}

fn layer_fields(configs: &[GridConfig], layer: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for config in configs.iter() {
        if let Some(reducers) = config.reducers(layer) {
            for (field, reducer) in reducers.iter() {
                let kind = if reducer.produces_string() { "String" } else { "Number" };
                fields.insert(field.clone(), Value::from(kind));
                if reducer.weight(&Accumulator::Empty).is_some() {
                    fields.insert(weight_property(field), Value::from("Number"));
                }
            }
        }
        if let Some(posts) = config.post_aggregations(layer) {
            for field in posts.keys() {
                fields.insert(field.clone(), Value::from("Number"));
            }
        }
    }
    fields.insert(QUADKEY_PROPERTY.to_string(), Value::from("String"));
    fields
}

/// `vector_layers` for the grid layers, merged with the base layers when the
/// base data was copied.
fn vector_layers(source: &MbtilesReader, stack: &JobStack, stats: &BuildStats) -> Result<Vec<Value>> {
    let mut layers: BTreeMap<String, Value> = BTreeMap::new();
    for config in stack.stages().iter() {
        for layer in config.layers() {
            layers.entry(layer.to_string()).or_insert_with(|| {
                json!({
                    "id": layer,
                    "description": "",
                    "minzoom": stats.minzoom,
                    "maxzoom": stats.maxzoom,
                    "fields": layer_fields(stack.stages(), layer),
                })
            });
        }
    }

    if stack.first().include_base_data {
        let metadata = source.metadata()?;
        if let Some(text) = metadata.get("json") {
            let base: Value = serde_json::from_str(text).context("parse source metadata json")?;
            let base_layers = base
                .get("vector_layers")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for base_layer in base_layers {
                let Some(id) = base_layer.get("id").and_then(Value::as_str) else {
                    continue;
                };
                match layers.get_mut(id) {
                    Some(Value::Object(grid)) => {
                        if let Some(Value::Object(base_fields)) = base_layer.get("fields") {
                            if let Some(Value::Object(fields)) = grid.get_mut("fields") {
                                for (name, kind) in base_fields.iter() {
                                    fields.entry(name.clone()).or_insert_with(|| kind.clone());
                                }
                            }
                        }
                    }
                    _ => {
                        layers.insert(id.to_string(), base_layer.clone());
                    }
                }
            }
        }
    }
    Ok(layers.into_values().collect())
}

fn output_metadata(
    source: &MbtilesReader,
    stack: &JobStack,
    output: &Path,
    options: &BuildOptions,
    stats: &BuildStats,
) -> Result<Vec<(String, String)>> {
    let name = options.name.clone().unwrap_or_else(|| {
        output
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("vt-grid")
            .to_string()
    });
    let json = json!({ "vector_layers": vector_layers(source, stack, stats)? });
    let mut metadata = vec![
        ("name".to_string(), name),
        ("format".to_string(), "pbf".to_string()),
        ("type".to_string(), "overlay".to_string()),
        ("minzoom".to_string(), stats.minzoom.to_string()),
        ("maxzoom".to_string(), stats.maxzoom.to_string()),
        ("json".to_string(), json.to_string()),
    ];
    let source_metadata = source.metadata()?;
    for key in ["bounds", "center", "attribution"] {
        if let Some(value) = source_metadata.get(key) {
            metadata.push((key.to_string(), value.clone()));
        }
    }
    Ok(metadata)
}
