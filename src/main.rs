use anyhow::Result;
use clap::Parser;

use vt_grid::cli::{Cli, Command};
use vt_grid::config::{DEFAULT_BUSY_TIMEOUT, DEFAULT_WRITE_BATCH};
use vt_grid::mbtiles::{MbtilesReader, MbtilesWriter, copy_base_tiles};
use vt_grid::pyramid::{BuildOptions, build_grid};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Command::Build(args) => {
            let source_minzoom = if args.basezoom.is_none() {
                let range = MbtilesReader::open(&args.input)?.zoom_range()?;
                range.map(|(min, _)| min)
            } else {
                None
            };
            let stack = args.job_stack(source_minzoom)?;
            let options = BuildOptions {
                progress: !args.no_progress,
                name: args.name.clone(),
            };
            let stats = build_grid(&args.input, &args.output, &stack, &options)?;
            println!(
                "tiles: {} features: {} base_tiles: {} zoom: {}-{}",
                stats.tiles, stats.features, stats.base_tiles, stats.minzoom, stats.maxzoom
            );
        }
        Command::CopyBase(args) => {
            let source = MbtilesReader::open(&args.input)?;
            let mut dest = MbtilesWriter::create(&args.output, DEFAULT_BUSY_TIMEOUT)?;
            let tiles = source.list_tiles(args.zoom)?;
            let copied = copy_base_tiles(&source, &mut dest, &tiles, DEFAULT_WRITE_BATCH)?;
            let zoom = args.zoom.to_string();
            dest.write_metadata([
                ("format", "pbf".to_string()),
                ("minzoom", zoom.clone()),
                ("maxzoom", zoom),
            ])?;
            println!("copied {} tiles at z{}", copied, args.zoom);
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level).unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
