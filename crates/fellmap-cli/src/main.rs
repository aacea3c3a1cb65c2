use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fellmap_storage::SnapshotStore;
use fellmap_sync::{BuildConfig, BuildMode, BuildPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fellmap-cli")]
#[command(about = "Scrape fell race listings and publish a month-layered race map")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape new races, update the snapshot and re-render the map (default).
    Build(BuildArgs),
    /// Re-render the map from the saved snapshot without touching the network.
    Render(PathArgs),
}

#[derive(Debug, Default, Args)]
struct PathArgs {
    /// Race snapshot (Parquet). Overrides FELLMAP_DATA_PATH.
    #[arg(long)]
    data: Option<PathBuf>,
    /// Output page. Overrides FELLMAP_MAP_PATH.
    #[arg(long)]
    map: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct BuildArgs {
    /// Ignore the saved snapshot and rebuild every race.
    #[arg(long)]
    full: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    paths: PathArgs,
}

impl PathArgs {
    fn apply(self, config: &mut BuildConfig) {
        if let Some(data) = self.data {
            config.data_path = data;
        }
        if let Some(map) = self.map {
            config.map_path = map;
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = BuildConfig::from_env();

    match cli.command.unwrap_or(Commands::Build(BuildArgs::default())) {
        Commands::Build(args) => {
            args.paths.apply(&mut config);
            let mode = if args.full {
                BuildMode::Full
            } else {
                BuildMode::Incremental
            };
            let map_path = config.map_path.clone();
            // The page is rendered before the snapshot is saved, so a render
            // failure leaves both files as they were.
            let (run, (layers, html)) = BuildPipeline::new(config)?
                .run_once_then(mode, |table| {
                    let layers = fellmap_web::group_by_month(table);
                    let html = fellmap_web::render_map(&layers)?;
                    Ok((layers, html))
                })
                .await?;
            fellmap_web::write_map(&map_path, &html).await?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&run.summary)?);
            } else {
                let s = &run.summary;
                println!(
                    "build complete: run_id={} added={} dropped={} total={} mapped={} snapshot={} map={}",
                    s.run_id,
                    s.counts.added_races,
                    s.counts.dropped_without_location,
                    s.counts.total_races,
                    layers.marker_count(),
                    s.snapshot_path,
                    map_path.display()
                );
            }
        }
        Commands::Render(paths) => {
            paths.apply(&mut config);
            let store = SnapshotStore::new(config.data_path.clone());
            let table = store.load().await?.with_context(|| {
                format!(
                    "no race snapshot at {}; run `fellmap-cli build` first",
                    store.path().display()
                )
            })?;
            info!(races = table.len(), "snapshot loaded");
            let layers = fellmap_web::publish_map(&table, &config.map_path).await?;
            println!(
                "render complete: races={} mapped={} map={}",
                table.len(),
                layers.marker_count(),
                config.map_path.display()
            );
        }
    }

    Ok(())
}
