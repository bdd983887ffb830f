use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cnbkit::asset::{AssetFetcher, AssetPackage, AssetReader, FetchOptions};
use cnbkit::config::{Config, PullPolicy};
use cnbkit::download::Downloader;
use cnbkit::image::{LayoutStore, ReadableImage};
use cnbkit::logging::init_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cnbkit", version, about = "Builder and asset cache tooling for Cloud Native Buildpacks")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "CNBKIT_LOG_JSON")]
    json_logs: bool,

    /// always, if-not-present or never
    #[arg(long, global = true, env = "CNBKIT_PULL_POLICY")]
    pull_policy: Option<PullPolicy>,

    /// Download cache directory; stored images live under it too
    #[arg(long, global = true, env = "CNBKIT_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Concurrent downloads of remote asset packages
    #[arg(long, global = true, env = "CNBKIT_DOWNLOAD_WORKERS")]
    download_workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collect the assets of every reference into one asset package file
    MergeAssets {
        output: PathBuf,
        #[arg(required = true)]
        assets: Vec<String>,
        #[arg(long, default_value = "linux")]
        os: String,
        #[arg(long, default_value = "amd64")]
        arch: String,
    },
    /// Print the asset metadata of a reference as JSON
    InspectAssets { asset: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(policy) = cli.pull_policy {
        config.pull_policy = policy;
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(workers) = cli.download_workers {
        config.download_workers = workers.max(1);
    }

    if let Err(e) = init_logging(cli.json_logs || config.log_json) {
        eprintln!("failed to initialize logging: {}", e);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let fetcher = AssetFetcher::with_workers(
        Arc::new(Downloader::new(&config.cache_dir)),
        Arc::new(LayoutStore::new(&config.cache_dir)),
        config.download_workers,
    );
    let opts = FetchOptions::new()?.with_pull_policy(config.pull_policy);

    match cli.command {
        Command::MergeAssets {
            output,
            assets,
            os,
            arch,
        } => {
            let images = fetcher.fetch_assets(&cancel, &assets, &opts).await?;
            let mut package = AssetPackage::new(&os, &arch)?;
            for (name, image) in assets.iter().zip(&images) {
                let (blobs, _) = AssetReader::new()
                    .read(image.as_ref())
                    .with_context(|| format!("reading assets from '{}'", name))?;
                package.add_asset_blobs(blobs);
            }
            package
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(output = %output.display(), assets = package.len(), "Merged assets");
        }
        Command::InspectAssets { asset } => {
            let images = fetcher
                .fetch_assets(&cancel, std::slice::from_ref(&asset), &opts)
                .await?;
            for image in &images {
                print_assets(image.as_ref())?;
            }
        }
    }
    Ok(())
}

fn print_assets(image: &dyn ReadableImage) -> Result<()> {
    let (_, metadata) = AssetReader::new().read(image)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}
