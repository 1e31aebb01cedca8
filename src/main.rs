use anyhow::Result;
use clap::Parser;
use ecodata_builder::pipeline::{BuildPipeline, PipelineConfig};
use ecodata_builder::source::{HttpSource, ImpactSource, StaticSource};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

#[derive(Parser)]
#[command(name = "ecodata-builder")]
#[command(about = "Builds the published environmental-impact datasets")]
struct Args {
    /// Path to the entity catalog
    #[arg(long, default_value = "data/activities.json")]
    catalog: PathBuf,

    /// Path to the indicator definitions
    #[arg(long, default_value = "data/impacts.json")]
    indicators: PathBuf,

    /// Where the published process dataset is written
    #[arg(short, long, default_value = "public/data/processes.json")]
    output: PathBuf,

    /// Optional ingredient listing output
    #[arg(long)]
    ingredients: Option<PathBuf>,

    /// Previous dataset to diff against (defaults to the output path)
    #[arg(long)]
    previous: Option<PathBuf>,

    /// Maximum concurrent impact-source calls
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Impact source base URL (or set ECODATA_SOURCE_URL)
    #[arg(long)]
    source_url: Option<String>,

    /// Read impacts from a fixture file instead of the HTTP source
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let source: Arc<dyn ImpactSource> = match &args.fixture {
        Some(path) => Arc::new(StaticSource::load(path)?),
        None => match &args.source_url {
            Some(url) => Arc::new(HttpSource::new(url.clone())),
            None => Arc::new(HttpSource::from_env()),
        },
    };

    let pipeline = BuildPipeline::new(
        PipelineConfig {
            catalog_path: args.catalog,
            indicators_path: args.indicators,
            output_path: args.output,
            ingredients_path: args.ingredients,
            previous_path: args.previous,
            concurrency: args.concurrency,
        },
        source,
    );

    let summary = pipeline.run().await?;
    println!("{}", summary);

    if !summary.is_success() {
        error!("Derived processes were dropped because a dependency failed to resolve");
        std::process::exit(1);
    }

    Ok(())
}
