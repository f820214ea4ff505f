use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use medvault::error::MalformedInput;
use medvault::ingest::sources::{read_jsonl, ImageLabelRow, ImageSource, ObservationRow};
use medvault::ingest::{Ingestor, LabelIndex, RawRecord};
use medvault::{telemetry, EmbedderArgs, StoreArgs, VaultArgs};
use tracing::{info, warn};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

type RowIter = Box<dyn Iterator<Item = std::result::Result<RawRecord, MalformedInput>>>;

#[derive(Parser, Debug)]
#[command(
    name = "medvault-ingest",
    about = "Embed lab observations and chest X-rays into the pgvector records table"
)]
struct IngestCli {
    /// JSONL file of Synthea observation rows
    #[arg(long, env = "MEDVAULT_OBSERVATIONS")]
    observations: Option<PathBuf>,

    /// Max observation rows to ingest
    #[arg(long, env = "MEDVAULT_OBSERVATION_LIMIT", default_value_t = 1000)]
    observation_limit: usize,

    /// Directory of chest X-ray images (.png, .jpg, .jpeg)
    #[arg(long, env = "MEDVAULT_IMAGES_DIR")]
    images_dir: Option<PathBuf>,

    /// JSONL file mapping image file names to finding labels
    #[arg(long, env = "MEDVAULT_IMAGE_LABELS")]
    image_labels: Option<PathBuf>,

    /// Max images to ingest
    #[arg(long, env = "MEDVAULT_IMAGE_LIMIT", default_value_t = 500)]
    image_limit: usize,

    /// Create the vector extension/table automatically if missing
    #[arg(long, env = "MEDVAULT_PREPARE_SCHEMA", default_value_t = true)]
    prepare_schema: bool,

    /// Build an HNSW cosine index on the embedding column
    #[arg(long, env = "MEDVAULT_HNSW", default_value_t = true)]
    hnsw: bool,

    #[command(flatten)]
    vault: VaultArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() -> Result<()> {
    telemetry::init();
    let cli = IngestCli::parse();
    anyhow::ensure!(
        cli.observations.is_some() || cli.images_dir.is_some(),
        "nothing to ingest; pass --observations and/or --images-dir"
    );
    let config = cli.vault.build_config()?;
    let embedder = cli.embedder.build()?;

    let mut sources: Vec<RowIter> = Vec::new();
    if let Some(path) = &cli.observations {
        sources.push(observation_rows(path, cli.observation_limit)?);
    }
    if let Some(dir) = &cli.images_dir {
        let mut labels = match &cli.image_labels {
            Some(path) => load_labels(path)?,
            None => LabelIndex::default(),
        };
        // unreadable label rows are counted as failed rows
        let label_errors = std::mem::take(&mut labels.errors);
        sources.push(Box::new(
            label_errors
                .into_iter()
                .map(Err::<RawRecord, MalformedInput>),
        ));
        sources.push(image_rows(dir, labels, cli.image_limit)?);
    }

    let mut store = cli.store.connect()?;
    if cli.prepare_schema {
        store.prepare_schema(config.embedding_dim, cli.hnsw)?;
    }

    let ingestor = Ingestor::new(&embedder, config)?;
    let report = ingestor.ingest(&mut store, sources.into_iter().flatten())?;
    println!(
        "Inserted {} record{}, skipped {} duplicate{}, {} failed, into {}.",
        report.inserted,
        if report.inserted == 1 { "" } else { "s" },
        report.skipped,
        if report.skipped == 1 { "" } else { "s" },
        report.failed,
        store.table().qualified()
    );
    Ok(())
}

fn observation_rows(path: &Path, limit: usize) -> Result<RowIter> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let rows = read_jsonl::<ObservationRow, _>(BufReader::new(file), "observation")
        .take(limit)
        .map(|row| row.map(RawRecord::Observation));
    Ok(Box::new(rows))
}

fn load_labels(path: &Path) -> Result<LabelIndex> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let labels =
        LabelIndex::from_rows(read_jsonl::<ImageLabelRow, _>(BufReader::new(file), "image label"));
    if labels.duplicates > 0 {
        warn!(
            duplicates = labels.duplicates,
            "repeated image label rows ignored; first row per image kept"
        );
    }
    info!(
        labels = labels.len(),
        malformed = labels.errors.len(),
        "loaded image labels"
    );
    Ok(labels)
}

fn image_rows(dir: &Path, mut labels: LabelIndex, limit: usize) -> Result<RowIter> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {:?}", dir))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            paths.push(path);
        }
    }
    paths.sort();
    paths.truncate(limit);
    info!(images = paths.len(), dir = %dir.display(), "found images");

    let rows = paths.into_iter().map(move |path| {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = fs::read(&path)
            .map_err(|err| MalformedInput::new("image", format!("{}: {err}", path.display())))?;
        let finding_labels = labels.take(&filename);
        Ok(RawRecord::Image(ImageSource {
            filename,
            bytes,
            finding_labels,
        }))
    });
    Ok(Box::new(rows))
}
