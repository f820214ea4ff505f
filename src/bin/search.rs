use anyhow::Result;
use clap::Parser;
use medvault::brief::{BriefSynthesizer, ClinicalBrief};
use medvault::record_store::RecordStore;
use medvault::search::{HybridQueryEngine, SearchOutcome};
use medvault::{telemetry, EmbedderArgs, StoreArgs, VaultArgs};

#[derive(Parser, Debug)]
#[command(
    name = "medvault-search",
    about = "Hybrid search over lab observations and chest X-rays"
)]
struct SearchCli {
    /// Clinical question or finding to search for
    #[arg(long)]
    query: String,

    /// Print the ranked hits as JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Skip the clinical brief
    #[arg(long, default_value_t = false)]
    no_brief: bool,

    #[command(flatten)]
    vault: VaultArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() -> Result<()> {
    telemetry::init();
    let cli = SearchCli::parse();
    let config = cli.vault.build_config()?;
    let embedder = cli.embedder.build()?;
    let mut backend = cli.store.connect()?;
    let records = RecordStore::new(&mut backend, &config);
    let engine = HybridQueryEngine::new(
        &embedder,
        &records,
        config.modalities.clone(),
        config.embedding_dim,
        config.max_tokens,
    );

    let outcome = engine.search(&cli.query, config.top_k_each)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.summary())?);
        return Ok(());
    }

    println!("--- Hybrid clinical view: '{}' ---", cli.query.trim());
    print!("{}", render_hits(&outcome));
    for warning in &outcome.warnings {
        eprintln!(
            "warning: {} search failed, results are partial: {}",
            warning.modality, warning.error
        );
    }
    if !cli.no_brief {
        println!();
        print!("{}", ClinicalBrief.render(cli.query.trim(), &outcome.results));
    }
    Ok(())
}

fn render_hits(outcome: &SearchOutcome) -> String {
    if outcome.results.is_empty() {
        return "no matching records\n".to_string();
    }
    let mut out = String::new();
    for hit in &outcome.results {
        out.push_str(&format!(
            "[{}] (similarity: {:.4})\n > {}\n",
            hit.modality.as_str().to_uppercase(),
            hit.similarity,
            hit.description
        ));
    }
    out
}
