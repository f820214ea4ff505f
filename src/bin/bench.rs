use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use medvault::record_store::RecordStore;
use medvault::search::HybridQueryEngine;
use medvault::vector_store::VectorStore;
use medvault::{telemetry, EmbedderArgs, StoreArgs, VaultArgs};
use serde::{Deserialize, Serialize};

const DEFAULT_QUERIES: [&str; 4] = [
    "pneumonia with pleural effusion",
    "consolidation and blunted costophrenic angles",
    "respiratory distress with high leukocyte count",
    "Patient with high Body Mass Index and respiratory issues",
];

#[derive(Parser, Debug)]
#[command(
    name = "medvault-bench",
    about = "Measure hybrid search latency against the records table"
)]
struct BenchCli {
    /// JSONL file of {"query": ...} lines; defaults to a built-in pathology set
    #[arg(long, env = "MEDVAULT_BENCH_QUERIES")]
    queries: Option<PathBuf>,

    /// Rounds over the query set
    #[arg(long, default_value_t = 3)]
    iterations: usize,

    /// Optional JSON report output path
    #[arg(long, env = "MEDVAULT_BENCH_REPORT")]
    report_json: Option<PathBuf>,

    #[command(flatten)]
    vault: VaultArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

#[derive(Debug, Deserialize)]
struct BenchQuery {
    query: String,
}

#[derive(Debug, Serialize)]
struct QueryTiming {
    iteration: usize,
    query: String,
    latency_ms: f64,
    results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_similarity: Option<f32>,
    degraded: bool,
}

#[derive(Debug, Serialize)]
struct BenchSummary {
    runs: usize,
    records: usize,
    mean_latency_ms: f64,
    p50_latency_ms: f64,
    max_latency_ms: f64,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    summary: BenchSummary,
    timings: Vec<QueryTiming>,
}

fn main() -> Result<()> {
    telemetry::init();
    let cli = BenchCli::parse();
    let queries = match &cli.queries {
        Some(path) => load_queries(path)?,
        None => DEFAULT_QUERIES.iter().map(|q| q.to_string()).collect(),
    };
    anyhow::ensure!(!queries.is_empty(), "query file contains no queries");
    let config = cli.vault.build_config()?;
    let embedder = cli.embedder.build()?;
    let mut backend = cli.store.connect()?;
    let records = RecordStore::new(&mut backend, &config);
    let record_count = records.store().len()?;
    let engine = HybridQueryEngine::new(
        &embedder,
        &records,
        config.modalities.clone(),
        config.embedding_dim,
        config.max_tokens,
    );

    println!("--- Hybrid search benchmark ({record_count} records) ---");
    let mut timings = Vec::new();
    for iteration in 1..=cli.iterations.max(1) {
        for query in &queries {
            let started = Instant::now();
            let outcome = engine.search(query, config.top_k_each)?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            let top_similarity = outcome.results.first().map(|hit| hit.similarity);
            println!(
                "iteration {iteration} | {latency_ms:>8.2} ms | top {} | {query}",
                top_similarity
                    .map(|s| format!("{s:.4}"))
                    .unwrap_or_else(|| "n/a".to_string())
            );
            timings.push(QueryTiming {
                iteration,
                query: query.clone(),
                latency_ms,
                results: outcome.results.len(),
                top_similarity,
                degraded: outcome.is_degraded(),
            });
        }
    }

    let report = BenchReport {
        summary: summarize(&timings, record_count),
        timings,
    };
    render_summary(&report.summary);
    if let Some(path) = &cli.report_json {
        let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        serde_json::to_writer_pretty(file, &report).context("failed to write JSON report")?;
        println!("wrote JSON report to {:?}", path);
    }
    Ok(())
}

fn load_queries(path: &PathBuf) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut queries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read query line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let query: BenchQuery = serde_json::from_str(&line)
            .with_context(|| format!("invalid query record at line {}", idx + 1))?;
        queries.push(query.query);
    }
    Ok(queries)
}

fn summarize(timings: &[QueryTiming], records: usize) -> BenchSummary {
    let mut latencies: Vec<f64> = timings.iter().map(|t| t.latency_ms).collect();
    latencies.sort_by(f64::total_cmp);
    let runs = latencies.len();
    let mean = if runs == 0 {
        0.0
    } else {
        latencies.iter().sum::<f64>() / runs as f64
    };
    BenchSummary {
        runs,
        records,
        mean_latency_ms: mean,
        p50_latency_ms: latencies.get(runs / 2).copied().unwrap_or(0.0),
        max_latency_ms: latencies.last().copied().unwrap_or(0.0),
    }
}

fn render_summary(summary: &BenchSummary) {
    println!("--- Benchmark Summary ---");
    println!("runs: {}", summary.runs);
    println!("records: {}", summary.records);
    println!("mean latency (ms): {:.2}", summary.mean_latency_ms);
    println!("p50 latency (ms): {:.2}", summary.p50_latency_ms);
    println!("max latency (ms): {:.2}", summary.max_latency_ms);
}
