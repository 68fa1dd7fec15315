//! CLI (C13, ambient): ingest a newline-delimited JSON corpus of
//! `{"id": <u32>, "fulltext": "..."}` records and print a summary of the
//! clusters the engine formed.

use anyhow::{Context, Result};
use dedupe_engine::{dump_clusters, ingest, init_tracing_once, DedupeConfig, EvidenceStore, InMemoryEvidenceStore, MemoryKvStore};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Deserialize)]
struct CardRecord {
    id: u32,
    fulltext: String,
}

fn main() -> Result<()> {
    init_tracing_once();

    let path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./corpus.ndjson"));

    let file = File::open(&path).with_context(|| format!("opening corpus file {}", path.display()))?;
    let reader = BufReader::new(file);

    let evidence_store = InMemoryEvidenceStore::new();
    let mut card_ids = Vec::new();
    for line in reader.lines() {
        let line = line.context("reading a line of the corpus file")?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CardRecord = serde_json::from_str(&line).context("parsing an NDJSON card record")?;
        evidence_store.insert(record.id, record.fulltext);
        card_ids.push(record.id);
    }

    tracing::info!(cards = card_ids.len(), "loaded corpus");

    let evidence: Arc<dyn EvidenceStore> = Arc::new(evidence_store);
    let store = MemoryKvStore::new();
    let config = DedupeConfig::default();

    let report = ingest(&store, &evidence, &config, card_ids);
    println!("processed {} cards ({} errors)", report.processed, report.errors.len());
    for (card_id, err) in &report.errors {
        eprintln!("card {card_id} failed: {err}");
    }

    let keys: Vec<u32> = report.touched_bucket_set_keys.into_iter().collect();
    let clusters = dump_clusters(&store, &config, &keys)?;
    println!("found {} duplicate clusters", clusters.len());
    for cluster in &clusters {
        let mut card_ids: Vec<u32> = cluster.sub_buckets.iter().flat_map(|sb| sb.card_ids.clone()).collect();
        card_ids.sort_unstable();
        println!("  cluster {}: {} cards {:?}", cluster.bucket_set_key, card_ids.len(), card_ids);
    }

    Ok(())
}
