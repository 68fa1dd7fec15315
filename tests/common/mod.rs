use dedupe_engine::{EvidenceStore, InMemoryEvidenceStore};
use std::sync::Arc;

/// Build a fresh store and an evidence store preloaded with `rows`.
pub fn setup(rows: &[(u32, &str)]) -> (dedupe_engine::MemoryKvStore, Arc<dyn EvidenceStore>) {
    let store = dedupe_engine::MemoryKvStore::new();
    let evidence = InMemoryEvidenceStore::new();
    for (id, text) in rows {
        evidence.insert(*id, *text);
    }
    (store, Arc::new(evidence))
}

/// Join a block of already-terminated sentences into one card's fulltext.
pub fn card_text(blocks: &[&[&str]]) -> String {
    blocks.iter().flat_map(|b| b.iter()).cloned().collect::<Vec<_>>().join(" ")
}
