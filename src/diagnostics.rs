//! Diagnostics (C14, ambient): a read-only walk of the persisted BucketSet /
//! SubBucket graph, for operators inspecting the state of a run without
//! touching anything.

use crate::config::DedupeConfig;
use crate::errors::{CardId, DedupeError};
use crate::kv::MemoryKvStore;
use crate::model::{BucketSet, SubBucket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub bucket_set_key: CardId,
    pub sub_buckets: Vec<SubBucketSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBucketSummary {
    pub sub_bucket_key: CardId,
    pub card_ids: Vec<CardId>,
}

/// Walk every BucketSet reachable by scanning `BS:<key>` entries that were
/// created during this run, returning their current membership. Since
/// `MemoryKvStore` has no native key-scan primitive, callers pass the set of
/// BucketSet keys they already know about (e.g. from `ProcessOutcome`s
/// accumulated during ingestion).
pub fn dump_clusters(store: &MemoryKvStore, config: &DedupeConfig, known_bucket_set_keys: &[CardId]) -> Result<Vec<ClusterSummary>, DedupeError> {
    let mut tx = store.begin();
    let mut summaries = Vec::new();

    for &key in known_bucket_set_keys {
        let bs_k = format!("{}BS:{}", config.key_prefix, key);
        let members = tx.get_set_members(&bs_k);
        let bs = if members.is_empty() { BucketSet::singleton(key) } else { BucketSet::from_set(key, &members)? };
        if bs.sub_bucket_ids.len() <= 1 && members.is_empty() {
            // Never-persisted singleton with no matching SB: entry either; skip.
            let sb_k = format!("{}SB:{}", config.key_prefix, key);
            if !tx.hash_exists(&sb_k) {
                continue;
            }
        }

        let mut sub_buckets = Vec::with_capacity(bs.sub_bucket_ids.len());
        for sb_key in &bs.sub_bucket_ids {
            let sb_k = format!("{}SB:{}", config.key_prefix, sb_key);
            let hash = tx.get_hash_all(&sb_k);
            let sb = SubBucket::from_hash(*sb_key, &hash)?;
            let card_ids: Vec<CardId> = sb.cards.keys().copied().collect();
            sub_buckets.push(SubBucketSummary { sub_bucket_key: *sb_key, card_ids });
        }
        summaries.push(ClusterSummary { bucket_set_key: bs.key, sub_buckets });
    }

    summaries.sort_by_key(|s| s.bucket_set_key);
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceStore, InMemoryEvidenceStore};
    use crate::processor;
    use std::sync::Arc;

    #[test]
    fn dump_clusters_reports_the_bucket_sets_touched_during_ingestion() {
        let store = MemoryKvStore::new();
        let evidence = InMemoryEvidenceStore::new();
        let sample = "A sentence long enough to clear the cutoff for fingerprinting purposes today.";
        evidence.insert(1, sample);
        evidence.insert(2, sample);
        let evidence: Arc<dyn EvidenceStore> = Arc::new(evidence);
        let config = DedupeConfig::default();

        processor::process_card(&store, &evidence, &config, 1).unwrap();
        let outcome = processor::process_card(&store, &evidence, &config, 2).unwrap();
        let keys: Vec<CardId> = outcome.updates.iter().map(|u| u.bucket_id).collect();

        let clusters = dump_clusters(&store, &config, &keys).unwrap();
        assert_eq!(clusters.len(), 1);
        let card_ids: Vec<CardId> = clusters[0].sub_buckets.iter().flat_map(|sb| sb.card_ids.clone()).collect();
        assert_eq!(card_ids, vec![1, 2]);
    }
}
